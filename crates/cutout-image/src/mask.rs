//! Segmentation mask to alpha channel conversion.

use cutout_core::{MaskConvention, MaskValues, SegmentationMask};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaskError {
    #[error("mask has {actual} values but {width}x{height} needs {expected}")]
    LengthMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// One opacity byte per pixel, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlphaBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl AlphaBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, MaskError> {
        check_len(width, height, data.len())?;
        Ok(Self { width, height, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Reinterprets the alpha bytes as a byte mask of the same size.
    pub fn into_mask(self) -> SegmentationMask {
        SegmentationMask {
            width: self.width,
            height: self.height,
            values: MaskValues::Bytes(self.data),
        }
    }

    /// True when every pixel is fully transparent or every pixel fully opaque.
    pub fn is_trivial(&self) -> bool {
        self.data.iter().all(|a| *a == 0) || self.data.iter().all(|a| *a == 255)
    }

    /// Mean opacity in `[0, 1]`.
    pub fn coverage(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.data.iter().map(|a| *a as u64).sum();
        sum as f32 / (self.data.len() as f32 * 255.0)
    }
}

fn check_len(width: u32, height: u32, actual: usize) -> Result<(), MaskError> {
    let expected = (width as usize).saturating_mul(height as usize);
    if actual != expected {
        return Err(MaskError::LengthMismatch {
            width,
            height,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Opacity for a mask whose high values mark background: `round((1 - c) * 255)`.
pub fn invert(mask: &SegmentationMask, width: u32, height: u32) -> Result<AlphaBuffer, MaskError> {
    to_alpha(mask, width, height, MaskConvention::BackgroundHigh)
}

pub fn to_alpha(
    mask: &SegmentationMask,
    width: u32,
    height: u32,
    convention: MaskConvention,
) -> Result<AlphaBuffer, MaskError> {
    check_len(width, height, mask.values.len())?;
    let data = match (&mask.values, convention) {
        (MaskValues::Bytes(values), MaskConvention::BackgroundHigh) => values.iter().map(|v| 255 - v).collect(),
        (MaskValues::Bytes(values), MaskConvention::ForegroundHigh) => values.clone(),
        (MaskValues::Confidence(values), MaskConvention::BackgroundHigh) => {
            values.iter().map(|c| confidence_to_byte(1.0 - sanitize(*c))).collect()
        }
        (MaskValues::Confidence(values), MaskConvention::ForegroundHigh) => {
            values.iter().map(|c| confidence_to_byte(sanitize(*c))).collect()
        }
    };
    Ok(AlphaBuffer { width, height, data })
}

fn sanitize(confidence: f32) -> f32 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

fn confidence_to_byte(value: f32) -> u8 {
    (value * 255.0).round() as u8
}
