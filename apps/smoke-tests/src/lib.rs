//! Fixtures shared by the end-to-end conformance tests.

use std::sync::Arc;

use anyhow::Result;
use cutout_core::{
    CoreError, MaskConvention, MaskValues, PipelineConfig, SegmentOutput, SegmentRequest, SegmentationMask, Segmenter,
};
use cutout_image::encode_jpeg;
use cutout_notify::RecordingSink;
use cutout_pipeline::BackgroundRemover;
use cutout_wizard::{UploadFile, WizardController};
use image::{Rgb, RgbImage};

/// Scores an ellipse in the middle of the frame as subject, reporting progress
/// in four steps.
pub struct EllipseSegmenter {
    pub convention: MaskConvention,
}

impl Default for EllipseSegmenter {
    fn default() -> Self {
        Self {
            convention: MaskConvention::BackgroundHigh,
        }
    }
}

impl Segmenter for EllipseSegmenter {
    fn segment(
        &self,
        request: &SegmentRequest,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<SegmentOutput>, CoreError> {
        let (w, h) = (request.width as f32, request.height as f32);
        let mut values = Vec::with_capacity((request.width * request.height) as usize);
        for y in 0..request.height {
            on_progress(y as f32 / request.height as f32);
            for x in 0..request.width {
                let dx = (x as f32 + 0.5 - w / 2.0) / (w / 3.0);
                let dy = (y as f32 + 0.5 - h / 2.0) / (h / 3.0);
                let subject = if dx * dx + dy * dy <= 1.0 { 1.0 } else { 0.0 };
                values.push(match self.convention {
                    MaskConvention::BackgroundHigh => 1.0 - subject,
                    MaskConvention::ForegroundHigh => subject,
                });
            }
        }
        on_progress(1.0);
        Ok(vec![SegmentOutput {
            label: Some("subject".to_string()),
            score: Some(0.99),
            mask: Some(SegmentationMask {
                width: request.width,
                height: request.height,
                values: MaskValues::Confidence(values),
            }),
        }])
    }

    fn mask_convention(&self) -> MaskConvention {
        self.convention
    }
}

/// Returns a result with no mask.
pub struct MasklessSegmenter;

impl Segmenter for MasklessSegmenter {
    fn segment(&self, _: &SegmentRequest, _: &mut dyn FnMut(f32)) -> Result<Vec<SegmentOutput>, CoreError> {
        Ok(vec![SegmentOutput::default()])
    }
}

/// Horizontal gradient photo with a darker disc, encoded as JPEG.
pub fn sample_jpeg(width: u32, height: u32) -> Result<Vec<u8>> {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let radius = width.min(height) as f32 / 3.0;
    let rgb = RgbImage::from_fn(width, height, |x, y| {
        let shade = (x * 255 / width.max(1)) as u8;
        let (dx, dy) = (x as f32 - cx, y as f32 - cy);
        if dx * dx + dy * dy <= radius * radius {
            Rgb([shade / 2, 40, 90])
        } else {
            Rgb([shade, 200, 220])
        }
    });
    Ok(encode_jpeg(&rgb, 90)?)
}

pub fn jpeg_upload(width: u32, height: u32) -> Result<UploadFile> {
    Ok(UploadFile::new("sample.jpg", "image/jpeg", sample_jpeg(width, height)?))
}

pub fn wizard_with(segmenter: Arc<dyn Segmenter>) -> (WizardController, RecordingSink) {
    let sink = RecordingSink::new();
    let remover = Arc::new(BackgroundRemover::new(segmenter, PipelineConfig::default()));
    (WizardController::new(remover, Arc::new(sink.clone())), sink)
}
