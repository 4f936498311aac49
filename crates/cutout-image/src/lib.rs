use std::io::Cursor;

use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};
use thiserror::Error;

pub mod mask;

pub use mask::{invert, to_alpha, AlphaBuffer, MaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(self) -> usize {
        (self.width as usize).saturating_mul(self.height as usize)
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
    #[error("image has no pixels")]
    Empty,
    #[error("alpha buffer is {alpha_width}x{alpha_height} but image is {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        alpha_width: u32,
        alpha_height: u32,
    },
    #[error("malformed data url: {0}")]
    DataUrl(String),
}

pub fn estimate_rgba_bytes(size: ImageSize) -> u64 {
    (size.pixels() as u64).saturating_mul(4)
}

/// Shrinks `size` so neither side exceeds `max_dimension`, keeping the aspect
/// ratio. Sizes already within bounds are returned untouched.
pub fn fit_within_dimension(size: ImageSize, max_dimension: u32) -> ImageSize {
    if size.width == 0 || size.height == 0 || max_dimension == 0 {
        return size;
    }
    if size.width <= max_dimension && size.height <= max_dimension {
        return size;
    }

    let aspect = size.width as f64 / size.height as f64;
    if size.width > size.height {
        let height = (max_dimension as f64 / aspect).round().max(1.0) as u32;
        ImageSize::new(max_dimension, height)
    } else {
        let width = (max_dimension as f64 * aspect).round().max(1.0) as u32;
        ImageSize::new(width, max_dimension)
    }
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    let image = image::load_from_memory(bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(ImageError::Empty);
    }
    Ok(image)
}

/// Decoded source downscaled to the working resolution used for inference.
#[derive(Debug, Clone)]
pub struct WorkingImage {
    pub rgb: RgbImage,
    pub source: ImageSize,
    pub size: ImageSize,
}

pub fn prepare_working_image(bytes: &[u8], max_dimension: u32) -> Result<WorkingImage, ImageError> {
    let decoded = decode(bytes)?;
    let source = ImageSize::new(decoded.width(), decoded.height());
    let size = fit_within_dimension(source, max_dimension);
    let rgb = if size == source {
        decoded.to_rgb8()
    } else {
        decoded
            .resize_exact(size.width, size.height, FilterType::CatmullRom)
            .to_rgb8()
    };
    Ok(WorkingImage { rgb, source, size })
}

/// Fully opaque RGBA copy of `rgb`, ready for `apply_alpha`.
pub fn opaque_canvas(rgb: &RgbImage) -> RgbaImage {
    let mut out = RgbaImage::new(rgb.width(), rgb.height());
    for (dst, src) in out.pixels_mut().zip(rgb.pixels()) {
        dst.0 = [src[0], src[1], src[2], u8::MAX];
    }
    out
}

/// Overwrites the fourth channel of `canvas` with `alpha`.
pub fn apply_alpha(canvas: &mut RgbaImage, alpha: &AlphaBuffer) -> Result<(), ImageError> {
    let (width, height) = canvas.dimensions();
    if alpha.width() != width || alpha.height() != height {
        return Err(ImageError::DimensionMismatch {
            width,
            height,
            alpha_width: alpha.width(),
            alpha_height: alpha.height(),
        });
    }
    for (dst, a) in canvas.pixels_mut().zip(alpha.as_slice()) {
        dst[3] = *a;
    }
    Ok(())
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, ImageError> {
    let mut encoded = Vec::new();
    image.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)?;
    Ok(encoded)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut encoded = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100));
        encoder.encode_image(image)?;
    }
    Ok(encoded)
}

pub fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Splits a base64 `data:` URL into its mime type and payload.
pub fn from_data_url(url: &str) -> Result<(String, Vec<u8>), ImageError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| ImageError::DataUrl("missing data: scheme".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| ImageError::DataUrl("missing payload separator".to_string()))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| ImageError::DataUrl("only base64 payloads are supported".to_string()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ImageError::DataUrl(e.to_string()))?;
    let mime = if mime.is_empty() { "text/plain" } else { mime };
    Ok((mime.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba};

    #[test]
    fn landscape_is_bounded_by_width() {
        let fitted = fit_within_dimension(ImageSize::new(2000, 1000), 1024);
        assert_eq!(fitted, ImageSize::new(1024, 512));
    }

    #[test]
    fn portrait_is_bounded_by_height() {
        let fitted = fit_within_dimension(ImageSize::new(900, 3000), 1024);
        assert_eq!(fitted, ImageSize::new(307, 1024));
    }

    #[test]
    fn small_and_degenerate_sizes_are_untouched() {
        assert_eq!(fit_within_dimension(ImageSize::new(640, 480), 1024), ImageSize::new(640, 480));
        assert_eq!(fit_within_dimension(ImageSize::new(0, 4000), 1024), ImageSize::new(0, 4000));
    }

    #[test]
    fn extreme_aspect_keeps_at_least_one_pixel() {
        let fitted = fit_within_dimension(ImageSize::new(5000, 2), 1024);
        assert_eq!(fitted, ImageSize::new(1024, 1));
    }

    #[test]
    fn estimate_rgba_bytes_uses_four_channels() {
        assert_eq!(ImageSize::new(10, 10).pixels(), 100);
        assert_eq!(estimate_rgba_bytes(ImageSize::new(10, 10)), 400);
    }

    #[test]
    fn working_image_is_downscaled_from_jpeg() {
        let source = RgbImage::from_pixel(2000, 1000, Rgb([200, 40, 40]));
        let jpeg = encode_jpeg(&source, 90).expect("jpeg encoding should work");
        let working = prepare_working_image(&jpeg, 1024).expect("working image should decode");
        assert_eq!(working.source, ImageSize::new(2000, 1000));
        assert_eq!(working.rgb.dimensions(), (1024, 512));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(matches!(decode(b"not an image"), Err(ImageError::Codec(_))));
    }

    #[test]
    fn composite_writes_alpha_and_keeps_color() {
        let rgb = RgbImage::from_pixel(2, 1, Rgb([1, 2, 3]));
        let alpha = AlphaBuffer::new(2, 1, vec![0, 255]).expect("alpha length should match");
        let mut out = opaque_canvas(&rgb);
        apply_alpha(&mut out, &alpha).expect("composite should work");
        assert_eq!(*out.get_pixel(0, 0), Rgba([1, 2, 3, 0]));
        assert_eq!(*out.get_pixel(1, 0), Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn canvas_starts_opaque_until_alpha_lands() {
        let rgb = RgbImage::from_pixel(2, 2, Rgb([7, 8, 9]));
        let mut canvas = opaque_canvas(&rgb);
        assert!(canvas.pixels().all(|p| p.0 == [7, 8, 9, 255]));
        let alpha = AlphaBuffer::new(2, 2, vec![0, 64, 128, 255]).expect("alpha length should match");
        apply_alpha(&mut canvas, &alpha).expect("same size");
        assert_eq!(*canvas.get_pixel(1, 0), Rgba([7, 8, 9, 64]));
        assert_eq!(*canvas.get_pixel(0, 1), Rgba([7, 8, 9, 128]));
    }

    #[test]
    fn composite_rejects_mismatched_alpha() {
        let mut canvas = opaque_canvas(&RgbImage::new(3, 3));
        let alpha = AlphaBuffer::new(2, 2, vec![0; 4]).expect("alpha length should match");
        assert!(matches!(
            apply_alpha(&mut canvas, &alpha),
            Err(ImageError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn png_preserves_transparency() {
        let image = RgbaImage::from_pixel(3, 2, Rgba([9, 8, 7, 42]));
        let png = encode_png(&image).expect("png encoding should work");
        let decoded = decode(&png).expect("png should decode").to_rgba8();
        assert_eq!(*decoded.get_pixel(2, 1), Rgba([9, 8, 7, 42]));
    }

    #[test]
    fn data_url_payload_survives_conversion() {
        let url = to_data_url("image/png", &[0x89, b'P', b'N', b'G']);
        assert!(url.starts_with("data:image/png;base64,"));
        let (mime, bytes) = from_data_url(&url).expect("data url should parse");
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, vec![0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn data_url_without_base64_marker_is_rejected() {
        assert!(matches!(
            from_data_url("data:image/png,abc"),
            Err(ImageError::DataUrl(_))
        ));
        assert!(from_data_url("blob:cutout/1").is_err());
    }
}
