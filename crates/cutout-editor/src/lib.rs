use cutout_image::{decode, encode_png, to_data_url, ImageError};
use image::imageops;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const MIN_ZOOM: f32 = 0.1;
pub const MAX_ZOOM: f32 = 3.0;
pub const NEUTRAL_FILTER: u32 = 100;
pub const MAX_FILTER: u32 = 200;
/// Width over height of the crop box.
pub const CROP_ASPECT_RATIO: f32 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EditTool {
    #[default]
    Crop,
    Rotate,
    Zoom,
    Filter,
}

/// Which editor button produced an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EditAction {
    Crop,
    Filter,
    Save,
}

impl EditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crop => "crop",
            Self::Filter => "filter",
            Self::Save => "save",
        }
    }
}

#[derive(Debug, Error)]
pub enum EditorError {
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Interactive crop/rotate/zoom/filter surface.
///
/// Setters record state. `cropped` produces the current crop box and
/// `filtered` the same crop with brightness and contrast applied; both return
/// `None` when the widget has nothing to show.
pub trait EditWidget: Send {
    fn rotate_to(&mut self, degrees: i32);
    fn zoom_to(&mut self, factor: f32);
    fn set_filter(&mut self, brightness: u32, contrast: u32);
    fn cropped(&self) -> Option<RgbaImage>;
    fn filtered(&self) -> Option<RgbaImage>;
}

/// `EditWidget` backed by an in-memory raster.
#[derive(Debug, Clone)]
pub struct RasterWidget {
    source: RgbaImage,
    aspect_ratio: f32,
    rotation: i32,
    zoom: f32,
    brightness: u32,
    contrast: u32,
}

impl RasterWidget {
    pub fn new(source: RgbaImage, aspect_ratio: f32) -> Self {
        let aspect_ratio = if aspect_ratio.is_finite() && aspect_ratio > 0.0 {
            aspect_ratio
        } else {
            CROP_ASPECT_RATIO
        };
        Self {
            source,
            aspect_ratio,
            rotation: 0,
            zoom: 1.0,
            brightness: NEUTRAL_FILTER,
            contrast: NEUTRAL_FILTER,
        }
    }

    fn rotated(&self) -> RgbaImage {
        match quarter_turns(self.rotation) {
            1 => imageops::rotate90(&self.source),
            2 => imageops::rotate180(&self.source),
            3 => imageops::rotate270(&self.source),
            _ => self.source.clone(),
        }
    }
}

impl EditWidget for RasterWidget {
    fn rotate_to(&mut self, degrees: i32) {
        self.rotation = degrees;
    }

    fn zoom_to(&mut self, factor: f32) {
        self.zoom = factor;
    }

    fn set_filter(&mut self, brightness: u32, contrast: u32) {
        self.brightness = brightness;
        self.contrast = contrast;
    }

    fn cropped(&self) -> Option<RgbaImage> {
        if self.source.width() == 0 || self.source.height() == 0 {
            return None;
        }
        Some(centered_crop(&self.rotated(), self.aspect_ratio, self.zoom))
    }

    fn filtered(&self) -> Option<RgbaImage> {
        let mut out = self.cropped()?;
        adjust(&mut out, self.brightness, self.contrast);
        Some(out)
    }
}

/// Nearest quarter turn, clockwise, in `0..4`.
fn quarter_turns(degrees: i32) -> i32 {
    ((degrees as f32 / 90.0).round() as i32).rem_euclid(4)
}

fn centered_crop(image: &RgbaImage, aspect_ratio: f32, zoom: f32) -> RgbaImage {
    let (width, height) = image.dimensions();
    let (mut box_w, mut box_h) = if width as f32 / height as f32 > aspect_ratio {
        (height as f32 * aspect_ratio, height as f32)
    } else {
        (width as f32, width as f32 / aspect_ratio)
    };
    if zoom > 1.0 {
        box_w /= zoom;
        box_h /= zoom;
    }
    let box_w = (box_w.round() as u32).clamp(1, width);
    let box_h = (box_h.round() as u32).clamp(1, height);
    let x = (width - box_w) / 2;
    let y = (height - box_h) / 2;
    imageops::crop_imm(image, x, y, box_w, box_h).to_image()
}

/// Brightness then contrast, both as percentages with 100 neutral. Alpha is kept.
fn adjust(image: &mut RgbaImage, brightness: u32, contrast: u32) {
    if brightness == NEUTRAL_FILTER && contrast == NEUTRAL_FILTER {
        return;
    }
    let b = brightness as f32 / 100.0;
    let c = contrast as f32 / 100.0;
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut().take(3) {
            let lit = *channel as f32 * b;
            let contrasted = (lit - 127.5) * c + 127.5;
            *channel = contrasted.round().clamp(0.0, 255.0) as u8;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditSettings {
    pub tool: EditTool,
    pub rotation: i32,
    pub zoom: f32,
    pub brightness: u32,
    pub contrast: u32,
}

impl Default for EditSettings {
    fn default() -> Self {
        Self {
            tool: EditTool::default(),
            rotation: 0,
            zoom: 1.0,
            brightness: NEUTRAL_FILTER,
            contrast: NEUTRAL_FILTER,
        }
    }
}

/// PNG produced by the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl EditedImage {
    fn from_raster(raster: &RgbaImage) -> Result<Self, EditorError> {
        Ok(Self {
            png: encode_png(raster)?,
            width: raster.width(),
            height: raster.height(),
        })
    }

    pub fn to_data_url(&self) -> String {
        to_data_url("image/png", &self.png)
    }
}

/// State of one editing visit. Dropped on save or cancel.
pub struct EditSession {
    settings: EditSettings,
    widget: Option<Box<dyn EditWidget>>,
}

impl std::fmt::Debug for EditSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditSession")
            .field("settings", &self.settings)
            .field("attached", &self.widget.is_some())
            .finish()
    }
}

impl EditSession {
    /// Opens a session over an encoded image using the raster widget.
    pub fn open(png: &[u8]) -> Result<Self, EditorError> {
        let source = decode(png)?.to_rgba8();
        debug!(width = source.width(), height = source.height(), "edit session opened");
        Ok(Self::with_widget(Box::new(RasterWidget::new(source, CROP_ASPECT_RATIO))))
    }

    pub fn with_widget(widget: Box<dyn EditWidget>) -> Self {
        Self {
            settings: EditSettings::default(),
            widget: Some(widget),
        }
    }

    /// A session whose widget is not mounted; every render is a no-op.
    pub fn detached() -> Self {
        Self {
            settings: EditSettings::default(),
            widget: None,
        }
    }

    pub fn settings(&self) -> EditSettings {
        self.settings
    }

    pub fn tool(&self) -> EditTool {
        self.settings.tool
    }

    pub fn select_tool(&mut self, tool: EditTool) {
        self.settings.tool = tool;
    }

    pub fn rotate(&mut self, delta_degrees: i32) {
        self.settings.rotation = self.settings.rotation.wrapping_add(delta_degrees);
        let rotation = self.settings.rotation;
        if let Some(widget) = self.widget.as_mut() {
            widget.rotate_to(rotation);
        }
    }

    pub fn set_zoom(&mut self, factor: f32) {
        let factor = if factor.is_finite() { factor } else { 1.0 };
        self.settings.zoom = factor.clamp(MIN_ZOOM, MAX_ZOOM);
        let zoom = self.settings.zoom;
        if let Some(widget) = self.widget.as_mut() {
            widget.zoom_to(zoom);
        }
    }

    pub fn set_brightness(&mut self, value: u32) {
        self.settings.brightness = value.min(MAX_FILTER);
        self.push_filter();
    }

    pub fn set_contrast(&mut self, value: u32) {
        self.settings.contrast = value.min(MAX_FILTER);
        self.push_filter();
    }

    fn push_filter(&mut self) {
        let EditSettings {
            brightness, contrast, ..
        } = self.settings;
        if let Some(widget) = self.widget.as_mut() {
            widget.set_filter(brightness, contrast);
        }
    }

    /// The crop box as it stands, without brightness or contrast.
    pub fn apply_crop(&self) -> Result<Option<EditedImage>, EditorError> {
        self.render(EditAction::Crop)
    }

    /// The crop box with the current brightness and contrast baked in.
    pub fn apply_filter(&self) -> Result<Option<EditedImage>, EditorError> {
        self.render(EditAction::Filter)
    }

    pub fn save(&self) -> Result<Option<EditedImage>, EditorError> {
        self.render(EditAction::Save)
    }

    pub fn render(&self, action: EditAction) -> Result<Option<EditedImage>, EditorError> {
        let raster = self.widget.as_ref().and_then(|w| match action {
            EditAction::Filter => w.filtered(),
            EditAction::Crop | EditAction::Save => w.cropped(),
        });
        let Some(raster) = raster else {
            debug!(action = action.as_str(), "no widget output to render");
            return Ok(None);
        };
        let edited = EditedImage::from_raster(&raster)?;
        debug!(
            action = action.as_str(),
            width = edited.width,
            height = edited.height,
            "rendered edit"
        );
        Ok(Some(edited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 128]);

    /// 4x2: red top row, blue bottom row.
    fn banded() -> RgbaImage {
        RgbaImage::from_fn(4, 2, |_, y| if y == 0 { RED } else { BLUE })
    }

    fn decode_png(edited: &EditedImage) -> RgbaImage {
        decode(&edited.png).expect("edited png decodes").to_rgba8()
    }

    #[test]
    fn crop_box_is_centered_square() {
        let widget = RasterWidget::new(banded(), CROP_ASPECT_RATIO);
        let out = widget.cropped().expect("widget renders");
        assert_eq!(out.dimensions(), (2, 2));
        assert_eq!(*out.get_pixel(0, 0), RED);
        assert_eq!(*out.get_pixel(1, 1), BLUE);
    }

    #[test]
    fn quarter_turn_rotates_clockwise() {
        let mut widget = RasterWidget::new(banded(), CROP_ASPECT_RATIO);
        widget.rotate_to(90);
        let out = widget.cropped().expect("widget renders");
        assert_eq!(out.dimensions(), (2, 2));
        assert_eq!(*out.get_pixel(1, 0), RED);
        assert_eq!(*out.get_pixel(0, 0), BLUE);
    }

    #[test]
    fn rotation_snaps_to_quarter_turns() {
        assert_eq!(quarter_turns(0), 0);
        assert_eq!(quarter_turns(90), 1);
        assert_eq!(quarter_turns(-90), 3);
        assert_eq!(quarter_turns(-180), 2);
        assert_eq!(quarter_turns(450), 1);
        assert_eq!(quarter_turns(100), 1);
    }

    #[test]
    fn zoom_shrinks_crop_box() {
        let mut widget = RasterWidget::new(RgbaImage::from_pixel(8, 8, RED), CROP_ASPECT_RATIO);
        widget.zoom_to(2.0);
        assert_eq!(widget.cropped().expect("renders").dimensions(), (4, 4));
        widget.zoom_to(0.5);
        assert_eq!(widget.cropped().expect("renders").dimensions(), (8, 8));
    }

    #[test]
    fn filters_scale_color_and_keep_alpha() {
        let mut image = RgbaImage::from_pixel(1, 1, Rgba([100, 50, 200, 77]));
        adjust(&mut image, 200, NEUTRAL_FILTER);
        assert_eq!(*image.get_pixel(0, 0), Rgba([200, 100, 255, 77]));

        let mut flat = RgbaImage::from_pixel(1, 1, Rgba([10, 240, 99, 3]));
        adjust(&mut flat, NEUTRAL_FILTER, 0);
        assert_eq!(*flat.get_pixel(0, 0), Rgba([128, 128, 128, 3]));

        let mut untouched = RgbaImage::from_pixel(1, 1, Rgba([1, 2, 3, 4]));
        adjust(&mut untouched, NEUTRAL_FILTER, NEUTRAL_FILTER);
        assert_eq!(*untouched.get_pixel(0, 0), Rgba([1, 2, 3, 4]));
    }

    #[test]
    fn session_clamps_settings() {
        let mut session = EditSession::detached();
        session.set_zoom(0.01);
        assert_eq!(session.settings().zoom, MIN_ZOOM);
        session.set_zoom(9.0);
        assert_eq!(session.settings().zoom, MAX_ZOOM);
        session.set_brightness(250);
        session.set_contrast(0);
        assert_eq!(session.settings().brightness, MAX_FILTER);
        assert_eq!(session.settings().contrast, 0);
        session.rotate(-90);
        session.rotate(-90);
        assert_eq!(session.settings().rotation, -180);
        session.select_tool(EditTool::Filter);
        assert_eq!(session.tool(), EditTool::Filter);
    }

    #[test]
    fn detached_session_renders_nothing() {
        let session = EditSession::detached();
        assert!(session.apply_crop().expect("no error").is_none());
        assert!(session.apply_filter().expect("no error").is_none());
        assert!(session.save().expect("no error").is_none());
    }

    #[test]
    fn saved_png_reflects_rotation_but_not_pending_filters() {
        let png = encode_png(&banded()).expect("source png");
        let mut session = EditSession::open(&png).expect("session opens");
        session.rotate(90);
        session.set_brightness(0);
        let saved = session.save().expect("encodes").expect("widget output");
        assert_eq!((saved.width, saved.height), (2, 2));
        let decoded = decode_png(&saved);
        assert_eq!(*decoded.get_pixel(1, 0), RED);
        assert_eq!(*decoded.get_pixel(0, 0), BLUE);
        assert!(saved.to_data_url().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn only_apply_filter_bakes_in_brightness() {
        let grey = Rgba([100, 100, 100, 255]);
        let png = encode_png(&RgbaImage::from_pixel(4, 4, grey)).expect("source png");
        let mut session = EditSession::open(&png).expect("session opens");
        session.set_brightness(0);

        let crop = session.apply_crop().expect("encodes").expect("widget output");
        assert_eq!(*decode_png(&crop).get_pixel(1, 1), grey);
        let saved = session.save().expect("encodes").expect("widget output");
        assert_eq!(*decode_png(&saved).get_pixel(1, 1), grey);
        let filtered = session.apply_filter().expect("encodes").expect("widget output");
        assert_eq!(*decode_png(&filtered).get_pixel(1, 1), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn open_rejects_undecodable_bytes() {
        assert!(matches!(EditSession::open(b"nope"), Err(EditorError::Image(_))));
    }
}
