use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest side of the working image handed to the segmentation model.
pub const MAX_IMAGE_DIMENSION: u32 = 1024;
pub const INFERENCE_JPEG_QUALITY: u8 = 85;
pub const DOWNLOAD_FILE_NAME: &str = "processed-image-hq.png";

/// Orientation of the values a segmentation model writes into its mask.
///
/// `BackgroundHigh` models score the background, so opacity is `1 - confidence`.
/// `ForegroundHigh` models score the subject and their confidence is used as-is.
/// Picking the wrong one yields a cut-out of the subject instead of the background.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaskConvention {
    #[default]
    BackgroundHigh,
    ForegroundHigh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentOptions {
    pub model: String,
    pub quality: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRequest {
    /// Encoded working image (JPEG by default).
    pub image_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub options: SegmentOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaskValues {
    /// Confidence in `[0, 1]`.
    Confidence(Vec<f32>),
    /// Confidence scaled to `[0, 255]`.
    Bytes(Vec<u8>),
}

impl MaskValues {
    pub fn len(&self) -> usize {
        match self {
            Self::Confidence(values) => values.len(),
            Self::Bytes(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationMask {
    pub width: u32,
    pub height: u32,
    pub values: MaskValues,
}

impl SegmentationMask {
    pub fn pixel_count(&self) -> usize {
        (self.width as usize).saturating_mul(self.height as usize)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentOutput {
    pub label: Option<String>,
    pub score: Option<f32>,
    pub mask: Option<SegmentationMask>,
}

/// Black-box segmentation model.
///
/// `on_progress` receives fractions in `[0, 1]`; implementations may call it any
/// number of times, including not at all.
pub trait Segmenter: Send + Sync {
    fn segment(
        &self,
        request: &SegmentRequest,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<SegmentOutput>, CoreError>;

    fn mask_convention(&self) -> MaskConvention {
        MaskConvention::BackgroundHigh
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
}

/// A user-visible, dismissible message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub description: String,
}

impl Notification {
    pub fn success(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Success,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Info,
            title: title.into(),
            description: description.into(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("processing failed: {0}")]
    ProcessingFailed(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidInput,
    ProcessingFailed,
    DownloadFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn processing(message: impl Into<String>) -> Self {
        Self::ProcessingFailed(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::ProcessingFailed(_) => ErrorCode::ProcessingFailed,
            Self::DownloadFailed(_) => ErrorCode::DownloadFailed,
        }
    }

    pub fn as_error_info(&self) -> ErrorInfo {
        let message = match self {
            Self::InvalidInput(message) | Self::ProcessingFailed(message) | Self::DownloadFailed(message) => {
                message.clone()
            }
        };
        ErrorInfo {
            code: self.code(),
            message,
        }
    }
}

pub fn is_image_content_type(content_type: &str) -> bool {
    content_type.trim().to_ascii_lowercase().starts_with("image/")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub max_dimension: u32,
    pub inference_jpeg_quality: u8,
    pub model: String,
    pub quality: f32,
    /// Overrides the convention reported by the segmenter.
    pub mask_convention: Option<MaskConvention>,
    /// Requested worker count; always clamped to the pool bounds.
    pub max_workers: Option<usize>,
    pub download_file_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_dimension: MAX_IMAGE_DIMENSION,
            inference_jpeg_quality: INFERENCE_JPEG_QUALITY,
            model: "medium".to_string(),
            quality: 1.0,
            mask_convention: None,
            max_workers: None,
            download_file_name: DOWNLOAD_FILE_NAME.to_string(),
        }
    }
}

pub fn resolve_pipeline_config(overrides: PipelineConfig) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    if overrides.max_dimension > 0 {
        cfg.max_dimension = overrides.max_dimension;
    }
    if (1..=100).contains(&overrides.inference_jpeg_quality) {
        cfg.inference_jpeg_quality = overrides.inference_jpeg_quality;
    }
    if !overrides.model.trim().is_empty() {
        cfg.model = overrides.model;
    }
    if overrides.quality.is_finite() && overrides.quality > 0.0 {
        cfg.quality = overrides.quality.min(1.0);
    }
    if !overrides.download_file_name.trim().is_empty() {
        cfg.download_file_name = overrides.download_file_name;
    }
    cfg.mask_convention = overrides.mask_convention;
    cfg.max_workers = overrides.max_workers;
    cfg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingStage {
    Loading,
    Resizing,
    Inference,
    MaskProcessing,
    Compositing,
    Encoding,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: ProcessingStage,
    pub percent: u8,
}

/// Publishing half of a progress channel. Percentages never go backwards and
/// publishing after the stream was dropped is a no-op.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: Sender<ProgressUpdate>,
    stage: ProcessingStage,
    percent: u8,
}

/// Consuming half of a progress channel.
#[derive(Debug)]
pub struct ProgressStream {
    rx: Receiver<ProgressUpdate>,
}

pub fn progress_channel() -> (ProgressReporter, ProgressStream) {
    let (tx, rx) = mpsc::channel();
    (
        ProgressReporter {
            tx,
            stage: ProcessingStage::Loading,
            percent: 0,
        },
        ProgressStream { rx },
    )
}

impl ProgressReporter {
    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn stage(&mut self, stage: ProcessingStage) {
        self.stage = stage;
        if stage == ProcessingStage::Completed {
            self.percent = 100;
        }
        self.publish();
    }

    /// Model progress in `[0, 1]`, shown as a rounded percentage.
    pub fn fraction(&mut self, fraction: f32) {
        if !fraction.is_finite() {
            return;
        }
        let percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
        if percent <= self.percent {
            return;
        }
        self.percent = percent;
        self.publish();
    }

    fn publish(&self) {
        let _ = self.tx.send(ProgressUpdate {
            stage: self.stage,
            percent: self.percent,
        });
    }
}

impl ProgressStream {
    /// Updates published so far, without blocking.
    pub fn drain(&self) -> Vec<ProgressUpdate> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(update) => out.push(update),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return out,
            }
        }
    }

    /// Blocks for the next update; `None` once the reporter is gone.
    pub fn recv(&self) -> Option<ProgressUpdate> {
        self.rx.recv().ok()
    }
}
