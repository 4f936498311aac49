use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cutout_core::{
    is_image_content_type, progress_channel, CoreError, Notification, NotificationSink, ProgressStream,
    ProgressUpdate,
};
use cutout_editor::{EditAction, EditSession, EditedImage, EditorError};
use cutout_image::{decode, encode_png, from_data_url};
use cutout_pipeline::{BackgroundRemover, ProcessedImageBytes};
use image::ImageFormat;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod blob;

pub use blob::{Blob, BlobStore};

mod toast {
    pub const INVALID_TYPE: (&str, &str) = ("Invalid file type", "Please upload an image file");
    pub const PROCESSED: (&str, &str) = ("Success!", "Background removed successfully");
    pub const PROCESS_FAILED: (&str, &str) = ("Error", "Failed to process image");
    pub const DELETED: (&str, &str) = ("Deleted", "Image has been removed");
    pub const DOWNLOADED: (&str, &str) = ("Success", "High quality image downloaded successfully");
    pub const DOWNLOAD_FAILED: (&str, &str) = ("Error", "Failed to download image");
    pub const EDITED: (&str, &str) = ("Success", "Image edited successfully");
}

/// A file picked by the user.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Reads a file, guessing its content type from the extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = fs::read(path)?;
        let content_type = ImageFormat::from_path(path)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, content_type, bytes))
    }
}

#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub name: String,
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub png: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WizardPhase {
    Idle,
    Uploading,
    Processing,
    Original,
    Result,
    Editing,
}

#[derive(Debug, Default)]
pub enum WizardState {
    #[default]
    Idle,
    Uploading {
        original: UploadedImage,
    },
    Processing {
        original: UploadedImage,
        progress: u8,
    },
    /// The last run failed; only the upload is shown.
    Original {
        original: UploadedImage,
    },
    Result {
        original: UploadedImage,
        processed: ProcessedImage,
    },
    Editing {
        original: UploadedImage,
        processed: ProcessedImage,
        session: EditSession,
    },
}

impl WizardState {
    pub fn phase(&self) -> WizardPhase {
        match self {
            Self::Idle => WizardPhase::Idle,
            Self::Uploading { .. } => WizardPhase::Uploading,
            Self::Processing { .. } => WizardPhase::Processing,
            Self::Original { .. } => WizardPhase::Original,
            Self::Result { .. } => WizardPhase::Result,
            Self::Editing { .. } => WizardPhase::Editing,
        }
    }

    pub fn original(&self) -> Option<&UploadedImage> {
        match self {
            Self::Idle => None,
            Self::Uploading { original }
            | Self::Processing { original, .. }
            | Self::Original { original }
            | Self::Result { original, .. }
            | Self::Editing { original, .. } => Some(original),
        }
    }

    pub fn processed(&self) -> Option<&ProcessedImage> {
        match self {
            Self::Result { processed, .. } | Self::Editing { processed, .. } => Some(processed),
            _ => None,
        }
    }

    /// Percent complete while a run is in flight.
    pub fn progress(&self) -> Option<u8> {
        match self {
            Self::Uploading { .. } => Some(0),
            Self::Processing { progress, .. } => Some(*progress),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WizardError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Edit(#[from] EditorError),
    #[error("an image is still being processed")]
    Busy,
    #[error("{action} is not available while {phase:?}")]
    InvalidTransition { action: &'static str, phase: WizardPhase },
}

impl WizardError {
    pub fn core(&self) -> Option<&CoreError> {
        match self {
            Self::Core(err) => Some(err),
            _ => None,
        }
    }
}

struct RunningJob {
    progress: ProgressStream,
    handle: JoinHandle<Result<ProcessedImageBytes, CoreError>>,
}

/// Drives upload, processing, editing and download of a single image.
///
/// Transitions run on the caller's thread. Each run executes on its own
/// background thread; call [`poll`](Self::poll) or [`wait`](Self::wait) to fold
/// its progress and outcome back into the state.
pub struct WizardController {
    remover: Arc<BackgroundRemover>,
    notifier: Arc<dyn NotificationSink>,
    blobs: BlobStore,
    state: WizardState,
    job: Option<RunningJob>,
    last_error: Option<CoreError>,
}

impl WizardController {
    pub fn new(remover: Arc<BackgroundRemover>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            remover,
            notifier,
            blobs: BlobStore::new(),
            state: WizardState::Idle,
            job: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> &WizardState {
        &self.state
    }

    pub fn phase(&self) -> WizardPhase {
        self.state.phase()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn is_busy(&self) -> bool {
        self.job.is_some()
    }

    /// Failure of the most recent run, cleared by the next upload or delete.
    pub fn last_error(&self) -> Option<&CoreError> {
        self.last_error.as_ref()
    }

    pub fn upload(&mut self, file: UploadFile) -> Result<(), WizardError> {
        if !is_image_content_type(&file.content_type) {
            self.notify(Notification::error(toast::INVALID_TYPE.0, toast::INVALID_TYPE.1));
            return Err(CoreError::InvalidInput(format!(
                "{} has content type {:?}",
                file.name, file.content_type
            ))
            .into());
        }
        self.poll();
        if self.job.is_some() {
            return Err(WizardError::Busy);
        }

        self.reset();
        let bytes = Arc::new(file.bytes);
        let url = self.blobs.register(file.content_type.clone(), Arc::clone(&bytes));
        let original = UploadedImage {
            name: file.name,
            content_type: file.content_type,
            bytes: Arc::clone(&bytes),
            url,
        };
        info!(name = %original.name, bytes = bytes.len(), "upload accepted");
        self.state = WizardState::Uploading { original };

        let (mut reporter, progress) = progress_channel();
        let remover = Arc::clone(&self.remover);
        let spawned = thread::Builder::new()
            .name("cutout-run".to_string())
            .spawn(move || remover.process(&bytes, &mut reporter));
        match spawned {
            Ok(handle) => {
                self.job = Some(RunningJob { progress, handle });
                Ok(())
            }
            Err(err) => {
                let error = CoreError::processing(format!("could not start processing: {err}"));
                self.finish(Err(error.clone()));
                Err(error.into())
            }
        }
    }

    /// Applies pending progress and, if the run has ended, its outcome.
    pub fn poll(&mut self) -> WizardPhase {
        let Some(job) = self.job.as_ref() else {
            return self.state.phase();
        };
        let finished = job.handle.is_finished();
        for update in job.progress.drain() {
            self.apply_progress(update);
        }
        if finished {
            if let Some(job) = self.job.take() {
                self.join(job);
            }
        }
        self.state.phase()
    }

    /// Blocks until the in-flight run, if any, has ended.
    pub fn wait(&mut self) -> WizardPhase {
        if let Some(job) = self.job.take() {
            while let Some(update) = job.progress.recv() {
                self.apply_progress(update);
            }
            self.join(job);
        }
        self.state.phase()
    }

    /// Returns to `Idle` from any state. A run still in flight is detached and
    /// its outcome ignored.
    pub fn delete(&mut self) {
        if self.job.take().is_some() {
            debug!("detached in-flight run");
        }
        self.reset();
        info!("image removed");
        self.notify(Notification::success(toast::DELETED.0, toast::DELETED.1));
    }

    pub fn start_edit(&mut self) -> Result<(), WizardError> {
        let WizardState::Result { processed, .. } = &self.state else {
            return Err(self.invalid("start_edit"));
        };
        let session = EditSession::open(&processed.png)?;
        self.state = match mem::take(&mut self.state) {
            WizardState::Result { original, processed } => WizardState::Editing {
                original,
                processed,
                session,
            },
            other => other,
        };
        Ok(())
    }

    pub fn edit_session_mut(&mut self) -> Option<&mut EditSession> {
        match &mut self.state {
            WizardState::Editing { session, .. } => Some(session),
            _ => None,
        }
    }

    /// Leaves the editor without touching the processed image.
    pub fn cancel_edit(&mut self) -> Result<(), WizardError> {
        match mem::take(&mut self.state) {
            WizardState::Editing { original, processed, .. } => {
                self.state = WizardState::Result { original, processed };
                Ok(())
            }
            other => {
                self.state = other;
                Err(self.invalid("cancel_edit"))
            }
        }
    }

    /// Replaces the processed image with the editor's output.
    pub fn save_edit(&mut self, edited: EditedImage) -> Result<(), WizardError> {
        match mem::take(&mut self.state) {
            WizardState::Editing { original, processed, .. } => {
                self.blobs.revoke(&processed.url);
                let png = Arc::new(edited.png);
                let url = self.blobs.register("image/png", Arc::clone(&png));
                info!(width = edited.width, height = edited.height, "edit saved");
                self.state = WizardState::Result {
                    original,
                    processed: ProcessedImage {
                        png,
                        width: edited.width,
                        height: edited.height,
                        url,
                    },
                };
                self.notify(Notification::success(toast::EDITED.0, toast::EDITED.1));
                Ok(())
            }
            other => {
                self.state = other;
                Err(self.invalid("save_edit"))
            }
        }
    }

    /// Saves a `data:` URL emitted by an editor. Non-PNG payloads are re-encoded.
    pub fn save_edit_data_url(&mut self, url: &str) -> Result<(), WizardError> {
        let (mime, bytes) = from_data_url(url).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let image = decode(&bytes).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let png = if mime == "image/png" {
            bytes
        } else {
            encode_png(&image.to_rgba8()).map_err(|e| CoreError::processing(e.to_string()))?
        };
        self.save_edit(EditedImage {
            png,
            width: image.width(),
            height: image.height(),
        })
    }

    /// Renders the open edit session for `action` and saves it. `false` when
    /// the editor had nothing to render.
    pub fn commit_edit(&mut self, action: EditAction) -> Result<bool, WizardError> {
        let WizardState::Editing { session, .. } = &self.state else {
            return Err(self.invalid("commit_edit"));
        };
        match session.render(action)? {
            Some(edited) => {
                self.save_edit(edited)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes the processed PNG into `dir` under the configured download name.
    pub fn download(&self, dir: &Path) -> Result<PathBuf, WizardError> {
        self.download_as(&dir.join(&self.remover.config().download_file_name))
    }

    pub fn download_as(&self, path: &Path) -> Result<PathBuf, WizardError> {
        let written = match self.state.processed() {
            Some(processed) => fs::write(path, processed.png.as_slice())
                .map(|()| path.to_path_buf())
                .map_err(|e| CoreError::DownloadFailed(format!("{}: {e}", path.display()))),
            None => Err(CoreError::DownloadFailed(
                "no processed image to download".to_string(),
            )),
        };
        match written {
            Ok(path) => {
                info!(path = %path.display(), "processed image downloaded");
                self.notify(Notification::success(toast::DOWNLOADED.0, toast::DOWNLOADED.1));
                Ok(path)
            }
            Err(err) => {
                warn!(error = %err, "download failed");
                self.notify(Notification::error(
                    toast::DOWNLOAD_FAILED.0,
                    toast::DOWNLOAD_FAILED.1,
                ));
                Err(err.into())
            }
        }
    }

    fn reset(&mut self) {
        self.blobs.revoke_all();
        self.state = WizardState::Idle;
        self.last_error = None;
    }

    fn apply_progress(&mut self, update: ProgressUpdate) {
        debug!(stage = ?update.stage, percent = update.percent, "progress");
        self.state = match mem::take(&mut self.state) {
            WizardState::Uploading { original } => WizardState::Processing {
                original,
                progress: update.percent,
            },
            WizardState::Processing { original, progress } => WizardState::Processing {
                original,
                progress: progress.max(update.percent),
            },
            other => other,
        };
    }

    fn join(&mut self, job: RunningJob) {
        let outcome = job
            .handle
            .join()
            .unwrap_or_else(|_| Err(CoreError::processing("processing thread panicked")));
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Result<ProcessedImageBytes, CoreError>) {
        let original = match mem::take(&mut self.state) {
            WizardState::Uploading { original } | WizardState::Processing { original, .. } => original,
            other => {
                self.state = other;
                return;
            }
        };
        match outcome {
            Ok(out) => {
                info!(
                    width = out.width,
                    height = out.height,
                    duration_ms = out.duration_ms,
                    "background removed"
                );
                let png = Arc::new(out.png);
                let url = self.blobs.register("image/png", Arc::clone(&png));
                self.state = WizardState::Result {
                    original,
                    processed: ProcessedImage {
                        png,
                        width: out.width,
                        height: out.height,
                        url,
                    },
                };
                self.notify(Notification::success(toast::PROCESSED.0, toast::PROCESSED.1));
            }
            Err(err) => {
                warn!(error = %err, "processing failed");
                self.last_error = Some(err);
                self.state = WizardState::Original { original };
                self.notify(Notification::error(
                    toast::PROCESS_FAILED.0,
                    toast::PROCESS_FAILED.1,
                ));
            }
        }
    }

    fn invalid(&self, action: &'static str) -> WizardError {
        WizardError::InvalidTransition {
            action,
            phase: self.state.phase(),
        }
    }

    fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }
}
