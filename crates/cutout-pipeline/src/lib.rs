use std::sync::Arc;
use std::time::Instant;

use cutout_core::{
    CoreError, MaskConvention, PipelineConfig, ProcessingStage, ProgressReporter, SegmentOptions, SegmentRequest,
    SegmentationMask, Segmenter,
};
use cutout_image::{
    apply_alpha, encode_jpeg, encode_png, estimate_rgba_bytes, opaque_canvas, prepare_working_image, AlphaBuffer,
    ImageSize,
};
use cutout_worker::{pool_capacity, MaskJob, MaskWorkerPool, PendingMask, Submission};
use tracing::{debug, info, instrument, warn};

/// Lossless PNG with the background removed, at working resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedImageBytes {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub duration_ms: u64,
}

/// Sequences resize, inference, mask conversion, compositing and encoding.
pub struct BackgroundRemover {
    segmenter: Arc<dyn Segmenter>,
    pool: MaskWorkerPool,
    config: PipelineConfig,
}

impl std::fmt::Debug for BackgroundRemover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRemover")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackgroundRemover {
    pub fn new(segmenter: Arc<dyn Segmenter>, config: PipelineConfig) -> Self {
        let pool = MaskWorkerPool::new(pool_capacity(config.max_workers));
        Self::with_pool(segmenter, config, pool)
    }

    pub fn with_pool(segmenter: Arc<dyn Segmenter>, config: PipelineConfig, pool: MaskWorkerPool) -> Self {
        Self {
            segmenter,
            pool,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mask_convention(&self) -> MaskConvention {
        self.config
            .mask_convention
            .unwrap_or_else(|| self.segmenter.mask_convention())
    }

    #[instrument(skip_all, fields(input_bytes = image_bytes.len()))]
    pub fn process(
        &self,
        image_bytes: &[u8],
        progress: &mut ProgressReporter,
    ) -> Result<ProcessedImageBytes, CoreError> {
        let start = Instant::now();
        progress.stage(ProcessingStage::Loading);
        let result = self.run(image_bytes, progress, start);
        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(out) => info!(
                duration_ms,
                width = out.width,
                height = out.height,
                "background removal finished"
            ),
            Err(err) => warn!(duration_ms, error = %err, "background removal failed"),
        }
        result
    }

    fn run(
        &self,
        image_bytes: &[u8],
        progress: &mut ProgressReporter,
        start: Instant,
    ) -> Result<ProcessedImageBytes, CoreError> {
        progress.stage(ProcessingStage::Resizing);
        let working = prepare_working_image(image_bytes, self.config.max_dimension)
            .map_err(|e| CoreError::processing(format!("could not prepare image: {e}")))?;
        let ImageSize { width, height } = working.size;
        debug!(
            source_width = working.source.width,
            source_height = working.source.height,
            width,
            height,
            rgba_bytes = estimate_rgba_bytes(working.size),
            "working image ready"
        );

        let request = SegmentRequest {
            image_bytes: encode_jpeg(&working.rgb, self.config.inference_jpeg_quality)
                .map_err(|e| CoreError::processing(format!("could not encode working image: {e}")))?,
            width,
            height,
            options: SegmentOptions {
                model: self.config.model.clone(),
                quality: self.config.quality,
            },
        };

        progress.stage(ProcessingStage::Inference);
        let outputs = {
            let mut on_progress = |fraction: f32| progress.fraction(fraction);
            self.segmenter
                .segment(&request, &mut on_progress)
                .map_err(|e| match e {
                    CoreError::ProcessingFailed(message) => CoreError::ProcessingFailed(message),
                    other => CoreError::processing(format!("segmentation failed: {other}")),
                })?
        };
        let mask = outputs
            .into_iter()
            .next()
            .and_then(|output| output.mask)
            .ok_or_else(|| CoreError::processing("invalid segmentation result: missing mask"))?;
        validate_mask(&mask, width, height)?;

        progress.stage(ProcessingStage::MaskProcessing);
        let task = MaskTask::start(
            &self.pool,
            MaskJob {
                mask,
                width,
                height,
                convention: self.mask_convention(),
            },
        );
        // The output canvas is drawn while the worker converts the mask.
        let mut rgba = opaque_canvas(&working.rgb);
        let alpha = task.finish()?;
        if alpha.is_trivial() {
            warn!(
                coverage = alpha.coverage(),
                "alpha channel is uniform; check the mask convention for this model"
            );
        }

        progress.stage(ProcessingStage::Compositing);
        apply_alpha(&mut rgba, &alpha).map_err(|e| CoreError::processing(format!("could not composite alpha: {e}")))?;

        progress.stage(ProcessingStage::Encoding);
        let png = encode_png(&rgba).map_err(|e| CoreError::processing(format!("could not encode png: {e}")))?;

        progress.stage(ProcessingStage::Completed);
        Ok(ProcessedImageBytes {
            png,
            width,
            height,
            source_width: working.source.width,
            source_height: working.source.height,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn validate_mask(mask: &SegmentationMask, width: u32, height: u32) -> Result<(), CoreError> {
    let expected = ImageSize::new(width, height).pixels();
    if mask.values.is_empty() {
        return Err(CoreError::processing("invalid segmentation result: empty mask"));
    }
    if mask.pixel_count() != mask.values.len() {
        return Err(CoreError::processing(format!(
            "invalid segmentation result: {}x{} mask carries {} values",
            mask.width,
            mask.height,
            mask.values.len()
        )));
    }
    if mask.values.len() != expected {
        return Err(CoreError::processing(format!(
            "invalid segmentation result: mask has {} values, expected {} ({}x{})",
            mask.values.len(),
            expected,
            width,
            height
        )));
    }
    Ok(())
}

enum MaskTask {
    Worker(PendingMask),
    Inline(MaskJob),
}

impl MaskTask {
    fn start(pool: &MaskWorkerPool, job: MaskJob) -> Self {
        match pool.try_submit(job) {
            Submission::Pending(pending) => {
                debug!(worker = ?pending.worker_id(), "mask conversion handed to worker");
                Self::Worker(pending)
            }
            Submission::Saturated(job) => {
                debug!("mask workers busy, converting on the calling thread");
                Self::Inline(job)
            }
        }
    }

    fn finish(self) -> Result<AlphaBuffer, CoreError> {
        match self {
            Self::Worker(pending) => pending
                .wait()
                .map_err(|e| CoreError::processing(format!("mask conversion failed: {e}"))),
            Self::Inline(job) => job
                .run_inline()
                .map_err(|e| CoreError::processing(format!("mask conversion failed: {e}"))),
        }
    }
}
