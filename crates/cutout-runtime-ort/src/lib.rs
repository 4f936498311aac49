use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use cutout_core::{
    CoreError, MaskConvention, MaskValues, SegmentOutput, SegmentRequest, SegmentationMask, Segmenter,
};
use image::{imageops::FilterType, DynamicImage, GrayImage, Luma};
use ndarray::Array4;
use ort::{inputs, session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MODEL_DIR_ENV: &str = "CUTOUT_MODEL_DIR";
/// Square input side expected by RMBG-style models.
pub const DEFAULT_INPUT_SIZE: u32 = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnnxVariant {
    #[default]
    Auto,
    Fp16,
    Fp32,
    Quantized,
}

impl OnnxVariant {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "fp16" => Some(Self::Fp16),
            "fp32" => Some(Self::Fp32),
            "quantized" | "q8" => Some(Self::Quantized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    #[default]
    Cpu,
    DirectML,
    Cuda,
    CoreML,
}

impl ProviderChoice {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "directml" => Some(Self::DirectML),
            "cuda" => Some(Self::Cuda),
            "coreml" => Some(Self::CoreML),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::DirectML => "directml",
            Self::Cuda => "cuda",
            Self::CoreML => "coreml",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrtConfig {
    /// Explicit `.onnx` file; wins over `model_dir`.
    pub model_path: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub onnx_variant: OnnxVariant,
    pub provider: ProviderChoice,
    /// Square model input side; 0 means the default.
    pub input_size: u32,
}

pub fn default_model_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os(MODEL_DIR_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    dirs::home_dir().map(|home| home.join(".cutout").join("models"))
}

pub fn resolve_model_file(config: &OrtConfig) -> Result<PathBuf> {
    if let Some(path) = &config.model_path {
        if !path.is_file() {
            bail!("model file not found: {}", path.display());
        }
        return Ok(path.clone());
    }
    let dir = config
        .model_dir
        .clone()
        .or_else(default_model_dir)
        .ok_or_else(|| anyhow!("no model directory configured and no home directory found"))?;
    find_preferred_onnx_file(&dir, config.onnx_variant)
        .ok_or_else(|| anyhow!("no .onnx file found in {}", dir.display()))
}

pub fn find_preferred_onnx_file(base_dir: &Path, onnx_variant: OnnxVariant) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = WalkDir::new(base_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|e| e == "onnx").unwrap_or(false))
        .collect();
    candidates.sort_by_key(|p| {
        let lower = p.to_string_lossy().to_lowercase();
        let is_fp16 = lower.contains("fp16");
        let is_quantized = lower.contains("quantized") || lower.contains("q8");
        let is_plain = !is_fp16 && !is_quantized;
        let rank = match onnx_variant {
            OnnxVariant::Fp16 | OnnxVariant::Auto => [is_fp16, is_plain, is_quantized],
            OnnxVariant::Fp32 => [is_plain, is_fp16, is_quantized],
            OnnxVariant::Quantized => [is_quantized, is_fp16, is_plain],
        };
        (rank.iter().position(|hit| *hit).unwrap_or(rank.len()), lower)
    });
    candidates.into_iter().next()
}

fn candidate_providers(preferred: ProviderChoice) -> Vec<ProviderChoice> {
    let mut out = vec![preferred];
    if preferred != ProviderChoice::Cpu {
        out.push(ProviderChoice::Cpu);
    }
    out
}

fn build_session_for_provider(model_file: &Path, provider: ProviderChoice) -> Result<Session> {
    match provider {
        ProviderChoice::Cpu => Session::builder()?.commit_from_file(model_file).map_err(Into::into),
        ProviderChoice::DirectML => {
            #[cfg(feature = "directml")]
            {
                Session::builder()?
                    .with_execution_providers([ort::ep::DirectML::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "directml"))]
            {
                Err(anyhow!("directml feature not enabled"))
            }
        }
        ProviderChoice::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Session::builder()?
                    .with_execution_providers([ort::ep::CUDA::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(anyhow!("cuda feature not enabled"))
            }
        }
        ProviderChoice::CoreML => {
            #[cfg(feature = "coreml")]
            {
                Session::builder()?
                    .with_execution_providers([ort::ep::CoreML::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "coreml"))]
            {
                Err(anyhow!("coreml feature not enabled"))
            }
        }
    }
}

/// Salient-object segmentation through ONNX Runtime.
///
/// The session is built on first use and kept for the lifetime of the
/// segmenter. Output is a foreground-high byte mask at the request size.
pub struct OrtSegmenter {
    model_file: PathBuf,
    provider: ProviderChoice,
    input_size: u32,
    session: Mutex<Option<(Session, ProviderChoice)>>,
}

impl std::fmt::Debug for OrtSegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtSegmenter")
            .field("model_file", &self.model_file)
            .field("provider", &self.provider)
            .field("input_size", &self.input_size)
            .finish_non_exhaustive()
    }
}

impl OrtSegmenter {
    pub fn from_config(config: &OrtConfig) -> Result<Self> {
        let model_file = resolve_model_file(config)?;
        info!(model = %model_file.display(), provider = config.provider.label(), "using onnx model");
        Ok(Self {
            model_file,
            provider: config.provider,
            input_size: if config.input_size == 0 {
                DEFAULT_INPUT_SIZE
            } else {
                config.input_size
            },
            session: Mutex::new(None),
        })
    }

    pub fn model_file(&self) -> &Path {
        &self.model_file
    }

    fn infer(&self, image: &DynamicImage, on_progress: &mut dyn FnMut(f32)) -> Result<GrayImage> {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.build_session()?);
        }
        on_progress(0.3);
        let (session, provider) = guard
            .as_mut()
            .ok_or_else(|| anyhow!("session failed to initialize"))?;
        let start = Instant::now();
        let mask = run_onnx_inference(image, session, self.input_size)?;
        debug!(
            provider = provider.label(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "onnx inference finished"
        );
        Ok(mask)
    }

    fn segment_mask(&self, request: &SegmentRequest, on_progress: &mut dyn FnMut(f32)) -> Result<GrayImage> {
        let image = image::load_from_memory(&request.image_bytes).context("decoding inference image")?;
        on_progress(0.1);
        let mask = self.infer(&image, on_progress)?;
        on_progress(0.9);
        Ok(image::imageops::resize(
            &mask,
            request.width,
            request.height,
            FilterType::Triangle,
        ))
    }

    fn build_session(&self) -> Result<(Session, ProviderChoice)> {
        let mut errors = Vec::new();
        for provider in candidate_providers(self.provider) {
            match build_session_for_provider(&self.model_file, provider) {
                Ok(session) => {
                    if provider != self.provider {
                        warn!(
                            requested = self.provider.label(),
                            selected = provider.label(),
                            "execution provider fell back"
                        );
                    }
                    return Ok((session, provider));
                }
                Err(err) => errors.push(format!("{}: {}", provider.label(), err)),
            }
        }
        Err(anyhow!("all providers failed: {}", errors.join(" | ")))
    }
}

impl Segmenter for OrtSegmenter {
    fn segment(
        &self,
        request: &SegmentRequest,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<Vec<SegmentOutput>, CoreError> {
        let mask = self
            .segment_mask(request, on_progress)
            .map_err(|e| CoreError::processing(format!("{e:#}")))?;
        on_progress(1.0);
        Ok(vec![SegmentOutput {
            label: Some("foreground".to_string()),
            score: None,
            mask: Some(SegmentationMask {
                width: mask.width(),
                height: mask.height(),
                values: MaskValues::Bytes(mask.into_raw()),
            }),
        }])
    }

    fn mask_convention(&self) -> MaskConvention {
        MaskConvention::ForegroundHigh
    }
}

fn run_onnx_inference(image: &DynamicImage, session: &mut Session, input_size: u32) -> Result<GrayImage> {
    let side = input_size as usize;
    let resized = image
        .resize_exact(input_size, input_size, FilterType::Triangle)
        .to_rgb8();

    // RMBG preprocessing: pixel / 255 - 0.5 per channel.
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] = pixel[channel] as f32 / 255.0 - 0.5;
        }
    }

    let input_tensor = Tensor::from_array(input)?;
    let outputs = session.run(inputs![input_tensor])?;
    if outputs.len() == 0 {
        return Err(anyhow!("model returned no outputs"));
    }
    let view = outputs[0].try_extract_array::<f32>()?;
    let (mask_h, mask_w) = match view.ndim() {
        4 => (view.shape()[2], view.shape()[3]),
        3 => (view.shape()[1], view.shape()[2]),
        2 => (view.shape()[0], view.shape()[1]),
        _ => return Err(anyhow!("unsupported output dimensions: {:?}", view.shape())),
    };
    let raw: Vec<f32> = view.iter().take(mask_w * mask_h).copied().collect();
    Ok(normalize_to_gray(&raw, mask_w as u32, mask_h as u32))
}

/// Min-max normalizes raw logits into a byte mask.
fn normalize_to_gray(raw: &[f32], width: u32, height: u32) -> GrayImage {
    let (min_v, max_v) = raw
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = (max_v - min_v).max(1e-6);
    GrayImage::from_fn(width, height, |x, y| {
        let v = raw
            .get(y as usize * width as usize + x as usize)
            .copied()
            .unwrap_or(min_v);
        let normalized = ((v - min_v) / range).clamp(0.0, 1.0);
        Luma([(normalized * 255.0).round() as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, b"onnx").expect("write file");
    }

    #[test]
    fn variant_preference_picks_matching_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("onnx").join("model.onnx"));
        touch(&dir.path().join("onnx").join("model_fp16.onnx"));
        touch(&dir.path().join("onnx").join("model_quantized.onnx"));
        touch(&dir.path().join("README.md"));

        let pick = |variant| {
            find_preferred_onnx_file(dir.path(), variant)
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .expect("a model should be found")
        };
        assert_eq!(pick(OnnxVariant::Auto), "model_fp16.onnx");
        assert_eq!(pick(OnnxVariant::Fp16), "model_fp16.onnx");
        assert_eq!(pick(OnnxVariant::Fp32), "model.onnx");
        assert_eq!(pick(OnnxVariant::Quantized), "model_quantized.onnx");
    }

    #[test]
    fn empty_model_dir_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = OrtConfig {
            model_dir: Some(dir.path().to_path_buf()),
            ..OrtConfig::default()
        };
        let err = resolve_model_file(&config).expect_err("nothing to load");
        assert!(err.to_string().contains("no .onnx file"));
    }

    #[test]
    fn explicit_model_path_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = OrtConfig {
            model_path: Some(dir.path().join("missing.onnx")),
            ..OrtConfig::default()
        };
        assert!(OrtSegmenter::from_config(&missing).is_err());

        let present = dir.path().join("rmbg.onnx");
        touch(&present);
        let config = OrtConfig {
            model_path: Some(present.clone()),
            ..OrtConfig::default()
        };
        let segmenter = OrtSegmenter::from_config(&config).expect("path exists");
        assert_eq!(segmenter.model_file(), present.as_path());
        assert_eq!(segmenter.mask_convention(), MaskConvention::ForegroundHigh);
    }

    #[test]
    fn gpu_requests_fall_back_to_cpu() {
        assert_eq!(candidate_providers(ProviderChoice::Cpu), vec![ProviderChoice::Cpu]);
        assert_eq!(
            candidate_providers(ProviderChoice::Cuda),
            vec![ProviderChoice::Cuda, ProviderChoice::Cpu]
        );
    }

    #[test]
    fn option_parsing() {
        assert_eq!(OnnxVariant::parse(" FP16 "), Some(OnnxVariant::Fp16));
        assert_eq!(OnnxVariant::parse("q8"), Some(OnnxVariant::Quantized));
        assert_eq!(OnnxVariant::parse("int4"), None);
        assert_eq!(ProviderChoice::parse("CoreML"), Some(ProviderChoice::CoreML));
        assert_eq!(ProviderChoice::DirectML.label(), "directml");
    }

    #[test]
    fn logits_are_min_max_normalized() {
        let mask = normalize_to_gray(&[-2.0, 0.0, 2.0, 1.0], 2, 2);
        assert_eq!(mask.into_raw(), vec![0, 128, 255, 191]);
    }

    #[test]
    fn undecodable_request_fails_before_loading_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rmbg.onnx");
        touch(&path);
        let segmenter = OrtSegmenter::from_config(&OrtConfig {
            model_path: Some(path),
            ..OrtConfig::default()
        })
        .expect("path exists");
        let request = SegmentRequest {
            image_bytes: b"not a jpeg".to_vec(),
            width: 4,
            height: 4,
            options: cutout_core::SegmentOptions {
                model: "medium".to_string(),
                quality: 1.0,
            },
        };
        let mut calls = 0;
        let err = segmenter
            .segment(&request, &mut |_: f32| calls += 1)
            .expect_err("bytes are not an image");
        assert!(matches!(err, CoreError::ProcessingFailed(_)));
        assert_eq!(calls, 0);
    }
}
