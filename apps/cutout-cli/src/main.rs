use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use cutout_core::{resolve_pipeline_config, MaskConvention, MaskValues, NotificationSink, PipelineConfig, SegmentationMask};
use cutout_editor::EditAction;
use cutout_image::to_alpha;
use cutout_notify::{sink_from_env, TracingSink};
use cutout_pipeline::BackgroundRemover;
use cutout_runtime_ort::{OnnxVariant, OrtConfig, OrtSegmenter, ProviderChoice};
use cutout_wizard::{UploadFile, WizardController, WizardPhase};
use regex::Regex;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "cutout", version, about = "Remove image backgrounds and touch up the result")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). `RUST_LOG` wins when set.
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    #[command(name = "exec")]
    Exec(ExecArgs),
    /// Show the alpha each mask convention produces for a probe mask.
    Convention,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Image file, directory, or file-name regex.
    #[arg(long, short = 'i')]
    input: String,
    /// Root directory for regex input matching (defaults to current directory).
    #[arg(long, short = 'r')]
    input_root: Option<PathBuf>,
    /// Recurse when scanning directories / regex matches.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    recursive: bool,
    /// If set, abort the whole run on the first input error.
    #[arg(long, default_value_t = false, action = ArgAction::SetTrue)]
    strict: bool,
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Output directory used when processing multiple inputs.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    model_path: Option<PathBuf>,
    #[arg(long, short = 'd')]
    model_dir: Option<PathBuf>,
    #[arg(long, default_value = "auto")]
    onnx_variant: String,
    #[arg(long, short = 'e', default_value = "cpu")]
    execution_provider: String,
    #[arg(long, default_value_t = 0)]
    max_dimension: u32,
    /// Override the model's mask orientation: background-high or foreground-high.
    #[arg(long)]
    mask_convention: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
    /// Rotation in degrees, applied in quarter turns.
    #[arg(long, allow_hyphen_values = true)]
    rotate: Option<i32>,
    #[arg(long)]
    zoom: Option<f32>,
    /// Brightness percent, 100 is neutral.
    #[arg(long)]
    brightness: Option<u32>,
    /// Contrast percent, 100 is neutral.
    #[arg(long)]
    contrast: Option<u32>,
    /// Save the centered square crop box with no other edit. Every edit pass
    /// crops to that box, so this only matters when no other edit flag is set.
    #[arg(long, default_value_t = false, action = ArgAction::SetTrue)]
    crop: bool,
}

impl ExecArgs {
    fn wants_edit(&self) -> bool {
        self.crop || self.rotate.is_some() || self.zoom.is_some() || self.brightness.is_some() || self.contrast.is_some()
    }

    /// Filter flags need the filtered render; everything else is a plain crop.
    fn edit_action(&self) -> EditAction {
        if self.brightness.is_some() || self.contrast.is_some() {
            EditAction::Filter
        } else {
            EditAction::Crop
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        TopLevelCommand::Convention => print_conventions()?,
        TopLevelCommand::Exec(args) => run_exec(&args)?,
    }
    Ok(())
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => EnvFilter::try_new(value)?,
        _ => EnvFilter::try_new(verbosity_to_filter(verbosity))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

fn verbosity_to_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn run_exec(args: &ExecArgs) -> Result<()> {
    let total_start = Instant::now();
    set_ort_dylib_path_if_available();

    let inputs = resolve_exec_inputs(args)?;
    if inputs.is_empty() {
        return Err(anyhow!("no input images matched"));
    }

    let segmenter = OrtSegmenter::from_config(&OrtConfig {
        model_path: args.model_path.clone(),
        model_dir: args.model_dir.clone(),
        onnx_variant: parse_onnx_variant(&args.onnx_variant)?,
        provider: parse_execution_provider(&args.execution_provider)?,
        input_size: 0,
    })?;
    let config = resolve_pipeline_config(PipelineConfig {
        max_dimension: args.max_dimension,
        mask_convention: args.mask_convention.as_deref().map(parse_mask_convention).transpose()?,
        max_workers: args.workers,
        ..PipelineConfig::default()
    });
    debug!(?config, "pipeline config");
    let remover = Arc::new(BackgroundRemover::new(Arc::new(segmenter), config));
    let notifier: Arc<dyn NotificationSink> = match sink_from_env() {
        Some(sink) => Arc::from(sink),
        None => Arc::new(TracingSink),
    };
    let mut wizard = WizardController::new(remover, notifier);

    let bulk_mode = inputs.len() > 1;
    let mut results = Vec::with_capacity(inputs.len());
    for input_path in inputs {
        match process_input(&mut wizard, args, &input_path) {
            Ok(summary) => results.push(summary),
            Err(err) => {
                if !bulk_mode || args.strict {
                    return Err(err.context(format!("processing {}", input_path.display())));
                }
                results.push(serde_json::json!({
                    "input": input_path,
                    "error": format!("{:#}", err),
                }));
            }
        }
    }

    info!(files = results.len(), elapsed_ms = total_start.elapsed().as_millis() as u64, "exec finished");
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "results": results,
            "totalMs": total_start.elapsed().as_millis(),
        }))?
    );
    Ok(())
}

fn process_input(wizard: &mut WizardController, args: &ExecArgs, input_path: &Path) -> Result<serde_json::Value> {
    let start = Instant::now();
    let file = UploadFile::from_path(input_path).with_context(|| format!("reading {}", input_path.display()))?;
    wizard.upload(file)?;
    if wizard.wait() != WizardPhase::Result {
        let reason = wizard
            .last_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "processing did not finish".to_string());
        return Err(anyhow!(reason));
    }

    let mut edit = None;
    if args.wants_edit() {
        wizard.start_edit()?;
        let session = wizard
            .edit_session_mut()
            .ok_or_else(|| anyhow!("edit session did not open"))?;
        if let Some(degrees) = args.rotate {
            session.rotate(degrees);
        }
        if let Some(zoom) = args.zoom {
            session.set_zoom(zoom);
        }
        if let Some(brightness) = args.brightness {
            session.set_brightness(brightness);
        }
        if let Some(contrast) = args.contrast {
            session.set_contrast(contrast);
        }
        edit = Some(session.settings());
        if !wizard.commit_edit(args.edit_action())? {
            wizard.cancel_edit()?;
        }
    }

    let output = resolve_output_for_input(args, input_path)?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let written = wizard.download_as(&output)?;

    let state = wizard.state();
    let processed = state.processed().ok_or_else(|| anyhow!("processed image missing after download"))?;
    Ok(serde_json::json!({
        "input": input_path,
        "output": written,
        "width": processed.width,
        "height": processed.height,
        "edit": edit,
        "elapsedMs": start.elapsed().as_millis(),
    }))
}

fn print_conventions() -> Result<()> {
    let probe = SegmentationMask {
        width: 5,
        height: 1,
        values: MaskValues::Confidence(vec![0.0, 0.25, 0.5, 0.75, 1.0]),
    };
    let mut rows = Vec::new();
    for convention in [MaskConvention::BackgroundHigh, MaskConvention::ForegroundHigh] {
        let alpha = to_alpha(&probe, probe.width, probe.height, convention)?;
        rows.push(serde_json::json!({
            "convention": convention,
            "confidence": [0.0, 0.25, 0.5, 0.75, 1.0],
            "alpha": alpha.as_slice(),
        }));
    }
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn resolve_exec_inputs(args: &ExecArgs) -> Result<Vec<PathBuf>> {
    let candidate = PathBuf::from(&args.input);
    if candidate.exists() {
        if candidate.is_dir() {
            return Ok(collect_images(&candidate, args.recursive, None));
        }
        return Ok(vec![candidate]);
    }
    // Treat as regex matching file name under input_root.
    let root = match &args.input_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let re = Regex::new(&args.input).map_err(|e| anyhow!("invalid regex: {}", e))?;
    Ok(collect_images(&root, args.recursive, Some(&re)))
}

fn collect_images(root: &Path, recursive: bool, name_filter: Option<&Regex>) -> Vec<PathBuf> {
    let walker = if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };
    let mut out: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|p| is_supported_image(p))
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name_filter.map(|re| re.is_match(name)).unwrap_or(true)
        })
        .collect();
    out.sort();
    out
}

fn is_supported_image(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "png" | "jpg" | "jpeg")
}

fn resolve_output_for_input(args: &ExecArgs, input_path: &Path) -> Result<PathBuf> {
    let multi_input = {
        let as_path = PathBuf::from(&args.input);
        as_path.is_dir() || !as_path.exists()
    };

    if multi_input {
        let dir = args.output_dir.clone().or_else(|| args.output.clone());
        return match dir {
            Some(dir) => Ok(dir.join(default_cutout_filename(input_path)?)),
            None => default_cutout_path(input_path),
        };
    }
    match &args.output {
        Some(path) => {
            validate_png_extension(path)?;
            Ok(path.clone())
        }
        None => match &args.output_dir {
            Some(dir) => Ok(dir.join(default_cutout_filename(input_path)?)),
            None => default_cutout_path(input_path),
        },
    }
}

fn default_cutout_filename(input: &Path) -> Result<String> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("input file must include a valid file name"))?
        .to_string_lossy();
    Ok(format!("{}_cutout.png", stem))
}

fn default_cutout_path(input: &Path) -> Result<PathBuf> {
    let filename = default_cutout_filename(input)?;
    Ok(match input.parent() {
        Some(parent) => parent.join(filename),
        None => PathBuf::from(filename),
    })
}

fn validate_png_extension(path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if ext != "png" {
        return Err(anyhow!("output must be a .png file (received: '{}')", path.display()));
    }
    Ok(())
}

fn set_ort_dylib_path_if_available() {
    if std::env::var("ORT_DYLIB_PATH").is_ok() {
        return;
    }
    let lib_name = if cfg!(target_os = "windows") {
        "onnxruntime.dll"
    } else if cfg!(target_os = "macos") {
        "libonnxruntime.dylib"
    } else {
        "libonnxruntime.so"
    };
    let next_to_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(lib_name)))
        .filter(|candidate| candidate.exists());
    if let Some(candidate) = next_to_exe {
        std::env::set_var("ORT_DYLIB_PATH", candidate);
        return;
    }
    if let Some(path) = std::env::var_os("PATH") {
        if let Some(candidate) = std::env::split_paths(&path)
            .map(|dir| dir.join(lib_name))
            .find(|candidate| candidate.exists())
        {
            std::env::set_var("ORT_DYLIB_PATH", candidate);
        }
    }
}

fn parse_onnx_variant(value: &str) -> Result<OnnxVariant> {
    OnnxVariant::parse(value).ok_or_else(|| {
        anyhow!(
            "unknown onnx variant '{}'; expected one of: fp16, fp32, quantized, auto",
            value
        )
    })
}

fn parse_execution_provider(value: &str) -> Result<ProviderChoice> {
    ProviderChoice::parse(value).ok_or_else(|| {
        anyhow!(
            "unknown execution provider '{}'; expected one of: cpu, directml, cuda, coreml",
            value
        )
    })
}

fn parse_mask_convention(value: &str) -> Result<MaskConvention> {
    match value.trim().to_ascii_lowercase().as_str() {
        "background-high" | "background" => Ok(MaskConvention::BackgroundHigh),
        "foreground-high" | "foreground" => Ok(MaskConvention::ForegroundHigh),
        other => Err(anyhow!(
            "unknown mask convention '{}'; expected background-high or foreground-high",
            other
        )),
    }
}
