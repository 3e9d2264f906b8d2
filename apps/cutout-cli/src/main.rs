use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cutout_core::{select_variant, PipelineConfig, ProgressStage, RefinementConfig, StaticDevice, Variant};
use cutout_model_registry::{list_installed, resolve_model_paths, OnnxVariant};
use cutout_pipeline::{ModelService, PipelineOrchestrator, PipelineRequest};
use cutout_runtime_ort::{fallback_chain, set_ort_dylib_path_if_available, ExecutionProvider, RuntimeOptions};
use cutout_telemetry::sink_from_env;
use regex::Regex;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "cutout", version, about = "Subject cutout with local segmentation models")]
struct Cli {
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    Models(ModelsCommand),
    #[command(name = "exec")]
    Exec(ExecArgs),
    Bench(BenchArgs),
}

#[derive(Args, Debug)]
struct ModelsCommand {
    #[command(subcommand)]
    command: ModelsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ModelsSubcommand {
    List(ListArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long, default_value = "fp32")]
    onnx_variant: String,
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(long, default_value_t = 5)]
    iterations: u32,
}

#[derive(Args, Debug)]
struct ExecArgs {
    #[arg(long, short = 'i')]
    input: String,
    /// Root directory for regex input matching (defaults to current directory).
    #[arg(long, short = 'r')]
    input_root: Option<PathBuf>,
    /// Recurse when scanning directories / regex matches.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    recursive: bool,
    /// If set, abort the whole run on the first input error.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    strict: bool,
    /// Copy the source image through unchanged when a cutout fails.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    keep_original_on_failure: bool,
    #[arg(long, short = 'd')]
    model_dir: Option<PathBuf>,
    #[arg(long, short = 'o')]
    output_cutout: Option<PathBuf>,
    #[arg(long, short = 'm')]
    output_mask: Option<PathBuf>,
    /// Output directory used when processing multiple inputs.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// JSON PipelineConfig file; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "auto")]
    variant: String,
    #[arg(long)]
    budget: Option<u32>,
    #[arg(long)]
    feather_radius: Option<u32>,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    low_power: bool,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    low_memory: bool,
    #[arg(long, short = 'v', default_value = "fp32")]
    onnx_variant: String,
    #[arg(long, short = 'e', default_value = "auto")]
    execution_provider: String,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    profile: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        TopLevelCommand::Models(models) => match models.command {
            ModelsSubcommand::List(args) => {
                let paths = resolve_model_paths(args.model_dir.as_deref())?;
                let installed = list_installed(&paths, parse_onnx_variant(&args.onnx_variant)?)?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "modelDir": paths.root,
                        "models": installed,
                    }))?
                );
            }
        },
        TopLevelCommand::Bench(args) => {
            let cases = cutout_bench::default_cases();
            tracing::info!(cases = %cutout_bench::describe(&cases), "running refinement benchmark");
            let reports = cutout_bench::run_all(&cases, args.iterations)?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        TopLevelCommand::Exec(args) => run_exec(&args)?,
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_exec(args: &ExecArgs) -> Result<()> {
    let total_start = Instant::now();
    set_ort_dylib_path_if_available();

    let inputs = resolve_exec_inputs(args)?;
    if inputs.is_empty() {
        return Err(anyhow!("no input images matched"));
    }
    let device = StaticDevice {
        low_power: args.low_power,
        low_memory: args.low_memory,
    };
    let config = build_pipeline_config(args, &device)?;
    let loaders = fallback_chain(&RuntimeOptions {
        model_dir: args.model_dir.clone(),
        onnx_variant: parse_onnx_variant(&args.onnx_variant)?,
        execution_provider: parse_execution_provider(&args.execution_provider)?,
    })?;

    let telemetry = sink_from_env();
    let mut service = ModelService::new(loaders);
    if let Some(sink) = &telemetry {
        service = service.with_telemetry(Arc::clone(sink));
    }
    let mut orchestrator = PipelineOrchestrator::new(Arc::new(service), Arc::new(device));
    if let Some(sink) = telemetry {
        orchestrator = orchestrator.with_telemetry(sink);
    }

    let bulk_mode = inputs.len() > 1;
    let mut results = Vec::with_capacity(inputs.len());
    let mut failures = 0usize;
    let progress = |stage: ProgressStage, percent: u8| {
        tracing::debug!(stage = stage.name(), percent, "progress");
    };

    for input_path in inputs {
        let source = match std::fs::read(&input_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                if bulk_mode && !args.strict {
                    failures += 1;
                    results.push(serde_json::json!({
                        "input": input_path,
                        "outcome": "failed",
                        "error": format!("failed to read input: {}", err),
                    }));
                    continue;
                }
                return Err(anyhow!("failed to read input {}: {}", input_path.display(), err));
            }
        };
        let (output_cutout, output_mask) = resolve_outputs_for_input(args, &input_path)?;

        let request = PipelineRequest {
            config: Some(&config),
            progress: Some(&progress),
            cancel: None,
        };
        let result = match orchestrator.run(&source, request) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(input = %input_path.display(), error = %err, "cutout failed");
                failures += 1;
                let info = err.as_error_info();
                if args.keep_original_on_failure {
                    let kept = keep_original_path(&output_cutout, &input_path);
                    write_output(&kept, &source)?;
                    results.push(serde_json::json!({
                        "input": input_path,
                        "outcome": "kept-original",
                        "output": kept,
                        "error": info,
                    }));
                    continue;
                }
                if bulk_mode && !args.strict {
                    results.push(serde_json::json!({
                        "input": input_path,
                        "outcome": "failed",
                        "error": info,
                    }));
                    continue;
                }
                return Err(anyhow!("{} ({})", err, input_path.display()));
            }
        };

        write_output(&output_cutout, &result.encoded)?;
        if let (Some(mask_path), Some(mask_png)) = (&output_mask, &result.mask_png) {
            write_output(mask_path, mask_png)?;
        }
        let meta = &result.metadata;
        results.push(serde_json::json!({
            "input": input_path,
            "outcome": "cutout",
            "variant": meta.variant,
            "backend": meta.backend,
            "fallbackUsed": meta.fallback_used,
            "selectedLabel": meta.selected_label,
            "sourceWidth": meta.source_width,
            "sourceHeight": meta.source_height,
            "width": meta.width,
            "height": meta.height,
            "outputCutout": output_cutout,
            "outputMask": output_mask,
            "timingsMs": if args.profile { Some(&meta.timings) } else { None },
        }));
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "results": results,
            "failures": failures,
            "totalMs": if args.profile { Some(total_start.elapsed().as_millis() as u64) } else { None },
        }))?
    );
    Ok(())
}

/// Layers the CLI flags over an optional JSON config file.
fn build_pipeline_config(args: &ExecArgs, device: &StaticDevice) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<PipelineConfig>(&raw).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    if let Some(variant) = parse_variant(&args.variant)? {
        config.variant = Some(variant);
    }
    if let Some(budget) = args.budget {
        config.resolution_budget = Some(budget);
    }
    if let Some(radius) = args.feather_radius {
        let variant = config
            .variant
            .or_else(|| config.refinement.as_ref().map(|r| r.variant))
            .unwrap_or_else(|| select_variant(device).0);
        if variant == Variant::Fast {
            bail!("--feather-radius has no effect on the fast variant; pass --variant quality to feather edges");
        }
        let mut refinement = config
            .refinement
            .take()
            .unwrap_or_else(|| RefinementConfig::for_variant(variant));
        refinement.feather_radius = radius;
        config.refinement = Some(refinement);
    }
    if args.output_mask.is_some() {
        config.emit_mask_png = true;
    }
    Ok(config)
}

fn resolve_exec_inputs(args: &ExecArgs) -> Result<Vec<PathBuf>> {
    let candidate = PathBuf::from(&args.input);
    if candidate.exists() {
        if candidate.is_dir() {
            return Ok(collect_images(&candidate, args.recursive, None));
        }
        return Ok(vec![candidate]);
    }
    // Not a path: treat as a file-name regex under input_root.
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
            name_filter.map_or(true, |re| {
                re.is_match(p.file_name().and_then(|n| n.to_str()).unwrap_or(""))
            })
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

fn resolve_outputs_for_input(args: &ExecArgs, input_path: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
    let multi_input = {
        let as_path = PathBuf::from(&args.input);
        as_path.is_dir() || !as_path.exists()
    };

    let cutout = match (&args.output_cutout, multi_input) {
        (Some(requested), false) => {
            validate_png_extension(requested)?;
            requested.clone()
        }
        (Some(requested), true) => args
            .output_dir
            .clone()
            .unwrap_or_else(|| requested.clone())
            .join(suffixed_filename(input_path, "cutout")?),
        (None, _) => match &args.output_dir {
            Some(dir) => dir.join(suffixed_filename(input_path, "cutout")?),
            None => input_path.with_file_name(suffixed_filename(input_path, "cutout")?),
        },
    };

    let mask = match &args.output_mask {
        Some(requested) if multi_input => Some(
            args.output_dir
                .clone()
                .unwrap_or_else(|| requested.clone())
                .join(suffixed_filename(input_path, "mask")?),
        ),
        Some(requested) => Some(requested.clone()),
        None => None,
    };

    Ok((cutout, mask))
}

fn suffixed_filename(input: &Path, suffix: &str) -> Result<String> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("input file must include a valid file name"))?
        .to_string_lossy();
    Ok(format!("{}_{}.png", stem, suffix))
}

/// The kept original lands where the cutout would have, with the source's
/// own extension.
fn keep_original_path(cutout: &Path, input: &Path) -> PathBuf {
    match input.extension() {
        Some(ext) => cutout.with_extension(ext),
        None => cutout.to_path_buf(),
    }
}

fn validate_png_extension(path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if ext != "png" {
        return Err(anyhow!(
            "output cutout must be a .png file (received: '{}')",
            path.display()
        ));
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

fn parse_variant(value: &str) -> Result<Option<Variant>> {
    match value.to_ascii_lowercase().as_str() {
        "auto" => Ok(None),
        "quality" => Ok(Some(Variant::Quality)),
        "fast" => Ok(Some(Variant::Fast)),
        other => Err(anyhow!("unknown variant '{}'; expected one of: auto, quality, fast", other)),
    }
}

fn parse_onnx_variant(value: &str) -> Result<OnnxVariant> {
    match value.to_ascii_lowercase().as_str() {
        "fp16" => Ok(OnnxVariant::Fp16),
        "fp32" => Ok(OnnxVariant::Fp32),
        "quantized" | "q8" => Ok(OnnxVariant::Quantized),
        "auto" => Ok(OnnxVariant::Auto),
        other => Err(anyhow!(
            "unknown onnx variant '{}'; expected one of: fp16, fp32, quantized, auto",
            other
        )),
    }
}

fn parse_execution_provider(value: &str) -> Result<ExecutionProvider> {
    match value.to_ascii_lowercase().as_str() {
        "auto" | "gpu" => Ok(ExecutionProvider::Auto),
        "cpu" => Ok(ExecutionProvider::Cpu),
        other => Err(anyhow!(
            "unknown execution provider '{}'; expected one of: auto, cpu",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_args(input: &str) -> ExecArgs {
        let cli = Cli::parse_from(["cutout", "exec", "-i", input]);
        match cli.command {
            TopLevelCommand::Exec(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn feather_flag_builds_refinement_for_device_variant() {
        let mut args = exec_args("photo.jpg");
        args.feather_radius = Some(5);
        let config = build_pipeline_config(&args, &StaticDevice::default()).expect("config");
        let refinement = config.refinement.expect("refinement override");
        assert_eq!(refinement.variant, Variant::Quality);
        assert_eq!(refinement.feather_radius, 5);
        assert_eq!(config.variant, None);
    }

    #[test]
    fn feather_flag_is_rejected_when_device_resolves_to_fast() {
        let mut args = exec_args("photo.jpg");
        args.feather_radius = Some(3);
        let device = StaticDevice {
            low_power: true,
            low_memory: false,
        };
        let err = build_pipeline_config(&args, &device).expect_err("fast cannot feather");
        assert!(err.to_string().contains("--feather-radius"));

        args.variant = "quality".to_string();
        let config = build_pipeline_config(&args, &device).expect("explicit quality");
        assert_eq!(config.refinement.map(|r| r.feather_radius), Some(3));
    }

    #[test]
    fn mask_output_enables_mask_export() {
        let mut args = exec_args("photo.jpg");
        args.output_mask = Some(PathBuf::from("mask.png"));
        args.variant = "quality".to_string();
        let config = build_pipeline_config(&args, &StaticDevice::default()).expect("config");
        assert!(config.emit_mask_png);
        assert_eq!(config.variant, Some(Variant::Quality));
    }

    #[test]
    fn regex_inputs_match_file_names_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["cat_1.png", "cat_2.JPG", "dog.png", "cat_notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }
        let re = Regex::new("^cat_").expect("regex");
        let found = collect_images(dir.path(), true, Some(&re));
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, ["cat_1.png", "cat_2.JPG"]);
    }

    #[test]
    fn single_input_outputs_sit_next_to_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("portrait.jpeg");
        std::fs::write(&input, b"x").expect("write");
        let args = exec_args(input.to_str().expect("utf8 path"));
        let (cutout, mask) = resolve_outputs_for_input(&args, &input).expect("outputs");
        assert_eq!(cutout, dir.path().join("portrait_cutout.png"));
        assert_eq!(mask, None);
        assert_eq!(keep_original_path(&cutout, &input), dir.path().join("portrait_cutout.jpeg"));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        assert!(parse_variant("ultra").is_err());
        assert_eq!(parse_variant("AUTO").expect("auto"), None);
    }
}
