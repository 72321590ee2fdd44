use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upscaler_core::backend::{select_backend, InferenceBackend};
use upscaler_core::batch::{BatchRunner, FileStatus, SaveFormat};
use upscaler_core::budget::{compute_budget, probe_available_bytes, probe_for_backend};
use upscaler_core::config::{config_path, data_dir, initialize_data_dir, AppConfig, ModelPreset};
use upscaler_core::engine::{InferenceEngine, OrtEngine, OrtEngineConfig, Precision};
use upscaler_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use upscaler_core::upscaler::TileUpscaler;
use upscaler_core::video::VideoJob;

#[derive(Parser)]
#[command(name = "upscaler", about = "Tiled AI super-resolution for images and videos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale images and videos.
    Upscale(UpscaleArgs),
    /// Report the selected backend and the tile size it would get.
    Probe(ProbeArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(required = true, help = "Input images or videos")]
    inputs: Vec<PathBuf>,
    #[arg(short = 'o', long, help = "Output file, or directory for several inputs")]
    output: PathBuf,
    #[arg(long, value_parser = parse_preset, help = "Bundled model: x2 or x4")]
    preset: Option<ModelPreset>,
    #[arg(long, requires = "scale", help = "Custom ONNX model (overrides --preset)")]
    model_path: Option<PathBuf>,
    #[arg(long, requires = "model_path", help = "Upscale factor of --model-path")]
    scale: Option<usize>,
    #[arg(long = "backend", value_name = "BACKEND", help = "tensorrt, cuda or cpu (repeatable, tried in order)")]
    backends: Vec<String>,
    #[arg(long, help = "Fixed tile side in pixels (skips memory probing)")]
    tile_size: Option<u32>,
    #[arg(long, help = "Context border around each tile")]
    tile_pad: Option<usize>,
    #[arg(long = "format", default_value = "auto", help = "Output extension, or auto to keep the source's")]
    save_format: String,
    #[arg(long, help = "Do not copy audio into upscaled videos")]
    no_audio: bool,
}

#[derive(Args)]
struct ProbeArgs {
    #[arg(long = "backend", value_name = "BACKEND")]
    backends: Vec<String>,
}

fn parse_preset(value: &str) -> Result<ModelPreset, String> {
    value.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn parse_backends(values: &[String], fallback: &[InferenceBackend]) -> Vec<InferenceBackend> {
    if values.is_empty() {
        fallback.to_vec()
    } else {
        values
            .iter()
            .map(|value| InferenceBackend::from_str_lossy(value))
            .collect()
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    upscaler_core::runtime::setup_ort_dylib();
    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    upscaler_core::runtime::log_runtime_status();
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config, resolved_data_dir).await,
        Commands::Probe(args) => run_probe(args, &config),
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let plan = logging::compose_logging_init_plan(&options);
    let console_filter = parse_env_filter_with_fallback(&plan.filters.console_filter, "console");

    match plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_filter),
                );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Set `cancel` on the first Ctrl-C.
fn spawn_interrupt_watcher(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            warn!("Interrupt received; cancelling after the current tile");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

async fn run_upscale(args: UpscaleArgs, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    let inputs: Vec<PathBuf> = args
        .inputs
        .iter()
        .filter(|input| {
            let exists = input.is_file();
            if !exists {
                warn!(input = %input.display(), "Input not found; skipping");
            }
            exists
        })
        .cloned()
        .collect();
    if inputs.is_empty() {
        bail!("no readable inputs");
    }

    let model = config.resolve_model(
        &data_dir,
        args.model_path.as_deref().zip(args.scale),
        args.preset,
    )?;
    let engine_config = OrtEngineConfig {
        model_path: model.path,
        scale: model.scale,
        backends: parse_backends(&args.backends, &config.engine.backends),
        trt_cache_dir: Some(config.trt_cache_dir(&data_dir)),
    };
    let tile_size = args.tile_size.or(config.engine.tile_size_override());
    let tile_pad = args.tile_pad.unwrap_or(config.engine.tile_pad);
    let save_format = SaveFormat::parse(&args.save_format);
    let output = args.output;

    let mut encoder = config.encoder.clone();
    if args.no_audio {
        encoder.keep_audio = false;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    spawn_interrupt_watcher(cancel.clone());

    let worker_cancel = cancel.clone();
    let budget_config = config.budget.clone();
    let pipeline_config = config.pipeline.clone();
    let total_files = inputs.len();

    let summary = tokio::task::spawn_blocking(move || -> Result<_> {
        let engine = OrtEngine::load(&engine_config)?;
        let probe = probe_for_backend(engine.backend());
        let mut upscaler =
            TileUpscaler::from_engine(engine, probe.as_ref(), &budget_config, tile_size, tile_pad);
        info!(
            scale = upscaler.scale(),
            tile_size = upscaler.tile_size(),
            tile_pad = upscaler.tile_pad(),
            "Upscaler ready"
        );

        let video = VideoJob::new(pipeline_config, encoder, worker_cancel.clone());
        let runner = BatchRunner::new(video, save_format, worker_cancel.clone());
        let mut progress = ProgressPrinter::new(total_files);
        let summary = runner.run(&inputs, &output, &mut upscaler, |file, percent| {
            progress.update(file, percent);
            !worker_cancel.load(Ordering::SeqCst)
        });
        eprintln!();
        Ok(summary)
    })
    .await
    .context("upscale worker panicked")??;

    for result in &summary.results {
        match &result.status {
            FileStatus::Done => info!(output = %result.output.display(), "Saved"),
            FileStatus::Failed(reason) => {
                warn!(input = %result.input.display(), %reason, "Failed")
            }
            FileStatus::Skipped => warn!(input = %result.input.display(), "Skipped"),
            FileStatus::Cancelled => warn!(input = %result.input.display(), "Cancelled"),
        }
    }

    if summary.cancelled {
        bail!("cancelled by user");
    }
    let failed = summary.failed();
    if failed > 0 {
        bail!("{failed} of {} file(s) failed", summary.results.len());
    }
    Ok(())
}

fn run_probe(args: ProbeArgs, config: &AppConfig) -> Result<()> {
    let backends = parse_backends(&args.backends, &config.engine.backends);
    let backend = select_backend(&backends);
    let probe = probe_for_backend(backend);

    let available = probe_available_bytes(probe.as_ref(), &config.budget);

    println!("backend:          {backend}");
    println!("probe:            {}", probe.name());
    println!("available memory: {} MiB", available / (1024 * 1024));
    for precision in [Precision::F16, Precision::F32] {
        let budget = compute_budget(backend, precision, available, &config.budget);
        println!(
            "tile side ({precision}):  {} px ({} px budget)",
            budget.tile_side(),
            budget.pixels()
        );
    }
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

struct ProgressPrinter {
    total_files: usize,
    current_file: Option<usize>,
    file_started: Instant,
}

impl ProgressPrinter {
    fn new(total_files: usize) -> Self {
        Self {
            total_files,
            current_file: None,
            file_started: Instant::now(),
        }
    }

    fn update(&mut self, file: usize, percent: f64) {
        if self.current_file != Some(file) {
            if self.current_file.is_some() {
                eprintln!();
            }
            self.current_file = Some(file);
            self.file_started = Instant::now();
        }
        let elapsed = self.file_started.elapsed().as_secs_f64();
        eprint!(
            "\r{}",
            render_progress(file, self.total_files, percent, elapsed)
        );
    }
}

fn render_progress(file: usize, total_files: usize, percent: f64, elapsed: f64) -> String {
    let fraction = (percent / 100.0).clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if fraction > 0.0 && fraction < 1.0 {
        format!(" | ETA: {}", format_duration(elapsed * (1.0 - fraction) / fraction))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | File {}/{} | Elapsed: {}{}    ",
        bar,
        fraction * 100.0,
        file + 1,
        total_files,
        format_duration(elapsed),
        eta,
    )
}
