use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::codec::FsImageCodec;
use tilescale_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tilescale_core::job::{JobEvent, UpscaleManager};
use tilescale_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use tilescale_core::ort_backend::OrtRuntime;
use tilescale_core::server::{self, AppState};

#[derive(Parser)]
#[command(
    name = "tilescale",
    about = "Tiled AI image super-resolution"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

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
    /// Upscale one image and print the output location.
    Upscale(UpscaleArgs),
    /// Serve the job API (the default when no subcommand is given).
    Serve(ServeArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image path or file:// URI")]
    input: String,
    #[arg(short = 'o', long, help = "Override the configured output directory")]
    output_dir: Option<PathBuf>,
    #[arg(long, help = "Skip the accelerator and run on the CPU only")]
    cpu: bool,
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Some(Commands::Upscale(_)) => RuntimeLogMode::Cli,
        _ => RuntimeLogMode::Server,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    tilescale_core::runtime::setup_runtime_libs();
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    tilescale_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Upscale(args)) => run_upscale(args, resolved_data_dir).await,
        Some(Commands::Serve(args)) => run_server(args, resolved_data_dir).await,
        None => run_server(ServeArgs::default(), resolved_data_dir).await,
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            eprintln!(
                "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
            );
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
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

fn runtime_mode_name(mode: RuntimeLogMode) -> &'static str {
    match mode {
        RuntimeLogMode::Cli => "cli",
        RuntimeLogMode::Server => "server",
    }
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = runtime_mode_name(mode),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Wire the ONNX runtime and the filesystem codec into a job manager.
fn build_manager(
    config: &AppConfig,
    data_dir: &Path,
    output_dir_override: Option<PathBuf>,
    force_cpu: bool,
) -> Result<(UpscaleManager, mpsc::UnboundedReceiver<JobEvent>)> {
    let paths = config.resolve_paths(data_dir);
    let output_dir = output_dir_override.unwrap_or(paths.output_dir);
    let mut settings = config
        .upscale_settings(data_dir)
        .context("invalid tiling configuration")?;
    if force_cpu {
        settings.prefer_accelerator = false;
    }
    let runtime = OrtRuntime::new(config.ort_runtime_config(data_dir)?);

    info!(
        model = %paths.model_file.display(),
        output_dir = %output_dir.display(),
        prefer_accelerator = settings.prefer_accelerator,
        accelerator = %config.inference.accelerator,
        "Upscaler configured"
    );

    Ok(UpscaleManager::new(
        Arc::new(runtime),
        Arc::new(FsImageCodec::new(output_dir)),
        settings,
    ))
}

async fn run_upscale(args: UpscaleArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let (manager, mut events) = build_manager(&config, &data_dir, args.output_dir, args.cpu)?;

    let job_id = manager
        .start(&args.input)
        .with_context(|| format!("cannot upscale {}", args.input))?;
    info!(job_id = %job_id, input = %args.input, "Upscaling");

    let start = Instant::now();
    let mut cancel_requested = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c, if !cancel_requested => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                cancel_requested = true;
                eprintln!();
                info!(job_id = %job_id, "Interrupted, cancelling");
                manager.cancel(job_id);
            }
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("job event stream closed before the job finished");
                };
                match event {
                    JobEvent::Progress { done, total, .. } => {
                        eprint!("\r{}    ", render_progress(done, total, start.elapsed().as_secs_f64()));
                    }
                    JobEvent::Completed { output_uri, width, height, .. } => {
                        eprintln!();
                        info!(
                            width,
                            height,
                            elapsed = %format_duration(start.elapsed().as_secs_f64()),
                            "Upscale completed"
                        );
                        println!("{output_uri}");
                        return Ok(());
                    }
                    JobEvent::Failed { message, .. } => {
                        eprintln!();
                        bail!("upscale failed: {message}");
                    }
                    JobEvent::Cancelled { done, .. } => {
                        eprintln!();
                        bail!("upscale cancelled after {done} tiles");
                    }
                }
            }
        }
    }
}

async fn run_server(args: ServeArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);

    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = args.host.unwrap_or_else(|| config.server.host.clone());

    let (manager, events) = build_manager(&config, &data_dir, None, false)?;
    let state = AppState::new(manager);
    state.spawn_event_pump(events);

    server::serve(state, &host, port).await
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(done: u32, total: u32, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (f64::from(done) / f64::from(total)).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if done > 0 && elapsed > 0.0 {
        let per_tile = elapsed / f64::from(done);
        let remaining = f64::from(total.saturating_sub(done)) * per_tile;
        format!(" | ETA: {}", format_duration(remaining))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Tile {}/{} | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        done,
        total,
        format_duration(elapsed),
        eta,
    )
}


#[cfg(test)]
mod progress_tests {
    use super::*;

    #[test]
    fn bar_fills_proportionally() {
        let line = render_progress(3, 6, 3.0);
        assert!(line.starts_with(&format!("[{}{}]", "█".repeat(15), "░".repeat(15))));
        assert!(line.contains(" 50.0%"));
        assert!(line.contains("Tile 3/6"));
        assert!(line.ends_with("ETA: 00:00:03"));
    }

    #[test]
    fn no_eta_before_first_tile() {
        let line = render_progress(0, 4, 0.5);
        assert!(line.contains("  0.0%"));
        assert!(!line.contains("ETA"));
    }

    #[test]
    fn zero_total_renders_empty_bar() {
        let line = render_progress(0, 0, 0.0);
        assert!(line.starts_with(&format!("[{}]", "░".repeat(PROGRESS_BAR_WIDTH))));
    }
}
