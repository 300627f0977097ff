use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use pixelscale_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use pixelscale_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use pixelscale_core::model_pool::ModelPool;
use pixelscale_core::model_registry::ModelRegistry;
use pixelscale_core::pipeline::{self, DEFAULT_SCALE};
use pixelscale_core::runtime;
use pixelscale_core::server::{app_router, AppState};
use pixelscale_core::tier::QualityTier;

#[derive(Parser, Debug)]
#[command(name = "pixelscale", about = "AI image upscaling service", version)]
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

    #[arg(long, global = true, help = "Data directory (config, weights, logs)")]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale a single image file without starting the server.
    Upscale(UpscaleArgs),
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(help = "Input image (PNG, JPEG, WebP, BMP, GIF, TIFF)")]
    input: PathBuf,
    #[arg(help = "Output PNG path")]
    output: PathBuf,
    #[arg(short, long, default_value_t = DEFAULT_SCALE)]
    scale: u32,
    #[arg(long, default_value = "free", help = "free, starter, pro or business")]
    tier: String,
    #[arg(short, long, help = "Catalog model name or alias")]
    model: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_libs = runtime::setup_runtime_libs(Some(&resolved_data_dir));
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime::log_runtime_lib_status(&runtime_libs);
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    let pool = build_model_pool(&config, &resolved_data_dir);

    match cli.command {
        Some(Commands::Upscale(args)) => run_upscale(args, config, pool).await,
        None => run_server(cli.port, cli.host, config, pool).await,
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
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {}; reason: {reason}). Panics will not be persisted to crash logs.",
            display_or_none(attempted_crash_dir.as_deref())
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
    let plan = logging::compose_logging_init_plan(&init_options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter_or_default(&plan.filters.console_filter, "console"));

    let mut file_sink_warning = None;
    let installed = match plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(logging::redacting_make_writer(appender))
                .with_filter(env_filter_or_default(&plan.filters.file_filter, "file"));
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(console_layer)
                    .with(file_layer),
            )
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            file_sink_warning = Some((display_or_none(attempted_log_dir.as_deref()), reason));
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(console_layer),
            )
        }
    };

    if let Err(error) = installed {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some((attempted_log_dir, reason)) = file_sink_warning {
        eprintln!(
            "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
        );
        warn!(
            attempted_log_dir = %attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
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

fn display_or_none(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

fn env_filter_or_default(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = %mode,
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Config from `<data_dir>/config.toml`, with relative paths anchored at the
/// data dir. A missing or broken file falls back to defaults.
fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    let mut config = match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.resolve_paths(data_dir);
    config
}

/// Built-in catalog, then `models.json` from the data dir, then any extra
/// `.onnx` files found in the models directory.
fn build_model_pool(config: &AppConfig, data_dir: &Path) -> Arc<ModelPool> {
    let mut registry = ModelRegistry::with_builtin_models(config.paths.models_dir.clone());
    if let Err(e) = registry.load_catalog_file(data_dir) {
        warn!(error = %format!("{e:#}"), "Ignoring model catalog file");
    }
    if let Err(e) = registry.discover() {
        warn!(
            models_dir = %config.paths.models_dir.display(),
            error = %format!("{e:#}"),
            "Failed to scan models directory"
        );
    }
    info!(
        models = registry.list().len(),
        default_model = %config.inference.default_model,
        backend = %config.inference.backend(),
        "Model catalog ready"
    );
    Arc::new(ModelPool::with_ort(Arc::new(registry), config))
}

/// `--port`, then a numeric `PORT` env var, then the config file.
fn resolve_port(cli_port: Option<u16>, env_port: Option<&str>, configured: u16) -> u16 {
    cli_port
        .or_else(|| env_port.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(configured)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
    pool: Arc<ModelPool>,
) -> Result<()> {
    let port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        config.server.port,
    );
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    if config.inference.preload {
        let pool = Arc::clone(&pool);
        let model = config.inference.default_model.clone();
        tokio::spawn(async move { pool.preload(&model).await });
    }

    let app = app_router(AppState::new(config, pool));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Starting pixelscale server");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_upscale(args: UpscaleArgs, config: AppConfig, pool: Arc<ModelPool>) -> Result<()> {
    let started = Instant::now();
    let tier = QualityTier::from_str_lossy(&args.tier);
    let plan = pipeline::plan(
        pool.registry(),
        &config.inference.default_model,
        args.scale,
        tier,
        args.model.as_deref(),
    )
    .map_err(|rejection| anyhow!(rejection))?;

    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let limits = config.tiers.clone();
    let img = tokio::task::spawn_blocking(move || pipeline::decode_for_tier(&bytes, tier, &limits))
        .await
        .context("decode task panicked")??;

    let enhancer = pool.get(&plan.model).await?;
    let scale = plan.scale;
    let png = tokio::task::spawn_blocking(move || pipeline::enhance_to_png(&enhancer, &img, scale))
        .await
        .context("inference task panicked")??;

    tokio::fs::write(&args.output, &png)
        .await
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        model = %plan.model,
        scale,
        %tier,
        bytes = png.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Upscale complete"
    );
    Ok(())
}
