use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info};

use bunflare::config::WorkerConfig;
use bunflare::trace::LogSink;
use bunflare::worker::{ModuleLoader, WorkerModule};
use bunflare::Emulator;

#[derive(Parser)]
#[command(
    name = "bunflare",
    about = "Bunflare — local Cloudflare Workers emulator",
    version
)]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "PORT", default_value_t = 8787)]
    port: u16,

    /// Host to bind
    #[arg(long, env = "HOST", default_value = "localhost")]
    host: String,

    /// Path to wrangler.jsonc / wrangler.toml (autodetected when omitted)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Data root for SQLite, R2 bodies, and per-instance databases
    #[arg(long, env = "BUNFLARE_DATA_DIR", default_value = ".bunflare")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BUNFLARE_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "BUNFLARE_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Disable the source watcher (no hot reload)
    #[arg(long)]
    no_watch: bool,
}

/// The standalone binary has no JavaScript engine, so modules resolve to an
/// empty export set: asset-serving, the queue pull API, and the scheduled
/// trigger work; class exports require embedding the crate with a real
/// loader.
struct StaticModuleLoader;

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load(&self, config: &WorkerConfig) -> Result<WorkerModule> {
        if !config.durable_objects.is_empty() || !config.workflows.is_empty() {
            return Err(anyhow!(
                "this build cannot load worker classes; embed bunflare with a ModuleLoader"
            ));
        }
        Ok(WorkerModule::default())
    }
}

fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(args.log.clone().unwrap_or_else(|| "info".into()))
        });
    match &args.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "bunflare.log".to_string());
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn find_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    for candidate in ["wrangler.jsonc", "wrangler.json", "wrangler.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(anyhow!(
        "no wrangler.jsonc / wrangler.json / wrangler.toml found; pass --config"
    ))
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => 130,
        _ = sigterm.recv() => 143,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    130
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let config_path = find_config(args.config.clone())?;
    // Configuration validation failures are fatal at startup.
    WorkerConfig::load(&config_path, None)
        .with_context(|| format!("invalid configuration {}", config_path.display()))?;

    let emulator = Emulator::start(
        config_path.clone(),
        args.data_dir.clone(),
        Arc::new(StaticModuleLoader),
        Arc::new(LogSink),
    )
    .await?;

    let _watcher = if args.no_watch {
        None
    } else {
        let watch_root = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        match emulator.generations.watch(&watch_root) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                error!(err = %e, "source watcher failed to start; hot reload disabled");
                None
            }
        }
    };

    let server_emulator = emulator.clone();
    let host = args.host.clone();
    let port = args.port;
    let server = tokio::spawn(async move {
        if let Err(e) = bunflare::server::start_server(server_emulator, &host, port).await {
            error!(err = %e, "server exited");
        }
    });

    let code = wait_for_signal().await;
    info!(code, "signal received; shutting down");
    emulator.generations.shutdown();
    bunflare::bindings::container::cleanup_all_containers();
    emulator.storage.close().await;
    server.abort();
    std::process::exit(code);
}
