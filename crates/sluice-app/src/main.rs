//! Sluice - filtering forward proxy.
//!
//! Loads `main.json` and the per-filter documents from the configured store,
//! builds the filter chain and serves until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use sluice_proxy::config::load_json_or_default;
use sluice_proxy::{builtin_registry, ProxyConfig, ProxyHandler, ProxyServer};
use sluice_storage::{open_uri, Store};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sluice - filtering forward proxy
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about)]
struct Args {
    /// Configuration store URI (file://dir or zip://archive.zip)
    #[arg(long)]
    config: Option<String>,

    /// Listen address, overrides main.json
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write rotated log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Default configuration store: the platform config directory.
fn default_config_uri() -> Option<String> {
    ProjectDirs::from("", "sluice", "Sluice")
        .map(|dirs| format!("file://{}", dirs.config_dir().display()))
}

/// Initialize logging, with file rotation when a log directory is given.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sluice={},warn", log_level)));

    if let Some(log_dir) = &args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("sluice")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        tracing::warn!("File logging unavailable in {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

/// Reads `main.json` and applies command line overrides.
fn load_config(store: &dyn Store, args: &Args) -> Result<ProxyConfig> {
    let mut config: ProxyConfig = load_json_or_default(store, "main.json")
        .with_context(|| format!("reading main.json from {}", store.url()))?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let uri = args
        .config
        .clone()
        .or_else(default_config_uri)
        .context("no configuration store given and no platform config directory")?;
    let store = open_uri(&uri).with_context(|| format!("opening configuration store {uri}"))?;
    tracing::info!("Configuration store: {}", store.url());

    let config = load_config(store.as_ref(), &args)?;
    let chain = builtin_registry()
        .build(&config.filters, store.as_ref())
        .context("building filter chain")?;
    tracing::debug!("Filter chain: {:?}", chain);

    let server = ProxyServer::bind(config.listen, config.reinject, ProxyHandler::new(chain))
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    let handle = server.start()?;
    tracing::info!("Sluice listening on {}", handle.addr());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    tracing::info!("Shutting down");
    handle.stop().await;

    Ok(())
}
