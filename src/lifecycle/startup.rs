//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize logging and metrics before anything else logs
//! - Start config reload sources (file watcher, SIGHUP)
//! - Bind the listener last, so traffic arrives only when ready
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, LoadError, ProxyConfig};
use crate::http::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::{spawn_reload_on_hangup, spawn_shutdown_handler};
use crate::observability::logging::LoggingError;
use crate::observability::{init_logging, init_metrics};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] LoadError),

    #[error("logging: {0}")]
    Logging(#[from] LoggingError),

    #[error("metrics: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the process was started.
#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    /// Config file; built-in defaults apply when absent.
    pub config_path: Option<PathBuf>,
    /// Reload the config file when it changes on disk.
    pub watch: bool,
}

/// Load the configuration named by `options`.
pub fn load(options: &StartupOptions) -> Result<ProxyConfig, LoadError> {
    match &options.config_path {
        Some(path) => load_config(path),
        None => Ok(ProxyConfig::default()),
    }
}

/// Start every subsystem and serve until a termination signal.
pub async fn run(options: StartupOptions) -> Result<(), StartupError> {
    let config = load(&options)?;
    init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?options.config_path,
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.pass,
        socks = config.socks.enabled,
        "socks-reverse-proxy starting"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        init_metrics(addr)?;
    }

    // kept alive until the server returns
    let mut _watcher = None;
    let config_updates = match &options.config_path {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            spawn_reload_on_hangup(path.clone(), watcher.sender())?;
            if options.watch {
                _watcher = Some(watcher.run()?);
            }
            updates
        }
        None => mpsc::unbounded_channel().1,
    };

    let shutdown = Shutdown::new();
    spawn_shutdown_handler(shutdown.clone());

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    HttpServer::new(config)
        .run(listener, config_updates, shutdown.subscribe())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
