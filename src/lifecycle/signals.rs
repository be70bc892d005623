//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT forces an immediate exit
//! - SIGHUP triggers config reload, not shutdown

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{load_config, ProxyConfig};
use crate::lifecycle::shutdown::Shutdown;

/// Exit status used when a second signal cuts the drain short.
const FORCED_EXIT: i32 = 130;

/// Resolves on SIGINT, or SIGTERM on Unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Trigger `shutdown` on the first termination signal and exit on the second.
pub fn spawn_shutdown_handler(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        termination_signal().await;
        tracing::info!("Termination signal received, draining");
        shutdown.trigger();

        termination_signal().await;
        tracing::warn!("Second termination signal, exiting without drain");
        std::process::exit(FORCED_EXIT);
    })
}

/// Reload `path` on every SIGHUP and send valid configurations to `updates`.
#[cfg(unix)]
pub fn spawn_reload_on_hangup(
    path: PathBuf,
    updates: mpsc::UnboundedSender<ProxyConfig>,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match load_config(&path) {
                Ok(config) => {
                    tracing::info!(path = ?path, "SIGHUP received, reloading configuration");
                    if updates.send(config).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(path = ?path, error = %e, "SIGHUP reload failed, keeping current configuration");
                }
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_reload_on_hangup(
    _path: PathBuf,
    _updates: mpsc::UnboundedSender<ProxyConfig>,
) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async {}))
}
