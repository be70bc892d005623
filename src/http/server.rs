//! Proxy server setup and accept loop.
//!
//! # Responsibilities
//! - Hold the hot-swappable server state (config, resolver, limits)
//! - Accept client connections and hand each one to the forwarding driver
//! - Apply configuration updates without dropping in-flight requests
//! - Start the admin API when it is enabled
//! - Drain open connections on shutdown

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use crate::admin::setup_admin_router;
use crate::buffer::SegmentPool;
use crate::config::ProxyConfig;
use crate::context::ContextLimits;
use crate::http::forward::serve_connection;
use crate::http::request::RequestLimits;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::upstream::DestinationResolver;

/// Pause after a failed accept, so fd exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Everything derived from one configuration version.
#[derive(Debug)]
pub struct SharedState {
    pub config: ProxyConfig,
    pub resolver: DestinationResolver,
    pub limits: ContextLimits,
    pub request_limits: RequestLimits,
}

impl SharedState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            resolver: DestinationResolver::from_config(&config),
            limits: ContextLimits::from_config(&config),
            request_limits: RequestLimits {
                max_head: config.limits.max_request_head,
                max_body: config.limits.max_request_body,
            },
            config,
        }
    }
}

/// Application state shared by the data plane and the admin handlers.
#[derive(Clone)]
pub struct AppState {
    /// Swapped as a whole on reload; a request keeps the version it started with.
    pub inner: Arc<ArcSwap<SharedState>>,
    pub pool: Arc<SegmentPool>,
    pub connections: ConnectionTracker,
    pub request_count: Arc<AtomicU64>,
    pub started: Instant,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            pool: SegmentPool::from_config(&config.buffers),
            inner: Arc::new(ArcSwap::from_pointee(SharedState::new(config))),
            connections: ConnectionTracker::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
        }
    }

    /// Install a new configuration for requests accepted from now on.
    pub fn apply(&self, config: ProxyConfig) {
        let current = self.inner.load();
        if current.config.listener.bind_address != config.listener.bind_address {
            tracing::warn!(
                current = %current.config.listener.bind_address,
                requested = %config.listener.bind_address,
                "Listener address changes need a restart"
            );
        }
        if current.config.buffers != config.buffers {
            tracing::warn!("Buffer pool settings change on restart only");
        }

        tracing::info!(upstream = %config.upstream.pass, socks = config.socks.enabled, "Configuration reloaded");
        self.inner.store(Arc::new(SharedState::new(config)));
    }
}

/// The reverse proxy server.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            state: AppState::new(config),
        }
    }

    /// Shared state, for callers that want to observe the server.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve until `shutdown` fires, then drain open connections.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let shared = self.state.inner.load_full();
        let listener = Listener::from_tcp(listener, shared.config.listener.max_connections);
        tracing::info!(
            address = %listener.local_addr()?,
            upstream = %shared.config.upstream.pass,
            socks = shared.config.socks.enabled,
            "Proxy server starting"
        );

        if shared.config.admin.enabled {
            let admin_listener = TcpListener::bind(&shared.config.admin.bind_address).await?;
            spawn_admin(admin_listener, self.state.clone(), shutdown.resubscribe())?;
        }
        drop(shared);

        let mut updates_open = true;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        let guard = self.state.connections.track(peer);
                        let state = self.state.clone();
                        tokio::spawn(async move {
                            serve_connection(state, stream, peer, guard).await;
                            drop(permit);
                        });
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                update = config_updates.recv(), if updates_open => match update {
                    Some(config) => self.state.apply(config),
                    None => updates_open = false,
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
            }
        }
        drop(listener);

        let deadline = Duration::from_secs(self.state.inner.load().config.timeouts.shutdown_secs);
        if self.state.connections.wait_for_drain(deadline).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = self.state.connections.active_count(),
                "Shutdown deadline passed with connections still open"
            );
        }

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

fn spawn_admin(listener: TcpListener, state: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");
    let app = setup_admin_router(state);
    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "Admin API stopped");
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_swaps_resolver() {
        let state = AppState::new(ProxyConfig::default());
        let before = state.inner.load_full();

        let mut config = ProxyConfig::default();
        config.upstream.pass = "http://reloaded:9000".to_string();
        state.apply(config);

        let after = state.inner.load_full();
        assert_eq!(after.config.upstream.pass, "http://reloaded:9000");
        // a request holding the old version keeps it
        assert_eq!(before.config.upstream.pass, "http://127.0.0.1:8000");

        let target = crate::upstream::RequestTarget { authority: None, path: "/" };
        assert_eq!(after.resolver.resolve(&target).unwrap().host, "reloaded");
    }
}
