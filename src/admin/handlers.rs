use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::http::server::AppState;
use crate::net::ConnectionInfo;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub active_connections: u64,
    pub upstream: String,
    pub socks_enabled: bool,
}

#[derive(Serialize)]
pub struct PoolStatus {
    pub segment_size: usize,
    pub ceiling: usize,
    pub live: usize,
    pub available: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let inner = state.inner.load();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        total_requests: state.request_count.load(Ordering::Relaxed),
        active_connections: state.connections.active_count(),
        upstream: inner.config.upstream.pass.clone(),
        socks_enabled: inner.config.socks.enabled,
    })
}

pub async fn get_pool(State(state): State<AppState>) -> Json<PoolStatus> {
    let pool = &state.pool;
    Json(PoolStatus {
        segment_size: pool.segment_size(),
        ceiling: pool.ceiling(),
        live: pool.live(),
        available: pool.available(),
    })
}

pub async fn get_connections(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.connections.snapshot())
}
