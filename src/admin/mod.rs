//! Authenticated admin API.
//!
//! ```text
//! GET /admin/status       version, uptime, request totals, live config summary
//! GET /admin/pool         segment pool occupancy
//! GET /admin/connections  open client connections
//! ```

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/pool", get(get_pool))
        .route("/admin/connections", get(get_connections))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
