//! Route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;

/// Create the router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::forward::forward))
        .route("/status", get(handlers::status::status))
        .route("/proxies", get(handlers::status::list_proxies))
        .route("/health", get(handlers::health::health_check))
        .route("/admin", post(handlers::admin::admin))
        .with_state(state)
}
