//! Pool inspection endpoints

use axum::extract::State;
use axum::Json;
use chrono::Utc;

use crate::api::server::AppState;
use crate::models::{Proxy, StatusReport};

/// Pool health counts, cumulative wait, and the effective configuration
pub async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(build_report(&state))
}

/// Every proxy record with its health fields
pub async fn list_proxies(State(state): State<AppState>) -> Json<Vec<Proxy>> {
    Json(state.registry().snapshot())
}

pub(crate) fn build_report(state: &AppState) -> StatusReport {
    let registry = state.registry();
    let now = Utc::now();
    StatusReport {
        start_time: state.started_at,
        counts: registry.counts(now),
        time_waited: registry.time_waited().as_millis() as u64,
        config: state.config.as_ref().clone(),
        blocked_until: registry.blocked_until(now),
    }
}
