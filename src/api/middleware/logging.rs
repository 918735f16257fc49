//! Request logging middleware

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::api::handlers::forward::PROXY_HEADER;

/// Logs one line per inbound request, naming the proxy that served it
pub struct RequestLogging;

impl RequestLogging {
    pub async fn log_request(req: Request<Body>, next: Next) -> Response {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let start = Instant::now();

        debug!("{} {} - started", method, uri);

        let response = next.run(req).await;

        let duration = start.elapsed();
        let status = response.status();
        let proxy = response
            .headers()
            .get(PROXY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");

        if status.is_server_error() {
            warn!("{} {} - {} in {:?} (proxy {})", method, uri, status, duration, proxy);
        } else {
            info!("{} {} - {} in {:?} (proxy {})", method, uri, status, duration, proxy);
        }

        response
    }
}
