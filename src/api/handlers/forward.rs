//! Forwarding endpoint

use axum::body::Body;
use axum::extract::{Query, State};
use axum::response::Response;
use http::header::CONTENT_LENGTH;
use http::{HeaderName, HeaderValue};
use serde::Deserialize;

use crate::api::server::AppState;
use crate::error::RotatorError;
use crate::proxy::ForwardedResponse;

/// Names the upstream proxy that served the response
pub const PROXY_HEADER: HeaderName = HeaderName::from_static("x-proxy-rotator-proxy");

/// Query parameters for `GET /`
#[derive(Debug, Deserialize, Default)]
pub struct ForwardQuery {
    pub url: Option<String>,
    /// Outbound timeout in milliseconds
    pub timeout: Option<u64>,
}

/// Forward a GET through the pool and mirror the upstream answer
pub async fn forward(
    State(state): State<AppState>,
    Query(query): Query<ForwardQuery>,
) -> Result<Response, RotatorError> {
    let forwarded = state
        .handler
        .handle(query.url.as_deref(), query.timeout)
        .await?;
    Ok(relay_response(forwarded))
}

fn relay_response(forwarded: ForwardedResponse) -> Response {
    let ForwardedResponse { proxy, response } = forwarded;

    let mut relayed = Response::new(Body::from(response.body));
    *relayed.status_mut() = response.status;

    // Body is re-framed by the server
    for (name, value) in &response.headers {
        if !is_hop_by_hop_header(name.as_str()) && *name != CONTENT_LENGTH {
            relayed.headers_mut().append(name.clone(), value.clone());
        }
    }

    if let Ok(value) = HeaderValue::from_str(&proxy) {
        relayed.headers_mut().insert(PROXY_HEADER, value);
    }

    relayed
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
