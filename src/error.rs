use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::proxy::transport::TransportError;

/// Unified error type for the proxy rotator
#[derive(Error, Debug)]
pub enum RotatorError {
    // Client input errors
    #[error("provide a url parameter, for example: /?url=www.example.com")]
    MissingUrl,

    #[error("supply a proper url, for example: url=example.com ({0})")]
    InvalidUrl(String),

    // Pool exhaustion
    #[error("all proxies are broken")]
    AllBroken,

    #[error("all proxies are blocked")]
    AllBlocked,

    // Outbound errors
    #[error("{0}")]
    Transport(#[from] TransportError),

    // Admin errors
    #[error("Proxy not found: {address}")]
    ProxyNotFound { address: String },

    #[error("unrecognized command")]
    UnknownCommand,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy rotator operations
pub type Result<T> = std::result::Result<T, RotatorError>;

impl RotatorError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RotatorError::MissingUrl
            | RotatorError::InvalidUrl(_)
            | RotatorError::UnknownCommand => StatusCode::BAD_REQUEST,

            // 404 Not Found
            RotatorError::ProxyNotFound { .. } => StatusCode::NOT_FOUND,

            // 503 Service Unavailable
            RotatorError::AllBroken | RotatorError::AllBlocked => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            RotatorError::Transport(_)
            | RotatorError::InvalidConfig(_)
            | RotatorError::Io(_)
            | RotatorError::Json(_)
            | RotatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Error bodies are plain text
impl IntoResponse for RotatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RotatorError {
    fn from(err: url::ParseError) -> Self {
        RotatorError::InvalidUrl(err.to_string())
    }
}
