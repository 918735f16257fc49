//! Relay server using Axum

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::Config;
use crate::error::{Result, RotatorError};
use crate::proxy::{ProxyHandler, ProxyRegistry};

use super::middleware::RequestLogging;
use super::routes;

/// Shared state for request handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<ProxyHandler>,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(handler: Arc<ProxyHandler>, config: Arc<Config>) -> Self {
        Self {
            handler,
            config,
            started_at: Utc::now(),
        }
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        self.handler.registry()
    }
}

/// Relay HTTP server
pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router
    pub fn build_router(&self) -> Router {
        routes::create_router(self.state.clone())
            .layer(axum::middleware::from_fn(RequestLogging::log_request))
            .layer(TraceLayer::new_for_http())
    }

    /// Run until `shutdown` flips
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self.state.config.listen_addr().parse().map_err(|e| {
            RotatorError::InvalidConfig(format!(
                "invalid listen address {}: {}",
                self.state.config.listen_addr(),
                e
            ))
        })?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        info!("Proxy rotator listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| RotatorError::Internal(e.to_string()))?;

        info!("Proxy rotator shut down");
        Ok(())
    }
}
