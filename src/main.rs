//! Proxy Rotator - Entry Point
//!
//! Restores the pool, serves until SIGINT/SIGTERM, then saves the pool.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxy_rotator::api::{ApiServer, AppState};
use proxy_rotator::proxy::{
    HyperTransport, ProxyHandler, ProxyHandlerConfig, ProxyRegistry, RoundRobinSelector,
    SelectorConfig,
};
use proxy_rotator::state::StateFile;
use proxy_rotator::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config);

    info!("Starting proxy rotator with {} proxies", config.proxies.len());

    let registry = Arc::new(ProxyRegistry::from_config(&config));
    let state_file = StateFile::new(config.state_path());
    match state_file.load() {
        Ok(Some(proxies)) => registry.replace(proxies),
        Ok(None) => {}
        Err(e) => warn!(
            "Ignoring unreadable state file {}: {}",
            state_file.path().display(),
            e
        ),
    }

    let selector = RoundRobinSelector::new(registry.clone(), SelectorConfig::from_config(&config));
    let handler = ProxyHandler::new(
        selector,
        Arc::new(HyperTransport::new()),
        ProxyHandlerConfig::from_config(&config),
    );

    let server = ApiServer::new(AppState::new(Arc::new(handler), Arc::new(config)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(shutdown_rx).await {
            error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;

    state_file
        .save(&registry.snapshot())
        .context("failed to save pool state")?;

    info!("Proxy rotator stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
