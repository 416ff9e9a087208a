//! Log File Metric Exporter - bytes logged per container
//!
//! This binary runs as a DaemonSet on each Kubernetes node, watching the
//! pod log directory and exposing `log_logged_bytes_total`.

use anyhow::{Context, Result};
use exporter_lib::{
    health::{components, HealthRegistry},
    LogWatcher, StructuredLogger,
};
use prometheus::Registry;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::ExporterConfig::load().context("Failed to load configuration")?;
    info!(node_name = %config.node_name, dir = %config.dir.display(), "Exporter configured");

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(EXPORTER_VERSION, &config.dir.display().to_string());

    let health_registry = HealthRegistry::new();
    health_registry.register(components::WATCHER).await;

    let registry = Registry::new();
    let mut watcher = LogWatcher::new(&config.watch_config(), registry.clone(), logger.clone())
        .with_context(|| format!("Failed to watch {}", config.dir.display()))?;
    let handle = watcher.handle();

    // The run loop owns the watcher; it is stopped through the handle
    let watch_health = health_registry.clone();
    let watch_task = tokio::spawn(async move {
        let result = watcher.watch().await;
        if let Err(e) = &result {
            error!(error = %e, "Log watcher failed");
            watch_health
                .set_unhealthy(components::WATCHER, e.to_string())
                .await;
        }
        result
    });

    health_registry.set_ready(true).await;

    let app_state = Arc::new(api::AppState::new(health_registry, registry));
    let api_handle = tokio::spawn(api::serve(config.port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            logger.log_shutdown("API server stopped");
            result.context("API server panicked")??;
        }
    }

    handle.close();
    match watch_task.await {
        Ok(Ok(())) => info!("Shut down cleanly"),
        Ok(Err(e)) => info!(error = %e, "Watcher had already failed"),
        Err(e) => error!(error = %e, "Watcher task panicked"),
    }

    Ok(())
}
