//! Server assembly: config, stores, orchestrator, sweeper, HTTP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::WindsiteConfig;
use crate::orchestrator::Orchestrator;
use crate::runner::RunnerRegistry;
use crate::store::{DbHandle, SiteDb};
use crate::sweep::TurnSweeper;

pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3920,
            db_path: PathBuf::from(".windsite/site.db"),
            config_path: PathBuf::from("windsite.toml"),
            dev_mode: false,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Start the orchestrator server. Blocks until Ctrl+C, then shuts down the
/// HTTP listener and the background sweeper together.
pub async fn start_server(server_config: ServerConfig) -> Result<()> {
    let config = WindsiteConfig::load(&server_config.config_path)?;
    for warning in config.validate() {
        warn!("config: {}", warning);
    }

    if let Some(parent) = server_config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(
        SiteDb::new(&server_config.db_path).context("Failed to initialize site database")?,
    );

    let registry = Arc::new(RunnerRegistry::from_config(&config));
    let orchestrator = Orchestrator::new(
        db.clone(),
        registry,
        Duration::from_secs(config.sync_budget_secs),
    );

    let shutdown = CancellationToken::new();
    let sweeper = TurnSweeper::new(db.clone(), Duration::from_secs(config.sweep_after_secs));
    let sweep_handle = tokio::spawn(sweeper.run(
        Duration::from_secs(config.sweep_after_secs.max(1)),
        shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        db,
        orchestrator,
        poll_interval: Duration::from_secs(config.poll_interval_secs),
    });
    let mut app = build_router(state);
    if server_config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server_config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("windsite orchestrator listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = sweep_handle.await;
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_local_only() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3920);
        assert!(!config.dev_mode);
        assert_eq!(config.db_path, PathBuf::from(".windsite/site.db"));
    }
}
