//! `hubbub serve`: the session backend.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hubconf::HubConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::AgentLoop;
use crate::api::{self, AppState};
use crate::model::GeminiModel;
use crate::pool::HttpConnector;
use crate::session::{spawn_sweeper, SessionManager};

/// Read the system instruction, if the file exists.
pub fn load_system_prompt(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "no system prompt loaded");
            None
        }
    }
}

pub async fn run(config: HubConfig) -> Result<()> {
    let servers = config
        .servers()
        .with_context(|| format!("Failed to load {}", config.mcp.servers_file.display()))?;
    info!(servers = servers.len(), "loaded tool providers");

    let model = GeminiModel::new(&config.model, load_system_prompt(&config.model.system_prompt))
        .context("Failed to configure model")?;
    info!(model = %model.model(), "model ready");

    let connector = HttpConnector::new(config.agent.tool_timeout());
    let agent = AgentLoop::new(servers, Arc::new(connector)).with_config(&config.agent);
    let sessions = Arc::new(SessionManager::new(Arc::new(model), agent));

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(
        sessions.clone(),
        config.sessions.sweep_interval(),
        config.sessions.ttl(),
        cancel.clone(),
    );

    let app = api::router(AppState::new(sessions), &config.cors.allowed_origins);

    let addr = config.bind.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("hubbub listening on http://{}", addr);
    info!("   Sessions: POST http://{}/api/session", addr);
    info!("   Health:   GET  http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "session sweeper did not stop cleanly");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
