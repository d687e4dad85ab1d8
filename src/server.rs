//! Server bootstrap.
//!
//! Grounded on the teacher's `factory/server.rs`: build the router, bind a
//! `TcpListener`, `axum::serve` with a Ctrl+C graceful shutdown, log the
//! bound address. CORS is permissive the same way the teacher's dev mode is
//! — the control plane here has no browser-facing dev/prod split, so it's
//! applied unconditionally rather than gated on a flag.

use crate::app::AppState;
use crate::{api, ws};
use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Assembles the Automation API and WebSocket Fabric into one router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::router()
        .route("/ws/devteam", get(ws::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Binds and serves the router until Ctrl+C, then returns once the listener
/// has shut down.
pub async fn start(state: Arc<AppState>, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr().context("failed to read bound address")?;
    info!(%local_addr, "devteam-runner listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("devteam-runner shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
