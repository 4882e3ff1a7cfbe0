//! Dashboard: Axum server for read-only monitoring.
//!
//! Serves the audit ledger as a small JSON API. The server opens its own
//! read-only connection, so it can run beside the agent process.
//! CORS allows GET from any origin.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::storage::Ledger;
use routes::{AppState, DashboardState};

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/decisions", get(routes::get_decisions))
        .route("/api/traces/:trace_id", get(routes::get_trace))
        .route("/api/trades", get(routes::get_trades))
        .route("/api/portfolio", get(routes::get_portfolio))
        .route("/api/experiments", get(routes::get_experiments))
        .layer(cors)
        .with_state(state)
}

/// Serve the dashboard over the ledger at `db_path` until `shutdown`
/// resolves.
pub async fn serve(
    db_path: &Path,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let ledger = Ledger::open_read_only(db_path)
        .await
        .with_context(|| format!("Failed to open ledger {} read-only", db_path.display()))?;
    let app = build_router(Arc::new(DashboardState::new(ledger.clone())));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind dashboard port {port}"))?;
    info!(port, db = %db_path.display(), "Dashboard server listening on http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Dashboard server error")?;

    ledger.close().await;
    info!("Dashboard stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
