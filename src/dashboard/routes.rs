//! Dashboard API route handlers.
//!
//! All endpoints return JSON read straight from the ledger. State is shared
//! via `Arc<DashboardState>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::storage::{Ledger, LedgerError};
use crate::types::{DecisionRecord, ExperimentRecord, SnapshotRecord, TradeRecord};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct DashboardState {
    pub ledger: Ledger,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

impl LimitQuery {
    fn resolve(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioResponse {
    pub latest: Option<SnapshotRecord>,
    pub history: Vec<SnapshotRecord>,
    pub trade_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Handler failure rendered as a JSON error body.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Ledger(LedgerError),
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            Self::Ledger(e) => {
                error!(error = %e, "Dashboard ledger query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "ledger unavailable".to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// GET /api/decisions?limit=N
pub async fn get_decisions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<DecisionRecord>> {
    Ok(Json(state.ledger.recent_decisions(query.resolve()).await?))
}

/// GET /api/traces/:trace_id
pub async fn get_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> ApiResult<Vec<DecisionRecord>> {
    let chain = state.ledger.decision_chain(&trace_id).await?;
    if chain.is_empty() {
        return Err(ApiError::NotFound(format!("trace {trace_id}")));
    }
    Ok(Json(chain))
}

/// GET /api/trades?limit=N
pub async fn get_trades(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<TradeRecord>> {
    Ok(Json(state.ledger.recent_trades(query.resolve()).await?))
}

/// GET /api/portfolio?limit=N
pub async fn get_portfolio(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<PortfolioResponse> {
    Ok(Json(PortfolioResponse {
        latest: state.ledger.latest_snapshot().await?,
        history: state.ledger.recent_snapshots(query.resolve()).await?,
        trade_count: state.ledger.trade_count().await?,
    }))
}

/// GET /api/experiments?limit=N
pub async fn get_experiments(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<ExperimentRecord>> {
    Ok(Json(state.ledger.recent_experiments(query.resolve()).await?))
}
