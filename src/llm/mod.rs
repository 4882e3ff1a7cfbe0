//! Decision generators.
//!
//! Defines the `PlanGenerator` and `ProposalGenerator` traits and provides
//! an OpenAI implementation of both. Generators return raw JSON; the
//! orchestrator parses it against the `Plan` / `Proposal` contracts, so a
//! misbehaving model can never hand the engine an unvalidated value.

pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::strategy::learning::Posterior;
use crate::types::{Plan, TradingMode};

/// Everything the planner sees at the start of a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct PlanningContext {
    pub symbol: String,
    pub timeframe: String,
    pub mode: TradingMode,
    pub cycle: u64,
    /// Latest scored result per strategy, newest first.
    pub posteriors: Vec<Posterior>,
}

/// Market state handed to the trader.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timeframe: String,
    pub last_price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Produces the per-cycle strategic plan.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Raw plan payload, validated by the caller.
    async fn generate_plan(&self, context: &PlanningContext) -> Result<Value>;
}

/// Produces a concrete trade proposal under a plan.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProposalGenerator: Send + Sync {
    /// Raw proposal payload, validated by the caller.
    async fn generate_proposal(&self, plan: &Plan, market: &MarketSnapshot) -> Result<Value>;
}
