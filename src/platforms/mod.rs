//! Venue integrations.
//!
//! Defines the `MarketData` and `ExecutionGateway` traits and provides:
//! - `binance::BinanceTicker`: public last-price feed
//! - `paper::PaperExchange`: in-memory venue for testnet runs
//! - `StaticPrice`: fixed price source for tests and dry runs

pub mod binance;
pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::types::{Side, TradeStatus};

// ---------------------------------------------------------------------------
// Order types
// ---------------------------------------------------------------------------

/// A market order. `client_order_id` carries the idempotency key so the
/// venue can deduplicate a resubmission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub client_order_id: String,
}

/// Venue confirmation of an executed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub fee: Decimal,
    pub status: TradeStatus,
}

/// Free balances in the quote and base assets of the traded pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub quote: Decimal,
    pub base: Decimal,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Source of the latest traded price.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn last_price(&self, symbol: &str) -> Result<Decimal>;

    /// Feed name for logging.
    fn name(&self) -> &str;
}

/// Order submission venue.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Submit a market order. Submitting the same `client_order_id` twice
    /// must not produce a second fill.
    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderFill>;

    /// Cancel every open order on `symbol`, returning how many were cancelled.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize>;

    async fn balances(&self) -> Result<Balances>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Static price
// ---------------------------------------------------------------------------

/// Price source returning a settable constant.
#[derive(Debug)]
pub struct StaticPrice {
    price: Mutex<Decimal>,
}

impl StaticPrice {
    pub fn new(price: Decimal) -> Self {
        Self {
            price: Mutex::new(price),
        }
    }

    pub fn set(&self, price: Decimal) {
        if let Ok(mut p) = self.price.lock() {
            *p = price;
        }
    }
}

#[async_trait]
impl MarketData for StaticPrice {
    async fn last_price(&self, _symbol: &str) -> Result<Decimal> {
        self.price
            .lock()
            .map(|p| *p)
            .map_err(|_| anyhow::anyhow!("static price lock poisoned"))
    }

    fn name(&self) -> &str {
        "static"
    }
}
