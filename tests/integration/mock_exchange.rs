//! Test doubles for integration testing.
//!
//! Scripted plan/proposal generators that replay queued answers, a price
//! feed that can start failing after a number of calls, and a gateway
//! wrapping the paper venue with failure injection. All state is in-memory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use autotrader::llm::{MarketSnapshot, PlanGenerator, PlanningContext, ProposalGenerator};
use autotrader::platforms::paper::PaperExchange;
use autotrader::platforms::{Balances, ExecutionGateway, MarketData, OrderFill, OrderRequest};
use autotrader::types::Plan;

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// Replays queued answers in order; once the queue is drained the last
/// answer repeats.
struct Script {
    queue: Mutex<VecDeque<Result<Value, String>>>,
    last: Mutex<Option<Result<Value, String>>>,
}

impl Script {
    fn new(answers: Vec<Result<Value, String>>) -> Self {
        Self {
            queue: Mutex::new(answers.into()),
            last: Mutex::new(None),
        }
    }

    fn next(&self) -> Result<Value> {
        let answer = match self.queue.lock().unwrap().pop_front() {
            Some(answer) => {
                *self.last.lock().unwrap() = Some(answer.clone());
                answer
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err("script is empty".to_string())),
        };
        answer.map_err(|e| anyhow!(e))
    }
}

pub struct ScriptedPlanner {
    script: Script,
    contexts: Mutex<Vec<PlanningContext>>,
}

impl ScriptedPlanner {
    pub fn new(answers: Vec<Result<Value, String>>) -> Self {
        Self {
            script: Script::new(answers),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn always(answer: Value) -> Self {
        Self::new(vec![Ok(answer)])
    }

    /// Contexts received so far, oldest first.
    pub fn contexts(&self) -> Vec<PlanningContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlanGenerator for ScriptedPlanner {
    async fn generate_plan(&self, context: &PlanningContext) -> Result<Value> {
        self.contexts.lock().unwrap().push(context.clone());
        self.script.next()
    }
}

pub struct ScriptedTrader {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedTrader {
    pub fn new(answers: Vec<Result<Value, String>>) -> Self {
        Self {
            script: Script::new(answers),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(answer: Value) -> Self {
        Self::new(vec![Ok(answer)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProposalGenerator for ScriptedTrader {
    async fn generate_proposal(&self, _plan: &Plan, _market: &MarketSnapshot) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.next()
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Fixed price that fails every call from `fail_from` (0-based) onward.
pub struct FlakyMarket {
    price: Decimal,
    fail_from: Option<usize>,
    calls: AtomicUsize,
}

impl FlakyMarket {
    pub fn steady(price: Decimal) -> Self {
        Self {
            price,
            fail_from: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_from(price: Decimal, call: usize) -> Self {
        Self {
            price,
            fail_from: Some(call),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MarketData for FlakyMarket {
    async fn last_price(&self, _symbol: &str) -> Result<Decimal> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_from {
            Some(from) if n >= from => Err(anyhow!("ticker timeout")),
            _ => Ok(self.price),
        }
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Paper venue with an on/off failure switch and a submission counter.
pub struct FlakyGateway {
    inner: PaperExchange,
    failure: Mutex<Option<String>>,
    submissions: AtomicUsize,
}

impl FlakyGateway {
    pub fn new(market: Arc<dyn MarketData>, balances: Balances) -> Self {
        Self {
            inner: PaperExchange::new(market, balances),
            failure: Mutex::new(None),
            submissions: AtomicUsize::new(0),
        }
    }

    /// Reject every order with `msg` until cleared.
    pub fn set_error(&self, msg: &str) {
        *self.failure.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionGateway for FlakyGateway {
    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderFill> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let failure = self.failure.lock().unwrap().clone();
        if let Some(msg) = failure {
            return Err(anyhow!(msg));
        }
        self.inner.place_market_order(order).await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize> {
        self.inner.cancel_all_orders(symbol).await
    }

    async fn balances(&self) -> Result<Balances> {
        self.inner.balances().await
    }

    fn name(&self) -> &str {
        "flaky-paper"
    }
}
