//! Trade executor.
//!
//! Turns an approved or revised proposal into at most one recorded trade:
//! derive the idempotency key, skip if the ledger already has it, submit the
//! market order, record the fill, snapshot the portfolio and feed the result
//! back into learning memory. Venue failures are reported, never retried.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::accountant::Accountant;
use super::idempotency::IdempotencyKeyGenerator;
use crate::decimal::parse_decimal;
use crate::platforms::{ExecutionGateway, OrderFill, OrderRequest};
use crate::storage::{Ledger, LedgerError};
use crate::strategy::learning::Memory;
use crate::types::{Decision, NewTrade, Proposal, Side, Verdict};

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Order filled. `trade_id` is `None` only if the trade row itself
    /// could not be written.
    Executed {
        trade_id: Option<i64>,
        fill: OrderFill,
    },
    /// A trade with this key is already in the ledger.
    AlreadyRecorded { key: String },
    /// The venue refused or the request failed.
    Failed { reason: String },
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Executed { .. } => "executed",
            Self::AlreadyRecorded { .. } => "already_recorded",
            Self::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    gateway: Arc<dyn ExecutionGateway>,
    ledger: Ledger,
    accountant: Accountant,
    memory: Memory,
    keys: IdempotencyKeyGenerator,
    symbol: String,
}

impl Executor {
    pub fn new(
        gateway: Arc<dyn ExecutionGateway>,
        ledger: Ledger,
        memory: Memory,
        symbol: impl Into<String>,
    ) -> Self {
        let symbol = symbol.into();
        Self {
            accountant: Accountant::new(ledger.clone(), gateway.clone(), symbol.clone()),
            gateway,
            ledger,
            memory,
            keys: IdempotencyKeyGenerator::default(),
            symbol,
        }
    }

    pub fn with_key_generator(mut self, keys: IdempotencyKeyGenerator) -> Self {
        self.keys = keys;
        self
    }

    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    /// Execute `proposal` under `verdict`.
    ///
    /// Errors are reserved for inconsistent inputs (HOLD, REJECT, REVISE
    /// without a quantity); venue and ledger trouble is folded into the
    /// outcome or logged.
    pub async fn execute(
        &self,
        trace_id: &str,
        proposal: &Proposal,
        verdict: &Verdict,
        proposal_ref: Option<i64>,
    ) -> Result<ExecutionOutcome> {
        let side = Side::try_from(proposal.action())
            .with_context(|| format!("Cannot execute a {} proposal", proposal.action()))?;

        let qty_str = match verdict.decision() {
            Decision::Approve => proposal.qty(),
            Decision::Revise => verdict
                .revised_qty()
                .context("REVISE verdict carries no revised quantity")?,
            Decision::Reject => bail!("Cannot execute a rejected proposal"),
        };
        let qty = parse_decimal(qty_str)
            .with_context(|| format!("Unexecutable quantity {qty_str:?}"))?;

        let key = self.keys.generate(&self.symbol, side, qty_str, trace_id);

        match self.ledger.trade_by_key(&key).await {
            Ok(Some(existing)) => {
                info!(trace_id, key = %key, trade_id = existing.id, "Trade already recorded, skipping submission");
                return Ok(ExecutionOutcome::AlreadyRecorded { key });
            }
            Ok(None) => {}
            Err(e) => warn!(trace_id, key = %key, error = %e, "Idempotency pre-check failed, submitting anyway"),
        }

        let order = OrderRequest {
            symbol: self.symbol.clone(),
            side,
            qty,
            client_order_id: key.clone(),
        };
        info!(
            trace_id,
            side = %side,
            qty = %qty,
            key = %key,
            venue = self.gateway.name(),
            "Submitting market order"
        );

        let fill = match self.gateway.place_market_order(&order).await {
            Ok(fill) => fill,
            Err(e) => {
                let reason = format!("{e:#}");
                error!(trace_id, key = %key, error = %reason, "Order submission failed");
                self.memory
                    .write_experiment(
                        proposal.policy_id(),
                        json!({
                            "result": "execution_failed",
                            "error": reason,
                            "confidence": proposal.confidence(),
                            "trace_id": trace_id,
                        }),
                    )
                    .await;
                return Ok(ExecutionOutcome::Failed { reason });
            }
        };

        let trade = NewTrade {
            symbol: self.symbol.clone(),
            side,
            qty: fill.filled_qty,
            price: fill.avg_price,
            fee: fill.fee,
            order_id: Some(fill.order_id.clone()),
            idempotency_key: key.clone(),
            proposal_ref,
            status: fill.status,
        };

        let trade_id = match self.ledger.insert_trade(&trade).await {
            Ok(id) => Some(id),
            Err(LedgerError::DuplicateIdempotencyKey(key)) => {
                info!(trace_id, key = %key, "Concurrent insert won, trade already recorded");
                return Ok(ExecutionOutcome::AlreadyRecorded { key });
            }
            Err(e) => {
                error!(trace_id, key = %key, error = %e, "Failed to record trade");
                None
            }
        };

        if let Err(e) = self.accountant.record_snapshot(fill.avg_price).await {
            warn!(trace_id, error = %e, "Post-trade snapshot failed");
        }

        self.memory
            .write_experiment(
                proposal.policy_id(),
                json!({
                    "result": "executed",
                    "action": proposal.action(),
                    "qty": fill.filled_qty.to_string(),
                    "price": fill.avg_price.to_string(),
                    "fee": fill.fee.to_string(),
                    "confidence": proposal.confidence(),
                    "trade_id": trade_id,
                    "trace_id": trace_id,
                }),
            )
            .await;

        info!(
            trace_id,
            trade_id = ?trade_id,
            order_id = %fill.order_id,
            qty = %fill.filled_qty,
            price = %fill.avg_price,
            fee = %fill.fee,
            "Trade executed"
        );

        Ok(ExecutionOutcome::Executed { trade_id, fill })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::idempotency::FixedClock;
    use crate::platforms::paper::PaperExchange;
    use crate::platforms::{Balances, StaticPrice};
    use crate::storage::tests::temp_db_path;
    use crate::types::{Action, TradingMode};
    use rust_decimal_macros::dec;

    const SYMBOL: &str = "BTC/USDT";

    async fn setup(quote: rust_decimal::Decimal) -> (Executor, Ledger, Arc<PaperExchange>) {
        let ledger = Ledger::open(temp_db_path()).await.unwrap();
        let market = Arc::new(StaticPrice::new(dec!(50000)));
        let venue = Arc::new(PaperExchange::new(
            market,
            Balances {
                quote,
                base: dec!(0),
            },
        ));
        let memory = Memory::new(ledger.clone(), SYMBOL, TradingMode::Testnet);
        let executor = Executor::new(venue.clone(), ledger.clone(), memory, SYMBOL)
            .with_key_generator(IdempotencyKeyGenerator::new(Arc::new(FixedClock::at_unix(1_700_000_000))));
        (executor, ledger, venue)
    }

    fn buy(qty: &str) -> Proposal {
        Proposal::new(Action::Buy, qty, "momentum_v1", "Breakout above range", 0.8).unwrap()
    }

    #[tokio::test]
    async fn test_approved_buy_records_everything() {
        let (executor, ledger, _) = setup(dec!(1000)).await;
        let outcome = executor
            .execute("trace-1", &buy("0.0001"), &Verdict::approve("ok"), Some(7))
            .await
            .unwrap();

        let ExecutionOutcome::Executed { trade_id, fill } = outcome else {
            panic!("expected execution, got {outcome:?}");
        };
        assert_eq!(fill.filled_qty, dec!(0.0001));
        assert_eq!(fill.avg_price, dec!(50000));

        let trades = ledger.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(Some(trades[0].id), trade_id);
        assert_eq!(trades[0].proposal_ref, Some(7));
        assert_eq!(trades[0].idempotency_key, fill.client_order_id);

        assert!(ledger.latest_snapshot().await.unwrap().is_some());

        let experiments = ledger.recent_experiments(10).await.unwrap();
        assert_eq!(experiments[0].key, "momentum_v1");
        assert_eq!(experiments[0].value["result"], "executed");
        assert_eq!(experiments[0].value["trace_id"], "trace-1");
    }

    #[tokio::test]
    async fn test_revised_quantity_is_used() {
        let (executor, ledger, _) = setup(dec!(1000)).await;
        let verdict = Verdict::revise(dec!(0.00009), vec!["cap".to_string()], "adjusted");
        executor
            .execute("trace-2", &buy("0.001"), &verdict, None)
            .await
            .unwrap();
        let trades = ledger.recent_trades(1).await.unwrap();
        assert_eq!(trades[0].qty, dec!(0.00009));
    }

    #[tokio::test]
    async fn test_same_trace_is_not_executed_twice() {
        let (executor, ledger, venue) = setup(dec!(1000)).await;
        let proposal = buy("0.0001");
        let verdict = Verdict::approve("ok");

        let first = executor.execute("trace-3", &proposal, &verdict, None).await.unwrap();
        assert_eq!(first.label(), "executed");
        let second = executor.execute("trace-3", &proposal, &verdict, None).await.unwrap();
        assert!(matches!(second, ExecutionOutcome::AlreadyRecorded { .. }));

        assert_eq!(ledger.trade_count().await.unwrap(), 1);
        assert_eq!(venue.fill_count().await, 1);
    }

    #[tokio::test]
    async fn test_venue_failure_is_reported_not_raised() {
        // 0.1 BTC at 50000 exceeds the 1000 USDT balance
        let (executor, ledger, _) = setup(dec!(1000)).await;
        let outcome = executor
            .execute("trace-4", &buy("0.1"), &Verdict::approve("ok"), None)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert_eq!(ledger.trade_count().await.unwrap(), 0);

        let experiments = ledger.recent_experiments(1).await.unwrap();
        assert_eq!(experiments[0].value["result"], "execution_failed");
        assert!(experiments[0].value["error"].is_string());
    }

    #[tokio::test]
    async fn test_inconsistent_inputs_are_errors() {
        let (executor, _, _) = setup(dec!(1000)).await;
        let hold = Proposal::fallback_hold();
        assert!(executor
            .execute("t", &hold, &Verdict::approve("ok"), None)
            .await
            .is_err());
        assert!(executor
            .execute("t", &buy("0.0001"), &Verdict::fallback_reject(), None)
            .await
            .is_err());
    }
}
