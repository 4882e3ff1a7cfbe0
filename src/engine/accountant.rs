//! Accountant: average-cost P&L and portfolio snapshots.
//!
//! Replays the recorded trades for the traded symbol to derive realized and
//! unrealized P&L at a mark price, combines them with the venue's balances
//! and appends the result to the ledger.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use crate::platforms::ExecutionGateway;
use crate::storage::Ledger;
use crate::types::{PortfolioSnapshot, Side, TradeRecord};

// ---------------------------------------------------------------------------
// Position book
// ---------------------------------------------------------------------------

/// Open position and P&L after replaying a trade history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PositionBook {
    pub position: Decimal,
    /// Average cost per base unit, fees included.
    pub avg_cost: Decimal,
    pub realized_pnl: Decimal,
}

impl PositionBook {
    /// Replay trades in execution order. Sells beyond the open position
    /// only realize against what is held.
    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        let mut book = Self::default();
        for trade in trades {
            book.apply(trade.side, trade.qty, trade.price, trade.fee);
        }
        book
    }

    pub fn apply(&mut self, side: Side, qty: Decimal, price: Decimal, fee: Decimal) {
        match side {
            Side::Buy => {
                let cost = self.avg_cost * self.position + qty * price + fee;
                self.position += qty;
                if self.position > Decimal::ZERO {
                    self.avg_cost = cost / self.position;
                }
            }
            Side::Sell => {
                let sold = qty.min(self.position);
                self.realized_pnl += sold * (price - self.avg_cost) - fee;
                self.position -= sold;
                if self.position.is_zero() {
                    self.avg_cost = Decimal::ZERO;
                }
            }
        }
    }

    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        self.position * (mark - self.avg_cost)
    }
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant {
    ledger: Ledger,
    gateway: Arc<dyn ExecutionGateway>,
    symbol: String,
}

impl Accountant {
    pub fn new(ledger: Ledger, gateway: Arc<dyn ExecutionGateway>, symbol: impl Into<String>) -> Self {
        Self {
            ledger,
            gateway,
            symbol: symbol.into(),
        }
    }

    /// Current valuation at `mark`, without recording it.
    pub async fn valuation(&self, mark: Decimal) -> Result<PortfolioSnapshot> {
        let balances = self
            .gateway
            .balances()
            .await
            .with_context(|| format!("Failed to read balances from {}", self.gateway.name()))?;
        let trades = self
            .ledger
            .trades_for_symbol(&self.symbol)
            .await
            .context("Failed to read trade history")?;

        let book = PositionBook::from_trades(&trades);
        debug!(
            trades = trades.len(),
            position = %book.position,
            avg_cost = %book.avg_cost,
            "Replayed trade history"
        );

        Ok(PortfolioSnapshot {
            balance_quote: balances.quote,
            balance_base: balances.base,
            unrealized_pnl: book.unrealized_pnl(mark),
            realized_pnl: book.realized_pnl,
        })
    }

    /// Value the portfolio at `mark` and append the snapshot to the ledger.
    pub async fn record_snapshot(&self, mark: Decimal) -> Result<(i64, PortfolioSnapshot)> {
        let snapshot = self.valuation(mark).await?;
        let id = self
            .ledger
            .snapshot_portfolio(&snapshot)
            .await
            .context("Failed to store portfolio snapshot")?;

        info!(
            id,
            quote = %snapshot.balance_quote,
            base = %snapshot.balance_base,
            unrealized = %snapshot.unrealized_pnl.round_dp(4),
            realized = %snapshot.realized_pnl.round_dp(4),
            "Portfolio snapshot"
        );
        Ok((id, snapshot))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::paper::PaperExchange;
    use crate::platforms::{Balances, StaticPrice};
    use crate::storage::tests::temp_db_path;
    use crate::types::{NewTrade, TradeStatus};
    use rust_decimal_macros::dec;

    #[test]
    fn test_buys_average_cost_with_fees() {
        let mut book = PositionBook::default();
        book.apply(Side::Buy, dec!(1), dec!(100), dec!(1));
        book.apply(Side::Buy, dec!(1), dec!(120), dec!(1));
        assert_eq!(book.position, dec!(2));
        assert_eq!(book.avg_cost, dec!(111));
        assert_eq!(book.realized_pnl, Decimal::ZERO);
        assert_eq!(book.unrealized_pnl(dec!(121)), dec!(20));
    }

    #[test]
    fn test_sell_realizes_against_average() {
        let mut book = PositionBook::default();
        book.apply(Side::Buy, dec!(2), dec!(100), Decimal::ZERO);
        book.apply(Side::Sell, dec!(1), dec!(110), dec!(0.5));
        assert_eq!(book.realized_pnl, dec!(9.5));
        assert_eq!(book.position, dec!(1));
        assert_eq!(book.avg_cost, dec!(100));

        book.apply(Side::Sell, dec!(1), dec!(90), Decimal::ZERO);
        assert_eq!(book.realized_pnl, dec!(-0.5));
        assert!(book.position.is_zero());
        assert!(book.avg_cost.is_zero());
    }

    #[test]
    fn test_oversell_is_bounded_by_position() {
        let mut book = PositionBook::default();
        book.apply(Side::Buy, dec!(1), dec!(100), Decimal::ZERO);
        book.apply(Side::Sell, dec!(3), dec!(110), Decimal::ZERO);
        assert_eq!(book.realized_pnl, dec!(10));
        assert!(book.position.is_zero());
        assert_eq!(book.unrealized_pnl(dec!(500)), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_record_snapshot_uses_venue_balances() {
        let ledger = Ledger::open(temp_db_path()).await.unwrap();
        let market = Arc::new(StaticPrice::new(dec!(100)));
        let venue = Arc::new(PaperExchange::new(
            market,
            Balances {
                quote: dec!(500),
                base: dec!(1),
            },
        ));
        ledger
            .insert_trade(&NewTrade {
                symbol: "BTC/USDT".to_string(),
                side: Side::Buy,
                qty: dec!(1),
                price: dec!(100),
                fee: Decimal::ZERO,
                order_id: Some("paper-1".to_string()),
                idempotency_key: "k1".to_string(),
                proposal_ref: None,
                status: TradeStatus::Filled,
            })
            .await
            .unwrap();

        let accountant = Accountant::new(ledger.clone(), venue, "BTC/USDT");
        let (id, snapshot) = accountant.record_snapshot(dec!(110)).await.unwrap();

        assert_eq!(snapshot.balance_quote, dec!(500));
        assert_eq!(snapshot.balance_base, dec!(1));
        assert_eq!(snapshot.unrealized_pnl, dec!(10));
        assert_eq!(snapshot.realized_pnl, Decimal::ZERO);

        let latest = ledger.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.unrealized_pnl, dec!(10));
    }
}
