//! In-memory paper venue.
//!
//! Fills market orders immediately at the current market-data price and
//! charges a flat 0.1% fee in the quote asset. Balances are enforced, and a
//! repeated `client_order_id` returns the original fill instead of trading
//! again.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Balances, ExecutionGateway, MarketData, OrderFill, OrderRequest};
use crate::decimal;
use crate::types::{Side, TradeStatus};

const VENUE_NAME: &str = "paper";

/// Taker fee as a fraction of notional.
pub const DEFAULT_FEE_RATE: Decimal = dec!(0.001);

#[derive(Debug)]
struct PaperBook {
    balances: Balances,
    fills: HashMap<String, OrderFill>,
    next_order: u64,
}

pub struct PaperExchange {
    market: Arc<dyn MarketData>,
    fee_rate: Decimal,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(market: Arc<dyn MarketData>, starting: Balances) -> Self {
        Self {
            market,
            fee_rate: DEFAULT_FEE_RATE,
            book: Mutex::new(PaperBook {
                balances: starting,
                fills: HashMap::new(),
                next_order: 1,
            }),
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Number of distinct orders filled so far.
    pub async fn fill_count(&self) -> usize {
        self.book.lock().await.fills.len()
    }
}

#[async_trait]
impl ExecutionGateway for PaperExchange {
    async fn place_market_order(&self, order: &OrderRequest) -> Result<OrderFill> {
        if order.qty <= Decimal::ZERO {
            bail!("Order quantity must be positive, got {}", order.qty);
        }

        let mut book = self.book.lock().await;

        if let Some(existing) = book.fills.get(&order.client_order_id) {
            debug!(
                client_order_id = %order.client_order_id,
                order_id = %existing.order_id,
                "Duplicate client order id, returning original fill"
            );
            return Ok(existing.clone());
        }

        let price = self
            .market
            .last_price(&order.symbol)
            .await
            .context("Paper venue could not price order")?;
        if price <= Decimal::ZERO {
            bail!("Market price must be positive, got {price}");
        }

        let notional = decimal::notional(order.qty, price)
            .context("Order notional overflow")?;
        let fee = notional * self.fee_rate;

        let mut balances = book.balances;
        match order.side {
            Side::Buy => {
                let cost = notional + fee;
                if cost > balances.quote {
                    bail!(
                        "Insufficient quote balance: need {cost}, have {}",
                        balances.quote
                    );
                }
                balances.quote -= cost;
                balances.base += order.qty;
            }
            Side::Sell => {
                if order.qty > balances.base {
                    bail!(
                        "Insufficient base balance: need {}, have {}",
                        order.qty,
                        balances.base
                    );
                }
                balances.base -= order.qty;
                balances.quote += notional - fee;
            }
        }

        let order_id = format!("{VENUE_NAME}-{}", book.next_order);
        book.next_order += 1;
        book.balances = balances;

        let fill = OrderFill {
            order_id,
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            filled_qty: order.qty,
            avg_price: price,
            fee,
            status: TradeStatus::Filled,
        };
        book.fills.insert(order.client_order_id.clone(), fill.clone());

        info!(
            order_id = %fill.order_id,
            side = %fill.side,
            qty = %fill.filled_qty,
            price = %fill.avg_price,
            fee = %fill.fee,
            "Paper order filled"
        );

        Ok(fill)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize> {
        // Market orders fill on submission, so nothing is ever resting
        debug!(symbol, "Paper venue has no open orders to cancel");
        Ok(0)
    }

    async fn balances(&self) -> Result<Balances> {
        Ok(self.book.lock().await.balances)
    }

    fn name(&self) -> &str {
        VENUE_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::StaticPrice;

    fn exchange(price: Decimal) -> PaperExchange {
        PaperExchange::new(
            Arc::new(StaticPrice::new(price)),
            Balances {
                quote: dec!(1000),
                base: dec!(0.02),
            },
        )
    }

    fn order(side: Side, qty: Decimal, id: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BTC/USDT".to_string(),
            side,
            qty,
            client_order_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_buy_debits_quote_with_fee() {
        let ex = exchange(dec!(50000));
        let fill = ex
            .place_market_order(&order(Side::Buy, dec!(0.001), "k1"))
            .await
            .unwrap();

        assert_eq!(fill.avg_price, dec!(50000));
        assert_eq!(fill.fee, dec!(0.05));
        assert_eq!(fill.status, TradeStatus::Filled);

        let b = ex.balances().await.unwrap();
        assert_eq!(b.quote, dec!(949.95));
        assert_eq!(b.base, dec!(0.021));
    }

    #[tokio::test]
    async fn test_sell_credits_quote_net_of_fee() {
        let ex = exchange(dec!(50000));
        ex.place_market_order(&order(Side::Sell, dec!(0.01), "k1"))
            .await
            .unwrap();

        let b = ex.balances().await.unwrap();
        assert_eq!(b.quote, dec!(1499.5));
        assert_eq!(b.base, dec!(0.01));
    }

    #[tokio::test]
    async fn test_duplicate_client_id_fills_once() {
        let ex = exchange(dec!(50000));
        let a = ex
            .place_market_order(&order(Side::Buy, dec!(0.001), "same"))
            .await
            .unwrap();
        let b = ex
            .place_market_order(&order(Side::Buy, dec!(0.001), "same"))
            .await
            .unwrap();

        assert_eq!(a.order_id, b.order_id);
        assert_eq!(ex.fill_count().await, 1);
        assert_eq!(ex.balances().await.unwrap().base, dec!(0.021));
    }

    #[tokio::test]
    async fn test_insufficient_balances_rejected() {
        let ex = exchange(dec!(50000));
        assert!(ex
            .place_market_order(&order(Side::Buy, dec!(1), "big"))
            .await
            .is_err());
        assert!(ex
            .place_market_order(&order(Side::Sell, dec!(0.5), "big-sell"))
            .await
            .is_err());
        assert_eq!(ex.fill_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_qty_rejected() {
        let ex = exchange(dec!(50000));
        assert!(ex
            .place_market_order(&order(Side::Buy, Decimal::ZERO, "z"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_all_is_noop() {
        let ex = exchange(dec!(50000));
        assert_eq!(ex.cancel_all_orders("BTC/USDT").await.unwrap(), 0);
    }
}
