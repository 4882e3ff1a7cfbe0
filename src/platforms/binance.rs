//! Binance public price feed.
//!
//! Reads the last traded price from the unauthenticated ticker endpoint.
//! No order placement happens here; execution goes through an
//! `ExecutionGateway`.
//!
//! API docs: https://developers.binance.com/docs/binance-spot-api-docs/rest-api
//! Endpoint: GET /api/v3/ticker/price?symbol=BTCUSDT

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::debug;

use super::MarketData;
use crate::types::TradingMode;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const PRODUCTION_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";
const FEED_NAME: &str = "binance";

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    /// Sent as a string to keep full precision.
    price: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BinanceTicker {
    http: Client,
    base_url: String,
}

impl BinanceTicker {
    pub fn new(mode: TradingMode) -> Result<Self> {
        let base_url = match mode {
            TradingMode::Testnet => TESTNET_URL,
            TradingMode::Real => PRODUCTION_URL,
        };
        Self::with_base_url(base_url)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("autotrader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client for Binance")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `BTC/USDT` → `BTCUSDT`.
    pub fn exchange_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    fn parse_ticker(body: &str) -> Result<Decimal> {
        let ticker: TickerPrice =
            serde_json::from_str(body).context("Failed to parse Binance ticker response")?;
        let price = Decimal::from_str(&ticker.price)
            .with_context(|| format!("Invalid price {:?} for {}", ticker.price, ticker.symbol))?;
        if price <= Decimal::ZERO {
            anyhow::bail!("Non-positive price {price} for {}", ticker.symbol);
        }
        Ok(price)
    }
}

#[async_trait]
impl MarketData for BinanceTicker {
    async fn last_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url,
            urlencoding::encode(&Self::exchange_symbol(symbol))
        );
        debug!(url = %url, "Fetching Binance ticker");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Binance ticker request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {status}: {body}");
        }

        let body = resp
            .text()
            .await
            .context("Failed to read Binance ticker body")?;
        Self::parse_ticker(&body)
    }

    fn name(&self) -> &str {
        FEED_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_mapping() {
        assert_eq!(BinanceTicker::exchange_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(BinanceTicker::exchange_symbol("eth/btc"), "ETHBTC");
    }

    #[test]
    fn test_base_url_by_mode() {
        assert_eq!(BinanceTicker::new(TradingMode::Testnet).unwrap().base_url(), TESTNET_URL);
        assert_eq!(BinanceTicker::new(TradingMode::Real).unwrap().base_url(), PRODUCTION_URL);
        assert_eq!(
            BinanceTicker::with_base_url("http://localhost:9000/").unwrap().base_url(),
            "http://localhost:9000"
        );
    }

    #[test]
    fn test_parse_ticker_keeps_precision() {
        let price =
            BinanceTicker::parse_ticker(r#"{"symbol":"BTCUSDT","price":"50123.45000000"}"#).unwrap();
        assert_eq!(price, dec!(50123.45));
        assert_eq!(price.to_string(), "50123.45000000");
    }

    #[test]
    fn test_parse_ticker_rejects_bad_payloads() {
        assert!(BinanceTicker::parse_ticker(r#"{"symbol":"BTCUSDT"}"#).is_err());
        assert!(BinanceTicker::parse_ticker(r#"{"symbol":"BTCUSDT","price":"abc"}"#).is_err());
        assert!(BinanceTicker::parse_ticker(r#"{"symbol":"BTCUSDT","price":"0"}"#).is_err());
        assert!(BinanceTicker::parse_ticker("not json").is_err());
    }
}
