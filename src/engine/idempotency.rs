//! Idempotency keys for order submission.
//!
//! A key is the first 16 hex chars of
//! `sha256("{bucket}|{symbol}|{side}|{qty}|{trace_id}")`, where `bucket` is
//! the current unix time divided into 60-second windows. The same trade
//! identity inside one window always yields the same key; the ledger's
//! unique constraint on the key then absorbs a resubmission.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::types::Side;

pub const DEFAULT_BUCKET_SECS: i64 = 60;
pub const DEFAULT_KEY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at_unix(secs: i64) -> Self {
        Self(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Index of the `bucket_secs` window containing `unix_secs`.
pub fn time_bucket(unix_secs: i64, bucket_secs: i64) -> i64 {
    unix_secs.div_euclid(bucket_secs.max(1))
}

/// Hash the trade identity into a hex key of `key_len` chars.
pub fn derive_key(
    bucket: i64,
    symbol: &str,
    side: Side,
    qty: &str,
    trace_id: &str,
    key_len: usize,
) -> String {
    let material = format!("{bucket}|{symbol}|{side}|{qty}|{trace_id}");
    let digest = Sha256::digest(material.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(key_len);
    key
}

#[derive(Clone)]
pub struct IdempotencyKeyGenerator {
    clock: Arc<dyn Clock>,
    bucket_secs: i64,
    key_len: usize,
}

impl IdempotencyKeyGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            bucket_secs: DEFAULT_BUCKET_SECS,
            key_len: DEFAULT_KEY_LEN,
        }
    }

    pub fn with_bucket_secs(mut self, secs: i64) -> Self {
        self.bucket_secs = secs.max(1);
        self
    }

    /// Key length in hex chars, at most 64.
    pub fn with_key_len(mut self, len: usize) -> Self {
        self.key_len = len.clamp(1, 64);
        self
    }

    pub fn generate(&self, symbol: &str, side: Side, qty: &str, trace_id: &str) -> String {
        let bucket = time_bucket(self.clock.now().timestamp(), self.bucket_secs);
        derive_key(bucket, symbol, side, qty, trace_id, self.key_len)
    }
}

impl Default for IdempotencyKeyGenerator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for IdempotencyKeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyKeyGenerator")
            .field("bucket_secs", &self.bucket_secs)
            .field("key_len", &self.key_len)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn generator_at(secs: i64) -> IdempotencyKeyGenerator {
        IdempotencyKeyGenerator::new(Arc::new(FixedClock::at_unix(secs)))
    }

    #[test]
    fn test_key_matches_documented_derivation() {
        // 1_700_000_000 / 60 = 28_333_333
        let key = generator_at(1_700_000_000).generate("BTC/USDT", Side::Buy, "0.001", "trace-1");
        let digest = Sha256::digest(b"28333333|BTC/USDT|BUY|0.001|trace-1");
        assert_eq!(key, hex::encode(digest)[..16]);
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_same_bucket_same_key() {
        let a = generator_at(120).generate("BTC/USDT", Side::Buy, "0.001", "t");
        let b = generator_at(179).generate("BTC/USDT", Side::Buy, "0.001", "t");
        assert_eq!(a, b);
    }

    #[test]
    fn test_bucket_boundary_changes_key() {
        let a = generator_at(119).generate("BTC/USDT", Side::Buy, "0.001", "t");
        let b = generator_at(120).generate("BTC/USDT", Side::Buy, "0.001", "t");
        assert_ne!(a, b);
    }

    #[test]
    fn test_each_identity_field_matters() {
        let g = generator_at(600);
        let base = g.generate("BTC/USDT", Side::Buy, "0.001", "t");
        assert_ne!(base, g.generate("ETH/USDT", Side::Buy, "0.001", "t"));
        assert_ne!(base, g.generate("BTC/USDT", Side::Sell, "0.001", "t"));
        assert_ne!(base, g.generate("BTC/USDT", Side::Buy, "0.002", "t"));
        assert_ne!(base, g.generate("BTC/USDT", Side::Buy, "0.001", "u"));
    }

    #[test]
    fn test_qty_string_form_is_significant() {
        // Keys hash the string as submitted, so scale matters
        let g = generator_at(600);
        assert_ne!(
            g.generate("BTC/USDT", Side::Buy, "0.10", "t"),
            g.generate("BTC/USDT", Side::Buy, "0.1", "t"),
        );
    }

    #[test]
    fn test_negative_time_buckets_floor() {
        assert_eq!(time_bucket(-1, 60), -1);
        assert_eq!(time_bucket(59, 60), 0);
        assert_eq!(time_bucket(60, 60), 1);
    }

    #[test]
    fn test_custom_width_and_length() {
        let g = generator_at(100).with_bucket_secs(300).with_key_len(32);
        let key = g.generate("BTC/USDT", Side::Sell, "1", "t");
        assert_eq!(key.len(), 32);
        assert_eq!(key, generator_at(299).with_bucket_secs(300).with_key_len(32).generate("BTC/USDT", Side::Sell, "1", "t"));
    }
}
