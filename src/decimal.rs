//! Exact fixed-point helpers.
//!
//! Every monetary quantity in the agent is a `rust_decimal::Decimal`.
//! Nothing in here goes through `f64`, so a value read from the ledger,
//! multiplied, and written back keeps its exact representation.

use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Failure to turn a string into an exact non-negative decimal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecimalError {
    #[error("not a non-negative decimal string: {0:?}")]
    Malformed(String),

    #[error("decimal out of representable range: {0:?}")]
    Overflow(String),
}

/// Whether `s` matches `^\d+(\.\d+)?$`.
pub fn is_decimal_string(s: &str) -> bool {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };

    let all_digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());

    all_digits(int_part) && frac_part.map_or(true, all_digits)
}

/// Parse a non-negative decimal string, keeping its written scale
/// (`"0.100"` parses with three fractional digits).
pub fn parse_decimal(s: &str) -> Result<Decimal, DecimalError> {
    if !is_decimal_string(s) {
        return Err(DecimalError::Malformed(s.to_string()));
    }
    Decimal::from_str(s).map_err(|_| DecimalError::Overflow(s.to_string()))
}

/// Monetary size of a trade: `qty × price`. `None` on overflow.
pub fn notional(qty: Decimal, price: Decimal) -> Option<Decimal> {
    qty.checked_mul(price)
}

/// Truncate toward zero to `dp` fractional digits.
pub fn quantize_down(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::ToZero)
}

/// Number of fractional digits as written.
pub fn fractional_digits(value: Decimal) -> u32 {
    value.scale()
}

/// Bound `value` to `[min, max]`.
pub fn clamp(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    value.max(min).min(max)
}

/// `numerator / denominator`, `None` for a zero denominator or overflow.
pub fn safe_divide(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator.is_zero() {
        return None;
    }
    numerator.checked_div(denominator)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_string_pattern() {
        assert!(is_decimal_string("0"));
        assert!(is_decimal_string("0.001"));
        assert!(is_decimal_string("12345.67890"));

        assert!(!is_decimal_string(""));
        assert!(!is_decimal_string("-1"));
        assert!(!is_decimal_string(".5"));
        assert!(!is_decimal_string("5."));
        assert!(!is_decimal_string("1e5"));
        assert!(!is_decimal_string("1.2.3"));
        assert!(!is_decimal_string(" 1"));
    }

    #[test]
    fn test_parse_keeps_scale() {
        let d = parse_decimal("0.100").unwrap();
        assert_eq!(d, dec!(0.1));
        assert_eq!(fractional_digits(d), 3);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            parse_decimal("abc"),
            Err(DecimalError::Malformed("abc".to_string()))
        );
        assert!(matches!(
            parse_decimal("99999999999999999999999999999999999"),
            Err(DecimalError::Overflow(_))
        ));
    }

    #[test]
    fn test_notional_is_exact() {
        let qty = parse_decimal("0.001").unwrap();
        let price = parse_decimal("50000.00").unwrap();
        let n = notional(qty, price).unwrap();
        assert_eq!(n, dec!(50.000));
        assert_eq!(n.normalize().to_string(), "50");
    }

    #[test]
    fn test_notional_no_float_artifacts() {
        // 0.1 * 3 is 0.30000000000000004 in binary floating point
        let n = notional(dec!(0.1), dec!(3)).unwrap();
        assert_eq!(n.to_string(), "0.3");
    }

    #[test]
    fn test_notional_overflow() {
        assert!(notional(Decimal::MAX, dec!(2)).is_none());
    }

    #[test]
    fn test_quantize_down_truncates() {
        assert_eq!(quantize_down(dec!(0.000099999), 5), dec!(0.00009));
        assert_eq!(quantize_down(dec!(1.99999), 2), dec!(1.99));
        assert_eq!(quantize_down(dec!(0.00009), 5).to_string(), "0.00009");
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(dec!(1.5), dec!(0), dec!(1)), dec!(1));
        assert_eq!(clamp(dec!(-0.2), dec!(0), dec!(1)), dec!(0));
        assert_eq!(clamp(dec!(0.9), dec!(0), dec!(1)), dec!(0.9));
    }

    #[test]
    fn test_safe_divide() {
        assert_eq!(safe_divide(dec!(5), dec!(50000)), Some(dec!(0.0001)));
        assert_eq!(safe_divide(dec!(5), Decimal::ZERO), None);
    }
}
