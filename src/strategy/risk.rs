//! Risk judge.
//!
//! Deterministic review of a trade proposal against the exchange-style
//! constraints (minimum size, precision) and, in real mode, the deposit cap.
//! When a real-mode proposal breaks the cap the judge tries to shrink it to
//! 90% of the largest quantity the cap allows; if that is still below the
//! minimum size the proposal is rejected.
//!
//! All arithmetic is exact `Decimal`. Any failure inside the review turns
//! into a REJECT, never into an approval.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::decimal::{self, DecimalError};
use crate::types::{Action, Proposal, TradingMode, Verdict};

pub const NOTE_APPROVED: &str = "All constraints satisfied";
pub const NOTE_REVISED: &str = "Quantity adjusted for constraints";
pub const NOTE_REJECTED: &str = "Constraints cannot be satisfied";
pub const NOTE_INTERNAL_ERROR: &str = "Judge error - rejecting for safety";
pub const VIOLATION_INTERNAL_ERROR: &str = "Internal error in risk assessment";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    pub mode: TradingMode,
    /// Maximum notional (quote currency) per trade, real mode only.
    pub deposit_cap: Decimal,
    /// Smallest tradable quantity.
    pub min_qty: Decimal,
    /// Maximum fractional digits in a quantity.
    pub qty_precision: u32,
    /// Fractional digits kept in a revised quantity.
    pub revision_dp: u32,
    /// Fraction of the cap-implied maximum used for a revision.
    pub safety_margin: Decimal,
}

impl RiskConfig {
    pub fn new(mode: TradingMode, deposit_cap: Decimal) -> Self {
        Self {
            mode,
            deposit_cap,
            ..Self::default()
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Testnet,
            deposit_cap: dec!(5.0),
            min_qty: dec!(0.00001),
            qty_precision: 8,
            revision_dp: 5,
            safety_margin: dec!(0.9),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskError {
    #[error("unparseable quantity: {0}")]
    Quantity(#[from] DecimalError),

    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),
}

// ---------------------------------------------------------------------------
// Judge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RiskJudge {
    config: RiskConfig,
}

impl RiskJudge {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Review `proposal` at `price`. Never fails: internal errors become a
    /// REJECT carrying a single generic violation.
    pub fn review(&self, proposal: &Proposal, price: Decimal) -> Verdict {
        if proposal.action() == Action::Hold {
            return Verdict::approve(NOTE_APPROVED);
        }

        match self.assess(proposal, price) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, proposal = %proposal, "Risk assessment failed, rejecting");
                Verdict::reject(
                    vec![VIOLATION_INTERNAL_ERROR.to_string()],
                    NOTE_INTERNAL_ERROR,
                )
            }
        }
    }

    fn assess(&self, proposal: &Proposal, price: Decimal) -> Result<Verdict, RiskError> {
        if price <= Decimal::ZERO {
            return Err(RiskError::NonPositivePrice(price));
        }

        let qty = proposal.qty_decimal()?;
        let violations = self.violations(qty, price)?;

        if violations.is_empty() {
            info!(qty = %qty, price = %price, "Proposal approved, no constraint violations");
            return Ok(Verdict::approve(NOTE_APPROVED));
        }

        if self.config.mode == TradingMode::Real {
            if let Some(revised) = self.revised_qty(price)? {
                info!(
                    qty = %qty,
                    revised = %revised,
                    violations = violations.len(),
                    "Proposal revised"
                );
                return Ok(Verdict::revise(revised, violations, NOTE_REVISED));
            }
        }

        info!(qty = %qty, violations = violations.len(), "Proposal rejected");
        Ok(Verdict::reject(violations, NOTE_REJECTED))
    }

    /// Constraint violations for a BUY/SELL of `qty` at `price`, in check
    /// order: deposit cap (real mode), minimum size, precision.
    pub fn violations(&self, qty: Decimal, price: Decimal) -> Result<Vec<String>, RiskError> {
        let mut violations = Vec::new();

        if self.config.mode == TradingMode::Real {
            let notional =
                decimal::notional(qty, price).ok_or(RiskError::Overflow("notional"))?;
            if notional > self.config.deposit_cap {
                violations.push(format!(
                    "Notional {notional} exceeds deposit cap {}",
                    self.config.deposit_cap
                ));
            }
        }

        if qty < self.config.min_qty {
            violations.push(format!(
                "Quantity {qty} below minimum {}",
                self.config.min_qty
            ));
        }

        if decimal::fractional_digits(qty) > self.config.qty_precision {
            violations.push(format!(
                "Quantity precision exceeds {} decimal places",
                self.config.qty_precision
            ));
        }

        Ok(violations)
    }

    /// Largest safe quantity under the deposit cap, or `None` when even that
    /// falls below the minimum size.
    pub fn revised_qty(&self, price: Decimal) -> Result<Option<Decimal>, RiskError> {
        if price <= Decimal::ZERO {
            return Err(RiskError::NonPositivePrice(price));
        }

        let max_qty = decimal::safe_divide(self.config.deposit_cap, price)
            .ok_or(RiskError::Overflow("cap / price"))?;
        let safe_qty = max_qty
            .checked_mul(self.config.safety_margin)
            .ok_or(RiskError::Overflow("safety margin"))?;
        let revised = decimal::quantize_down(safe_qty, self.config.revision_dp);

        if revised < self.config.min_qty {
            return Ok(None);
        }
        Ok(Some(revised))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
