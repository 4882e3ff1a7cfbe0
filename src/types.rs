//! Shared types for the trading agent.
//!
//! The three boundary contracts (`Plan`, `Proposal`, `Verdict`) can only be
//! obtained through their validating constructors or `from_value` parsers,
//! so a value of one of these types is always within its contract. The
//! ledger row types at the bottom mirror the persisted tables.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::decimal::{self, DecimalError};

/// Maximum characters in a proposal hypothesis or verdict note.
pub const MAX_TEXT_CHARS: usize = 120;
/// Maximum violations carried by a verdict.
pub const MAX_VIOLATIONS: usize = 4;
/// Bounds on the planner-requested sleep.
pub const MIN_WAKEUP_SECS: u64 = 30;
pub const MAX_WAKEUP_SECS: u64 = 3600;
/// Bounds on the number of strategies in a plan.
pub const MIN_STRATEGIES: usize = 1;
pub const MAX_STRATEGIES: usize = 3;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether the agent should trade this cycle or only watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanMode {
    Observe,
    Trade,
}

impl fmt::Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanMode::Observe => write!(f, "OBSERVE"),
            PlanMode::Trade => write!(f, "TRADE"),
        }
    }
}

/// Proposed action, including the explicit no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

/// Order direction. Unlike `Action` there is no HOLD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<Action> for Side {
    type Error = anyhow::Error;

    fn try_from(action: Action) -> Result<Self, Self::Error> {
        match action {
            Action::Buy => Ok(Side::Buy),
            Action::Sell => Ok(Side::Sell),
            Action::Hold => Err(anyhow::anyhow!("HOLD has no order side")),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(anyhow::anyhow!("Unknown side: {s}")),
        }
    }
}

/// Risk validation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Approve,
    Revise,
    Reject,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approve => write!(f, "APPROVE"),
            Decision::Revise => write!(f, "REVISE"),
            Decision::Reject => write!(f, "REJECT"),
        }
    }
}

/// Which stage of the cycle produced a decision row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentKind {
    Planner,
    Trader,
    Judge,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Planner => "PLANNER",
            AgentKind::Trader => "TRADER",
            AgentKind::Judge => "JUDGE",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLANNER" => Ok(AgentKind::Planner),
            "TRADER" => Ok(AgentKind::Trader),
            "JUDGE" => Ok(AgentKind::Judge),
            _ => Err(anyhow::anyhow!("Unknown agent kind: {s}")),
        }
    }
}

/// Fill state of a recorded trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Filled,
    PartiallyFilled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Filled => "FILLED",
            TradeStatus::PartiallyFilled => "PARTIALLY_FILLED",
        }
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FILLED" => Ok(TradeStatus::Filled),
            "PARTIALLY_FILLED" => Ok(TradeStatus::PartiallyFilled),
            _ => Err(anyhow::anyhow!("Unknown trade status: {s}")),
        }
    }
}

/// Capital-at-risk mode. The deposit cap is only enforced for `Real`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Testnet,
    Real,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Testnet => "testnet",
            TradingMode::Real => "real",
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "testnet" => Ok(TradingMode::Testnet),
            "real" => Ok(TradingMode::Real),
            _ => Err(anyhow::anyhow!("Unknown trading mode: {s} (expected testnet|real)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// A boundary payload failed its contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Wrong shape: not an object, missing or unknown field, bad enum value,
    /// wrong JSON type.
    #[error("{contract}: malformed payload: {message}")]
    Malformed {
        contract: &'static str,
        message: String,
    },

    /// Well-formed but a field is outside its allowed range or length.
    #[error("{contract}.{field}: {message}")]
    Invalid {
        contract: &'static str,
        field: &'static str,
        message: String,
    },
}

impl ValidationError {
    fn invalid(contract: &'static str, field: &'static str, message: impl Into<String>) -> Self {
        ValidationError::Invalid {
            contract,
            field,
            message: message.into(),
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    contract: &'static str,
    value: Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(value).map_err(|e| ValidationError::Malformed {
        contract,
        message: e.to_string(),
    })
}

fn check_unit_interval(
    contract: &'static str,
    field: &'static str,
    value: f64,
) -> Result<(), ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::invalid(contract, field, format!("{value} not in [0, 1]")))
    }
}

fn check_text_len(
    contract: &'static str,
    field: &'static str,
    value: &str,
) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len > MAX_TEXT_CHARS {
        return Err(ValidationError::invalid(
            contract,
            field,
            format!("{len} chars exceeds {MAX_TEXT_CHARS}"),
        ));
    }
    Ok(())
}

fn check_decimal(
    contract: &'static str,
    field: &'static str,
    value: &str,
) -> Result<(), ValidationError> {
    decimal::parse_decimal(value)
        .map(|_| ())
        .map_err(|e| ValidationError::invalid(contract, field, e.to_string()))
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One candidate strategy in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategySpec {
    pub policy_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl StrategySpec {
    pub fn new(policy_id: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            params: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlan {
    mode: PlanMode,
    explore_ratio: f64,
    next_wakeup_secs: u64,
    strategies: Vec<StrategySpec>,
}

/// Per-cycle strategic directive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    mode: PlanMode,
    explore_ratio: f64,
    next_wakeup_secs: u64,
    strategies: Vec<StrategySpec>,
}

impl Plan {
    const CONTRACT: &'static str = "plan";

    /// Wakeup used when planning fails.
    pub const FALLBACK_WAKEUP_SECS: u64 = 600;

    pub fn new(
        mode: PlanMode,
        explore_ratio: f64,
        next_wakeup_secs: u64,
        strategies: Vec<StrategySpec>,
    ) -> Result<Self, ValidationError> {
        check_unit_interval(Self::CONTRACT, "explore_ratio", explore_ratio)?;

        if !(MIN_WAKEUP_SECS..=MAX_WAKEUP_SECS).contains(&next_wakeup_secs) {
            return Err(ValidationError::invalid(
                Self::CONTRACT,
                "next_wakeup_secs",
                format!("{next_wakeup_secs} not in [{MIN_WAKEUP_SECS}, {MAX_WAKEUP_SECS}]"),
            ));
        }

        if !(MIN_STRATEGIES..=MAX_STRATEGIES).contains(&strategies.len()) {
            return Err(ValidationError::invalid(
                Self::CONTRACT,
                "strategies",
                format!(
                    "{} items, expected {MIN_STRATEGIES}..={MAX_STRATEGIES}",
                    strategies.len()
                ),
            ));
        }

        Ok(Self {
            mode,
            explore_ratio,
            next_wakeup_secs,
            strategies,
        })
    }

    /// Parse and validate a planner payload.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let raw: RawPlan = parse_payload(Self::CONTRACT, value)?;
        Self::new(raw.mode, raw.explore_ratio, raw.next_wakeup_secs, raw.strategies)
    }

    /// Conservative plan used when the planner fails.
    pub fn fallback_observe() -> Self {
        Self {
            mode: PlanMode::Observe,
            explore_ratio: 0.0,
            next_wakeup_secs: Self::FALLBACK_WAKEUP_SECS,
            strategies: vec![StrategySpec::new("fallback_observe")],
        }
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    pub fn explore_ratio(&self) -> f64 {
        self.explore_ratio
    }

    pub fn next_wakeup_secs(&self) -> u64 {
        self.next_wakeup_secs
    }

    pub fn strategies(&self) -> &[StrategySpec] {
        &self.strategies
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.strategies.iter().map(|s| s.policy_id.as_str()).collect();
        write!(
            f,
            "{} explore={:.2} wakeup={}s strategies=[{}]",
            self.mode,
            self.explore_ratio,
            self.next_wakeup_secs,
            ids.join(", "),
        )
    }
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProposal {
    action: Action,
    qty: String,
    policy_id: String,
    hypothesis: String,
    confidence: f64,
}

/// A concrete candidate trade, or an explicit HOLD.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proposal {
    action: Action,
    qty: String,
    policy_id: String,
    hypothesis: String,
    confidence: f64,
}

impl Proposal {
    const CONTRACT: &'static str = "proposal";

    pub fn new(
        action: Action,
        qty: impl Into<String>,
        policy_id: impl Into<String>,
        hypothesis: impl Into<String>,
        confidence: f64,
    ) -> Result<Self, ValidationError> {
        let qty = qty.into();
        let hypothesis = hypothesis.into();

        check_decimal(Self::CONTRACT, "qty", &qty)?;
        check_text_len(Self::CONTRACT, "hypothesis", &hypothesis)?;
        check_unit_interval(Self::CONTRACT, "confidence", confidence)?;

        Ok(Self {
            action,
            qty,
            policy_id: policy_id.into(),
            hypothesis,
            confidence,
        })
    }

    /// Parse and validate a trader payload.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let raw: RawProposal = parse_payload(Self::CONTRACT, value)?;
        Self::new(raw.action, raw.qty, raw.policy_id, raw.hypothesis, raw.confidence)
    }

    /// A HOLD proposal. Hypothesis is truncated and confidence clamped so
    /// this never fails.
    pub fn hold(policy_id: impl Into<String>, hypothesis: &str, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            action: Action::Hold,
            qty: "0".to_string(),
            policy_id: policy_id.into(),
            hypothesis: truncate_chars(hypothesis, MAX_TEXT_CHARS),
            confidence,
        }
    }

    /// Conservative proposal used when analysis fails.
    pub fn fallback_hold() -> Self {
        Self::hold(
            "fallback_hold",
            "Analysis failed - maintaining safe position",
            0.1,
        )
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn qty(&self) -> &str {
        &self.qty
    }

    pub fn qty_decimal(&self) -> Result<Decimal, DecimalError> {
        decimal::parse_decimal(&self.qty)
    }

    pub fn policy_id(&self) -> &str {
        &self.policy_id
    }

    pub fn hypothesis(&self) -> &str {
        &self.hypothesis
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] conf={:.2}",
            self.action, self.qty, self.policy_id, self.confidence,
        )
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVerdict {
    decision: Decision,
    #[serde(default)]
    revised_qty: Option<String>,
    #[serde(default)]
    violations: Option<Vec<String>>,
    #[serde(default)]
    notes: Option<String>,
}

/// Risk validation outcome for one proposal.
///
/// Built only through `approve`/`revise`/`reject` (which truncate the
/// violation list and notes to their caps) or through `from_value` (which
/// rejects over-cap payloads).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    revised_qty: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    violations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
}

impl Verdict {
    const CONTRACT: &'static str = "verdict";

    fn build(
        decision: Decision,
        revised_qty: Option<String>,
        mut violations: Vec<String>,
        notes: &str,
    ) -> Self {
        violations.truncate(MAX_VIOLATIONS);
        let notes = if notes.is_empty() {
            None
        } else {
            Some(truncate_chars(notes, MAX_TEXT_CHARS))
        };
        Self {
            decision,
            revised_qty,
            violations,
            notes,
        }
    }

    pub fn approve(notes: &str) -> Self {
        Self::build(Decision::Approve, None, Vec::new(), notes)
    }

    pub fn revise(revised_qty: Decimal, violations: Vec<String>, notes: &str) -> Self {
        Self::build(
            Decision::Revise,
            Some(revised_qty.to_string()),
            violations,
            notes,
        )
    }

    pub fn reject(violations: Vec<String>, notes: &str) -> Self {
        Self::build(Decision::Reject, None, violations, notes)
    }

    /// Conservative verdict used when validation itself fails.
    pub fn fallback_reject() -> Self {
        Self::reject(
            vec!["Validation system error".to_string()],
            "Judge failure - rejecting for safety",
        )
    }

    /// Parse and validate a verdict payload.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let raw: RawVerdict = parse_payload(Self::CONTRACT, value)?;

        if let Some(qty) = &raw.revised_qty {
            check_decimal(Self::CONTRACT, "revised_qty", qty)?;
        }

        let violations = raw.violations.unwrap_or_default();
        if violations.len() > MAX_VIOLATIONS {
            return Err(ValidationError::invalid(
                Self::CONTRACT,
                "violations",
                format!("{} items exceeds {MAX_VIOLATIONS}", violations.len()),
            ));
        }

        if let Some(notes) = &raw.notes {
            check_text_len(Self::CONTRACT, "notes", notes)?;
        }

        Ok(Self {
            decision: raw.decision,
            revised_qty: raw.revised_qty,
            violations,
            notes: raw.notes,
        })
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn revised_qty(&self) -> Option<&str> {
        self.revised_qty.as_deref()
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    /// APPROVE and REVISE lead to execution.
    pub fn is_actionable(&self) -> bool {
        matches!(self.decision, Decision::Approve | Decision::Revise)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.decision)?;
        if let Some(qty) = &self.revised_qty {
            write!(f, " qty={qty}")?;
        }
        if !self.violations.is_empty() {
            write!(f, " violations=[{}]", self.violations.join("; "))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ledger rows
// ---------------------------------------------------------------------------

/// Trade about to be recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTrade {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub order_id: Option<String>,
    pub idempotency_key: String,
    pub proposal_ref: Option<i64>,
    pub status: TradeStatus,
}

/// A recorded trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub order_id: Option<String>,
    pub idempotency_key: String,
    pub proposal_ref: Option<i64>,
    pub status: TradeStatus,
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {} @ {} (fee {}) [{}]",
            self.id, self.side, self.qty, self.symbol, self.price, self.fee, self.idempotency_key,
        )
    }
}

/// Point-in-time account valuation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioSnapshot {
    pub balance_quote: Decimal,
    pub balance_base: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

/// A recorded portfolio snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub balance_quote: Decimal,
    pub balance_base: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

/// One entry of the learning feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub key: String,
    pub value: Value,
}

/// Audit envelope around a plan, proposal or verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub agent: AgentKind,
    pub trace_id: String,
    pub payload: Value,
    pub plan_ref: Option<i64>,
    pub proposal_ref: Option<i64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
