//! Learning memory.
//!
//! Thin layer over the ledger's `memory` table. Writes are enriched with run
//! metadata; reads attach a heuristic performance score to each strategy's
//! latest result so the planner can weigh exploitation against exploration.
//! Every read re-queries the ledger; nothing is cached between cycles.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, error, info};

use crate::storage::Ledger;
use crate::types::{ExperimentRecord, TradingMode};

/// Experiments read into the planner context.
pub const CONTEXT_WINDOW: u32 = 50;
/// Experiments scanned when scoring for exploration tuning.
pub const EXPLORATION_WINDOW: u32 = 20;
/// Insights consider at most this many experiments from the last 30 days.
pub const INSIGHT_WINDOW: u32 = 100;
pub const INSIGHT_LOOKBACK_DAYS: i64 = 30;

/// Cycle cadence of the periodic learning tasks.
pub const INSIGHTS_EVERY_CYCLES: u64 = 10;
pub const EXPLORATION_EVERY_CYCLES: u64 = 5;

pub const DEFAULT_EXPLORATION_RATIO: f64 = 0.3;

pub const KEY_LEARNING_INSIGHTS: &str = "learning_insights";
pub const KEY_GRACEFUL_SHUTDOWN: &str = "graceful_shutdown";

/// Bookkeeping keys that are not strategy results.
const SYSTEM_KEYS: &[&str] = &[KEY_LEARNING_INSIGHTS, KEY_GRACEFUL_SHUTDOWN];

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    ExploitMore,
    ContinueTesting,
    CautiousUse,
    AvoidStrategy,
}

fn number_field(value: &Value, field: &str) -> Option<f64> {
    match value.get(field)? {
        Value::Number(n) => n.as_f64(),
        // Decimals are written as strings
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Heuristic score in `[0, 1]` for one experiment result.
///
/// Base 0.6 executed, 0.3 rejected, 0.4 otherwise; plus `pnl / 100` capped
/// at ±0.3; plus `(confidence - 0.5) * 0.2`.
pub fn performance_score(value: &Value) -> f64 {
    let mut score = match value.get("result").and_then(Value::as_str) {
        Some("executed") => 0.6,
        Some("rejected") => 0.3,
        _ => 0.4,
    };

    if let Some(pnl) = number_field(value, "pnl") {
        if pnl != 0.0 && pnl.is_finite() {
            score += (pnl / 100.0).clamp(-0.3, 0.3);
        }
    }

    let confidence = number_field(value, "confidence")
        .filter(|c| c.is_finite())
        .unwrap_or(0.5);
    score += (confidence - 0.5) * 0.2;

    score.clamp(0.0, 1.0)
}

pub fn confidence_level(score: f64) -> ConfidenceLevel {
    if score >= 0.8 {
        ConfidenceLevel::High
    } else if score >= 0.6 {
        ConfidenceLevel::Medium
    } else if score >= 0.4 {
        ConfidenceLevel::Low
    } else {
        ConfidenceLevel::VeryLow
    }
}

pub fn recommendation(score: f64) -> Recommendation {
    if score >= 0.8 {
        Recommendation::ExploitMore
    } else if score >= 0.6 {
        Recommendation::ContinueTesting
    } else if score >= 0.4 {
        Recommendation::CautiousUse
    } else {
        Recommendation::AvoidStrategy
    }
}

/// A strategy's latest result with its derived score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Posterior {
    pub key: String,
    /// Results for this key inside the context window.
    pub observations: usize,
    pub latest: Value,
    pub performance_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub recommendation: Recommendation,
}

/// Collapse newest-first records into one posterior per strategy key,
/// keeping each key's most recent result.
pub fn posteriors_from(records: &[ExperimentRecord]) -> Vec<Posterior> {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut latest: HashMap<&str, &Value> = HashMap::new();

    for record in records {
        let key = record.key.as_str();
        if SYSTEM_KEYS.contains(&key) {
            continue;
        }
        let count = counts.entry(key).or_insert(0);
        if *count == 0 {
            order.push(key);
            latest.insert(key, &record.value);
        }
        *count += 1;
    }

    order
        .into_iter()
        .filter_map(|key| {
            let value = latest.get(key)?;
            let score = performance_score(value);
            Some(Posterior {
                key: key.to_string(),
                observations: counts.get(key).copied().unwrap_or(0),
                latest: (*value).clone(),
                performance_score: score,
                confidence_level: confidence_level(score),
                recommendation: recommendation(score),
            })
        })
        .collect()
}

/// Exploration ratio from recent performance scores.
///
/// Strong average performance lowers exploration, weak performance raises
/// it, and in between the score variance drives it. Result is clamped to
/// `[0.05, 0.95]`; no scores yields the default 0.3.
pub fn optimize_exploration_ratio(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return DEFAULT_EXPLORATION_RATIO;
    }

    let n = scores.len() as f64;
    let avg = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / n;

    let ratio = if avg > 0.7 {
        (0.3 - (avg - 0.7)).max(0.1)
    } else if avg < 0.3 {
        (0.5 + (0.3 - avg)).min(0.8)
    } else {
        0.3 + variance * 0.5
    };

    ratio.clamp(0.05, 0.95)
}

// ---------------------------------------------------------------------------
// Insights
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceRating {
    Poor,
    Fair,
    Good,
    Excellent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyPerformance {
    pub strategy: String,
    pub experiments: usize,
    pub execution_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub win_rate: f64,
    pub performance_rating: PerformanceRating,
}

pub fn analyze_strategy(strategy: &str, results: &[&Value]) -> StrategyPerformance {
    let total = results.len();
    let executed = results
        .iter()
        .filter(|v| v.get("result").and_then(Value::as_str) == Some("executed"))
        .count();
    let execution_rate = if total > 0 {
        executed as f64 / total as f64
    } else {
        0.0
    };

    let pnls: Vec<f64> = results
        .iter()
        .filter_map(|v| number_field(v, "pnl"))
        .filter(|p| p.is_finite())
        .collect();
    let (total_pnl, avg_pnl, win_rate) = if pnls.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let sum: f64 = pnls.iter().sum();
        let wins = pnls.iter().filter(|p| **p > 0.0).count();
        (sum, sum / pnls.len() as f64, wins as f64 / pnls.len() as f64)
    };

    let performance_rating = if execution_rate >= 0.8 && avg_pnl > 0.0 && win_rate >= 0.6 {
        PerformanceRating::Excellent
    } else if execution_rate >= 0.6 && avg_pnl >= 0.0 && win_rate >= 0.5 {
        PerformanceRating::Good
    } else if execution_rate >= 0.4 || avg_pnl >= 0.0 {
        PerformanceRating::Fair
    } else {
        PerformanceRating::Poor
    };

    StrategyPerformance {
        strategy: strategy.to_string(),
        experiments: total,
        execution_rate,
        total_pnl,
        avg_pnl,
        win_rate,
        performance_rating,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningInsights {
    pub total_strategies: usize,
    pub total_experiments: usize,
    /// Best five by rating, then execution rate.
    pub top_strategies: Vec<StrategyPerformance>,
    pub recommendations: Vec<String>,
    pub exploration_suggestions: Vec<String>,
}

const EXPLORATION_AREAS: &[(&str, &str)] = &[
    ("volatility", "Test contrarian strategies during high volatility"),
    ("timeframe", "Experiment with multi-timeframe analysis"),
    ("volume", "Explore volume-based entry signals"),
    ("momentum", "Test momentum strategies with different RSI thresholds"),
    ("mean_reversion", "Investigate mean-reversion during trending markets"),
];

fn tested_areas(strategies: &[&str]) -> Vec<&'static str> {
    let mut areas = Vec::new();
    for s in strategies {
        let s = s.to_lowercase();
        if s.contains("momentum") {
            areas.push("momentum");
        }
        if s.contains("revert") || s.contains("mean") {
            areas.push("mean_reversion");
        }
        if s.contains("volume") {
            areas.push("volume");
        }
    }
    areas
}

/// Summarize newest-first experiment records into per-strategy insights.
pub fn build_insights(records: &[ExperimentRecord]) -> LearningInsights {
    let mut order: Vec<&str> = Vec::new();
    let mut grouped: HashMap<&str, Vec<&Value>> = HashMap::new();
    for record in records {
        let key = record.key.as_str();
        if SYSTEM_KEYS.contains(&key) {
            continue;
        }
        grouped
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(&record.value);
    }

    let total_experiments: usize = grouped.values().map(Vec::len).sum();

    let mut ranked: Vec<StrategyPerformance> = order
        .iter()
        .map(|key| analyze_strategy(key, grouped.get(key).map(Vec::as_slice).unwrap_or(&[])))
        .collect();
    ranked.sort_by(|a, b| {
        b.performance_rating.cmp(&a.performance_rating).then(
            b.execution_rate
                .partial_cmp(&a.execution_rate)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    let mut recommendations = Vec::new();
    if grouped.is_empty() {
        recommendations.push("Start with basic momentum and mean-reversion strategies".to_string());
    } else {
        if total_experiments < 10 {
            recommendations.push("Increase experimentation frequency for better learning".to_string());
        }
        if grouped.len() < 3 {
            recommendations.push("Explore more diverse trading strategies".to_string());
        }
        let avg_execution =
            ranked.iter().map(|s| s.execution_rate).sum::<f64>() / ranked.len() as f64;
        if avg_execution < 0.3 {
            recommendations.push("Review risk management - execution rate too low".to_string());
        } else if avg_execution > 0.8 {
            recommendations
                .push("Consider tightening risk controls - execution rate very high".to_string());
        }
    }
    recommendations.truncate(3);

    let tested = tested_areas(&order);
    let exploration_suggestions = EXPLORATION_AREAS
        .iter()
        .filter(|(area, _)| !tested.contains(area))
        .map(|(_, text)| text.to_string())
        .take(3)
        .collect();

    ranked.truncate(5);

    LearningInsights {
        total_strategies: grouped.len(),
        total_experiments,
        top_strategies: ranked,
        recommendations,
        exploration_suggestions,
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Experiment feed bound to one symbol and mode.
#[derive(Debug, Clone)]
pub struct Memory {
    ledger: Ledger,
    symbol: String,
    mode: TradingMode,
}

impl Memory {
    pub fn new(ledger: Ledger, symbol: impl Into<String>, mode: TradingMode) -> Self {
        Self {
            ledger,
            symbol: symbol.into(),
            mode,
        }
    }

    fn enrich(&self, value: Value) -> Value {
        let mut map = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        map.insert("symbol".to_string(), json!(self.symbol));
        map.insert("mode".to_string(), json!(self.mode.as_str()));
        map.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        map.insert("agent_version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        Value::Object(map)
    }

    /// Append an experiment record. Failures are logged and swallowed.
    pub async fn write_experiment(&self, key: &str, value: Value) -> Option<i64> {
        match self.ledger.write_experiment(key, &self.enrich(value)).await {
            Ok(id) => {
                info!(key, id, "Stored experiment");
                Some(id)
            }
            Err(e) => {
                error!(key, error = %e, "Failed to store experiment");
                None
            }
        }
    }

    /// One scored posterior per strategy over the last `limit` experiments.
    /// Read failures yield an empty context.
    pub async fn posteriors(&self, limit: u32) -> Vec<Posterior> {
        match self.ledger.recent_experiments(limit).await {
            Ok(records) => {
                let posteriors = posteriors_from(&records);
                debug!(count = posteriors.len(), "Retrieved posteriors");
                posteriors
            }
            Err(e) => {
                error!(error = %e, "Failed to read posteriors");
                Vec::new()
            }
        }
    }

    /// Insights over the last 30 days, at most 100 experiments.
    pub async fn learning_insights(&self) -> anyhow::Result<LearningInsights> {
        let since = Utc::now() - Duration::days(INSIGHT_LOOKBACK_DAYS);
        let records = self.ledger.experiments_since(since, INSIGHT_WINDOW).await?;
        Ok(build_insights(&records))
    }

    pub async fn exploration_ratio(&self) -> f64 {
        let scores: Vec<f64> = self
            .posteriors(EXPLORATION_WINDOW)
            .await
            .iter()
            .map(|p| p.performance_score)
            .collect();
        optimize_exploration_ratio(&scores)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
