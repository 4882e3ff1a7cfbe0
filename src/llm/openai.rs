//! OpenAI Chat Completions integration.
//!
//! Implements `PlanGenerator` and `ProposalGenerator` with structured
//! outputs: each request carries a `json_schema` response format matching
//! the Plan or Proposal contract. The returned JSON is still validated by
//! the orchestrator; the schema only makes a conforming answer likely.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::{MarketSnapshot, PlanGenerator, PlanningContext, ProposalGenerator};
use crate::config::AppConfig;
use crate::types::{Plan, MAX_STRATEGIES, MAX_TEXT_CHARS, MAX_WAKEUP_SECS, MIN_STRATEGIES, MIN_WAKEUP_SECS};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const DEFAULT_MAX_TOKENS: u32 = 300;
const DEFAULT_TEMPERATURE: f32 = 0.5;
const REQUEST_TIMEOUT_SECS: u64 = 60;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;

/// Strategies named in the prompt summary.
const PROMPT_STRATEGY_SAMPLE: usize = 3;

const PLANNER_SYSTEM_PROMPT: &str = "\
You are the strategic planner of an autonomous spot trading agent. Each cycle you \
decide whether to trade or only observe, how much to explore untested strategies, \
and when to wake up next.

- OBSERVE during high uncertainty, after losses, or when no strategy is performing.
- TRADE only when recent results or clear conditions support it.
- explore_ratio: 0.0-0.3 exploit proven strategies, 0.3-0.7 balanced, 0.7-1.0 explore.
- next_wakeup_secs: 30-300 active markets, 300-1800 normal, 1800-3600 quiet or risky.
- Capital preservation comes first.

Respond with Plan JSON only.";

const TRADER_SYSTEM_PROMPT: &str = "\
You are the trader of an autonomous spot trading agent. Given the strategic plan and \
the current market snapshot, propose exactly one action: BUY, SELL or HOLD.

- BUY or SELL only with a clear signal and confidence above 0.7; otherwise HOLD.
- qty is a plain decimal string in base-asset units (\"0\" for HOLD).
- Keep the notional within the deposit cap and prefer smaller sizes under uncertainty.
- hypothesis states the core reasoning in at most 120 characters.
- policy_id names the plan strategy you are following.

Respond with Proposal JSON only.";

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    response_format: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

/// JSON schema of the Plan contract.
pub fn plan_schema() -> Value {
    json!({
        "type": "object",
        "required": ["mode", "explore_ratio", "next_wakeup_secs", "strategies"],
        "properties": {
            "mode": {"enum": ["OBSERVE", "TRADE"]},
            "explore_ratio": {"type": "number", "minimum": 0, "maximum": 1},
            "next_wakeup_secs": {
                "type": "integer",
                "minimum": MIN_WAKEUP_SECS,
                "maximum": MAX_WAKEUP_SECS
            },
            "strategies": {
                "type": "array",
                "minItems": MIN_STRATEGIES,
                "maxItems": MAX_STRATEGIES,
                "items": {
                    "type": "object",
                    "required": ["policy_id"],
                    "properties": {
                        "policy_id": {"type": "string"},
                        "params": {"type": "object"}
                    },
                    "additionalProperties": false
                }
            }
        },
        "additionalProperties": false
    })
}

/// JSON schema of the Proposal contract.
pub fn proposal_schema() -> Value {
    json!({
        "type": "object",
        "required": ["action", "qty", "policy_id", "hypothesis", "confidence"],
        "properties": {
            "action": {"enum": ["BUY", "SELL", "HOLD"]},
            "qty": {"type": "string", "pattern": "^\\d+(\\.\\d+)?$"},
            "policy_id": {"type": "string"},
            "hypothesis": {"type": "string", "maxLength": MAX_TEXT_CHARS},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
        },
        "additionalProperties": false
    })
}

fn response_format(name: &str, schema: Value) -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": name,
            "schema": schema,
            "strict": false
        }
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    http: Client,
    api_key: SecretString,
    api_url: String,
    planner_model: String,
    trader_model: String,
    /// Quoted to the trader so its sizes start near the judge's limit.
    deposit_cap: Decimal,
    max_tokens: u32,
    total_calls: AtomicU64,
}

impl OpenAiClient {
    pub fn new(
        api_key: SecretString,
        api_url: impl Into<String>,
        planner_model: impl Into<String>,
        trader_model: impl Into<String>,
        deposit_cap: Decimal,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build OpenAI HTTP client")?;

        Ok(Self {
            http,
            api_key,
            api_url: api_url.into(),
            planner_model: planner_model.into(),
            trader_model: trader_model.into(),
            deposit_cap,
            max_tokens: DEFAULT_MAX_TOKENS,
            total_calls: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(
            config.openai_api_key.clone(),
            config.openai_api_url.clone(),
            config.planner_model.clone(),
            config.trader_model.clone(),
            config.deposit_cap,
        )
    }

    pub fn planner_model(&self) -> &str {
        &self.planner_model
    }

    pub fn trader_model(&self) -> &str {
        &self.trader_model
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// One structured completion, retried on 429/5xx and transport errors
    /// with exponential backoff.
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: Value,
    ) -> Result<Value> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: self.max_tokens,
            response_format: response_format(schema_name, schema),
        };

        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .post(&self.api_url)
                .bearer_auth(self.api_key.expose_secret())
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: ChatResponse = response
                            .json()
                            .await
                            .context("Failed to parse OpenAI response")?;
                        self.total_calls.fetch_add(1, Ordering::Relaxed);

                        let text = body
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message)
                            .map(|m| m.content)
                            .unwrap_or_default();

                        debug!(model, schema = schema_name, chars = text.len(), "OpenAI completion received");
                        return parse_json_content(&text);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let error_text = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, model, "Retryable OpenAI error");
                        last_error = Some(format!("HTTP {status}: {error_text}"));
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    anyhow::bail!("OpenAI API error {status}: {error_text}");
                }
                Err(e) => {
                    warn!(error = %e, attempt, model, "OpenAI request failed");
                    last_error = Some(format!("Request error: {e}"));
                }
            }
        }

        anyhow::bail!(
            "OpenAI API failed after {MAX_RETRIES} retries: {}",
            last_error.unwrap_or_default()
        )
    }

    // -- Prompts ---------------------------------------------------------

    pub fn build_plan_prompt(&self, context: &PlanningContext) -> String {
        format!(
            "Current context:\n{}\n\nSymbol: {}\nTimeframe: {}\nMode: {}\nCycle: {}\nDeposit cap: {}\n\n\
             Generate a plan weighing recent strategy performance, market regime and \
             exploration against exploitation.",
            summarize_posteriors(context),
            context.symbol,
            context.timeframe,
            context.mode,
            context.cycle,
            self.deposit_cap,
        )
    }

    pub fn build_proposal_prompt(&self, plan: &Plan, market: &MarketSnapshot) -> String {
        let strategies: Vec<&str> = plan
            .strategies()
            .iter()
            .map(|s| s.policy_id.as_str())
            .collect();

        format!(
            "Strategic plan:\nMode: {} | Strategies: {} | Exploration: {:.2}\n\n\
             Market:\nSymbol: {} | Timeframe: {} | Last price: {} | Observed: {}\n\n\
             Deposit cap: {}\n\nPropose one action following the plan.",
            plan.mode(),
            strategies.join(", "),
            plan.explore_ratio(),
            market.symbol,
            market.timeframe,
            market.last_price,
            market.observed_at.to_rfc3339(),
            self.deposit_cap,
        )
    }
}

fn summarize_posteriors(context: &PlanningContext) -> String {
    if context.posteriors.is_empty() {
        return "No prior experiments - initial planning cycle".to_string();
    }

    let mut lines = vec![format!("Strategies with recent results: {}", context.posteriors.len())];
    for p in context.posteriors.iter().take(PROMPT_STRATEGY_SAMPLE) {
        let result = p.latest.get("result").and_then(Value::as_str).unwrap_or("unknown");
        lines.push(format!(
            "- {}: last={} score={:.2} runs={} advice={}",
            p.key,
            result,
            p.performance_score,
            p.observations,
            serde_json::to_value(p.recommendation)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        ));
    }
    lines.join("\n")
}

/// Parse the assistant message as a JSON object, tolerating a Markdown
/// code fence around it.
fn parse_json_content(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        anyhow::bail!("Empty response from OpenAI");
    }

    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: Value = serde_json::from_str(body).context("OpenAI response is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("OpenAI response is not a JSON object");
    }
    Ok(value)
}

#[async_trait]
impl PlanGenerator for OpenAiClient {
    async fn generate_plan(&self, context: &PlanningContext) -> Result<Value> {
        let prompt = self.build_plan_prompt(context);
        self.complete(
            &self.planner_model,
            PLANNER_SYSTEM_PROMPT,
            &prompt,
            "plan_response",
            plan_schema(),
        )
        .await
    }
}

#[async_trait]
impl ProposalGenerator for OpenAiClient {
    async fn generate_proposal(&self, plan: &Plan, market: &MarketSnapshot) -> Result<Value> {
        let prompt = self.build_proposal_prompt(plan, market);
        self.complete(
            &self.trader_model,
            TRADER_SYSTEM_PROMPT,
            &prompt,
            "proposal_response",
            proposal_schema(),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
