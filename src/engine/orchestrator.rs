//! Cycle orchestrator.
//!
//! Drives one decision cycle through
//! `PLANNING → (ANALYZING) → (VALIDATING) → (EXECUTING) → LEARNING`, then
//! sleeps for the planned interval. Each phase contains its own failures and
//! hands on either its result or a conservative fallback, so a cycle only
//! aborts on an internal inconsistency. Shutdown is honored at the sleep
//! boundary only; an in-flight cycle always finishes.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{ExecutionOutcome, Executor};
use super::idempotency::IdempotencyKeyGenerator;
use crate::config::AppConfig;
use crate::llm::{MarketSnapshot, PlanGenerator, PlanningContext, ProposalGenerator};
use crate::platforms::{ExecutionGateway, MarketData};
use crate::storage::Ledger;
use crate::strategy::learning::{
    Memory, CONTEXT_WINDOW, EXPLORATION_EVERY_CYCLES, INSIGHTS_EVERY_CYCLES, KEY_GRACEFUL_SHUTDOWN,
    KEY_LEARNING_INSIGHTS,
};
use crate::strategy::risk::{RiskConfig, RiskJudge};
use crate::types::{
    Action, AgentKind, Decision, Plan, PlanMode, Proposal, TradingMode, Verdict, MAX_WAKEUP_SECS,
    MIN_WAKEUP_SECS,
};

/// Pause after a cycle aborts before the next one starts.
pub const ERROR_COOLDOWN: Duration = Duration::from_secs(60);

/// Sleep actually taken for a planned wakeup.
pub fn clamp_wakeup(secs: u64) -> u64 {
    secs.clamp(MIN_WAKEUP_SECS, MAX_WAKEUP_SECS)
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Planning,
    Analyzing,
    Validating,
    Executing,
    Learning,
    Sleeping,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "PLANNING",
            Phase::Analyzing => "ANALYZING",
            Phase::Validating => "VALIDATING",
            Phase::Executing => "EXECUTING",
            Phase::Learning => "LEARNING",
            Phase::Sleeping => "SLEEPING",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a contained phase: the real value or a safe substitute.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome<T> {
    Success(T),
    Fallback { value: T, reason: String },
}

impl<T> PhaseOutcome<T> {
    pub fn fallback(value: T, reason: impl Into<String>) -> Self {
        Self::Fallback {
            value,
            reason: reason.into(),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Self::Success(value) | Self::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Success(value) | Self::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub trace_id: String,
    /// Phases in the order visited.
    pub phases: Vec<Phase>,
    pub fallbacks: Vec<(Phase, String)>,
    pub plan: Option<Plan>,
    pub proposal: Option<Proposal>,
    pub verdict: Option<Verdict>,
    pub execution: Option<ExecutionOutcome>,
    /// Clamped planned sleep before the next cycle.
    pub sleep_secs: u64,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(cycle: u64, trace_id: String) -> Self {
        Self {
            cycle,
            trace_id,
            phases: Vec::new(),
            fallbacks: Vec::new(),
            plan: None,
            proposal: None,
            verdict: None,
            execution: None,
            sleep_secs: clamp_wakeup(Plan::FALLBACK_WAKEUP_SECS),
            duration_ms: 0,
        }
    }

    fn track<T>(&mut self, phase: Phase, outcome: &PhaseOutcome<T>) {
        if let Some(reason) = outcome.reason() {
            warn!(trace_id = %self.trace_id, phase = %phase, reason, "Phase fell back");
            self.fallbacks.push((phase, reason.to_string()));
        }
    }

    pub fn visited(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<&str> = self.phases.iter().map(Phase::as_str).collect();
        write!(f, "cycle {} [{}]", self.cycle, path.join(" → "))?;
        if let Some(plan) = &self.plan {
            write!(f, " plan={}", plan.mode())?;
        }
        if let Some(proposal) = &self.proposal {
            write!(f, " action={}", proposal.action())?;
        }
        if let Some(verdict) = &self.verdict {
            write!(f, " verdict={}", verdict.decision())?;
        }
        if let Some(execution) = &self.execution {
            write!(f, " execution={}", execution.label())?;
        }
        write!(f, " fallbacks={} sleep={}s", self.fallbacks.len(), self.sleep_secs)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Components {
    pub planner: Arc<dyn PlanGenerator>,
    pub trader: Arc<dyn ProposalGenerator>,
    pub market: Arc<dyn MarketData>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub ledger: Ledger,
}

pub struct Orchestrator {
    symbol: String,
    timeframe: String,
    mode: TradingMode,
    planner: Arc<dyn PlanGenerator>,
    trader: Arc<dyn ProposalGenerator>,
    market: Arc<dyn MarketData>,
    gateway: Arc<dyn ExecutionGateway>,
    ledger: Ledger,
    memory: Memory,
    judge: RiskJudge,
    executor: Executor,
    error_cooldown: Duration,
    cycle_count: u64,
    #[cfg(test)]
    forced_aborts: u32,
}

impl Orchestrator {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        risk: RiskConfig,
        components: Components,
    ) -> Self {
        let symbol = symbol.into();
        let Components {
            planner,
            trader,
            market,
            gateway,
            ledger,
        } = components;

        let memory = Memory::new(ledger.clone(), symbol.clone(), risk.mode);
        let executor = Executor::new(gateway.clone(), ledger.clone(), memory.clone(), symbol.clone());

        Self {
            symbol,
            timeframe: timeframe.into(),
            mode: risk.mode,
            planner,
            trader,
            market,
            gateway,
            ledger,
            memory,
            judge: RiskJudge::new(risk),
            executor,
            error_cooldown: ERROR_COOLDOWN,
            cycle_count: 0,
            #[cfg(test)]
            forced_aborts: 0,
        }
    }

    pub fn from_config(config: &AppConfig, components: Components) -> Self {
        Self::new(
            config.symbol.clone(),
            config.timeframe.clone(),
            config.risk_config(),
            components,
        )
    }

    pub fn with_key_generator(mut self, keys: IdempotencyKeyGenerator) -> Self {
        self.executor = self.executor.with_key_generator(keys);
        self
    }

    /// Override the pause taken after an aborted cycle.
    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    pub fn error_cooldown(&self) -> Duration {
        self.error_cooldown
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Append a decision row. Audit failures are logged, never fatal.
    async fn audit(
        &self,
        agent: AgentKind,
        trace_id: &str,
        payload: &Value,
        plan_ref: Option<i64>,
        proposal_ref: Option<i64>,
    ) -> Option<i64> {
        match self
            .ledger
            .record_decision(agent, trace_id, payload, plan_ref, proposal_ref)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                error!(trace_id, agent = agent.as_str(), error = %e, "Failed to record decision");
                None
            }
        }
    }

    /// Run one PLANNING → LEARNING pass. The returned report carries the
    /// sleep the loop should take next.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycle_count += 1;
        let cycle = self.cycle_count;
        let trace_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut report = CycleReport::new(cycle, trace_id.clone());

        info!(cycle, trace_id = %trace_id, symbol = %self.symbol, "Cycle started");

        #[cfg(test)]
        if self.forced_aborts > 0 {
            self.forced_aborts -= 1;
            bail!("forced abort in cycle {cycle}");
        }

        let mut plan_ref = None;
        let mut proposal_ref = None;
        let mut phase = Phase::Planning;

        loop {
            report.phases.push(phase);
            debug!(trace_id = %trace_id, phase = %phase, "Entering phase");

            phase = match phase {
                Phase::Planning => {
                    let outcome = self.plan(cycle).await;
                    report.track(phase, &outcome);
                    let plan = outcome.into_value();

                    plan_ref = self
                        .audit(AgentKind::Planner, &trace_id, &plan.to_value(), None, None)
                        .await;
                    info!(trace_id = %trace_id, plan = %plan, "Plan ready");

                    let next = match plan.mode() {
                        PlanMode::Observe => Phase::Learning,
                        PlanMode::Trade => Phase::Analyzing,
                    };
                    report.sleep_secs = clamp_wakeup(plan.next_wakeup_secs());
                    report.plan = Some(plan);
                    next
                }

                Phase::Analyzing => {
                    let plan = report
                        .plan
                        .as_ref()
                        .context("Reached ANALYZING without a plan")?;
                    let outcome = self.analyze(plan).await;
                    report.track(phase, &outcome);
                    let proposal = outcome.into_value();

                    proposal_ref = self
                        .audit(AgentKind::Trader, &trace_id, &proposal.to_value(), plan_ref, None)
                        .await;
                    info!(trace_id = %trace_id, proposal = %proposal, "Proposal ready");

                    let next = if proposal.action() == Action::Hold {
                        Phase::Learning
                    } else {
                        Phase::Validating
                    };
                    report.proposal = Some(proposal);
                    next
                }

                Phase::Validating => {
                    let proposal = report
                        .proposal
                        .clone()
                        .context("Reached VALIDATING without a proposal")?;
                    let outcome = self.validate(&proposal).await;
                    report.track(phase, &outcome);
                    let verdict = outcome.into_value();

                    self.audit(
                        AgentKind::Judge,
                        &trace_id,
                        &verdict.to_value(),
                        plan_ref,
                        proposal_ref,
                    )
                    .await;
                    info!(trace_id = %trace_id, verdict = %verdict, "Verdict ready");

                    let next = if verdict.is_actionable() {
                        Phase::Executing
                    } else {
                        self.memory
                            .write_experiment(
                                proposal.policy_id(),
                                json!({
                                    "result": "rejected",
                                    "decision": verdict.decision(),
                                    "violations": verdict.violations(),
                                    "confidence": proposal.confidence(),
                                    "trace_id": trace_id,
                                }),
                            )
                            .await;
                        Phase::Learning
                    };
                    report.verdict = Some(verdict);
                    next
                }

                Phase::Executing => {
                    let proposal = report
                        .proposal
                        .as_ref()
                        .context("Reached EXECUTING without a proposal")?;
                    let verdict = report
                        .verdict
                        .as_ref()
                        .context("Reached EXECUTING without a verdict")?;
                    if verdict.decision() == Decision::Revise && verdict.revised_qty().is_none() {
                        bail!("REVISE verdict without a revised quantity");
                    }

                    let outcome = self
                        .executor
                        .execute(&trace_id, proposal, verdict, proposal_ref)
                        .await?;
                    if let ExecutionOutcome::Failed { reason } = &outcome {
                        report.fallbacks.push((phase, reason.clone()));
                    }
                    report.execution = Some(outcome);
                    Phase::Learning
                }

                Phase::Learning => {
                    self.learn(cycle).await;
                    break;
                }

                Phase::Sleeping => bail!("SLEEPING is not part of a cycle pass"),
            };
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            trace_id = %trace_id,
            duration_ms = report.duration_ms,
            summary = %report,
            "Cycle complete"
        );
        Ok(report)
    }

    async fn plan(&self, cycle: u64) -> PhaseOutcome<Plan> {
        let context = PlanningContext {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            mode: self.mode,
            cycle,
            posteriors: self.memory.posteriors(CONTEXT_WINDOW).await,
        };

        let raw = match self.planner.generate_plan(&context).await {
            Ok(raw) => raw,
            Err(e) => {
                return PhaseOutcome::fallback(Plan::fallback_observe(), format!("planner failed: {e:#}"))
            }
        };

        match Plan::from_value(raw) {
            Ok(plan) => PhaseOutcome::Success(plan),
            Err(e) => PhaseOutcome::fallback(Plan::fallback_observe(), format!("invalid plan: {e}")),
        }
    }

    async fn analyze(&self, plan: &Plan) -> PhaseOutcome<Proposal> {
        let last_price = match self.market.last_price(&self.symbol).await {
            Ok(price) => price,
            Err(e) => {
                return PhaseOutcome::fallback(
                    Proposal::fallback_hold(),
                    format!("market data from {} failed: {e:#}", self.market.name()),
                )
            }
        };

        let snapshot = MarketSnapshot {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            last_price,
            observed_at: chrono::Utc::now(),
        };

        let raw = match self.trader.generate_proposal(plan, &snapshot).await {
            Ok(raw) => raw,
            Err(e) => {
                return PhaseOutcome::fallback(Proposal::fallback_hold(), format!("trader failed: {e:#}"))
            }
        };

        match Proposal::from_value(raw) {
            Ok(proposal) => PhaseOutcome::Success(proposal),
            Err(e) => {
                PhaseOutcome::fallback(Proposal::fallback_hold(), format!("invalid proposal: {e}"))
            }
        }
    }

    /// Review at a freshly fetched price.
    async fn validate(&self, proposal: &Proposal) -> PhaseOutcome<Verdict> {
        match self.market.last_price(&self.symbol).await {
            Ok(price) => PhaseOutcome::Success(self.judge.review(proposal, price)),
            Err(e) => PhaseOutcome::fallback(
                Verdict::fallback_reject(),
                format!("validation price unavailable: {e:#}"),
            ),
        }
    }

    async fn learn(&self, cycle: u64) {
        if cycle % INSIGHTS_EVERY_CYCLES == 0 {
            match self.memory.learning_insights().await {
                Ok(insights) => {
                    info!(
                        cycle,
                        strategies = insights.total_strategies,
                        experiments = insights.total_experiments,
                        "Learning insights generated"
                    );
                    self.memory
                        .write_experiment(
                            KEY_LEARNING_INSIGHTS,
                            json!({"cycle": cycle, "insights": insights}),
                        )
                        .await;
                }
                Err(e) => warn!(cycle, error = %e, "Learning insights failed"),
            }
        }

        if cycle % EXPLORATION_EVERY_CYCLES == 0 {
            let ratio = self.memory.exploration_ratio().await;
            info!(cycle, exploration_ratio = ratio, "Exploration ratio tuned");
        }
    }

    /// Loop cycles until `shutdown` flips to `true`, then run the shutdown
    /// sequence. The flag is only observed while sleeping.
    pub async fn run_forever(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(symbol = %self.symbol, mode = %self.mode, "Agent loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.run_cycle().await {
                Ok(report) => Duration::from_secs(report.sleep_secs),
                Err(e) => {
                    error!(
                        cycle = self.cycle_count,
                        error = format!("{e:#}"),
                        cooldown_secs = self.error_cooldown.as_secs(),
                        "Cycle aborted, cooling down"
                    );
                    self.error_cooldown
                }
            };

            debug!(phase = %Phase::Sleeping, secs = wait.as_secs(), "Sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed, stopping");
                        break;
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Cancel open orders, take a final snapshot and record the stop.
    pub async fn shutdown(&self) -> Result<()> {
        info!(cycles = self.cycle_count, "Shutting down");

        match self.gateway.cancel_all_orders(&self.symbol).await {
            Ok(cancelled) => info!(cancelled, "Open orders cancelled"),
            Err(e) => warn!(error = %e, "Cancel-all failed during shutdown"),
        }

        match self.market.last_price(&self.symbol).await {
            Ok(price) => {
                if let Err(e) = self.executor.accountant().record_snapshot(price).await {
                    warn!(error = %e, "Final snapshot failed");
                }
            }
            Err(e) => warn!(error = %e, "No price for final snapshot"),
        }

        self.memory
            .write_experiment(
                KEY_GRACEFUL_SHUTDOWN,
                json!({"event": "graceful_shutdown", "cycle_count": self.cycle_count}),
            )
            .await;

        info!("Shutdown complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
