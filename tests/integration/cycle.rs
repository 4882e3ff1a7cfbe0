//! End-to-end cycle scenarios.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;

use autotrader::engine::executor::{ExecutionOutcome, Executor};
use autotrader::engine::idempotency::{FixedClock, IdempotencyKeyGenerator};
use autotrader::engine::orchestrator::{Components, Orchestrator, Phase};
use autotrader::platforms::{Balances, MarketData};
use autotrader::storage::{Ledger, LedgerError};
use autotrader::strategy::learning::Memory;
use autotrader::strategy::risk::RiskConfig;
use autotrader::types::{AgentKind, Decision, NewTrade, Proposal, Side, TradeStatus, TradingMode, Verdict};

use crate::mock_exchange::{FlakyGateway, FlakyMarket, ScriptedPlanner, ScriptedTrader};
use crate::temp_db_path;

const SYMBOL: &str = "BTC/USDT";

fn trade_plan() -> Value {
    json!({
        "mode": "TRADE",
        "explore_ratio": 0.25,
        "next_wakeup_secs": 300,
        "strategies": [{"policy_id": "momentum_v1", "params": {"lookback": 20}}]
    })
}

fn buy(qty: &str) -> Value {
    json!({
        "action": "BUY",
        "qty": qty,
        "policy_id": "momentum_v1",
        "hypothesis": "Higher lows on rising volume",
        "confidence": 0.8
    })
}

struct Harness {
    orchestrator: Orchestrator,
    ledger: Ledger,
    planner: Arc<ScriptedPlanner>,
    trader: Arc<ScriptedTrader>,
    gateway: Arc<FlakyGateway>,
}

async fn harness(
    mode: TradingMode,
    planner: ScriptedPlanner,
    trader: ScriptedTrader,
    market: FlakyMarket,
) -> Harness {
    let ledger = Ledger::open(temp_db_path()).await.unwrap();
    let market: Arc<dyn MarketData> = Arc::new(market);
    let gateway = Arc::new(FlakyGateway::new(
        market.clone(),
        Balances {
            quote: dec!(1000),
            base: dec!(0.02),
        },
    ));
    let planner = Arc::new(planner);
    let trader = Arc::new(trader);

    let orchestrator = Orchestrator::new(
        SYMBOL,
        "5m",
        RiskConfig::new(mode, dec!(5.0)),
        Components {
            planner: planner.clone(),
            trader: trader.clone(),
            market,
            gateway: gateway.clone(),
            ledger: ledger.clone(),
        },
    );

    Harness {
        orchestrator,
        ledger,
        planner,
        trader,
        gateway,
    }
}

#[tokio::test]
async fn testnet_buy_is_approved_and_fully_audited() {
    let mut h = harness(
        TradingMode::Testnet,
        ScriptedPlanner::always(trade_plan()),
        ScriptedTrader::always(buy("0.0001")),
        FlakyMarket::steady(dec!(50000)),
    )
    .await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(
        report.phases,
        vec![
            Phase::Planning,
            Phase::Analyzing,
            Phase::Validating,
            Phase::Executing,
            Phase::Learning
        ]
    );
    assert!(report.fallbacks.is_empty());
    assert_eq!(report.sleep_secs, 300);
    assert_eq!(report.verdict.as_ref().unwrap().decision(), Decision::Approve);

    let chain = h.ledger.decision_chain(&report.trace_id).await.unwrap();
    let agents: Vec<AgentKind> = chain.iter().map(|d| d.agent).collect();
    assert_eq!(agents, vec![AgentKind::Planner, AgentKind::Trader, AgentKind::Judge]);
    assert_eq!(chain[2].payload["decision"], "APPROVE");

    let trades = h.ledger.recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].side, Side::Buy);
    assert_eq!(trades[0].qty, dec!(0.0001));
    assert_eq!(trades[0].price, dec!(50000));
    assert_eq!(trades[0].proposal_ref, Some(chain[1].id));
    assert_eq!(trades[0].idempotency_key.len(), 16);

    let snapshot = h.ledger.latest_snapshot().await.unwrap().unwrap();
    // 1000 - 5 notional - 0.005 fee
    assert_eq!(snapshot.balance_quote, dec!(994.995));
}

#[tokio::test]
async fn real_mode_oversized_buy_is_revised_to_cap() {
    let mut h = harness(
        TradingMode::Real,
        ScriptedPlanner::always(trade_plan()),
        ScriptedTrader::always(buy("0.001")),
        FlakyMarket::steady(dec!(50000)),
    )
    .await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    let verdict = report.verdict.unwrap();
    assert_eq!(verdict.decision(), Decision::Revise);
    assert_eq!(verdict.revised_qty(), Some("0.00009"));
    assert!(!verdict.violations().is_empty());

    let trades = h.ledger.recent_trades(1).await.unwrap();
    assert_eq!(trades[0].qty, dec!(0.00009));
    assert!(trades[0].qty * trades[0].price <= dec!(5.0));
}

#[tokio::test]
async fn gateway_failure_is_recorded_and_next_cycle_recovers() {
    let mut h = harness(
        TradingMode::Testnet,
        ScriptedPlanner::always(trade_plan()),
        ScriptedTrader::always(buy("0.0001")),
        FlakyMarket::steady(dec!(50000)),
    )
    .await;

    h.gateway.set_error("exchange maintenance");
    let report = h.orchestrator.run_cycle().await.unwrap();
    assert!(matches!(report.execution, Some(ExecutionOutcome::Failed { .. })));
    assert_eq!(report.fallbacks.len(), 1);
    assert_eq!(h.ledger.trade_count().await.unwrap(), 0);

    let experiments = h.ledger.recent_experiments(1).await.unwrap();
    assert_eq!(experiments[0].value["result"], "execution_failed");
    assert!(experiments[0].value["error"]
        .as_str()
        .unwrap()
        .contains("maintenance"));

    h.gateway.clear_error();
    let report = h.orchestrator.run_cycle().await.unwrap();
    assert!(matches!(report.execution, Some(ExecutionOutcome::Executed { .. })));
    assert_eq!(h.ledger.trade_count().await.unwrap(), 1);
    assert_eq!(h.gateway.submissions(), 2);
}

#[tokio::test]
async fn planner_context_is_reread_from_the_ledger() {
    let mut h = harness(
        TradingMode::Testnet,
        ScriptedPlanner::new(vec![Err("upstream 503".to_string()), Ok(trade_plan())]),
        ScriptedTrader::always(buy("0.0001")),
        FlakyMarket::steady(dec!(50000)),
    )
    .await;

    // Planner failure: OBSERVE fallback, trader never consulted
    let first = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(first.phases, vec![Phase::Planning, Phase::Learning]);
    assert_eq!(first.fallbacks[0].0, Phase::Planning);
    assert_eq!(first.sleep_secs, 600);
    assert_eq!(h.trader.calls(), 0);

    h.orchestrator.run_cycle().await.unwrap();
    h.orchestrator.run_cycle().await.unwrap();

    let contexts = h.planner.contexts();
    assert_eq!(contexts.len(), 3);
    assert!(contexts[0].posteriors.is_empty());
    assert!(contexts[1].posteriors.is_empty());
    // The trade executed in cycle 2 is visible to cycle 3
    assert_eq!(contexts[2].cycle, 3);
    assert_eq!(contexts[2].posteriors.len(), 1);
    assert_eq!(contexts[2].posteriors[0].key, "momentum_v1");
    assert_eq!(contexts[2].posteriors[0].latest["result"], "executed");
}

#[tokio::test]
async fn validation_price_outage_rejects_safely() {
    // Call 0 prices the analysis; call 1 (validation) fails
    let mut h = harness(
        TradingMode::Testnet,
        ScriptedPlanner::always(trade_plan()),
        ScriptedTrader::always(buy("0.0001")),
        FlakyMarket::failing_from(dec!(50000), 1),
    )
    .await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    let verdict = report.verdict.as_ref().unwrap();
    assert_eq!(verdict.decision(), Decision::Reject);
    assert_eq!(verdict.violations(), ["Validation system error".to_string()]);
    assert_eq!(report.fallbacks[0].0, Phase::Validating);
    assert!(!report.visited(Phase::Executing));
    assert_eq!(h.gateway.submissions(), 0);

    // Fallback verdicts are audited like any other
    let chain = h.ledger.decision_chain(&report.trace_id).await.unwrap();
    assert_eq!(chain[2].payload["decision"], "REJECT");
}

#[tokio::test]
async fn hold_and_invalid_proposals_never_reach_the_judge() {
    let hold = json!({
        "action": "HOLD",
        "qty": "0",
        "policy_id": "momentum_v1",
        "hypothesis": "Range-bound, no edge",
        "confidence": 0.4
    });
    let mut h = harness(
        TradingMode::Testnet,
        ScriptedPlanner::always(trade_plan()),
        ScriptedTrader::new(vec![Ok(hold), Ok(json!({"action": "SHORT"}))]),
        FlakyMarket::steady(dec!(50000)),
    )
    .await;

    let first = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(
        first.phases,
        vec![Phase::Planning, Phase::Analyzing, Phase::Learning]
    );
    assert!(first.fallbacks.is_empty());

    let second = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(second.proposal.as_ref().unwrap().policy_id(), "fallback_hold");
    assert_eq!(second.fallbacks[0].0, Phase::Analyzing);
    assert!(!second.visited(Phase::Validating));
    assert_eq!(h.gateway.submissions(), 0);
}

#[tokio::test]
async fn duplicate_keys_are_absorbed_not_reexecuted() {
    let ledger = Ledger::open(temp_db_path()).await.unwrap();
    let market: Arc<dyn MarketData> = Arc::new(FlakyMarket::steady(dec!(50000)));
    let gateway = Arc::new(FlakyGateway::new(
        market,
        Balances {
            quote: dec!(1000),
            base: Decimal::ZERO,
        },
    ));
    let keys = IdempotencyKeyGenerator::new(Arc::new(FixedClock::at_unix(1_700_000_000)));
    let memory = Memory::new(ledger.clone(), SYMBOL, TradingMode::Testnet);
    let executor = Executor::new(gateway.clone(), ledger.clone(), memory, SYMBOL)
        .with_key_generator(keys.clone());

    let proposal = Proposal::from_value(buy("0.0001")).unwrap();
    let verdict = Verdict::approve("All constraints satisfied");

    // A crash after the insert but before the cycle finished leaves the row
    let key = keys.generate(SYMBOL, Side::Buy, "0.0001", "trace-dup");
    ledger
        .insert_trade(&NewTrade {
            symbol: SYMBOL.to_string(),
            side: Side::Buy,
            qty: dec!(0.0001),
            price: dec!(50000),
            fee: dec!(0.005),
            order_id: Some("paper-0".to_string()),
            idempotency_key: key.clone(),
            proposal_ref: None,
            status: TradeStatus::Filled,
        })
        .await
        .unwrap();

    let outcome = executor
        .execute("trace-dup", &proposal, &verdict, None)
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::AlreadyRecorded { key: key.clone() });
    assert_eq!(gateway.submissions(), 0);
    assert_eq!(ledger.trade_count().await.unwrap(), 1);

    // The ledger refuses the key outright
    let again = ledger
        .insert_trade(&NewTrade {
            symbol: SYMBOL.to_string(),
            side: Side::Buy,
            qty: dec!(0.0001),
            price: dec!(50001),
            fee: Decimal::ZERO,
            order_id: None,
            idempotency_key: key,
            proposal_ref: None,
            status: TradeStatus::Filled,
        })
        .await;
    assert!(matches!(again, Err(LedgerError::DuplicateIdempotencyKey(_))));

    // A different trace is a different trade
    let outcome = executor
        .execute("trace-other", &proposal, &verdict, None)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
    assert_eq!(ledger.trade_count().await.unwrap(), 2);
}

#[tokio::test]
async fn shutdown_sequence_records_final_state() {
    let mut h = harness(
        TradingMode::Testnet,
        ScriptedPlanner::always(trade_plan()),
        ScriptedTrader::always(buy("0.0001")),
        FlakyMarket::steady(dec!(50000)),
    )
    .await;

    h.orchestrator.run_cycle().await.unwrap();
    h.orchestrator.shutdown().await.unwrap();

    let experiments = h.ledger.recent_experiments(1).await.unwrap();
    assert_eq!(experiments[0].key, "graceful_shutdown");
    assert_eq!(experiments[0].value["cycle_count"], 1);
    assert_eq!(experiments[0].value["symbol"], SYMBOL);

    // One snapshot after the trade, one at shutdown
    assert_eq!(h.ledger.recent_snapshots(10).await.unwrap().len(), 2);
}
