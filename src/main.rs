//! autotrader: autonomous plan/propose/judge trading agent.
//!
//! Entry point. Loads configuration, initialises structured logging, opens
//! the audit ledger and runs the decision loop until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use autotrader::config::AppConfig;
use autotrader::dashboard;
use autotrader::engine::orchestrator::{Components, Orchestrator};
use autotrader::llm::openai::OpenAiClient;
use autotrader::platforms::binance::BinanceTicker;
use autotrader::platforms::paper::PaperExchange;
use autotrader::platforms::MarketData;
use autotrader::storage::Ledger;
use autotrader::types::TradingMode;

#[derive(Debug, Parser)]
#[command(name = "autotrader", version, about = "Autonomous plan/propose/judge trading agent")]
struct Cli {
    /// Check configuration and initialise the ledger schema, then exit.
    #[arg(long, conflicts_with_all = ["test_cycle", "dashboard"])]
    validate: bool,

    /// Run a single cycle without sleeping, then exit.
    #[arg(long, conflicts_with = "dashboard")]
    test_cycle: bool,

    /// Serve the read-only monitoring API instead of trading.
    #[arg(long)]
    dashboard: bool,

    /// Optional TOML file with settings; environment variables take precedence.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let cfg = match AppConfig::load(cli.config.as_deref()) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cfg);

    let result = if cli.validate {
        validate(&cfg).await
    } else if cli.dashboard {
        dashboard::serve(&cfg.db_path, cfg.dashboard_port, shutdown_signal()).await
    } else {
        run_agent(cfg, cli.test_cycle).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn validate(cfg: &AppConfig) -> Result<()> {
    cfg.ensure_data_dir()
        .with_context(|| format!("Cannot create data directory for {}", cfg.db_path.display()))?;
    let ledger = Ledger::open(&cfg.db_path).await.context("Ledger initialisation failed")?;
    ledger.close().await;

    info!(
        symbol = %cfg.symbol,
        timeframe = %cfg.timeframe,
        mode = %cfg.mode,
        deposit_cap = %cfg.deposit_cap,
        db = %cfg.db_path.display(),
        api_key = %cfg.api_key_hint(),
        log_file = ?cfg.log_file,
        "Configuration valid"
    );
    Ok(())
}

async fn run_agent(cfg: Arc<AppConfig>, single_cycle: bool) -> Result<()> {
    info!(
        symbol = %cfg.symbol,
        timeframe = %cfg.timeframe,
        mode = %cfg.mode,
        deposit_cap = %cfg.deposit_cap,
        planner = %cfg.planner_model,
        trader = %cfg.trader_model,
        "autotrader starting up"
    );

    cfg.ensure_data_dir()
        .with_context(|| format!("Cannot create data directory for {}", cfg.db_path.display()))?;
    let ledger = Ledger::open(&cfg.db_path).await.context("Failed to open ledger")?;

    let market: Arc<dyn MarketData> = Arc::new(BinanceTicker::new(cfg.mode)?);
    if cfg.mode == TradingMode::Real {
        warn!("Real mode validates against the deposit cap, but orders still fill on the paper venue");
    }
    let gateway = Arc::new(PaperExchange::new(market.clone(), cfg.paper_balances));
    let llm = Arc::new(OpenAiClient::from_config(&cfg)?);

    let mut orchestrator = Orchestrator::from_config(
        &cfg,
        Components {
            planner: llm.clone(),
            trader: llm,
            market,
            gateway,
            ledger: ledger.clone(),
        },
    );

    if single_cycle {
        let report = orchestrator.run_cycle().await?;
        info!(trace_id = %report.trace_id, summary = %report, "Test cycle finished");
        ledger.close().await;
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, finishing current cycle");
        let _ = tx.send(true);
    });

    orchestrator.run_forever(rx).await?;
    ledger.close().await;
    info!(cycles = orchestrator.cycle_count(), "autotrader shut down cleanly");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Initialise the `tracing` subscriber. The returned guard flushes the
/// optional log file and must live until exit.
fn init_logging(cfg: &AppConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("autotrader={}", cfg.log_level.as_filter())));

    let (file_layer, guard) = match &cfg.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let appender = tracing_appender::rolling::never(dir, path.file_name().unwrap_or_default());
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    if cfg.log_json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
    guard
}
