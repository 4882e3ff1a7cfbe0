//! Audit ledger.
//!
//! SQLite store (via `sqlx`) of every decision, trade, portfolio snapshot
//! and experiment record the agent produces. The file is opened in WAL mode
//! with a busy timeout so the read-only dashboard can run alongside the
//! agent. Decimals are stored as TEXT and timestamps as RFC 3339 UTC strings.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{
    AgentKind, DecisionRecord, ExperimentRecord, NewTrade, PortfolioSnapshot, Side,
    SnapshotRecord, TradeRecord, TradeStatus,
};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_CONNECTIONS: u32 = 4;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS decisions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts_utc TEXT NOT NULL,
        agent TEXT NOT NULL CHECK (agent IN ('PLANNER', 'TRADER', 'JUDGE')),
        trace_id TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        plan_id INTEGER,
        proposal_id INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts_utc TEXT NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL CHECK (side IN ('BUY', 'SELL')),
        qty TEXT NOT NULL,
        price TEXT NOT NULL,
        fee TEXT NOT NULL,
        order_id TEXT,
        idempotency_key TEXT NOT NULL UNIQUE,
        proposal_id INTEGER,
        status TEXT NOT NULL DEFAULT 'FILLED'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS portfolio (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts_utc TEXT NOT NULL,
        balance_quote TEXT NOT NULL,
        balance_base TEXT NOT NULL,
        unrealized_pnl TEXT NOT NULL,
        realized_pnl TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS memory (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts_utc TEXT NOT NULL,
        key TEXT NOT NULL,
        value_json TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decisions(ts_utc)",
    "CREATE INDEX IF NOT EXISTS idx_decisions_trace ON decisions(trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(ts_utc)",
    "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
    "CREATE INDEX IF NOT EXISTS idx_portfolio_ts ON portfolio(ts_utc)",
    "CREATE INDEX IF NOT EXISTS idx_memory_ts ON memory(ts_utc)",
    "CREATE INDEX IF NOT EXISTS idx_memory_key ON memory(key)",
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A trade with this idempotency key is already recorded.
    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A stored row could not be decoded back into its type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Handle on the audit database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path` and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| LedgerError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.migrate().await?;

        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Open an existing ledger without write access.
    pub async fn open_read_only(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Ledger opened read-only");
        Ok(Self { pool })
    }

    async fn migrate(&self) -> LedgerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Ledger schema ensured");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- Decisions --

    /// Append a decision row and return its id.
    pub async fn record_decision(
        &self,
        agent: AgentKind,
        trace_id: &str,
        payload: &Value,
        plan_ref: Option<i64>,
        proposal_ref: Option<i64>,
    ) -> LedgerResult<i64> {
        let payload_json = serde_json::to_string(payload)?;
        let result = sqlx::query(
            r#"
            INSERT INTO decisions (ts_utc, agent, trace_id, payload_json, plan_id, proposal_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now_utc())
        .bind(agent.as_str())
        .bind(trace_id)
        .bind(payload_json)
        .bind(plan_ref)
        .bind(proposal_ref)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, agent = %agent, trace_id, "Decision recorded");
        Ok(id)
    }

    /// All decisions of one cycle, in insertion order.
    pub async fn decision_chain(&self, trace_id: &str) -> LedgerResult<Vec<DecisionRecord>> {
        let rows = sqlx::query(
            "SELECT id, ts_utc, agent, trace_id, payload_json, plan_id, proposal_id \
             FROM decisions WHERE trace_id = ? ORDER BY id ASC",
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decision_from_row).collect()
    }

    /// Newest decisions first.
    pub async fn recent_decisions(&self, limit: u32) -> LedgerResult<Vec<DecisionRecord>> {
        let rows = sqlx::query(
            "SELECT id, ts_utc, agent, trace_id, payload_json, plan_id, proposal_id \
             FROM decisions ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decision_from_row).collect()
    }

    // -- Trades --

    /// Record a filled trade. A second trade with the same idempotency key
    /// yields `LedgerError::DuplicateIdempotencyKey` and leaves the ledger
    /// unchanged.
    pub async fn insert_trade(&self, trade: &NewTrade) -> LedgerResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades
                (ts_utc, symbol, side, qty, price, fee, order_id, idempotency_key, proposal_id, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now_utc())
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.qty.to_string())
        .bind(trade.price.to_string())
        .bind(trade.fee.to_string())
        .bind(&trade.order_id)
        .bind(&trade.idempotency_key)
        .bind(trade.proposal_ref)
        .bind(trade.status.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                info!(
                    id,
                    symbol = %trade.symbol,
                    side = %trade.side,
                    qty = %trade.qty,
                    price = %trade.price,
                    key = %trade.idempotency_key,
                    "Trade recorded"
                );
                Ok(id)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                LedgerError::DuplicateIdempotencyKey(trade.idempotency_key.clone()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn trade_by_key(&self, idempotency_key: &str) -> LedgerResult<Option<TradeRecord>> {
        let row = sqlx::query(&format!("{TRADE_SELECT} WHERE idempotency_key = ?"))
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(trade_from_row).transpose()
    }

    /// Newest trades first.
    pub async fn recent_trades(&self, limit: u32) -> LedgerResult<Vec<TradeRecord>> {
        let rows = sqlx::query(&format!("{TRADE_SELECT} ORDER BY id DESC LIMIT ?"))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(trade_from_row).collect()
    }

    /// Every trade on `symbol`, oldest first.
    pub async fn trades_for_symbol(&self, symbol: &str) -> LedgerResult<Vec<TradeRecord>> {
        let rows = sqlx::query(&format!("{TRADE_SELECT} WHERE symbol = ? ORDER BY id ASC"))
            .bind(symbol)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(trade_from_row).collect()
    }

    pub async fn trade_count(&self) -> LedgerResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // -- Portfolio --

    pub async fn snapshot_portfolio(&self, snapshot: &PortfolioSnapshot) -> LedgerResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO portfolio (ts_utc, balance_quote, balance_base, unrealized_pnl, realized_pnl)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(now_utc())
        .bind(snapshot.balance_quote.to_string())
        .bind(snapshot.balance_base.to_string())
        .bind(snapshot.unrealized_pnl.to_string())
        .bind(snapshot.realized_pnl.to_string())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(
            id,
            quote = %snapshot.balance_quote,
            base = %snapshot.balance_base,
            realized = %snapshot.realized_pnl,
            "Portfolio snapshot recorded"
        );
        Ok(id)
    }

    pub async fn latest_snapshot(&self) -> LedgerResult<Option<SnapshotRecord>> {
        let row = sqlx::query(&format!("{SNAPSHOT_SELECT} ORDER BY id DESC LIMIT 1"))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    /// Newest snapshots first.
    pub async fn recent_snapshots(&self, limit: u32) -> LedgerResult<Vec<SnapshotRecord>> {
        let rows = sqlx::query(&format!("{SNAPSHOT_SELECT} ORDER BY id DESC LIMIT ?"))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    // -- Experiments --

    pub async fn write_experiment(&self, key: &str, value: &Value) -> LedgerResult<i64> {
        let value_json = serde_json::to_string(value)?;
        let result = sqlx::query("INSERT INTO memory (ts_utc, key, value_json) VALUES (?, ?, ?)")
            .bind(now_utc())
            .bind(key)
            .bind(value_json)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        debug!(id, key, "Experiment recorded");
        Ok(id)
    }

    /// Newest experiments first.
    pub async fn recent_experiments(&self, limit: u32) -> LedgerResult<Vec<ExperimentRecord>> {
        let rows = sqlx::query(&format!("{EXPERIMENT_SELECT} ORDER BY id DESC LIMIT ?"))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(experiment_from_row).collect()
    }

    /// Experiments at or after `since`, newest first.
    pub async fn experiments_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> LedgerResult<Vec<ExperimentRecord>> {
        let rows = sqlx::query(&format!(
            "{EXPERIMENT_SELECT} WHERE ts_utc >= ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(format_ts(since))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(experiment_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

const TRADE_SELECT: &str = "SELECT id, ts_utc, symbol, side, qty, price, fee, order_id, \
     idempotency_key, proposal_id, status FROM trades";

const SNAPSHOT_SELECT: &str = "SELECT id, ts_utc, balance_quote, balance_base, \
     unrealized_pnl, realized_pnl FROM portfolio";

const EXPERIMENT_SELECT: &str = "SELECT id, ts_utc, key, value_json FROM memory";

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_utc() -> String {
    format_ts(Utc::now())
}

fn parse_ts(raw: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn decimal_col(row: &SqliteRow, col: &str) -> LedgerResult<Decimal> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw).map_err(|e| LedgerError::Corrupt(format!("{col} {raw:?}: {e}")))
}

fn json_col(row: &SqliteRow, col: &str) -> LedgerResult<Value> {
    let raw: String = row.try_get(col)?;
    serde_json::from_str(&raw).map_err(|e| LedgerError::Corrupt(format!("{col}: {e}")))
}

fn parse_col<T>(row: &SqliteRow, col: &str) -> LedgerResult<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.try_get(col)?;
    raw.parse()
        .map_err(|e: anyhow::Error| LedgerError::Corrupt(format!("{col}: {e}")))
}

fn decision_from_row(row: &SqliteRow) -> LedgerResult<DecisionRecord> {
    let ts: String = row.try_get("ts_utc")?;
    Ok(DecisionRecord {
        id: row.try_get("id")?,
        ts: parse_ts(&ts)?,
        agent: parse_col::<AgentKind>(row, "agent")?,
        trace_id: row.try_get("trace_id")?,
        payload: json_col(row, "payload_json")?,
        plan_ref: row.try_get("plan_id")?,
        proposal_ref: row.try_get("proposal_id")?,
    })
}

fn trade_from_row(row: &SqliteRow) -> LedgerResult<TradeRecord> {
    let ts: String = row.try_get("ts_utc")?;
    Ok(TradeRecord {
        id: row.try_get("id")?,
        ts: parse_ts(&ts)?,
        symbol: row.try_get("symbol")?,
        side: parse_col::<Side>(row, "side")?,
        qty: decimal_col(row, "qty")?,
        price: decimal_col(row, "price")?,
        fee: decimal_col(row, "fee")?,
        order_id: row.try_get("order_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        proposal_ref: row.try_get("proposal_id")?,
        status: parse_col::<TradeStatus>(row, "status")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> LedgerResult<SnapshotRecord> {
    let ts: String = row.try_get("ts_utc")?;
    Ok(SnapshotRecord {
        id: row.try_get("id")?,
        ts: parse_ts(&ts)?,
        balance_quote: decimal_col(row, "balance_quote")?,
        balance_base: decimal_col(row, "balance_base")?,
        unrealized_pnl: decimal_col(row, "unrealized_pnl")?,
        realized_pnl: decimal_col(row, "realized_pnl")?,
    })
}

fn experiment_from_row(row: &SqliteRow) -> LedgerResult<ExperimentRecord> {
    let ts: String = row.try_get("ts_utc")?;
    Ok(ExperimentRecord {
        id: row.try_get("id")?,
        ts: parse_ts(&ts)?,
        key: row.try_get("key")?,
        value: json_col(row, "value_json")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
