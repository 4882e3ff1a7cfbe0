//! Configuration loading from the environment, with an optional TOML file.
//!
//! Every setting has an environment variable name (`SYMBOL`, `MODE`, ...).
//! `.env` is loaded by `main` before this runs. An optional flat TOML file
//! may supply the same keys; environment values win over file values.
//! Validation happens during construction, so an `AppConfig` in hand is
//! always usable.

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::platforms::Balances;
use crate::strategy::risk::RiskConfig;
use crate::types::TradingMode;

pub const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_PLANNER_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TRADER_MODEL: &str = "gpt-4o";
pub const DEFAULT_SYMBOL: &str = "BTC/USDT";
pub const DEFAULT_TIMEFRAME: &str = "5m";
pub const DEFAULT_DEPOSIT_CAP: &str = "5.0";
pub const DEFAULT_DB_PATH: &str = "data/agent.db";
pub const DEFAULT_PAPER_QUOTE: &str = "1000";
pub const DEFAULT_PAPER_BASE: &str = "0.02";
pub const DEFAULT_DASHBOARD_PORT: u16 = 8080;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Log level
// ---------------------------------------------------------------------------

/// Operator-facing log level names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    /// Equivalent `tracing` filter directive.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Critical | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CRITICAL" => Ok(LogLevel::Critical),
            "ERROR" => Ok(LogLevel::Error),
            "WARNING" => Ok(LogLevel::Warning),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            other => Err(invalid(
                "LOG_LEVEL",
                format!("{other:?} (expected CRITICAL|ERROR|WARNING|INFO|DEBUG)"),
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Critical => "CRITICAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Top-level application configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub openai_api_key: SecretString,
    pub openai_api_url: String,
    pub planner_model: String,
    pub trader_model: String,
    pub symbol: String,
    pub timeframe: String,
    pub mode: TradingMode,
    /// Maximum notional per trade in real mode (quote currency).
    pub deposit_cap: Decimal,
    pub db_path: PathBuf,
    pub log_level: LogLevel,
    pub log_json: bool,
    /// Optional file that receives a plain-text copy of the log stream.
    pub log_file: Option<PathBuf>,
    pub paper_balances: Balances,
    pub dashboard_port: u16,
}

impl AppConfig {
    /// Build from process environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from the environment layered over an optional TOML file.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let file_values = match config_file {
            Some(path) => read_config_file(path)?,
            None => HashMap::new(),
        };
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_values.get(key).cloned())
        })
    }

    /// Build from any key → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get("OPENAI_API_KEY").ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
        if !api_key.starts_with("sk-") {
            return Err(invalid("OPENAI_API_KEY", "must start with 'sk-'"));
        }

        let symbol = get("SYMBOL").unwrap_or_else(|| DEFAULT_SYMBOL.to_string());
        validate_symbol(&symbol)?;

        let timeframe = get("TIMEFRAME").unwrap_or_else(|| DEFAULT_TIMEFRAME.to_string());
        validate_timeframe(&timeframe)?;

        let mode = match get("MODE") {
            Some(raw) => raw
                .parse::<TradingMode>()
                .map_err(|e| invalid("MODE", e.to_string()))?,
            None => TradingMode::Testnet,
        };

        let deposit_cap = parse_decimal_setting(
            "DEPOSIT_CAP_USDT",
            get("DEPOSIT_CAP_USDT").as_deref().unwrap_or(DEFAULT_DEPOSIT_CAP),
        )?;
        if deposit_cap <= Decimal::ZERO {
            return Err(invalid("DEPOSIT_CAP_USDT", "must be positive"));
        }

        let log_level = match get("LOG_LEVEL") {
            Some(raw) => raw.parse::<LogLevel>()?,
            None => LogLevel::Info,
        };

        let log_json = get("LOG_JSON")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(false);

        let log_file = get("LOG_FILE").map(PathBuf::from);
        if let Some(path) = &log_file {
            if path.file_name().is_none() {
                return Err(invalid("LOG_FILE", format!("{} names no file", path.display())));
            }
        }

        let paper_quote = parse_decimal_setting(
            "PAPER_QUOTE_BALANCE",
            get("PAPER_QUOTE_BALANCE").as_deref().unwrap_or(DEFAULT_PAPER_QUOTE),
        )?;
        let paper_base = parse_decimal_setting(
            "PAPER_BASE_BALANCE",
            get("PAPER_BASE_BALANCE").as_deref().unwrap_or(DEFAULT_PAPER_BASE),
        )?;
        if paper_quote < Decimal::ZERO || paper_base < Decimal::ZERO {
            return Err(invalid("PAPER_*_BALANCE", "balances cannot be negative"));
        }

        let dashboard_port = match get("DASHBOARD_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|e| invalid("DASHBOARD_PORT", e.to_string()))?,
            None => DEFAULT_DASHBOARD_PORT,
        };

        Ok(Self {
            openai_api_key: SecretString::new(api_key),
            openai_api_url: get("OPENAI_API_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_string()),
            planner_model: get("OPENAI_MODEL_PLANNER")
                .unwrap_or_else(|| DEFAULT_PLANNER_MODEL.to_string()),
            trader_model: get("OPENAI_MODEL_TRADER")
                .unwrap_or_else(|| DEFAULT_TRADER_MODEL.to_string()),
            symbol,
            timeframe,
            mode,
            deposit_cap,
            db_path: PathBuf::from(get("DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string())),
            log_level,
            log_json,
            log_file,
            paper_balances: Balances {
                quote: paper_quote,
                base: paper_base,
            },
            dashboard_port,
        })
    }

    /// Create the ledger's parent directory if missing.
    pub fn ensure_data_dir(&self) -> std::io::Result<()> {
        match self.db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig::new(self.mode, self.deposit_cap)
    }

    /// Length-only view of the API key, for startup logs.
    pub fn api_key_hint(&self) -> String {
        let key = self.openai_api_key.expose_secret();
        format!("sk-...({} chars)", key.len())
    }
}

fn read_config_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let display = path.display().to_string();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    let table: toml::Table = contents.parse().map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })?;

    Ok(table
        .into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                _ => return None,
            };
            Some((key.to_uppercase(), value))
        })
        .collect())
}

fn validate_symbol(symbol: &str) -> Result<(), ConfigError> {
    match symbol.split_once('/') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok(()),
        _ => Err(invalid("SYMBOL", format!("{symbol:?} must look like BASE/QUOTE"))),
    }
}

fn validate_timeframe(timeframe: &str) -> Result<(), ConfigError> {
    let err = || invalid("TIMEFRAME", format!("{timeframe:?} (expected e.g. 5m, 1h, 1d)"));
    let unit = timeframe.chars().last().ok_or_else(err)?;
    if !matches!(unit, 'm' | 'h' | 'd') {
        return Err(err());
    }
    let count: u32 = timeframe[..timeframe.len() - 1].parse().map_err(|_| err())?;
    if count == 0 {
        return Err(err());
    }
    Ok(())
}

fn parse_decimal_setting(key: &'static str, raw: &str) -> Result<Decimal, ConfigError> {
    Decimal::from_str(raw).map_err(|e| invalid(key, format!("{raw:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
