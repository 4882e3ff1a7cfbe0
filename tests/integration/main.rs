//! Integration tests: full decision cycles against an on-disk ledger, with
//! scripted generators standing in for the model API and a paper venue
//! standing in for the exchange.

mod cycle;
mod mock_exchange;

use std::path::PathBuf;

pub fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("autotrader_it_{}.db", uuid::Uuid::new_v4()))
}
