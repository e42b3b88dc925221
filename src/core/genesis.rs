//! Genesis document: the balances that seed a fresh chain.

use crate::types::address::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tinychain_derive::Error;

/// Default genesis document written on first startup of a data directory.
const DEFAULT_GENESIS_JSON: &str = r#"{
  "genesis_time": "2024-01-01T00:00:00.000000000Z",
  "chain_id": "tinychain-ledger",
  "symbol": "TNC",
  "balances": {
    "0x50543e830590fD03a0301fAA0164d731f0E2ff7D": 1000000
  }
}"#;

#[derive(Debug, Error)]
pub enum GenesisError {
    /// The genesis document exists but cannot be parsed.
    #[error("corrupt genesis document: {0}")]
    Corrupt(String),
    /// The genesis document cannot be read or written.
    #[error("genesis io failure: {0}")]
    Io(String),
}

/// Parsed genesis document.
///
/// Balances use a `BTreeMap` so seeding iterates accounts in a stable order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub genesis_time: String,
    pub chain_id: String,
    pub symbol: String,
    pub balances: BTreeMap<Address, u64>,
}

/// Path of the genesis document inside a data directory.
pub fn genesis_path(datadir: &Path) -> PathBuf {
    datadir.join("genesis.json")
}

/// Loads `<datadir>/genesis.json`, writing the embedded default first when
/// the data directory is fresh.
pub fn load_genesis(datadir: &Path) -> Result<Genesis, GenesisError> {
    let path = genesis_path(datadir);

    if !path.exists() {
        fs::create_dir_all(datadir).map_err(|e| GenesisError::Io(e.to_string()))?;
        fs::write(&path, DEFAULT_GENESIS_JSON).map_err(|e| GenesisError::Io(e.to_string()))?;
    }

    let content = fs::read_to_string(&path).map_err(|e| GenesisError::Io(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| GenesisError::Corrupt(e.to_string()))
}
