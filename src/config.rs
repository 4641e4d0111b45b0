//! Runtime configuration

use crate::constants::*;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Mempool admission and retention policy. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    pub max_size: usize,
    pub max_age: u64,
    pub min_fee_rate: f64,
    pub max_tx_size: usize,
    pub cleanup_interval: u64,
    pub validate_tx: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MEMPOOL_MAX_SIZE,
            max_age: DEFAULT_MEMPOOL_MAX_AGE,
            min_fee_rate: DEFAULT_MIN_FEE_RATE,
            max_tx_size: DEFAULT_MAX_TX_SIZE,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            validate_tx: true,
        }
    }
}

impl MempoolConfig {
    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }
}

/// Block assembly and proof-of-work parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub difficulty: u32,
    /// 0 means unlimited
    pub max_block_transactions: usize,
    pub max_block_bytes: usize,
    pub max_nonce: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            max_block_transactions: DEFAULT_MAX_BLOCK_TRANSACTIONS,
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            max_nonce: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub mempool: MempoolConfig,
    pub mining: MiningConfig,
    /// Directory of the durable store; `None` keeps the ledger in memory
    pub store_path: Option<PathBuf>,
}

impl LedgerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mempool_defaults() {
        let cfg = MempoolConfig::default();
        assert_eq!(cfg.max_size, 5000);
        assert_eq!(cfg.max_age, 86_400);
        assert_eq!(cfg.min_fee_rate, 1e-5);
        assert_eq!(cfg.max_tx_size, 100_000);
        assert_eq!(cfg.cleanup_interval, 600);
        assert!(cfg.validate_tx);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = LedgerConfig::from_json(r#"{"mempool": {"max_size": 2}, "mining": {"difficulty": 3}}"#)
            .unwrap();
        assert_eq!(cfg.mempool.max_size, 2);
        assert_eq!(cfg.mempool.max_tx_size, DEFAULT_MAX_TX_SIZE);
        assert_eq!(cfg.mining.difficulty, 3);
        assert_eq!(cfg.mining.max_block_bytes, DEFAULT_MAX_BLOCK_BYTES);
        assert!(cfg.store_path.is_none());
    }

    #[test]
    fn test_bad_json_is_bad_input() {
        let err = LedgerConfig::from_json("{not json").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadInput);
    }
}
