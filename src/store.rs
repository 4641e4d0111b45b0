//! Durable chain storage backed by sled
//!
//! Trees:
//! - `blocks`: index (u64 BE) → block JSON
//! - `hashes`: block hash → index (u64 BE)
//! - `times`: timestamp (u64 BE) ‖ index (u64 BE) → ()
//! - `rewards`: miner address → accumulated reward (f64 BE)
//! - `meta`: `schema_version`, `length`
//!
//! Saves are incremental: only blocks past the stored length are written,
//! together with the new length and reward totals, in one sled transaction.

use crate::block::Block;
use crate::constants::*;
use crate::economic::miner_rewards;
use crate::error::{LedgerError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use sled::transaction::{TransactionError, TransactionResult, Transactional};
use sled::Error as SledError;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

const TREE_BLOCKS: &str = "blocks";
const TREE_HASHES: &str = "hashes";
const TREE_TIMES: &str = "times";
const TREE_REWARDS: &str = "rewards";
const TREE_META: &str = "meta";
const KEY_SCHEMA_VERSION: &[u8] = b"schema_version";
const KEY_LENGTH: &[u8] = b"length";

/// Aggregate mining figures over a stored chain. The genesis block is not
/// counted as mined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningStats {
    pub blocks: u64,
    pub total_rewards: Amount,
    pub miners: usize,
    pub average_difficulty: f64,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
}

/// Durable store contract: one writer, any number of readers
pub trait ChainStore {
    /// Persist `blocks`, which must extend what is already stored
    fn save_blockchain(&self, blocks: &[Block]) -> Result<()>;

    /// Every stored block in index order; `NotInitialized` when empty
    fn load_blockchain(&self) -> Result<Vec<Block>>;

    fn get_block_by_index(&self, index: u64) -> Result<Option<Block>>;

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>>;

    /// Blocks with `start <= timestamp <= end`, in index order
    fn get_blocks_by_time_range(&self, start: u64, end: u64) -> Result<Vec<Block>>;

    fn get_chain_length(&self) -> Result<u64>;

    fn get_miner_rewards(&self) -> Result<HashMap<Address, Amount>>;

    fn get_mining_stats(&self) -> Result<MiningStats>;

    fn schema_version(&self) -> Result<String>;

    /// Truncate all state; the store stays usable and reports length 0
    fn delete(&self) -> Result<()>;

    /// Flush everything to disk
    fn close(&self) -> Result<()>;
}

pub struct SledStore {
    db: sled::Db,
    blocks: sled::Tree,
    hashes: sled::Tree,
    times: sled::Tree,
    rewards: sled::Tree,
    meta: sled::Tree,
    writer: Mutex<()>,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        let store = Self::from_db(db)?;
        info!(path = %path.display(), length = store.get_chain_length()?, "opened chain store");
        Ok(store)
    }

    /// In-memory store, discarded on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let store = Self {
            blocks: db.open_tree(TREE_BLOCKS)?,
            hashes: db.open_tree(TREE_HASHES)?,
            times: db.open_tree(TREE_TIMES)?,
            rewards: db.open_tree(TREE_REWARDS)?,
            meta: db.open_tree(TREE_META)?,
            db,
            writer: Mutex::new(()),
        };
        match store.meta.get(KEY_SCHEMA_VERSION)? {
            None => {
                store.meta.insert(KEY_SCHEMA_VERSION, SCHEMA_VERSION.as_bytes())?;
            }
            Some(v) if v.as_ref() != SCHEMA_VERSION.as_bytes() => {
                return Err(LedgerError::Storage(format!(
                    "unsupported schema version {:?}",
                    String::from_utf8_lossy(&v)
                )));
            }
            Some(_) => {}
        }
        Ok(store)
    }

    fn decode_block(bytes: &[u8]) -> Result<Block> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn decode_u64(bytes: &[u8], what: &str) -> Result<u64> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| LedgerError::Storage(format!("corrupt {} record", what)))?;
        Ok(u64::from_be_bytes(arr))
    }

    fn time_key(timestamp: u64, index: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&timestamp.to_be_bytes());
        key[8..].copy_from_slice(&index.to_be_bytes());
        key
    }

    fn all_blocks(&self) -> Result<Vec<Block>> {
        self.blocks
            .iter()
            .map(|item| {
                let (_, v) = item?;
                Self::decode_block(&v)
            })
            .collect()
    }
}

impl ChainStore for SledStore {
    fn save_blockchain(&self, blocks: &[Block]) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let stored = self.get_chain_length()? as usize;
        if stored > blocks.len() {
            return Err(LedgerError::InvariantViolation(format!(
                "store holds {} blocks, refusing to save a chain of {}",
                stored,
                blocks.len()
            )));
        }
        if stored > 0 {
            let last = self
                .get_block_by_index(stored as u64 - 1)?
                .ok_or_else(|| LedgerError::Storage(format!("missing block {}", stored - 1)))?;
            if last.hash != blocks[stored - 1].hash {
                return Err(LedgerError::InvariantViolation(format!(
                    "chain diverges from store at block {}",
                    stored - 1
                )));
            }
        }
        if stored == blocks.len() {
            return Ok(());
        }

        let mut records = Vec::with_capacity(blocks.len() - stored);
        for block in &blocks[stored..] {
            records.push((block.index, block.hash.clone(), block.timestamp, serde_json::to_vec(block)?));
        }
        let rewards: Vec<(Address, Amount)> = miner_rewards(blocks).into_iter().collect();
        let length = (blocks.len() as u64).to_be_bytes();

        let res: TransactionResult<(), SledError> = (&self.blocks, &self.hashes, &self.times, &self.rewards, &self.meta)
            .transaction(|(blocks_tree, hashes, times, rewards_tree, meta)| {
                for (index, hash, timestamp, json) in &records {
                    blocks_tree.insert(index.to_be_bytes().to_vec(), json.clone())?;
                    hashes.insert(hash.as_bytes(), index.to_be_bytes().to_vec())?;
                    times.insert(Self::time_key(*timestamp, *index).to_vec(), Vec::new())?;
                }
                for (address, reward) in &rewards {
                    rewards_tree.insert(address.as_bytes(), reward.to_be_bytes().to_vec())?;
                }
                meta.insert(KEY_LENGTH, length.to_vec())?;
                Ok(())
            });
        res.map_err(|e| match e {
            TransactionError::Abort(e) | TransactionError::Storage(e) => LedgerError::Sled(e),
        })?;
        self.db.flush()?;

        info!(saved = records.len(), length = blocks.len(), "chain saved");
        Ok(())
    }

    fn load_blockchain(&self) -> Result<Vec<Block>> {
        let length = self.get_chain_length()?;
        if length == 0 {
            return Err(LedgerError::NotInitialized);
        }
        let mut blocks = Vec::with_capacity(length as usize);
        for index in 0..length {
            let block = self
                .get_block_by_index(index)?
                .ok_or_else(|| LedgerError::Storage(format!("missing block {}", index)))?;
            blocks.push(block);
        }
        debug!(length, "chain loaded from store");
        Ok(blocks)
    }

    fn get_block_by_index(&self, index: u64) -> Result<Option<Block>> {
        match self.blocks.get(index.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_block(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        match self.hashes.get(hash.as_bytes())? {
            Some(bytes) => self.get_block_by_index(Self::decode_u64(&bytes, "hash index")?),
            None => Ok(None),
        }
    }

    fn get_blocks_by_time_range(&self, start: u64, end: u64) -> Result<Vec<Block>> {
        if start > end {
            return Ok(Vec::new());
        }
        let from = Self::time_key(start, 0);
        let to = Self::time_key(end, u64::MAX);
        let mut indices = Vec::new();
        for item in self.times.range(from..=to) {
            let (key, _) = item?;
            indices.push(Self::decode_u64(&key[8..], "time index")?);
        }
        indices.sort_unstable();

        let mut blocks = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(block) = self.get_block_by_index(index)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    fn get_chain_length(&self) -> Result<u64> {
        match self.meta.get(KEY_LENGTH)? {
            Some(bytes) => Self::decode_u64(&bytes, "length"),
            None => Ok(0),
        }
    }

    fn get_miner_rewards(&self) -> Result<HashMap<Address, Amount>> {
        let mut rewards = HashMap::new();
        for item in self.rewards.iter() {
            let (key, value) = item?;
            let address = String::from_utf8(key.to_vec())
                .map_err(|_| LedgerError::Storage("corrupt reward key".to_string()))?;
            let bytes: [u8; 8] = value
                .as_ref()
                .try_into()
                .map_err(|_| LedgerError::Storage("corrupt reward value".to_string()))?;
            rewards.insert(address, f64::from_be_bytes(bytes));
        }
        Ok(rewards)
    }

    fn get_mining_stats(&self) -> Result<MiningStats> {
        let blocks = self.all_blocks()?;
        let mined: Vec<&Block> = blocks.iter().filter(|b| !b.is_genesis()).collect();
        let miners: HashSet<&str> = mined
            .iter()
            .map(|b| b.miner_address.as_str())
            .filter(|a| !a.is_empty())
            .collect();
        let average_difficulty = if mined.is_empty() {
            0.0
        } else {
            mined.iter().map(|b| b.difficulty as f64).sum::<f64>() / mined.len() as f64
        };
        Ok(MiningStats {
            blocks: mined.len() as u64,
            total_rewards: mined.iter().map(|b| b.reward).sum(),
            miners: miners.len(),
            average_difficulty,
            first_timestamp: blocks.iter().map(|b| b.timestamp).min(),
            last_timestamp: blocks.iter().map(|b| b.timestamp).max(),
        })
    }

    fn schema_version(&self) -> Result<String> {
        match self.meta.get(KEY_SCHEMA_VERSION)? {
            Some(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            None => Ok(SCHEMA_VERSION.to_string()),
        }
    }

    fn delete(&self) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        for tree in [&self.blocks, &self.hashes, &self.times, &self.rewards, &self.meta] {
            tree.clear()?;
        }
        self.meta.insert(KEY_SCHEMA_VERSION, SCHEMA_VERSION.as_bytes())?;
        self.db.flush()?;
        info!("chain store truncated");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
