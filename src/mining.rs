//! Block templates and the proof-of-work search

use crate::block::{hash_fields, payload_digest, Block, BlockPayload};
use crate::economic::{block_reward, coinbase_amount};
use crate::error::{LedgerError, Result};
use crate::pow::{meets_difficulty, validate_difficulty};
use crate::transaction::new_coinbase;
use crate::types::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Nonces tried between two checks of the cancellation token and deadline
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Shared flag that asks a running proof-of-work search to stop.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Bounds on a single proof-of-work search
#[derive(Debug, Clone, Default)]
pub struct MiningLimits<'a> {
    /// Highest nonce to try; `None` searches the whole u64 space
    pub max_nonce: Option<u64>,
    pub deadline: Option<Instant>,
    pub cancel: Option<&'a CancellationToken>,
}

/// Timestamp for the block after `tip`: the current time, but strictly
/// after the tip so consecutive coinbases never share an id
pub fn next_block_timestamp(tip: &Block, now: u64) -> u64 {
    now.max(tip.timestamp + 1)
}

/// CreateBlockTemplate: ℬ × payload × addr × ℕ → ℬ
///
/// 1. index = tip.index + 1, prev_hash = tip.hash
/// 2. timestamp = max(now, tip.timestamp + 1)
/// 3. reward = BlockReward(difficulty)
/// 4. nonce = 0, hash unset until mined
pub fn create_block_template(
    tip: &Block,
    payload: BlockPayload,
    miner_address: &str,
    difficulty: u32,
    now: u64,
) -> Result<Block> {
    validate_difficulty(difficulty)?;
    Ok(Block {
        index: tip.index + 1,
        timestamp: next_block_timestamp(tip, now),
        payload,
        prev_hash: tip.hash.clone(),
        hash: String::new(),
        nonce: 0,
        difficulty,
        miner_address: miner_address.to_string(),
        reward: block_reward(difficulty),
    })
}

/// Coinbase paying the block reward plus `fees` to the miner, stamped with
/// the block's timestamp
pub fn create_coinbase_transaction(
    miner_address: &str,
    difficulty: u32,
    fees: Amount,
    timestamp: u64,
) -> Transaction {
    new_coinbase(miner_address, coinbase_amount(difficulty, fees), timestamp)
}

/// MineBlock: ℬ × limits → ℬ
///
/// Search nonces from 0 upwards until hex(hash) starts with `difficulty`
/// zeros. Returns the block with `nonce` and `hash` set.
///
/// Fails with `Cancelled` when the token fires or the deadline passes, and
/// with `NotFound` when `max_nonce` is exhausted. The input block is consumed
/// either way; nothing outside it is touched.
pub fn mine_block(mut block: Block, limits: &MiningLimits<'_>) -> Result<Block> {
    validate_difficulty(block.difficulty)?;
    let digest = payload_digest(&block.payload);
    let max_nonce = limits.max_nonce.unwrap_or(u64::MAX);
    let started = Instant::now();

    let mut nonce = 0u64;
    loop {
        if nonce % CANCEL_CHECK_INTERVAL == 0 && should_stop(limits) {
            warn!(index = block.index, attempts = nonce, "mining cancelled");
            return Err(LedgerError::Cancelled);
        }

        let hash = hash_fields(&block, &digest, nonce);
        if meets_difficulty(&hash, block.difficulty) {
            block.nonce = nonce;
            block.hash = hash;
            debug!(
                index = block.index,
                nonce,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "proof of work found"
            );
            return Ok(block);
        }

        if nonce >= max_nonce {
            return Err(LedgerError::NotFound(format!(
                "no nonce up to {} meets difficulty {}",
                max_nonce, block.difficulty
            )));
        }
        nonce += 1;
    }
}

fn should_stop(limits: &MiningLimits<'_>) -> bool {
    limits.cancel.map(|c| c.is_cancelled()).unwrap_or(false)
        || limits.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}
