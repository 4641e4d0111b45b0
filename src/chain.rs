//! The append-only chain of mined blocks

use crate::block::{calculate_block_hash, Block, BlockPayload};
use crate::constants::*;
use crate::economic::{block_reward, miner_rewards};
use crate::error::{LedgerError, Result};
use crate::mining::{create_block_template, mine_block, MiningLimits};
use crate::pow::meets_difficulty;
use crate::transaction::calculate_id;
use crate::types::*;
use crate::utxo::UtxoSet;
use crate::validation::validate_structure;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct ChainInner {
    blocks: Vec<Block>,
    by_hash: HashMap<String, usize>,
    miner_rewards: HashMap<Address, Amount>,
}

impl ChainInner {
    fn from_validated(blocks: Vec<Block>) -> Self {
        let by_hash = blocks.iter().enumerate().map(|(i, b)| (b.hash.clone(), i)).collect();
        let miner_rewards = miner_rewards(&blocks);
        Self { blocks, by_hash, miner_rewards }
    }

    fn tip(&self) -> &Block {
        // Never empty: constructed with at least the genesis block
        &self.blocks[self.blocks.len() - 1]
    }

    fn push(&mut self, block: Block) {
        if !block.miner_address.is_empty() {
            *self.miner_rewards.entry(block.miner_address.clone()).or_insert(0.0) += block.reward;
        }
        self.by_hash.insert(block.hash.clone(), self.blocks.len());
        self.blocks.push(block);
    }
}

/// Blockchain behind a reader–writer lock.
///
/// Appends take the writer lock only to commit; proof-of-work runs without
/// holding it and the tip is re-checked at commit time.
#[derive(Debug)]
pub struct Blockchain {
    inner: RwLock<ChainInner>,
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain {
    /// A chain holding only the genesis block
    pub fn new() -> Self {
        Self { inner: RwLock::new(ChainInner::from_validated(vec![Block::genesis()])) }
    }

    /// Rebuild a chain from stored blocks, checking every chain invariant
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Self> {
        validate_chain(&blocks)?;
        Ok(Self { inner: RwLock::new(ChainInner::from_validated(blocks)) })
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// AppendBlock: payload × addr × ℕ → ℬ
    ///
    /// 1. Build a template on the current tip
    /// 2. Solve proof of work without holding the chain lock
    /// 3. Commit under the writer lock, re-asserting the chain invariants
    /// 4. Credit the miner with BlockReward(difficulty)
    pub fn append_block(
        &self,
        payload: BlockPayload,
        miner_address: &str,
        difficulty: u32,
        limits: &MiningLimits<'_>,
    ) -> Result<Block> {
        let tip = self.tip();
        let template = create_block_template(&tip, payload, miner_address, difficulty, unix_timestamp())?;
        let block = mine_block(template, limits)?;
        self.commit_block(block.clone())?;
        Ok(block)
    }

    /// Append a mined block after checking it extends the current tip
    pub fn commit_block(&self, block: Block) -> Result<()> {
        self.commit_block_with(block, |_| Ok(()))
    }

    /// Commit `block`, running `on_commit` under the writer lock before the
    /// block becomes visible. If `on_commit` fails the block is not appended.
    pub fn commit_block_with<F>(&self, block: Block, on_commit: F) -> Result<()>
    where
        F: FnOnce(&Block) -> Result<()>,
    {
        let mut inner = self.write();
        if let Err(e) = validate_successor(inner.tip(), &block) {
            warn!(index = block.index, hash = %block.hash, error = %e, "block rejected");
            return Err(e);
        }
        on_commit(&block)?;
        info!(
            index = block.index,
            hash = %block.hash,
            txs = block.tx_count(),
            miner = %block.miner_address,
            reward = block.reward,
            "block committed"
        );
        inner.push(block);
        Ok(())
    }

    /// IsValid: (C1)–(C5) plus proof of work on every block
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Like [`is_valid`](Self::is_valid) but reports the first violation
    pub fn validate(&self) -> Result<()> {
        validate_chain(&self.read().blocks)
    }

    pub fn get_block_by_index(&self, index: u64) -> Option<Block> {
        self.read().blocks.get(index as usize).cloned()
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Option<Block> {
        let inner = self.read();
        inner.by_hash.get(hash).map(|&i| inner.blocks[i].clone())
    }

    /// Blocks with `start <= timestamp <= end`, in chain order
    pub fn get_blocks_by_time_range(&self, start: u64, end: u64) -> Vec<Block> {
        self.read()
            .blocks
            .iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().blocks.len()
    }

    /// Always false: a chain holds at least its genesis block
    pub fn is_empty(&self) -> bool {
        self.read().blocks.is_empty()
    }

    pub fn tip(&self) -> Block {
        self.read().tip().clone()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.read().blocks.clone()
    }

    pub fn miner_rewards(&self) -> HashMap<Address, Amount> {
        self.read().miner_rewards.clone()
    }

    pub fn miner_reward(&self, address: &str) -> Amount {
        self.read().miner_rewards.get(address).copied().unwrap_or(0.0)
    }
}

// ===== CHAIN INVARIANTS =====

/// ValidateChain: ℬ* → {ok, err}
///
/// 1. (C1) blocks[0] is the genesis block
/// 2. For every i > 0, ValidateSuccessor(blocks[i-1], blocks[i])
/// 3. Every transaction replays against the outputs created before it,
///    signatures included
pub fn validate_chain(blocks: &[Block]) -> Result<()> {
    let genesis = blocks
        .first()
        .ok_or_else(|| LedgerError::InvariantViolation("chain has no genesis block".to_string()))?;
    if *genesis != Block::genesis() {
        return Err(LedgerError::InvariantViolation(format!(
            "block 0 is not the genesis block (hash {})",
            genesis.hash
        )));
    }
    for pair in blocks.windows(2) {
        validate_successor(&pair[0], &pair[1])?;
    }
    replay_transactions(blocks, &UtxoSet::new())
}

/// Apply every transaction of `blocks` to `utxo` in chain order.
///
/// Coinbases are applied directly; every other transaction must pass
/// ValidateStructure against the set as it stands at that point. On failure
/// `utxo` holds the state up to the offending transaction.
pub fn replay_transactions(blocks: &[Block], utxo: &UtxoSet) -> Result<()> {
    for block in blocks {
        for tx in block.transactions() {
            let applied = if tx.is_coinbase() {
                utxo.process_transaction(tx).map(|_| ())
            } else {
                validate_structure(tx, utxo).and_then(|_| utxo.process_transaction(tx).map(|_| ()))
            };
            if let Err(e) = applied {
                return Err(LedgerError::InvariantViolation(format!(
                    "replay of block {} transaction {} failed: {}",
                    block.index, tx.id, e
                )));
            }
        }
    }
    Ok(())
}

/// ValidateSuccessor: ℬ × ℬ → {ok, err}
///
/// 1. (C5) index = prev.index + 1, timestamp ≥ prev.timestamp
/// 2. (C2) prev_hash = prev.hash
/// 3. (C3) hash recomputes from the block's fields
/// 4. (C4) hash has `difficulty` leading zero nibbles
/// 5. reward = BlockReward(difficulty)
/// 6. Transaction blocks: exactly one coinbase, first, paying the miner at
///    least the reward; every transaction id recomputes
pub fn validate_successor(prev: &Block, block: &Block) -> Result<()> {
    let fail = |msg: String| Err(LedgerError::InvariantViolation(format!("block {}: {}", block.index, msg)));

    if block.index != prev.index + 1 {
        return fail(format!("index should be {}", prev.index + 1));
    }
    if block.timestamp < prev.timestamp {
        return fail(format!("timestamp {} precedes {}", block.timestamp, prev.timestamp));
    }
    if block.prev_hash != prev.hash {
        return fail(format!("prev_hash {} does not match tip {}", block.prev_hash, prev.hash));
    }
    if block.difficulty > MAX_DIFFICULTY {
        return fail(format!("difficulty {} out of range", block.difficulty));
    }
    let recomputed = calculate_block_hash(block);
    if recomputed != block.hash {
        return fail(format!("hash {} does not recompute ({})", block.hash, recomputed));
    }
    if !meets_difficulty(&block.hash, block.difficulty) {
        return fail(format!("hash does not meet difficulty {}", block.difficulty));
    }
    if (block.reward - block_reward(block.difficulty)).abs() > AMOUNT_EPSILON {
        return fail(format!(
            "reward {} should be {}",
            block.reward,
            block_reward(block.difficulty)
        ));
    }

    if let BlockPayload::Transactions(txs) = &block.payload {
        let coinbase = match txs.first() {
            Some(tx) if tx.is_coinbase() => tx,
            _ => return fail("first transaction is not a coinbase".to_string()),
        };
        if txs.iter().skip(1).any(|tx| tx.is_coinbase()) {
            return fail("more than one coinbase".to_string());
        }
        match coinbase.outputs.as_slice() {
            [output] if output.address == block.miner_address && output.amount + AMOUNT_EPSILON >= block.reward => {}
            _ => return fail("coinbase does not pay the block reward to the miner".to_string()),
        }
        for tx in txs {
            if calculate_id(tx) != tx.id {
                return fail(format!("transaction id {} does not recompute", tx.id));
            }
        }
    }

    Ok(())
}
