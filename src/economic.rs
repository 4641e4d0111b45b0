//! Block rewards, fees and issued supply

use crate::block::Block;
use crate::constants::*;
use crate::error::Result;
use crate::types::*;
use crate::validation::{calculate_fee, UtxoView};
use std::collections::HashMap;

/// BlockReward: ℕ → ℝ
///
/// reward = BASE_BLOCK_REWARD + REWARD_PER_DIFFICULTY × d
///
/// There is no halving schedule; the reward depends on difficulty alone.
pub fn block_reward(difficulty: u32) -> Amount {
    BASE_BLOCK_REWARD + REWARD_PER_DIFFICULTY * difficulty as f64
}

/// Sum of fees paid by `txs` against `view`. Coinbase transactions pay none.
pub fn total_fees(txs: &[Transaction], view: &dyn UtxoView) -> Result<Amount> {
    let mut total = 0.0;
    for tx in txs {
        total += calculate_fee(tx, view)?;
    }
    Ok(total)
}

/// Reward recorded on every block of the chain, genesis included (0)
pub fn issued_supply(blocks: &[Block]) -> Amount {
    blocks.iter().map(|b| b.reward).sum()
}

/// Rewards credited per miner address. Blocks without a miner (genesis)
/// are skipped.
pub fn miner_rewards(blocks: &[Block]) -> HashMap<Address, Amount> {
    let mut rewards = HashMap::new();
    for block in blocks.iter().filter(|b| !b.miner_address.is_empty()) {
        *rewards.entry(block.miner_address.clone()).or_insert(0.0) += block.reward;
    }
    rewards
}

/// Coinbase amount for a block: reward plus collected fees
pub fn coinbase_amount(difficulty: u32, fees: Amount) -> Amount {
    block_reward(difficulty) + fees
}
