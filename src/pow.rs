//! Proof of work: leading zero hex nibbles of the block hash

use crate::block::{calculate_block_hash, Block};
use crate::constants::*;
use crate::error::{LedgerError, Result};

/// Number of leading `'0'` characters in the hex form of `hash`
pub fn leading_zero_nibbles(hash: &str) -> u32 {
    hash.chars().take_while(|c| *c == '0').count() as u32
}

/// MeetsDifficulty: hex string × ℕ → {true, false}
///
/// True iff the first `difficulty` characters of `hash` are `'0'`.
/// Difficulty 0 accepts every hash.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    if difficulty == 0 {
        return true;
    }
    hash.len() >= difficulty as usize && leading_zero_nibbles(hash) >= difficulty
}

/// Difficulty must fit inside a 64-nibble SHA-256 hash
pub fn validate_difficulty(difficulty: u32) -> Result<()> {
    if difficulty > MAX_DIFFICULTY {
        return Err(LedgerError::BadInput(format!(
            "difficulty {} exceeds {}",
            difficulty, MAX_DIFFICULTY
        )));
    }
    Ok(())
}

/// CheckProofOfWork: ℬ → {true, false}
///
/// 1. Recompute the hash from the block's fields
/// 2. It must equal the recorded hash
/// 3. It must carry `block.difficulty` leading zero nibbles
pub fn check_proof_of_work(block: &Block) -> bool {
    let recomputed = calculate_block_hash(block);
    recomputed == block.hash && meets_difficulty(&recomputed, block.difficulty)
}

/// Expected number of hash attempts for a difficulty (16^d)
pub fn expected_attempts(difficulty: u32) -> f64 {
    16f64.powi(difficulty as i32)
}
