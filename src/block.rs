//! Blocks: payload, hashing, merkle root and genesis

use crate::constants::*;
use crate::crypto::sha256;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// What a block carries: either a free-form data string or a list of
/// transactions whose first entry is the coinbase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPayload {
    Data(String),
    Transactions(Vec<Transaction>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: BlockPayload,
    pub prev_hash: String,
    pub hash: String,
    pub nonce: u64,
    pub difficulty: u32,
    #[serde(default)]
    pub miner_address: Address,
    #[serde(default)]
    pub reward: Amount,
}

impl Block {
    /// Genesis: index 0, empty `prev_hash`, fixed data, no proof of work
    pub fn genesis() -> Self {
        let mut block = Block {
            index: 0,
            timestamp: GENESIS_TIMESTAMP,
            payload: BlockPayload::Data(GENESIS_DATA.to_string()),
            prev_hash: String::new(),
            hash: String::new(),
            nonce: 0,
            difficulty: 0,
            miner_address: String::new(),
            reward: 0.0,
        };
        block.hash = calculate_block_hash(&block);
        block
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    pub fn data(&self) -> Option<&str> {
        match &self.payload {
            BlockPayload::Data(data) => Some(data),
            BlockPayload::Transactions(_) => None,
        }
    }

    /// Transactions carried by the block (empty for data blocks)
    pub fn transactions(&self) -> &[Transaction] {
        match &self.payload {
            BlockPayload::Data(_) => &[],
            BlockPayload::Transactions(txs) => txs,
        }
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions().first().filter(|tx| tx.is_coinbase())
    }

    pub fn tx_count(&self) -> usize {
        self.transactions().len()
    }

    /// Block hash with the given nonce, other fields unchanged
    pub fn hash_with_nonce(&self, nonce: u64) -> String {
        hash_fields(self, &payload_digest(&self.payload), nonce)
    }
}

/// CalculateBlockHash: ℬ → hex
///
/// hex(SHA-256(index ‖ timestamp ‖ data_or_tx_hash ‖ prev_hash ‖ nonce ‖ difficulty))
/// with the integers in decimal. For transaction blocks `data_or_tx_hash` is
/// the hex merkle root of the transaction ids. A non-empty `miner_address` is
/// appended last so the miner credit of a data block is covered by the hash.
pub fn calculate_block_hash(block: &Block) -> String {
    block.hash_with_nonce(block.nonce)
}

/// Digest of the payload as it enters the block hash; computed once per
/// mining run since it does not depend on the nonce
pub fn payload_digest(payload: &BlockPayload) -> String {
    match payload {
        BlockPayload::Data(data) => data.clone(),
        BlockPayload::Transactions(txs) => hex::encode(calculate_merkle_root(txs)),
    }
}

pub(crate) fn hash_fields(block: &Block, payload_digest: &str, nonce: u64) -> String {
    let preimage = format!(
        "{}{}{}{}{}{}{}",
        block.index, block.timestamp, payload_digest, block.prev_hash, nonce, block.difficulty, block.miner_address
    );
    hex::encode(sha256(preimage.as_bytes()))
}

/// Merkle root over transaction ids.
///
/// Leaves are SHA-256 of each id; each level hashes adjacent pairs, an odd
/// last node is paired with itself. An empty list hashes to SHA-256("").
pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash {
    if transactions.is_empty() {
        return sha256(&[]);
    }

    let mut hashes: Vec<Hash> = transactions.iter().map(|tx| sha256(tx.id.as_bytes())).collect();

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));
        for chunk in hashes.chunks(2) {
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(&chunk[0]);
            combined.extend_from_slice(right);
            next_level.push(sha256(&combined));
        }
        hashes = next_level;
    }

    hashes[0]
}
