//! # UTXO Ledger
//!
//! Single-node UTXO ledger with P-256 ECDSA ownership, a priority mempool,
//! proof-of-work mining, an encrypted wallet and a sled-backed chain store.
//!
//! ## Architecture
//!
//! The crate is layered bottom-up:
//! - Primitives: hashing, keys and addresses (`crypto`), value types (`types`)
//! - Transactions: construction, signing and validation against a UTXO view
//! - State: the concurrent UTXO set and the mempool
//! - Chain: blocks, proof of work, mining and the append-only blockchain
//! - Edges: the wallet, the durable store and the [`Ledger`] facade
//!
//! ## Design Principles
//!
//! 1. **Deterministic hashing**: ids and block hashes depend only on content
//! 2. **Validate before mutate**: state changes only after every check passes
//! 3. **Atomic commits**: a block and its UTXO effects become visible together
//!
//! ## Usage
//!
//! ```rust
//! use utxo_ledger::{KeyPair, Ledger, LedgerConfig};
//!
//! let mut config = LedgerConfig::default();
//! config.mining.difficulty = 1;
//! let ledger = Ledger::new(config);
//!
//! let miner = KeyPair::generate();
//! let block = ledger.mine_block(miner.address(), None).unwrap();
//! assert!(block.hash.starts_with('0'));
//! assert_eq!(ledger.balance(miner.address()), 55.0);
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod config;
pub mod crypto;
pub mod transaction;
pub mod validation;
pub mod utxo;
pub mod mempool;
pub mod pow;
pub mod block;
pub mod mining;
pub mod economic;
pub mod chain;
pub mod wallet;
pub mod store;
pub mod ledger;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{ErrorKind, LedgerError, Result};
pub use config::{LedgerConfig, MempoolConfig, MiningConfig};
pub use crypto::{derive_address, generate_key_pair, validate_address, KeyPair};
pub use utxo::UtxoSet;
pub use mempool::{CleanupWorker, Mempool};
pub use block::{Block, BlockPayload};
pub use mining::CancellationToken;
pub use chain::Blockchain;
pub use wallet::Wallet;
pub use store::{ChainStore, SledStore};
pub use ledger::Ledger;
