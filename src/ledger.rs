//! Ledger facade: mempool admission, mining, UTXO application and persistence

use crate::block::{Block, BlockPayload};
use crate::chain::{replay_transactions, Blockchain};
use crate::config::LedgerConfig;
use crate::crypto::validate_address;
use crate::error::{LedgerError, Result};
use crate::mempool::Mempool;
use crate::mining::{create_block_template, create_coinbase_transaction, mine_block, next_block_timestamp, CancellationToken, MiningLimits};
use crate::store::{ChainStore, SledStore};
use crate::types::*;
use crate::utxo::{UtxoSet, UtxoUndo};
use crate::validation::validate_structure;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Single-node ledger: chain, UTXO set, mempool and an optional durable store
pub struct Ledger {
    config: LedgerConfig,
    chain: Blockchain,
    utxo: UtxoSet,
    mempool: Arc<Mempool>,
    store: Option<Box<dyn ChainStore + Send + Sync>>,
}

impl Ledger {
    /// In-memory ledger starting from genesis; `store_path` is ignored
    pub fn new(config: LedgerConfig) -> Self {
        let mempool = Arc::new(Mempool::new(config.mempool.clone()));
        Self { config, chain: Blockchain::new(), utxo: UtxoSet::new(), mempool, store: None }
    }

    /// Open the ledger described by `config`, loading the chain from
    /// `store_path` when one is configured
    pub fn open(config: LedgerConfig) -> Result<Self> {
        match config.store_path.clone() {
            Some(path) => {
                let store = SledStore::open(&path)?;
                Self::with_store(config, Box::new(store))
            }
            None => Ok(Self::new(config)),
        }
    }

    /// Load the chain from `store`, validate it and rebuild the UTXO set by
    /// replaying every block. An empty store starts a fresh chain at genesis.
    pub fn with_store(config: LedgerConfig, store: Box<dyn ChainStore + Send + Sync>) -> Result<Self> {
        let chain = match store.load_blockchain() {
            Ok(blocks) => Blockchain::from_blocks(blocks)?,
            Err(LedgerError::NotInitialized) => {
                info!("store not initialized, starting from genesis");
                Blockchain::new()
            }
            Err(e) => return Err(e),
        };
        let mut ledger = Self::new(config);
        ledger.chain = chain;
        ledger.replay()?;
        ledger.store = Some(store);
        info!(length = ledger.chain.len(), utxos = ledger.utxo.count(), "ledger opened");
        Ok(ledger)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn utxo(&self) -> &UtxoSet {
        &self.utxo
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Shared handle for a [`crate::mempool::CleanupWorker`]
    pub fn mempool_handle(&self) -> Arc<Mempool> {
        Arc::clone(&self.mempool)
    }

    pub fn balance(&self, address: &str) -> Amount {
        self.utxo.balance(address)
    }

    /// Fully validate `tx` against the live UTXO set (signatures included),
    /// then hand it to mempool admission
    pub fn submit_transaction(&self, tx: Transaction) -> Result<()> {
        validate_structure(&tx, &self.utxo)?;
        let id = tx.id.clone();
        self.mempool.add_transaction(tx, &self.utxo)?;
        debug!(tx_id = %id, pool = self.mempool.len(), "transaction submitted");
        Ok(())
    }

    /// Append a data block paying the block reward to `miner_address`
    pub fn mine_data_block(&self, data: &str, miner_address: &str, cancel: Option<&CancellationToken>) -> Result<Block> {
        if !validate_address(miner_address) {
            return Err(LedgerError::InvalidAddress(miner_address.to_string()));
        }
        self.chain.append_block(
            BlockPayload::Data(data.to_string()),
            miner_address,
            self.config.mining.difficulty,
            &self.limits(cancel),
        )
    }

    /// MineBlock: mempool → block → chain → UTXO set
    ///
    /// 1. Draw candidates from the mempool, highest priority first
    /// 2. Re-validate each one against a scratch copy of the UTXO set with
    ///    the previously accepted candidates applied; drop failures
    /// 3. Coinbase pays BlockReward(difficulty) + collected fees
    /// 4. Solve proof of work with no lock held
    /// 5. Commit to the chain and apply to the UTXO set atomically
    /// 6. Remove mined and dropped transactions from the mempool
    pub fn mine_block(&self, miner_address: &str, cancel: Option<&CancellationToken>) -> Result<Block> {
        if !validate_address(miner_address) {
            return Err(LedgerError::InvalidAddress(miner_address.to_string()));
        }
        let mining = &self.config.mining;
        let tip = self.chain.tip();
        let now = unix_timestamp();
        let timestamp = next_block_timestamp(&tip, now);

        let candidates = self
            .mempool
            .get_transactions_for_block(mining.max_block_bytes, mining.max_block_transactions);

        let scratch = self.utxo.clone();
        let mut included = Vec::with_capacity(candidates.len());
        let mut dropped = Vec::new();
        let mut fees = 0.0;
        for tx in candidates {
            match validate_structure(&tx, &scratch).and_then(|_| scratch.process_transaction(&tx)) {
                Ok(undo) => {
                    fees += undo.fee;
                    included.push(tx);
                }
                Err(e) => {
                    warn!(tx_id = %tx.id, error = %e, "dropping transaction that no longer validates");
                    dropped.push(tx.id);
                }
            }
        }

        let coinbase = create_coinbase_transaction(miner_address, mining.difficulty, fees, timestamp);
        let mut transactions = Vec::with_capacity(included.len() + 1);
        transactions.push(coinbase);
        transactions.extend(included);

        let template = create_block_template(
            &tip,
            BlockPayload::Transactions(transactions),
            miner_address,
            mining.difficulty,
            now,
        )?;
        let block = mine_block(template, &self.limits(cancel))?;

        self.chain.commit_block_with(block.clone(), |b| self.apply_block(b))?;

        let mut finished: Vec<TxId> = block.transactions().iter().skip(1).map(|tx| tx.id.clone()).collect();
        finished.extend(dropped);
        self.mempool.remove_transactions(&finished);
        self.mempool.validate_and_remove_invalid(&self.utxo);

        info!(index = block.index, txs = block.tx_count(), fees, "mined block");
        Ok(block)
    }

    /// Persist the chain to the configured store; a no-op without one
    pub fn save(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.save_blockchain(&self.chain.blocks()),
            None => Ok(()),
        }
    }

    /// Save and flush the store
    pub fn close(self) -> Result<()> {
        self.save()?;
        if let Some(store) = &self.store {
            store.close()?;
        }
        Ok(())
    }

    fn limits<'a>(&self, cancel: Option<&'a CancellationToken>) -> MiningLimits<'a> {
        let max_nonce = self.config.mining.max_nonce;
        MiningLimits {
            max_nonce: (max_nonce != u64::MAX).then_some(max_nonce),
            deadline: None,
            cancel,
        }
    }

    /// Apply every transaction of `block` to the live UTXO set, or none
    fn apply_block(&self, block: &Block) -> Result<()> {
        let mut applied: Vec<(&Transaction, UtxoUndo)> = Vec::new();
        for tx in block.transactions() {
            match self.utxo.process_transaction(tx) {
                Ok(undo) => applied.push((tx, undo)),
                Err(e) => {
                    for (done, undo) in applied.iter().rev() {
                        self.utxo.revert_transaction(done, undo)?;
                    }
                    return Err(LedgerError::InvariantViolation(format!(
                        "block {} transaction {} cannot be applied: {}",
                        block.index, tx.id, e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rebuild the UTXO set from the chain, validating every non-coinbase
    /// transaction against the state before it
    fn replay(&self) -> Result<()> {
        self.utxo.clear();
        replay_transactions(&self.chain.blocks(), &self.utxo)
    }
}
