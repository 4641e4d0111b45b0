//! Bounded, prioritized pool of transactions waiting for a block

use crate::config::MempoolConfig;
use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::transaction::{transaction_size, validate_basic};
use crate::types::*;
use crate::validation::{calculate_fee, validate_amounts, UtxoView};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// An admitted transaction and its admission metadata
#[derive(Debug, Clone, PartialEq)]
pub struct MempoolEntry {
    pub transaction: Transaction,
    pub fee: Amount,
    pub fee_rate: f64,
    pub size_bytes: usize,
    pub inserted_at: u64,
    /// Priority at insertion: ⌊fee_rate · 10⁸⌋
    pub priority: i64,
    /// Addresses this entry is indexed under (payers and payees)
    pub addresses: Vec<Address>,
    seq: u64,
}

impl MempoolEntry {
    /// Priority = ⌊fee_rate · 10⁸⌋ + age_seconds
    pub fn priority_at(&self, now: u64) -> i64 {
        self.priority + now.saturating_sub(self.inserted_at) as i64
    }

    /// Time-invariant ordering key: every entry ages at the same rate, so
    /// comparing `priority - inserted_at` equals comparing `priority_at(now)`
    fn rank(&self) -> i64 {
        self.priority - self.inserted_at as i64
    }

    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.inserted_at)
    }
}

/// Typed summary of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolStats {
    pub count: usize,
    pub total_bytes: usize,
    pub total_fees: Amount,
    pub min_fee_rate: f64,
    pub max_fee_rate: f64,
    pub oldest_entry: Option<u64>,
}

/// Slot in the eviction queue (min-heap by rank)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueSlot {
    rank: i64,
    seq: u64,
    id: TxId,
}

/// Candidate in the disposable block-selection heap (max-heap)
struct Candidate<'a> {
    priority: i64,
    fee_rate: f64,
    seq: u64,
    entry: &'a MempoolEntry,
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.fee_rate.total_cmp(&other.fee_rate))
            // Earlier insertion wins ties
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct MempoolInner {
    entries: HashMap<TxId, MempoolEntry>,
    by_address: HashMap<Address, Vec<TxId>>,
    spent: HashMap<OutPoint, TxId>,
    queue: BinaryHeap<Reverse<QueueSlot>>,
    /// Sequence numbers of queue slots whose entry has been removed
    tombstones: HashSet<u64>,
    next_seq: u64,
    last_cleanup: u64,
    total_bytes: usize,
}

impl MempoolInner {
    fn insert(&mut self, mut entry: MempoolEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        let id = entry.transaction.id.clone();
        for address in &entry.addresses {
            self.by_address.entry(address.clone()).or_default().push(id.clone());
        }
        for input in &entry.transaction.inputs {
            self.spent.insert(input.outpoint(), id.clone());
        }
        self.queue.push(Reverse(QueueSlot { rank: entry.rank(), seq: entry.seq, id: id.clone() }));
        self.total_bytes += entry.size_bytes;
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &str) -> Option<MempoolEntry> {
        let entry = self.entries.remove(id)?;
        for address in &entry.addresses {
            if let Some(ids) = self.by_address.get_mut(address) {
                ids.retain(|other| other != id);
                if ids.is_empty() {
                    self.by_address.remove(address);
                }
            }
        }
        for input in &entry.transaction.inputs {
            let outpoint = input.outpoint();
            if self.spent.get(&outpoint).map(|s| s == id).unwrap_or(false) {
                self.spent.remove(&outpoint);
            }
        }
        self.tombstones.insert(entry.seq);
        self.total_bytes -= entry.size_bytes;
        self.compact_if_needed();
        Some(entry)
    }

    /// Lowest-ranked live entry, discarding tombstoned slots on the way
    fn lowest(&mut self) -> Option<(i64, TxId)> {
        while let Some(Reverse(slot)) = self.queue.peek() {
            if self.tombstones.contains(&slot.seq) {
                let seq = slot.seq;
                self.queue.pop();
                self.tombstones.remove(&seq);
                continue;
            }
            return Some((slot.rank, slot.id.clone()));
        }
        None
    }

    fn compact_if_needed(&mut self) {
        if self.tombstones.len() <= self.entries.len() {
            return;
        }
        self.queue = self
            .entries
            .values()
            .map(|e| Reverse(QueueSlot { rank: e.rank(), seq: e.seq, id: e.transaction.id.clone() }))
            .collect();
        self.tombstones.clear();
    }

    fn expire(&mut self, now: u64, max_age: u64) -> Vec<TxId> {
        let expired: Vec<TxId> = self
            .entries
            .values()
            .filter(|e| e.age(now) > max_age)
            .map(|e| e.transaction.id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        self.last_cleanup = now;
        expired
    }
}

/// Mempool behind a reader–writer lock.
///
/// Admission, removal, cleanup and block selection take the writer lock;
/// queries and stats take the reader lock.
#[derive(Debug)]
pub struct Mempool {
    config: MempoolConfig,
    inner: RwLock<MempoolInner>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(MempoolConfig::default())
    }
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        let inner = MempoolInner { last_cleanup: unix_timestamp(), ..Default::default() };
        Self { config, inner: RwLock::new(inner) }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, MempoolInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MempoolInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_transaction(&self, tx: Transaction, view: &dyn UtxoView) -> Result<()> {
        self.add_transaction_at(tx, view, unix_timestamp())
    }

    /// AddTransaction: 𝒯𝒳 × 𝒰𝒮 → {admitted, rejected}
    ///
    /// 1. Reject a known id (`DuplicateTransaction`)
    /// 2. ValidateBasic when `validate_tx` is on
    /// 3. size = estimated_tx_size(|ins|, |outs|) ≤ max_tx_size (`TooLarge`)
    /// 4. fee from the UTXO view > 0 (`NonPositiveFee`)
    /// 5. fee_rate = fee / size ≥ min_fee_rate (`FeeRateTooLow`)
    /// 6. When full, evict the lowest-priority live entry; `MempoolFull` when
    ///    there is nothing to evict
    /// 7. Insert into the id map, address index and priority queue
    /// 8. Run age-based cleanup if `cleanup_interval` has elapsed
    pub fn add_transaction_at(&self, tx: Transaction, view: &dyn UtxoView, now: u64) -> Result<()> {
        let mut inner = self.write();

        // 1. Duplicate
        if inner.entries.contains_key(&tx.id) {
            return Err(LedgerError::DuplicateTransaction(tx.id));
        }

        // 2. Structure
        if self.config.validate_tx {
            validate_basic(&tx)?;
        }
        if tx.is_coinbase() {
            return Err(LedgerError::TransactionValidation(
                "coinbase transactions are not accepted into the mempool".to_string(),
            ));
        }

        // 3. Size
        let size = transaction_size(&tx);
        if size > self.config.max_tx_size {
            return Err(LedgerError::TooLarge { size, max: self.config.max_tx_size });
        }

        // Inputs already claimed by another pooled transaction
        for input in &tx.inputs {
            if let Some(other) = inner.spent.get(&input.outpoint()) {
                return Err(LedgerError::TransactionValidation(format!(
                    "{} already spent by pooled transaction {}",
                    input.outpoint(),
                    other
                )));
            }
        }

        // 4. Fee
        let fee = calculate_fee(&tx, view)?;
        if fee <= 0.0 || !fee.is_finite() {
            return Err(LedgerError::NonPositiveFee(fee));
        }

        // 5. Fee rate
        let fee_rate = fee / size as f64;
        if fee_rate < self.config.min_fee_rate {
            return Err(LedgerError::FeeRateTooLow { rate: fee_rate, min: self.config.min_fee_rate });
        }

        let mut addresses: Vec<Address> = Vec::new();
        for input in &tx.inputs {
            if let Some(prev) = view.get_output(&input.outpoint()) {
                addresses.push(prev.address);
            }
        }
        addresses.extend(tx.outputs.iter().map(|o| o.address.clone()));
        let mut seen = HashSet::new();
        addresses.retain(|a| seen.insert(a.clone()));

        let entry = MempoolEntry {
            transaction: tx,
            fee,
            fee_rate,
            size_bytes: size,
            inserted_at: now,
            priority: (fee_rate * PRIORITY_FEE_SCALE).floor() as i64,
            addresses,
            seq: 0,
        };

        // 6. Capacity
        if inner.entries.len() >= self.config.max_size {
            match inner.lowest() {
                Some((_, victim)) => {
                    inner.remove(&victim);
                    debug!(evicted = %victim, admitted = %entry.transaction.id, "mempool eviction");
                }
                None => {
                    return Err(LedgerError::MempoolFull(format!(
                        "capacity {} leaves no entry to evict",
                        self.config.max_size
                    )));
                }
            }
        }

        // 7. Insert
        debug!(tx_id = %entry.transaction.id, fee, fee_rate, size, "transaction admitted to mempool");
        inner.insert(entry);

        // 8. Age-based cleanup
        if now.saturating_sub(inner.last_cleanup) > self.config.cleanup_interval {
            let expired = inner.expire(now, self.config.max_age);
            if !expired.is_empty() {
                debug!(count = expired.len(), "expired mempool entries dropped");
            }
        }

        Ok(())
    }

    pub fn get_transactions_for_block(&self, max_size_bytes: usize, max_count: usize) -> Vec<Transaction> {
        self.get_transactions_for_block_at(max_size_bytes, max_count, unix_timestamp())
    }

    /// GetTransactionsForBlock: highest priority first.
    ///
    /// Entries that would overflow `max_size_bytes` are skipped; selection
    /// stops after `max_count` transactions (0 = unlimited). The pool itself
    /// is left untouched; committed transactions are removed afterwards with
    /// [`remove_transactions`](Self::remove_transactions).
    pub fn get_transactions_for_block_at(
        &self,
        max_size_bytes: usize,
        max_count: usize,
        now: u64,
    ) -> Vec<Transaction> {
        let inner = self.write();
        let mut heap: BinaryHeap<Candidate<'_>> = inner
            .entries
            .values()
            .map(|entry| Candidate {
                priority: entry.priority_at(now),
                fee_rate: entry.fee_rate,
                seq: entry.seq,
                entry,
            })
            .collect();

        let mut selected = Vec::new();
        let mut used_bytes = 0usize;
        while let Some(candidate) = heap.pop() {
            if max_count > 0 && selected.len() >= max_count {
                break;
            }
            let size = candidate.entry.size_bytes;
            if used_bytes.saturating_add(size) > max_size_bytes {
                continue;
            }
            used_bytes += size;
            selected.push(candidate.entry.transaction.clone());
        }
        selected
    }

    pub fn remove_transaction(&self, id: &str) -> Option<Transaction> {
        self.write().remove(id).map(|e| e.transaction)
    }

    /// Remove committed transactions; unknown ids are ignored
    pub fn remove_transactions(&self, ids: &[TxId]) -> usize {
        let mut inner = self.write();
        ids.iter().filter(|id| inner.remove(id).is_some()).count()
    }

    /// Drop every entry that no longer validates against `view` (inputs
    /// spent elsewhere, outputs exceeding inputs). Returns the removed ids.
    pub fn validate_and_remove_invalid(&self, view: &dyn UtxoView) -> Vec<TxId> {
        let mut inner = self.write();
        let invalid: Vec<TxId> = inner
            .entries
            .values()
            .filter(|e| {
                let tx = &e.transaction;
                (self.config.validate_tx && validate_basic(tx).is_err())
                    || validate_amounts(tx, view).is_err()
            })
            .map(|e| e.transaction.id.clone())
            .collect();
        for id in &invalid {
            inner.remove(id);
        }
        if !invalid.is_empty() {
            warn!(count = invalid.len(), "removed invalid transactions from mempool");
        }
        invalid
    }

    /// Run age-based cleanup if `cleanup_interval` has elapsed
    pub fn tick(&self) -> usize {
        let now = unix_timestamp();
        let mut inner = self.write();
        if now.saturating_sub(inner.last_cleanup) <= self.config.cleanup_interval {
            return 0;
        }
        inner.expire(now, self.config.max_age).len()
    }

    /// Drop every entry older than `max_age`, unconditionally
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(unix_timestamp())
    }

    pub fn cleanup_at(&self, now: u64) -> usize {
        let expired = self.write().expire(now, self.config.max_age);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired mempool entries dropped");
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.write();
        let last_cleanup = inner.last_cleanup;
        *inner = MempoolInner { last_cleanup, ..Default::default() };
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<MempoolEntry> {
        self.read().entries.get(id).cloned()
    }

    /// Transactions paying to or spending from `address`
    pub fn get_by_address(&self, address: &str) -> Vec<Transaction> {
        let inner = self.read();
        inner
            .by_address
            .get(address)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.entries.get(id))
                    .map(|e| e.transaction.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MempoolStats {
        let inner = self.read();
        let rates = || inner.entries.values().map(|e| e.fee_rate);
        MempoolStats {
            count: inner.entries.len(),
            total_bytes: inner.total_bytes,
            total_fees: inner.entries.values().map(|e| e.fee).sum(),
            min_fee_rate: rates().reduce(f64::min).unwrap_or(0.0),
            max_fee_rate: rates().reduce(f64::max).unwrap_or(0.0),
            oldest_entry: inner.entries.values().map(|e| e.inserted_at).min(),
        }
    }
}

/// Owned background thread that runs age-based cleanup every
/// `cleanup_interval`. Dropping the handle (or calling [`stop`](Self::stop))
/// cancels it and joins the thread.
pub struct CleanupWorker {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupWorker {
    pub fn spawn(mempool: Arc<Mempool>) -> Result<Self> {
        let period = mempool.config().cleanup_period();
        Self::spawn_with_period(mempool, period)
    }

    pub fn spawn_with_period(mempool: Arc<Mempool>, period: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("mempool-cleanup".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        mempool.cleanup();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { stop: Some(stop), handle: Some(handle) })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CleanupWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
