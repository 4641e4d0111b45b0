//! The authoritative set of unspent transaction outputs

use crate::error::{LedgerError, Result};
use crate::transaction::validate_basic;
use crate::types::*;
use crate::validation::{validate_amounts, validate_unique_inputs, UtxoView};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// What [`UtxoSet::process_transaction`] consumed, enough to undo it exactly
#[derive(Debug, Clone, PartialEq)]
pub struct UtxoUndo {
    pub tx_id: TxId,
    pub spent: Vec<(OutPoint, TxOutput)>,
    pub fee: Amount,
}

/// Typed summary of the set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoStats {
    pub count: usize,
    pub total_value: Amount,
    pub address_count: usize,
}

#[derive(Debug, Clone, Default)]
struct UtxoInner {
    utxos: HashMap<OutPoint, TxOutput>,
    by_address: HashMap<Address, BTreeSet<OutPoint>>,
    total_value: Amount,
}

impl UtxoInner {
    fn insert(&mut self, outpoint: OutPoint, mut output: TxOutput) -> Result<()> {
        if self.utxos.contains_key(&outpoint) {
            return Err(LedgerError::DuplicateUtxo(outpoint.to_string()));
        }
        if !output.amount.is_finite() || output.amount <= 0.0 {
            return Err(LedgerError::BadInput(format!(
                "UTXO {} has non-positive amount {}",
                outpoint, output.amount
            )));
        }
        output.tx_id = outpoint.tx_id.clone();
        output.output_index = outpoint.index;
        self.total_value += output.amount;
        self.by_address
            .entry(output.address.clone())
            .or_default()
            .insert(outpoint.clone());
        self.utxos.insert(outpoint, output);
        Ok(())
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Result<TxOutput> {
        let output = self
            .utxos
            .remove(outpoint)
            .ok_or_else(|| LedgerError::UtxoNotFound(outpoint.to_string()))?;
        self.total_value -= output.amount;
        if let Some(set) = self.by_address.get_mut(&output.address) {
            set.remove(outpoint);
            if set.is_empty() {
                self.by_address.remove(&output.address);
            }
        }
        Ok(output)
    }

    fn outputs_of(&self, address: &str) -> Vec<TxOutput> {
        self.by_address
            .get(address)
            .map(|set| set.iter().filter_map(|op| self.utxos.get(op).cloned()).collect())
            .unwrap_or_default()
    }
}

impl UtxoView for UtxoInner {
    fn get_output(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        self.utxos.get(outpoint).cloned()
    }
}

/// Mapping `(tx_id, output_index) → output` behind a reader–writer lock.
///
/// Every mutation takes the writer lock for its whole duration, so readers see
/// either the state before or after it. `count` and `total_value` are kept
/// incrementally.
#[derive(Debug, Default)]
pub struct UtxoSet {
    inner: RwLock<UtxoInner>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, UtxoInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UtxoInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add: fails with `DuplicateUtxo` if the key is present
    pub fn add(&self, tx_id: &str, index: u32, output: TxOutput) -> Result<()> {
        let outpoint = OutPoint::new(tx_id, index);
        self.write().insert(outpoint.clone(), output)?;
        debug!(utxo = %outpoint, "utxo added");
        Ok(())
    }

    /// AddBatch: all outputs are inserted, or none are
    pub fn add_batch(&self, outputs: Vec<TxOutput>) -> Result<usize> {
        let mut inner = self.write();
        let mut seen = HashSet::new();
        for output in &outputs {
            let outpoint = output.outpoint();
            if inner.utxos.contains_key(&outpoint) || !seen.insert(outpoint.clone()) {
                return Err(LedgerError::DuplicateUtxo(outpoint.to_string()));
            }
            if !output.amount.is_finite() || output.amount <= 0.0 {
                return Err(LedgerError::BadInput(format!(
                    "UTXO {} has non-positive amount {}",
                    outpoint, output.amount
                )));
            }
        }
        let count = outputs.len();
        for output in outputs {
            inner.insert(output.outpoint(), output)?;
        }
        debug!(count, "utxo batch added");
        Ok(count)
    }

    /// Spend: fails with `UtxoNotFound` if absent
    pub fn spend(&self, tx_id: &str, index: u32) -> Result<TxOutput> {
        let outpoint = OutPoint::new(tx_id, index);
        let output = self.write().remove(&outpoint)?;
        debug!(utxo = %outpoint, "utxo spent");
        Ok(output)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        self.read().utxos.get(outpoint).cloned()
    }

    pub fn exists(&self, outpoint: &OutPoint) -> bool {
        self.read().utxos.contains_key(outpoint)
    }

    /// All outputs payable to `address`, ordered by outpoint
    pub fn get_by_address(&self, address: &str) -> Vec<TxOutput> {
        self.read().outputs_of(address)
    }

    /// All outputs worth at least `min_amount`, smallest first
    pub fn get_by_amount(&self, min_amount: Amount) -> Vec<TxOutput> {
        self.get_by_range(min_amount, f64::INFINITY)
    }

    /// All outputs with `min ≤ amount ≤ max`, smallest first
    pub fn get_by_range(&self, min: Amount, max: Amount) -> Vec<TxOutput> {
        let inner = self.read();
        let mut outputs: Vec<TxOutput> = inner
            .utxos
            .values()
            .filter(|o| o.amount >= min && o.amount <= max)
            .cloned()
            .collect();
        sort_by_amount(&mut outputs);
        outputs
    }

    pub fn balance(&self, address: &str) -> Amount {
        self.read().outputs_of(address).iter().map(|o| o.amount).sum()
    }

    /// SelectForAmount: outputs of `address` covering `target`.
    ///
    /// 1. target ≤ 0 → `InvalidTarget`
    /// 2. balance(address) < target → `InsufficientFunds`
    /// 3. If some single output covers the target, the smallest such output
    /// 4. Otherwise largest-first until the target is covered
    ///
    /// Ties are broken by outpoint, so the choice is deterministic.
    pub fn select_for_amount(&self, target: Amount, address: &str) -> Result<Vec<TxOutput>> {
        if !target.is_finite() || target <= 0.0 {
            return Err(LedgerError::InvalidTarget(format!("target {} must be positive", target)));
        }

        let mut candidates = self.read().outputs_of(address);
        let available: Amount = candidates.iter().map(|o| o.amount).sum();
        if available < target {
            return Err(LedgerError::InsufficientFunds(format!(
                "{} holds {}, needs {}",
                address, available, target
            )));
        }

        sort_by_amount(&mut candidates);
        if let Some(single) = candidates.iter().find(|o| o.amount >= target) {
            return Ok(vec![single.clone()]);
        }

        let mut selected = Vec::new();
        let mut total = 0.0;
        for output in candidates.into_iter().rev() {
            total += output.amount;
            selected.push(output);
            if total >= target {
                break;
            }
        }
        Ok(selected)
    }

    /// ProcessTransaction: validate against the current set, then remove every
    /// referenced output and insert every new one. On failure nothing changes.
    ///
    /// Checks applied here: basic structure, no repeated inputs, input
    /// existence and value conservation. Signatures are the caller's concern
    /// (see [`crate::validation::validate_structure`]).
    pub fn process_transaction(&self, tx: &Transaction) -> Result<UtxoUndo> {
        let mut inner = self.write();

        validate_basic(tx)?;
        validate_unique_inputs(tx)?;
        let fee = validate_amounts(tx, &*inner)?;
        for (i, _) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(tx.id.clone(), i as u32);
            if inner.utxos.contains_key(&outpoint) {
                return Err(LedgerError::DuplicateUtxo(outpoint.to_string()));
            }
        }

        let mut spent = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let outpoint = input.outpoint();
            let output = inner.remove(&outpoint)?;
            spent.push((outpoint, output));
        }
        for (i, output) in tx.outputs.iter().enumerate() {
            inner.insert(OutPoint::new(tx.id.clone(), i as u32), output.clone())?;
        }

        debug!(tx_id = %tx.id, spent = spent.len(), created = tx.outputs.len(), fee, "transaction applied to utxo set");
        Ok(UtxoUndo { tx_id: tx.id.clone(), spent, fee })
    }

    /// Undo a previous [`process_transaction`](Self::process_transaction):
    /// the transaction's outputs are removed and the spent outputs restored.
    pub fn revert_transaction(&self, tx: &Transaction, undo: &UtxoUndo) -> Result<()> {
        if undo.tx_id != tx.id {
            return Err(LedgerError::BadInput(format!(
                "undo record belongs to {}, not {}",
                undo.tx_id, tx.id
            )));
        }
        let mut inner = self.write();
        for i in 0..tx.outputs.len() {
            let outpoint = OutPoint::new(tx.id.clone(), i as u32);
            if !inner.utxos.contains_key(&outpoint) {
                return Err(LedgerError::UtxoNotFound(outpoint.to_string()));
            }
        }
        for (outpoint, _) in &undo.spent {
            if inner.utxos.contains_key(outpoint) {
                return Err(LedgerError::DuplicateUtxo(outpoint.to_string()));
            }
        }

        for i in 0..tx.outputs.len() {
            inner.remove(&OutPoint::new(tx.id.clone(), i as u32))?;
        }
        for (outpoint, output) in &undo.spent {
            inner.insert(outpoint.clone(), output.clone())?;
        }
        debug!(tx_id = %tx.id, "transaction reverted from utxo set");
        Ok(())
    }

    /// PruneSpent: drop the listed outpoints if present, returning how many
    /// were removed
    pub fn prune_spent(&self, spent: &[OutPoint]) -> usize {
        let mut inner = self.write();
        let removed = spent.iter().filter(|op| inner.remove(op).is_ok()).count();
        debug!(removed, "pruned spent utxos");
        removed
    }

    pub fn clear(&self) {
        *self.write() = UtxoInner::default();
    }

    pub fn count(&self) -> usize {
        self.read().utxos.len()
    }

    pub fn total_value(&self) -> Amount {
        self.read().total_value
    }

    pub fn stats(&self) -> UtxoStats {
        let inner = self.read();
        UtxoStats {
            count: inner.utxos.len(),
            total_value: inner.total_value,
            address_count: inner.by_address.len(),
        }
    }

    /// Point-in-time copy of the whole set
    pub fn snapshot(&self) -> HashMap<OutPoint, TxOutput> {
        self.read().utxos.clone()
    }
}

impl Clone for UtxoSet {
    /// Deep copy: later mutations to either side do not affect the other
    fn clone(&self) -> Self {
        Self { inner: RwLock::new(self.read().clone()) }
    }
}

impl UtxoView for UtxoSet {
    fn get_output(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        self.get(outpoint)
    }
}

fn sort_by_amount(outputs: &mut [TxOutput]) {
    outputs.sort_by(|a, b| {
        a.amount
            .total_cmp(&b.amount)
            .then_with(|| a.tx_id.cmp(&b.tx_id))
            .then_with(|| a.output_index.cmp(&b.output_index))
    });
}
