//! Transaction validation against a view of the UTXO set

use crate::constants::*;
use crate::crypto::validate_address;
use crate::error::{LedgerError, Result};
use crate::transaction::{validate_basic, verify_input};
use crate::types::*;
use std::collections::{HashMap, HashSet};

/// Read access to unspent outputs.
///
/// Implemented by the live [`crate::utxo::UtxoSet`] and by plain snapshots so
/// validation can run against either.
pub trait UtxoView {
    fn get_output(&self, outpoint: &OutPoint) -> Option<TxOutput>;
}

impl UtxoView for HashMap<OutPoint, TxOutput> {
    fn get_output(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        self.get(outpoint).cloned()
    }
}

impl<V: UtxoView + ?Sized> UtxoView for &V {
    fn get_output(&self, outpoint: &OutPoint) -> Option<TxOutput> {
        (**self).get_output(outpoint)
    }
}

/// Resolve the outputs spent by `tx`, in input order
pub fn referenced_outputs(tx: &Transaction, view: &dyn UtxoView) -> Result<Vec<TxOutput>> {
    tx.inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let outpoint = input.outpoint();
            view.get_output(&outpoint).ok_or_else(|| {
                LedgerError::UtxoNotFound(format!("input {} references {}", i, outpoint))
            })
        })
        .collect()
}

/// Fee = Σ referenced input amounts − Σ output amounts (0 for coinbase)
pub fn calculate_fee(tx: &Transaction, view: &dyn UtxoView) -> Result<Amount> {
    if tx.is_coinbase() {
        return Ok(0.0);
    }
    let total_in: Amount = referenced_outputs(tx, view)?.iter().map(|o| o.amount).sum();
    Ok(total_in - tx.total_output())
}

/// ValidateAmounts: 𝒯𝒳 × 𝒰𝒮 → ℝ
///
/// 1. Coinbase: exactly one output with finite amount > 0, fee 0
/// 2. Otherwise ∀o ∈ outs: o.amount finite and > 0
/// 3. Σ outs ≤ Σ us(i.prevout).amount
/// 4. Return the fee Σ ins − Σ outs (≥ 0)
pub fn validate_amounts(tx: &Transaction, view: &dyn UtxoView) -> Result<Amount> {
    if tx.is_coinbase() {
        if tx.outputs.len() != 1 {
            return Err(LedgerError::TransactionValidation(format!(
                "coinbase must have exactly one output, has {}",
                tx.outputs.len()
            )));
        }
        let amount = tx.outputs[0].amount;
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LedgerError::TransactionValidation(format!(
                "coinbase amount {} is not positive",
                amount
            )));
        }
        return Ok(0.0);
    }

    for (i, output) in tx.outputs.iter().enumerate() {
        if !output.amount.is_finite() || output.amount <= 0.0 {
            return Err(LedgerError::TransactionValidation(format!(
                "output {} amount {} is not positive",
                i, output.amount
            )));
        }
    }

    let total_in: Amount = referenced_outputs(tx, view)?.iter().map(|o| o.amount).sum();
    let total_out = tx.total_output();
    if total_out > total_in + AMOUNT_EPSILON {
        return Err(LedgerError::InsufficientFunds(format!(
            "outputs {} exceed inputs {}",
            total_out, total_in
        )));
    }

    // Differences inside the tolerance are rounding, not negative fees
    Ok((total_in - total_out).max(0.0))
}

/// Verify every input's signature against the outputs it spends
pub fn validate_signatures(tx: &Transaction, referenced: &[TxOutput]) -> Result<()> {
    for index in 0..tx.inputs.len() {
        verify_input(tx, index, referenced)?;
    }
    Ok(())
}

/// Every output must carry a well-formed checksummed address
pub fn validate_addresses(tx: &Transaction) -> Result<()> {
    for (i, output) in tx.outputs.iter().enumerate() {
        if !validate_address(&output.address) {
            return Err(LedgerError::InvalidAddress(format!(
                "output {}: {}",
                i, output.address
            )));
        }
    }
    Ok(())
}

/// No outpoint may be spent twice by the same transaction
pub fn validate_unique_inputs(tx: &Transaction) -> Result<()> {
    let mut seen = HashSet::new();
    for (i, input) in tx.inputs.iter().enumerate() {
        if !seen.insert(input.outpoint()) {
            return Err(LedgerError::TransactionValidation(format!(
                "input {} spends {} twice",
                i,
                input.outpoint()
            )));
        }
    }
    Ok(())
}

/// ValidateStructure: 𝒯𝒳 × 𝒰𝒮 → ℝ
///
/// Composition, first failure wins:
/// 1. ValidateBasic
/// 2. ValidateAmounts (UTXO-aware)
/// 3. Per-input UTXO existence
/// 4. Per-input signature verification
/// 5. Per-output address format
///
/// Returns the transaction fee.
pub fn validate_structure(tx: &Transaction, view: &dyn UtxoView) -> Result<Amount> {
    validate_basic(tx)?;
    validate_unique_inputs(tx)?;
    let fee = validate_amounts(tx, view)?;
    let referenced = referenced_outputs(tx, view)?;
    validate_signatures(tx, &referenced)?;
    validate_addresses(tx)?;
    Ok(fee)
}

/// Observer-facing form of [`validate_structure`]
pub fn check_structure(tx: &Transaction, view: &dyn UtxoView) -> ValidationResult {
    match validate_structure(tx, view) {
        Ok(_) => ValidationResult::Valid,
        Err(e) => ValidationResult::Invalid(e.to_string()),
    }
}
