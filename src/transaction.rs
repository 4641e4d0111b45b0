//! Transaction construction, canonical ids, signing and structural checks

use crate::constants::*;
use crate::crypto::{self, KeyPair};
use crate::error::{LedgerError, Result};
use crate::types::*;
use serde::Serialize;

/// Input as it appears in the hashing view: no signature, no public key
#[derive(Serialize)]
struct InputView<'a> {
    tx_id: &'a str,
    index: u32,
}

/// Output as it appears in the hashing view: no back-filled id fields
#[derive(Serialize)]
struct OutputView<'a> {
    address: &'a str,
    amount: Amount,
}

#[derive(Serialize)]
struct HashingView<'a> {
    inputs: Vec<InputView<'a>>,
    outputs: Vec<OutputView<'a>>,
    timestamp: u64,
}

#[derive(Serialize)]
struct ReferencedOutputView<'a> {
    tx_id: &'a str,
    index: u32,
    address: &'a str,
    amount: Amount,
}

/// Canonical encoding of {inputs, outputs, timestamp} with signatures, public
/// keys and back-filled output references left out.
///
/// This is both the preimage of the transaction id and the prefix of every
/// signing message, so adding signatures never changes the id.
pub fn hashing_view(tx: &Transaction) -> Vec<u8> {
    let view = HashingView {
        inputs: tx
            .inputs
            .iter()
            .map(|i| InputView { tx_id: &i.prev_tx_id, index: i.prev_output_index })
            .collect(),
        outputs: tx
            .outputs
            .iter()
            .map(|o| OutputView { address: &o.address, amount: o.amount })
            .collect(),
        timestamp: tx.timestamp,
    };
    serde_json::to_vec(&view).expect("hashing view holds only strings and numbers")
}

/// CalculateID: hex(SHA-256(SHA-256(hashing_view(tx))))
pub fn calculate_id(tx: &Transaction) -> TxId {
    hex::encode(crypto::double_sha256(&hashing_view(tx)))
}

/// Build a transaction stamped with the current time, id assigned and output
/// references back-filled.
pub fn new_transaction(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Transaction {
    new_transaction_at(inputs, outputs, unix_timestamp())
}

pub fn new_transaction_at(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, timestamp: u64) -> Transaction {
    let mut tx = Transaction {
        id: String::new(),
        inputs,
        outputs,
        timestamp,
    };
    finalize(&mut tx);
    tx
}

/// Coinbase: no inputs, exactly one output paying `amount` to `address`
pub fn new_coinbase(address: &str, amount: Amount, timestamp: u64) -> Transaction {
    new_transaction_at(vec![], vec![TxOutput::new(address, amount)], timestamp)
}

/// Recompute the id and back-fill `tx_id` / `output_index` on every output
pub fn finalize(tx: &mut Transaction) {
    tx.id = calculate_id(tx);
    let id = tx.id.clone();
    for (i, output) in tx.outputs.iter_mut().enumerate() {
        output.tx_id = id.clone();
        output.output_index = i as u32;
    }
}

/// Message signed for input `index`: hashing view followed by the canonical
/// encoding of the output that input spends, hashed with SHA-256.
pub fn signing_message(tx: &Transaction, index: usize, referenced: &TxOutput) -> Hash {
    let input = &tx.inputs[index];
    let mut data = hashing_view(tx);
    let referenced_view = ReferencedOutputView {
        tx_id: &input.prev_tx_id,
        index: input.prev_output_index,
        address: &referenced.address,
        amount: referenced.amount,
    };
    data.extend(
        serde_json::to_vec(&referenced_view).expect("referenced output view holds only strings and numbers"),
    );
    crypto::sha256(&data)
}

fn referenced_for<'a>(
    tx: &Transaction,
    index: usize,
    referenced_outputs: &'a [TxOutput],
) -> Result<&'a TxOutput> {
    if index >= tx.inputs.len() {
        return Err(LedgerError::BadInput(format!(
            "input index {} out of range ({} inputs)",
            index,
            tx.inputs.len()
        )));
    }
    referenced_outputs.get(index).ok_or_else(|| {
        LedgerError::BadInput(format!("no referenced output supplied for input {}", index))
    })
}

/// Sign input `index` with `key`, storing the hex signature and public key on
/// the input. The referenced output must be payable to the key's address.
pub fn sign_input(
    tx: &mut Transaction,
    index: usize,
    referenced_outputs: &[TxOutput],
    key: &KeyPair,
) -> Result<()> {
    let referenced = referenced_for(tx, index, referenced_outputs)?;
    if !referenced.address.eq_ignore_ascii_case(key.address()) {
        return Err(LedgerError::KeyMismatch(format!(
            "input {} spends an output of {}, key belongs to {}",
            index,
            referenced.address,
            key.address()
        )));
    }
    let message = signing_message(tx, index, referenced);
    let signature = key.sign(&message);
    let input = &mut tx.inputs[index];
    input.signature = hex::encode(signature);
    input.public_key = key.public_key_hex();
    Ok(())
}

/// Sign every input with the same key
pub fn sign_all(tx: &mut Transaction, referenced_outputs: &[TxOutput], key: &KeyPair) -> Result<()> {
    for index in 0..tx.inputs.len() {
        sign_input(tx, index, referenced_outputs, key)?;
    }
    Ok(())
}

/// Verify input `index` against the output it spends. The embedded public key
/// must hash to the referenced output's address and carry a valid signature.
pub fn verify_input(tx: &Transaction, index: usize, referenced_outputs: &[TxOutput]) -> Result<()> {
    let referenced = referenced_for(tx, index, referenced_outputs)?;
    let input = &tx.inputs[index];
    if !input.is_signed() {
        return Err(LedgerError::BadSignature(format!("input {} is unsigned", index)));
    }
    let public_key = hex::decode(&input.public_key)
        .map_err(|_| LedgerError::BadSignature(format!("input {} public key is not hex", index)))?;
    let signature = hex::decode(&input.signature)
        .map_err(|_| LedgerError::BadSignature(format!("input {} signature is not hex", index)))?;
    if !crypto::derive_address(&public_key).eq_ignore_ascii_case(&referenced.address) {
        return Err(LedgerError::BadSignature(format!(
            "input {} public key does not own {}",
            index, referenced.address
        )));
    }
    let message = signing_message(tx, index, referenced);
    crypto::verify(&message, &signature, &public_key)
        .map_err(|e| LedgerError::BadSignature(format!("input {}: {}", index, e)))
}

/// ValidateBasic: 𝒯𝒳 → {ok, err}
///
/// 1. id non-empty
/// 2. at least one of inputs / outputs non-empty
/// 3. ∀o ∈ outs: o.address non-empty and 0x-prefixed, o.amount finite and > 0
/// 4. non-coinbase: ∀i ∈ ins: i.prev_tx_id non-empty
/// 5. id = CalculateID(tx)
/// 6. ∀o ∈ outs with a back-filled tx_id: o.tx_id = id ∧ o.output_index = position
pub fn validate_basic(tx: &Transaction) -> Result<()> {
    if tx.id.is_empty() {
        return Err(LedgerError::TransactionValidation("empty transaction id".to_string()));
    }

    if tx.inputs.is_empty() && tx.outputs.is_empty() {
        return Err(LedgerError::TransactionValidation(
            "transaction has no inputs and no outputs".to_string(),
        ));
    }

    for (i, output) in tx.outputs.iter().enumerate() {
        if output.address.is_empty() || !output.address.starts_with(ADDRESS_PREFIX) {
            return Err(LedgerError::TransactionValidation(format!(
                "output {} has invalid address {:?}",
                i, output.address
            )));
        }
        if !output.amount.is_finite() || output.amount <= 0.0 {
            return Err(LedgerError::TransactionValidation(format!(
                "output {} has non-positive amount {}",
                i, output.amount
            )));
        }
    }

    for (i, input) in tx.inputs.iter().enumerate() {
        if input.prev_tx_id.is_empty() {
            return Err(LedgerError::TransactionValidation(format!(
                "input {} has empty previous transaction id",
                i
            )));
        }
    }

    let expected = calculate_id(tx);
    if tx.id != expected {
        return Err(LedgerError::TransactionValidation(format!(
            "transaction id {} does not match contents (expected {})",
            tx.id, expected
        )));
    }

    for (i, output) in tx.outputs.iter().enumerate() {
        if output.tx_id.is_empty() {
            continue;
        }
        if output.tx_id != tx.id || output.output_index as usize != i {
            return Err(LedgerError::TransactionValidation(format!(
                "output {} carries reference {}:{} instead of {}:{}",
                i, output.tx_id, output.output_index, tx.id, i
            )));
        }
    }

    Ok(())
}

/// Observer-facing form of [`validate_basic`]
pub fn check_transaction(tx: &Transaction) -> ValidationResult {
    match validate_basic(tx) {
        Ok(()) => ValidationResult::Valid,
        Err(e) => ValidationResult::Invalid(e.to_string()),
    }
}

pub fn classify(tx: &Transaction) -> TransactionKind {
    match (tx.inputs.len(), tx.outputs.len()) {
        (0, _) => TransactionKind::Coinbase,
        (1, 1) => TransactionKind::SimpleTransfer,
        (n, 1) if n > 1 => TransactionKind::Consolidation,
        (_, m) if m > 2 => TransactionKind::MultiOutput,
        _ => TransactionKind::Standard,
    }
}

/// Estimated serialized size in bytes
pub fn estimated_tx_size(num_inputs: usize, num_outputs: usize) -> usize {
    TX_BASE_SIZE + num_inputs * TX_INPUT_SIZE + num_outputs * TX_OUTPUT_SIZE
}

pub fn transaction_size(tx: &Transaction) -> usize {
    estimated_tx_size(tx.inputs.len(), tx.outputs.len())
}

pub fn to_json(tx: &Transaction) -> Result<String> {
    Ok(serde_json::to_string(tx)?)
}

pub fn from_json(json: &str) -> Result<Transaction> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_funding_output(owner: &KeyPair, amount: Amount) -> TxOutput {
        let mut out = TxOutput::new(owner.address(), amount);
        out.tx_id = "f".repeat(64);
        out.output_index = 0;
        out
    }

    fn create_spend(owner: &KeyPair, to: &str) -> (Transaction, Vec<TxOutput>) {
        let funding = create_funding_output(owner, 10.0);
        let tx = new_transaction_at(
            vec![TxInput::new(funding.tx_id.clone(), 0)],
            vec![TxOutput::new(to, 9.0)],
            1_700_000_100,
        );
        (tx, vec![funding])
    }

    #[test]
    fn test_id_is_64_hex() {
        let kp = KeyPair::generate();
        let (tx, _) = create_spend(&kp, kp.address());
        assert_eq!(tx.id.len(), HASH_HEX_LEN);
        assert!(tx.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(tx.id, calculate_id(&tx));
    }

    #[test]
    fn test_outputs_backfilled() {
        let kp = KeyPair::generate();
        let tx = new_transaction(
            vec![TxInput::new("a".repeat(64), 1)],
            vec![TxOutput::new(kp.address(), 1.0), TxOutput::new(kp.address(), 2.0)],
        );
        for (i, out) in tx.outputs.iter().enumerate() {
            assert_eq!(out.tx_id, tx.id);
            assert_eq!(out.output_index, i as u32);
        }
    }

    #[test]
    fn test_signing_does_not_change_id() {
        let kp = KeyPair::generate();
        let (mut tx, refs) = create_spend(&kp, kp.address());
        let before = tx.id.clone();
        sign_all(&mut tx, &refs, &kp).unwrap();
        assert_eq!(calculate_id(&tx), before);
        assert!(tx.inputs[0].is_signed());
    }

    #[test]
    fn test_sign_and_verify_input() {
        let kp = KeyPair::generate();
        let (mut tx, refs) = create_spend(&kp, kp.address());
        sign_input(&mut tx, 0, &refs, &kp).unwrap();
        assert!(verify_input(&tx, 0, &refs).is_ok());
    }

    #[test]
    fn test_verify_detects_tampered_output() {
        let kp = KeyPair::generate();
        let (mut tx, refs) = create_spend(&kp, kp.address());
        sign_input(&mut tx, 0, &refs, &kp).unwrap();
        tx.outputs[0].amount = 9.5;
        assert!(matches!(verify_input(&tx, 0, &refs), Err(LedgerError::BadSignature(_))));
    }

    #[test]
    fn test_verify_detects_wrong_referenced_amount() {
        let kp = KeyPair::generate();
        let (mut tx, mut refs) = create_spend(&kp, kp.address());
        sign_input(&mut tx, 0, &refs, &kp).unwrap();
        refs[0].amount = 100.0;
        assert!(verify_input(&tx, 0, &refs).is_err());
    }

    #[test]
    fn test_sign_with_foreign_key_rejected() {
        let owner = KeyPair::generate();
        let thief = KeyPair::generate();
        let (mut tx, refs) = create_spend(&owner, thief.address());
        assert!(matches!(
            sign_input(&mut tx, 0, &refs, &thief),
            Err(LedgerError::KeyMismatch(_))
        ));
    }

    #[test]
    fn test_verify_unsigned_input() {
        let kp = KeyPair::generate();
        let (tx, refs) = create_spend(&kp, kp.address());
        assert!(matches!(verify_input(&tx, 0, &refs), Err(LedgerError::BadSignature(_))));
    }

    #[test]
    fn test_sign_index_out_of_range() {
        let kp = KeyPair::generate();
        let (mut tx, refs) = create_spend(&kp, kp.address());
        assert!(matches!(sign_input(&mut tx, 3, &refs, &kp), Err(LedgerError::BadInput(_))));
    }

    #[test]
    fn test_validate_basic() {
        let kp = KeyPair::generate();
        let (tx, _) = create_spend(&kp, kp.address());
        assert!(validate_basic(&tx).is_ok());

        let mut no_id = tx.clone();
        no_id.id.clear();
        assert!(validate_basic(&no_id).is_err());

        let mut zero = tx.clone();
        zero.outputs[0].amount = 0.0;
        assert!(validate_basic(&zero).is_err());

        let mut nan = tx.clone();
        nan.outputs[0].amount = f64::NAN;
        assert!(validate_basic(&nan).is_err());

        let mut bad_addr = tx.clone();
        bad_addr.outputs[0].address = "bob".to_string();
        assert!(validate_basic(&bad_addr).is_err());

        let mut empty_prev = tx.clone();
        empty_prev.inputs[0].prev_tx_id.clear();
        assert!(validate_basic(&empty_prev).is_err());

        let mut empty = tx;
        empty.inputs.clear();
        empty.outputs.clear();
        assert!(validate_basic(&empty).is_err());
    }

    #[test]
    fn test_validate_basic_rejects_forged_id() {
        let kp = KeyPair::generate();
        let (mut tx, refs) = create_spend(&kp, kp.address());
        sign_all(&mut tx, &refs, &kp).unwrap();
        assert!(validate_basic(&tx).is_ok());

        let mut forged = tx.clone();
        forged.id = "f".repeat(64);
        assert!(matches!(
            validate_basic(&forged),
            Err(LedgerError::TransactionValidation(_))
        ));

        // Signatures stay valid under a rewritten id, so only the id check catches it
        assert!(verify_input(&forged, 0, &refs).is_ok());
    }

    #[test]
    fn test_validate_basic_rejects_tampered_backfill() {
        let kp = KeyPair::generate();
        let tx = new_transaction_at(
            vec![TxInput::new("a".repeat(64), 0)],
            vec![TxOutput::new(kp.address(), 1.0), TxOutput::new(kp.address(), 2.0)],
            1_700_000_200,
        );
        assert!(validate_basic(&tx).is_ok());

        let mut wrong_ref = tx.clone();
        wrong_ref.outputs[1].tx_id = "b".repeat(64);
        assert!(validate_basic(&wrong_ref).is_err());

        let mut wrong_index = tx.clone();
        wrong_index.outputs[1].output_index = 0;
        assert!(validate_basic(&wrong_index).is_err());

        let mut unfilled = tx;
        for output in unfilled.outputs.iter_mut() {
            output.tx_id.clear();
        }
        assert!(validate_basic(&unfilled).is_ok());
    }

    #[test]
    fn test_check_transaction_observer_form() {
        let kp = KeyPair::generate();
        let coinbase = new_coinbase(kp.address(), 50.0, 1_700_000_000);
        assert_eq!(check_transaction(&coinbase), ValidationResult::Valid);
    }

    #[test]
    fn test_classify() {
        let kp = KeyPair::generate();
        let a = kp.address();
        let out = |n: usize| (0..n).map(|_| TxOutput::new(a, 1.0)).collect::<Vec<_>>();
        let ins = |n: usize| (0..n).map(|i| TxInput::new("p", i as u32)).collect::<Vec<_>>();

        assert_eq!(classify(&new_coinbase(a, 1.0, 0)), TransactionKind::Coinbase);
        assert_eq!(classify(&new_transaction_at(ins(1), out(1), 0)), TransactionKind::SimpleTransfer);
        assert_eq!(classify(&new_transaction_at(ins(3), out(1), 0)), TransactionKind::Consolidation);
        assert_eq!(classify(&new_transaction_at(ins(1), out(3), 0)), TransactionKind::MultiOutput);
        assert_eq!(classify(&new_transaction_at(ins(1), out(2), 0)), TransactionKind::Standard);
    }

    #[test]
    fn test_estimated_size() {
        assert_eq!(estimated_tx_size(0, 0), TX_BASE_SIZE);
        assert_eq!(
            estimated_tx_size(2, 3),
            TX_BASE_SIZE + 2 * TX_INPUT_SIZE + 3 * TX_OUTPUT_SIZE
        );
    }

    #[test]
    fn test_id_survives_json() {
        let kp = KeyPair::generate();
        let (mut tx, refs) = create_spend(&kp, kp.address());
        sign_all(&mut tx, &refs, &kp).unwrap();
        let json = to_json(&tx).unwrap();
        let back = from_json(&json).unwrap();
        assert_eq!(back, tx);
        assert_eq!(calculate_id(&back), tx.id);
        assert!(verify_input(&back, 0, &refs).is_ok());
    }

    #[test]
    fn test_json_field_names() {
        let kp = KeyPair::generate();
        let (tx, _) = create_spend(&kp, kp.address());
        let value: serde_json::Value = serde_json::from_str(&to_json(&tx).unwrap()).unwrap();
        assert!(value["inputs"][0].get("tx_id").is_some());
        assert!(value["inputs"][0].get("index").is_some());
        assert!(value["inputs"][0].get("signature").is_some());
        assert!(value["inputs"][0].get("public_key").is_some());
        assert!(value["outputs"][0].get("index").is_some());
        assert!(value.get("timestamp").is_some());
    }
}
