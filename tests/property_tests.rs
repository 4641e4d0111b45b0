//! Universal properties checked over small generated samples

use std::collections::HashMap;
use utxo_ledger::chain::validate_chain;
use utxo_ledger::crypto::{self, KeyPair};
use utxo_ledger::mining::MiningLimits;
use utxo_ledger::transaction::{self, calculate_id, estimated_tx_size, new_transaction, new_transaction_at, sign_all};
use utxo_ledger::validation::{calculate_fee, referenced_outputs};
use utxo_ledger::wallet::Kdf;
use utxo_ledger::*;

fn flip_bit(bytes: &[u8], bit: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out[bit / 8] ^= 1 << (bit % 8);
    out
}

#[test]
fn test_address_round_trip() {
    for _ in 0..16 {
        let kp = KeyPair::generate();
        let derived = crypto::derive_address(&kp.public_key_bytes());
        assert_eq!(derived, kp.address());
        assert_eq!(derived, crypto::derive_address(&kp.public_key_bytes()));
        assert!(validate_address(&derived));
        assert_eq!(derived.len(), ADDRESS_LEN);
    }
}

#[test]
fn test_signature_correctness() {
    let kp = KeyPair::generate();
    let message = b"pay bob six coins".to_vec();
    let signature = kp.sign(&message);
    let public = kp.public_key_bytes();
    assert!(crypto::verify_signature(&message, &signature, &public));

    for bit in [0, 7, 42, message.len() * 8 - 1] {
        assert!(!crypto::verify_signature(&flip_bit(&message, bit), &signature, &public));
    }
    for bit in [9 * 8, signature.len() * 4, signature.len() * 8 - 1] {
        assert!(!crypto::verify_signature(&message, &flip_bit(&signature, bit), &public));
    }
    for bit in [8, 100, public.len() * 8 - 1] {
        assert!(!crypto::verify_signature(&message, &signature, &flip_bit(&public, bit)));
    }
}

#[test]
fn test_transaction_id_determinism() -> anyhow::Result<()> {
    let alice = KeyPair::generate();
    let utxo = UtxoSet::new();
    utxo.add("funding", 0, TxOutput::new(alice.address(), 3.25))?;

    let mut tx = new_transaction(
        vec![TxInput::new("funding", 0)],
        vec![TxOutput::new(alice.address(), 1.1), TxOutput::new(alice.address(), 2.0)],
    );
    let unsigned_id = tx.id.clone();
    assert_eq!(calculate_id(&tx), unsigned_id);

    let refs = referenced_outputs(&tx, &utxo)?;
    sign_all(&mut tx, &refs, &alice)?;
    assert_eq!(calculate_id(&tx), unsigned_id);

    let decoded = transaction::from_json(&transaction::to_json(&tx)?)?;
    assert_eq!(decoded, tx);
    assert_eq!(calculate_id(&decoded), unsigned_id);
    Ok(())
}

#[test]
fn test_utxo_conservation_and_revert() -> anyhow::Result<()> {
    let alice = KeyPair::generate();
    let bob = KeyPair::generate();
    let utxo = UtxoSet::new();
    utxo.add("funding", 0, TxOutput::new(alice.address(), 4.0))?;
    utxo.add("funding", 1, TxOutput::new(alice.address(), 1.5))?;
    utxo.add("other", 0, TxOutput::new(bob.address(), 7.0))?;
    let before = utxo.snapshot();

    let mut tx = new_transaction(
        vec![TxInput::new("funding", 0), TxInput::new("funding", 1)],
        vec![TxOutput::new(bob.address(), 5.0), TxOutput::new(alice.address(), 0.25)],
    );
    let refs = referenced_outputs(&tx, &utxo)?;
    sign_all(&mut tx, &refs, &alice)?;

    let total_in: Amount = refs.iter().map(|o| o.amount).sum();
    let fee = calculate_fee(&tx, &utxo)?;
    assert!(fee >= 0.0);
    assert!((total_in - (tx.total_output() + fee)).abs() < 1e-9);

    let undo = utxo.process_transaction(&tx)?;
    assert_eq!(undo.fee, fee);
    assert_ne!(utxo.snapshot(), before);

    utxo.revert_transaction(&tx, &undo)?;
    assert_eq!(utxo.snapshot(), before);
    assert_eq!(utxo.balance(alice.address()), 5.5);
    Ok(())
}

#[test]
fn test_mempool_monotonicity() {
    let pool = Mempool::default();
    let mut view: HashMap<OutPoint, TxOutput> = HashMap::new();
    let now = 1_700_000_000;
    let rates = [0.0003, 0.00002, 0.0011, 0.0005, 0.00007, 0.0009, 0.0002];

    for (i, rate) in rates.iter().enumerate() {
        let mut funding = TxOutput::new(format!("0xpayer-{}", i), 2.0);
        funding.tx_id = format!("fund-{}", i);
        view.insert(funding.outpoint(), funding.clone());
        let fee = rate * estimated_tx_size(1, 1) as f64;
        let tx = new_transaction_at(
            vec![TxInput::new(funding.tx_id, 0)],
            vec![TxOutput::new(format!("0xpayee-{}", i), 2.0 - fee)],
            now,
        );
        pool.add_transaction_at(tx, &view, now).unwrap();
    }

    let selected = pool.get_transactions_for_block_at(usize::MAX, 0, now);
    assert_eq!(selected.len(), rates.len());
    let selected_rates: Vec<f64> = selected.iter().map(|tx| pool.get(&tx.id).unwrap().fee_rate).collect();
    assert!(selected_rates.windows(2).all(|w| w[0] >= w[1]));

    let prefix = pool.get_transactions_for_block_at(usize::MAX, 3, now);
    assert_eq!(prefix, selected[..3].to_vec());
    assert_eq!(pool.len(), rates.len());
}

#[test]
fn test_chain_validity_under_mutation() {
    let chain = Blockchain::new();
    let miner = KeyPair::generate();
    for i in 0..3 {
        chain
            .append_block(BlockPayload::Data(format!("entry {}", i)), miner.address(), 1, &MiningLimits::default())
            .unwrap();
        assert!(chain.is_valid());
    }

    let blocks = chain.blocks();
    for target in 0..blocks.len() {
        let mut tampered = blocks.clone();
        tampered[target].timestamp += 1;
        assert!(validate_chain(&tampered).is_err(), "timestamp of block {}", target);

        let mut tampered = blocks.clone();
        tampered[target].nonce += 1;
        assert!(validate_chain(&tampered).is_err(), "nonce of block {}", target);

        let mut tampered = blocks.clone();
        tampered[target].prev_hash.push('0');
        assert!(validate_chain(&tampered).is_err(), "prev_hash of block {}", target);
    }
}

#[test]
fn test_encrypt_decrypt_inverse() -> anyhow::Result<()> {
    let wallet = Wallet::new("inverse");
    wallet.generate_new_address()?;
    wallet.generate_new_address()?;
    let addresses = wallet.addresses();

    wallet.encrypt_with("correct horse", Kdf::Sha256)?;
    let err = wallet.decrypt("battery staple").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);

    wallet.decrypt("correct horse")?;
    assert_eq!(wallet.addresses(), addresses);
    wallet.validate()?;
    Ok(())
}
