//! Ledger facade against the durable store, with wallets driving payments

use std::sync::Arc;
use std::time::Duration;
use utxo_ledger::mempool::CleanupWorker;
use utxo_ledger::*;

fn create_config(dir: &std::path::Path) -> LedgerConfig {
    let mut config = LedgerConfig::default();
    config.mining.difficulty = 1;
    config.store_path = Some(dir.join("chain"));
    config
}

#[test]
fn test_wallet_payments_survive_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = create_config(dir.path());
    let alice = Wallet::new("alice");
    let bob = Wallet::new("bob");
    let alice_addr = alice.generate_new_address()?;
    let bob_addr = bob.generate_new_address()?;

    {
        let ledger = Ledger::open(config.clone())?;
        ledger.mine_block(&alice_addr, None)?;
        ledger.mine_block(&alice_addr, None)?;
        assert_eq!(alice.calculate_balance(ledger.utxo())?, 110.0);

        let tx = alice.create_transaction(&bob_addr, 70.0, 0.1, ledger.utxo())?;
        assert_eq!(tx.inputs.len(), 2);
        ledger.submit_transaction(tx)?;
        let miner = KeyPair::generate();
        ledger.mine_block(miner.address(), None)?;

        assert_eq!(bob.calculate_balance(ledger.utxo())?, 70.0);
        assert!((alice.calculate_balance(ledger.utxo())? - 39.9).abs() < 1e-9);
        ledger.close()?;
    }

    let ledger = Ledger::open(config)?;
    assert_eq!(ledger.chain().len(), 4);
    assert!(ledger.chain().is_valid());
    assert_eq!(bob.calculate_balance(ledger.utxo())?, 70.0);
    assert!((alice.calculate_balance(ledger.utxo())? - 39.9).abs() < 1e-9);
    assert!(ledger.mempool().is_empty());
    Ok(())
}

#[test]
fn test_repeated_save_is_idempotent() -> anyhow::Result<()> {
    let store = SledStore::temporary()?;
    let config = LedgerConfig {
        mining: MiningConfig { difficulty: 0, ..Default::default() },
        ..Default::default()
    };
    let ledger = Ledger::with_store(config, Box::new(store))?;
    let miner = KeyPair::generate();
    ledger.mine_block(miner.address(), None)?;
    ledger.mine_data_block("audit note", miner.address(), None)?;
    ledger.save()?;
    ledger.save()?;
    ledger.mine_data_block("second note", miner.address(), None)?;
    ledger.save()?;
    assert_eq!(ledger.chain().miner_reward(miner.address()), 150.0);
    Ok(())
}

#[test]
fn test_double_spend_dropped_at_mining() -> anyhow::Result<()> {
    let mut config = LedgerConfig::default();
    config.mining.difficulty = 0;
    let ledger = Ledger::new(config);
    let alice = Wallet::new("alice");
    let addr = alice.generate_new_address()?;
    let carol = KeyPair::generate();
    ledger.mine_block(&addr, None)?;

    let first = alice.create_transaction(carol.address(), 10.0, 0.5, ledger.utxo())?;
    ledger.submit_transaction(first.clone())?;
    let second = alice.create_transaction(carol.address(), 11.0, 0.5, ledger.utxo())?;
    let err = ledger.submit_transaction(second).unwrap_err();
    assert!(matches!(err, LedgerError::TransactionValidation(_)));

    let block = ledger.mine_block(carol.address(), None)?;
    assert_eq!(block.transactions()[1].id, first.id);
    assert_eq!(ledger.balance(carol.address()), 10.0 + 50.5);
    Ok(())
}

#[test]
fn test_cleanup_worker_on_ledger_mempool() -> anyhow::Result<()> {
    let mut config = LedgerConfig::default();
    config.mempool.max_age = 0;
    config.mining.difficulty = 0;
    let ledger = Ledger::new(config);
    let worker = CleanupWorker::spawn_with_period(ledger.mempool_handle(), Duration::from_millis(10))?;
    assert_eq!(Arc::strong_count(&ledger.mempool_handle()), 3);
    worker.stop();
    assert_eq!(Arc::strong_count(&ledger.mempool_handle()), 2);
    Ok(())
}

#[test]
fn test_config_from_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ledger.json");
    std::fs::write(&path, r#"{ "mining": { "difficulty": 3 }, "mempool": { "max_size": 10 } }"#)?;
    let config = LedgerConfig::from_file(&path)?;
    assert_eq!(config.mining.difficulty, 3);
    assert_eq!(config.mempool.max_size, 10);
    assert_eq!(config.mempool.min_fee_rate, DEFAULT_MIN_FEE_RATE);
    assert!(config.store_path.is_none());
    Ok(())
}
