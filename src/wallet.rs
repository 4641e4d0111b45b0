//! Named keystore of key pairs with passphrase encryption
//!
//! A wallet owns the key pairs for its addresses and signs on their behalf.
//! Encrypting it serializes the keystore, seals it with AES-256-GCM under a
//! passphrase-derived key and wipes the key pairs from memory; only the
//! address list stays readable until the wallet is decrypted again.

use crate::constants::*;
use crate::crypto::{self, write_private_file, KeyPair};
use crate::error::{LedgerError, Result};
use crate::transaction::{new_transaction, sign_input};
use crate::types::*;
use crate::utxo::UtxoSet;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;
use zeroize::{Zeroize, Zeroizing};

const META_ENCRYPTED_DATA: &str = "encrypted_data";
const META_SALT: &str = "salt";
const META_NONCE: &str = "nonce";
const META_CHECKSUM: &str = "checksum";
const META_KDF: &str = "kdf";

const ENCRYPTION_FIELDS: [&str; 5] = [META_ENCRYPTED_DATA, META_SALT, META_NONCE, META_CHECKSUM, META_KDF];

/// Key derivation used to turn a passphrase into the AES-256 key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kdf {
    /// Argon2id with default parameters
    Argon2id,
    /// Single SHA-256 over passphrase ‖ salt, for records written before
    /// Argon2id was introduced
    Sha256,
}

impl Kdf {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kdf::Argon2id => "argon2id",
            Kdf::Sha256 => "sha256",
        }
    }

    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "argon2id" => Ok(Kdf::Argon2id),
            "sha256" => Ok(Kdf::Sha256),
            other => Err(LedgerError::BadInput(format!("unknown key derivation {:?}", other))),
        }
    }

    fn derive(&self, passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let mut key = Zeroizing::new([0u8; 32]);
        match self {
            Kdf::Argon2id => Argon2::default()
                .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
                .map_err(|e| LedgerError::BadInput(format!("key derivation failed: {}", e)))?,
            Kdf::Sha256 => {
                let mut input = Zeroizing::new(Vec::with_capacity(passphrase.len() + salt.len()));
                input.extend_from_slice(passphrase.as_bytes());
                input.extend_from_slice(salt);
                key.copy_from_slice(&crypto::sha256(&input));
            }
        }
        Ok(key)
    }
}

/// One key pair as stored on disk or inside the encrypted payload:
/// hex of the SEC1 private key DER and the SPKI public key DER
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyStoreRecord {
    pub address: Address,
    pub private_key: String,
    pub public_key: String,
}

impl KeyStoreRecord {
    fn from_key_pair(kp: &KeyPair) -> Result<Self> {
        Ok(Self {
            address: kp.address().to_string(),
            private_key: hex::encode(Zeroizing::new(kp.private_key_der()?).as_slice()),
            public_key: hex::encode(kp.public_key_der()?),
        })
    }

    fn to_key_pair(&self) -> Result<KeyPair> {
        let private = Zeroizing::new(
            hex::decode(&self.private_key).map_err(|_| LedgerError::BadHex("private_key".to_string()))?,
        );
        let public = hex::decode(&self.public_key).map_err(|_| LedgerError::BadHex("public_key".to_string()))?;
        let kp = KeyPair::from_der(&private, &public)?;
        if !kp.address().eq_ignore_ascii_case(&self.address) {
            return Err(LedgerError::KeyMismatch(format!(
                "stored address {} does not match key ({})",
                self.address,
                kp.address()
            )));
        }
        Ok(kp)
    }
}

impl Drop for KeyStoreRecord {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Plaintext sealed by [`Wallet::encrypt`]
#[derive(Serialize, Deserialize)]
struct KeystorePayload {
    addresses: Vec<Address>,
    key_stores: Vec<KeyStoreRecord>,
}

/// Encryption parameters mirrored into the wallet file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionData {
    pub salt: String,
    pub nonce: String,
    pub checksum: String,
}

/// On-disk form of a wallet
#[derive(Serialize, Deserialize)]
struct WalletFile {
    name: String,
    created_at: u64,
    updated_at: u64,
    addresses: Vec<Address>,
    encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key_stores: Option<Vec<KeyStoreRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption_data: Option<EncryptionData>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct WalletState {
    name: String,
    created_at: u64,
    updated_at: u64,
    addresses: Vec<Address>,
    keypairs: HashMap<Address, KeyPair>,
    metadata: HashMap<String, String>,
    encrypted: bool,
}

impl WalletState {
    fn unlocked(&self) -> Result<()> {
        if self.encrypted {
            return Err(LedgerError::WalletEncrypted);
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = unix_timestamp().max(self.updated_at);
    }

    fn insert_key_pair(&mut self, kp: KeyPair) -> Address {
        let address = kp.address().to_string();
        if !self.keypairs.contains_key(&address) {
            self.addresses.push(address.clone());
            self.keypairs.insert(address.clone(), kp);
            self.touch();
        }
        address
    }

    fn key_for(&self, address: &str) -> Result<&KeyPair> {
        self.keypairs
            .get(address)
            .ok_or_else(|| LedgerError::UnknownAddress(address.to_string()))
    }

    fn meta_field(&self, field: &str) -> Result<&str> {
        self.metadata
            .get(field)
            .map(String::as_str)
            .ok_or_else(|| LedgerError::MissingField(field.to_string()))
    }

    fn meta_hex(&self, field: &str) -> Result<Vec<u8>> {
        hex::decode(self.meta_field(field)?).map_err(|_| LedgerError::BadHex(field.to_string()))
    }
}

/// Wallet behind a reader–writer lock; encrypt and decrypt take the writer
/// lock, everything else that only reads takes the reader lock
#[derive(Debug)]
pub struct Wallet {
    state: RwLock<WalletState>,
}

impl Wallet {
    pub fn new(name: &str) -> Self {
        let now = unix_timestamp();
        Self {
            state: RwLock::new(WalletState {
                name: name.to_string(),
                created_at: now,
                updated_at: now,
                addresses: Vec::new(),
                keypairs: HashMap::new(),
                metadata: HashMap::new(),
                encrypted: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, WalletState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, WalletState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn created_at(&self) -> u64 {
        self.read().created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.read().updated_at
    }

    pub fn is_encrypted(&self) -> bool {
        self.read().encrypted
    }

    /// Owned addresses, in creation order. Readable while encrypted.
    pub fn addresses(&self) -> Vec<Address> {
        self.read().addresses.clone()
    }

    pub fn owns(&self, address: &str) -> bool {
        self.read().addresses.iter().any(|a| a == address)
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        self.read().metadata.get(key).cloned()
    }

    /// Set a free-form metadata entry. Keys used by encryption are reserved.
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        if ENCRYPTION_FIELDS.contains(&key) {
            return Err(LedgerError::BadInput(format!("metadata key {:?} is reserved", key)));
        }
        let mut state = self.write();
        state.metadata.insert(key.to_string(), value.to_string());
        state.touch();
        Ok(())
    }

    /// GenerateNewAddress: fresh key pair, fails while encrypted
    pub fn generate_new_address(&self) -> Result<Address> {
        let mut state = self.write();
        state.unlocked()?;
        let address = state.insert_key_pair(KeyPair::generate());
        info!(wallet = %state.name, address = %address, "generated new address");
        Ok(address)
    }

    /// Take ownership of an existing key pair. Importing a key that is
    /// already present changes nothing.
    pub fn import_key_pair(&self, kp: KeyPair) -> Result<Address> {
        let mut state = self.write();
        state.unlocked()?;
        Ok(state.insert_key_pair(kp))
    }

    pub fn get_key_pair(&self, address: &str) -> Result<KeyPair> {
        let state = self.read();
        state.unlocked()?;
        state.key_for(address).cloned()
    }

    /// Total balance across every owned address
    pub fn calculate_balance(&self, utxo: &UtxoSet) -> Result<Amount> {
        let state = self.read();
        state.unlocked()?;
        Ok(state.addresses.iter().map(|a| utxo.balance(a)).sum())
    }

    pub fn get_address_balance(&self, address: &str, utxo: &UtxoSet) -> Result<Amount> {
        let state = self.read();
        state.unlocked()?;
        state.key_for(address)?;
        Ok(utxo.balance(address))
    }

    /// Every unspent output paying an owned address
    pub fn get_unspent_outputs(&self, utxo: &UtxoSet) -> Result<Vec<TxOutput>> {
        let state = self.read();
        state.unlocked()?;
        Ok(state.addresses.iter().flat_map(|a| utxo.get_by_address(a)).collect())
    }

    /// SignTransaction: sign input `input_index` with the key owning
    /// `referenced_outputs[input_index].address`
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        input_index: usize,
        referenced_outputs: &[TxOutput],
    ) -> Result<()> {
        let state = self.read();
        state.unlocked()?;
        let referenced = referenced_outputs.get(input_index).ok_or_else(|| {
            LedgerError::BadInput(format!("no referenced output supplied for input {}", input_index))
        })?;
        let key = state.key_for(&referenced.address)?;
        sign_input(tx, input_index, referenced_outputs, key)
    }

    /// CreateTransaction: pay `amount` to `to`, leaving `fee` unclaimed.
    ///
    /// 1. If one owned address can cover amount + fee on its own, spend from
    ///    it (SelectForAmount)
    /// 2. Otherwise combine outputs of all owned addresses, largest first
    /// 3. Return change above the amount tolerance to the first payer
    /// 4. Sign every input with its owning key
    pub fn create_transaction(&self, to: &str, amount: Amount, fee: Amount, utxo: &UtxoSet) -> Result<Transaction> {
        if !crypto::validate_address(to) {
            return Err(LedgerError::InvalidAddress(to.to_string()));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LedgerError::BadInput(format!("amount {} must be positive", amount)));
        }
        if !fee.is_finite() || fee < 0.0 {
            return Err(LedgerError::BadInput(format!("fee {} must not be negative", fee)));
        }

        let state = self.read();
        state.unlocked()?;
        if state.addresses.is_empty() {
            return Err(LedgerError::EmptyWallet);
        }

        let target = amount + fee;
        let selected = match state
            .addresses
            .iter()
            .find(|a| utxo.balance(a) >= target)
        {
            Some(address) => utxo.select_for_amount(target, address)?,
            None => select_across(&state.addresses, target, utxo)?,
        };

        let total_in: Amount = selected.iter().map(|o| o.amount).sum();
        let mut outputs = vec![TxOutput::new(to, amount)];
        let change = total_in - target;
        if change > AMOUNT_EPSILON {
            outputs.push(TxOutput::new(selected[0].address.clone(), change));
        }

        let inputs = selected.iter().map(|o| TxInput::new(o.tx_id.clone(), o.output_index)).collect();
        let mut tx = new_transaction(inputs, outputs);
        for (index, output) in selected.iter().enumerate() {
            let key = state.key_for(&output.address)?;
            sign_input(&mut tx, index, &selected, key)?;
        }
        Ok(tx)
    }

    /// Encrypt(passphrase)
    ///
    /// 1. Serialize addresses and DER key pairs
    /// 2. key = Argon2id(passphrase, fresh 16-byte salt)
    /// 3. AES-256-GCM with a fresh 12-byte nonce
    /// 4. checksum = SHA-256(ciphertext)
    /// 5. Store ciphertext and parameters in metadata, wipe the key pairs
    pub fn encrypt(&self, passphrase: &str) -> Result<()> {
        self.encrypt_with(passphrase, Kdf::Argon2id)
    }

    pub fn encrypt_with(&self, passphrase: &str, kdf: Kdf) -> Result<()> {
        let mut state = self.write();
        if state.encrypted {
            return Err(LedgerError::AlreadyEncrypted);
        }
        if state.keypairs.is_empty() {
            return Err(LedgerError::EmptyWallet);
        }

        let key_stores = state
            .addresses
            .iter()
            .map(|a| state.key_for(a).and_then(KeyStoreRecord::from_key_pair))
            .collect::<Result<Vec<_>>>()?;
        let payload = KeystorePayload { addresses: state.addresses.clone(), key_stores };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);

        let mut salt = [0u8; WALLET_SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; WALLET_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let key = kdf.derive(passphrase, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| LedgerError::AeadFailure)?;
        let checksum = hex::encode(crypto::sha256(&ciphertext));

        state.metadata.insert(META_ENCRYPTED_DATA.to_string(), hex::encode(&ciphertext));
        state.metadata.insert(META_SALT.to_string(), hex::encode(salt));
        state.metadata.insert(META_NONCE.to_string(), hex::encode(nonce));
        state.metadata.insert(META_CHECKSUM.to_string(), checksum);
        state.metadata.insert(META_KDF.to_string(), kdf.as_str().to_string());
        state.keypairs.clear();
        state.encrypted = true;
        state.touch();

        info!(wallet = %state.name, addresses = state.addresses.len(), kdf = kdf.as_str(), "wallet encrypted");
        Ok(())
    }

    /// Decrypt(passphrase): verify the checksum, open the ciphertext and
    /// restore the key pairs. Records without a `kdf` tag use SHA-256.
    pub fn decrypt(&self, passphrase: &str) -> Result<()> {
        let mut state = self.write();
        if !state.encrypted {
            return Err(LedgerError::NotEncrypted);
        }

        let ciphertext = state.meta_hex(META_ENCRYPTED_DATA)?;
        let salt = state.meta_hex(META_SALT)?;
        let nonce = state.meta_hex(META_NONCE)?;
        let checksum = state.meta_hex(META_CHECKSUM)?;
        let kdf = match state.metadata.get(META_KDF) {
            Some(tag) => Kdf::parse(tag)?,
            None => Kdf::Sha256,
        };

        if crypto::sha256(&ciphertext)[..] != checksum[..] {
            return Err(LedgerError::ChecksumMismatch("wallet ciphertext".to_string()));
        }
        if nonce.len() != WALLET_NONCE_LEN {
            return Err(LedgerError::BadInput(format!("nonce must be {} bytes", WALLET_NONCE_LEN)));
        }

        let key = kdf.derive(passphrase, &salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| LedgerError::AeadFailure)?,
        );

        let payload: KeystorePayload = serde_json::from_slice(&plaintext)?;
        let mut keypairs = HashMap::new();
        for record in &payload.key_stores {
            let kp = record.to_key_pair()?;
            keypairs.insert(kp.address().to_string(), kp);
        }

        state.addresses = payload.addresses;
        state.keypairs = keypairs;
        for field in ENCRYPTION_FIELDS {
            state.metadata.remove(field);
        }
        state.encrypted = false;
        state.touch();

        info!(wallet = %state.name, addresses = state.addresses.len(), "wallet decrypted");
        Ok(())
    }

    /// Validate: when unlocked every address has exactly one key pair whose
    /// derived address matches; when locked the ciphertext is present
    pub fn validate(&self) -> Result<()> {
        let state = self.read();
        let unique: HashSet<&Address> = state.addresses.iter().collect();
        if unique.len() != state.addresses.len() {
            return Err(LedgerError::InvariantViolation("duplicate address in wallet".to_string()));
        }

        if state.encrypted {
            if !state.keypairs.is_empty() {
                return Err(LedgerError::InvariantViolation(
                    "encrypted wallet holds key pairs in memory".to_string(),
                ));
            }
            state.meta_field(META_ENCRYPTED_DATA)?;
            return Ok(());
        }

        if state.addresses.len() != state.keypairs.len() {
            return Err(LedgerError::InvariantViolation(format!(
                "{} addresses but {} key pairs",
                state.addresses.len(),
                state.keypairs.len()
            )));
        }
        for address in &state.addresses {
            let kp = state.key_for(address)?;
            let derived = crypto::derive_address(&kp.public_key_bytes());
            if derived != *address || kp.address() != address {
                return Err(LedgerError::KeyMismatch(format!(
                    "key stored under {} derives {}",
                    address, derived
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        let state = self.read();
        let (key_stores, encryption_data) = if state.encrypted {
            let data = EncryptionData {
                salt: state.meta_field(META_SALT)?.to_string(),
                nonce: state.meta_field(META_NONCE)?.to_string(),
                checksum: state.meta_field(META_CHECKSUM)?.to_string(),
            };
            (None, Some(data))
        } else {
            let records = state
                .addresses
                .iter()
                .map(|a| state.key_for(a).and_then(KeyStoreRecord::from_key_pair))
                .collect::<Result<Vec<_>>>()?;
            (Some(records), None)
        };
        let file = WalletFile {
            name: state.name.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
            addresses: state.addresses.clone(),
            encrypted: state.encrypted,
            key_stores,
            encryption_data,
            metadata: state.metadata.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: WalletFile = serde_json::from_str(json)?;
        let mut metadata = file.metadata;
        let mut keypairs = HashMap::new();

        if file.encrypted {
            // Older files may carry the parameters only in `encryption_data`
            if let Some(data) = &file.encryption_data {
                metadata.entry(META_SALT.to_string()).or_insert_with(|| data.salt.clone());
                metadata.entry(META_NONCE.to_string()).or_insert_with(|| data.nonce.clone());
                metadata.entry(META_CHECKSUM.to_string()).or_insert_with(|| data.checksum.clone());
            }
        } else {
            for record in file.key_stores.as_deref().unwrap_or_default() {
                let kp = record.to_key_pair()?;
                keypairs.insert(kp.address().to_string(), kp);
            }
        }

        let wallet = Self {
            state: RwLock::new(WalletState {
                name: file.name,
                created_at: file.created_at,
                updated_at: file.updated_at,
                addresses: file.addresses,
                keypairs,
                metadata,
                encrypted: file.encrypted,
            }),
        };
        wallet.validate()?;
        Ok(wallet)
    }

    /// Write the wallet as JSON with mode 0600
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        write_private_file(path, self.to_json()?.as_bytes())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::from_json(&json)
    }
}

/// Largest-first selection over several addresses
fn select_across(addresses: &[Address], target: Amount, utxo: &UtxoSet) -> Result<Vec<TxOutput>> {
    let mut candidates: Vec<TxOutput> = addresses.iter().flat_map(|a| utxo.get_by_address(a)).collect();
    candidates.sort_by(|a, b| {
        b.amount
            .total_cmp(&a.amount)
            .then_with(|| a.outpoint().cmp(&b.outpoint()))
    });

    let mut selected = Vec::new();
    let mut total = 0.0;
    for output in candidates {
        total += output.amount;
        selected.push(output);
        if total >= target {
            return Ok(selected);
        }
    }
    Err(LedgerError::InsufficientFunds(format!(
        "wallet holds {}, needs {}",
        total, target
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::new_coinbase;
    use crate::validation::validate_structure;

    fn create_wallet(addresses: usize) -> Wallet {
        let wallet = Wallet::new("test");
        for _ in 0..addresses {
            wallet.generate_new_address().unwrap();
        }
        wallet
    }

    fn fund(utxo: &UtxoSet, address: &str, amount: Amount, ts: u64) {
        let coinbase = new_coinbase(address, amount, ts);
        utxo.process_transaction(&coinbase).unwrap();
    }

    #[test]
    fn test_generate_and_lookup() {
        let wallet = create_wallet(2);
        let addresses = wallet.addresses();
        assert_eq!(addresses.len(), 2);
        for address in &addresses {
            assert!(crypto::validate_address(address));
            assert_eq!(wallet.get_key_pair(address).unwrap().address(), address);
        }
        assert!(wallet.validate().is_ok());
        assert!(matches!(wallet.get_key_pair("0xnope"), Err(LedgerError::UnknownAddress(_))));
    }

    #[test]
    fn test_import_is_idempotent() {
        let wallet = Wallet::new("w");
        let kp = KeyPair::generate();
        wallet.import_key_pair(kp.clone()).unwrap();
        wallet.import_key_pair(kp).unwrap();
        assert_eq!(wallet.addresses().len(), 1);
    }

    #[test]
    fn test_encrypt_decrypt_restores_addresses() {
        let wallet = create_wallet(3);
        let before = wallet.addresses();
        let key = wallet.get_key_pair(&before[0]).unwrap();

        wallet.encrypt("pw").unwrap();
        assert!(wallet.is_encrypted());
        assert_eq!(wallet.addresses(), before);
        assert!(matches!(wallet.get_key_pair(&before[0]), Err(LedgerError::WalletEncrypted)));
        assert!(matches!(wallet.generate_new_address(), Err(LedgerError::WalletEncrypted)));
        assert!(wallet.validate().is_ok());

        let wrong = wallet.decrypt("pw2").unwrap_err();
        assert!(matches!(wrong, LedgerError::AeadFailure | LedgerError::ChecksumMismatch(_)));
        assert!(wallet.is_encrypted());

        wallet.decrypt("pw").unwrap();
        assert!(!wallet.is_encrypted());
        assert_eq!(wallet.addresses(), before);
        assert_eq!(wallet.get_key_pair(&before[0]).unwrap(), key);
        assert!(wallet.metadata(META_ENCRYPTED_DATA).is_none());
        assert!(wallet.validate().is_ok());
    }

    #[test]
    fn test_encrypt_preconditions() {
        let empty = Wallet::new("empty");
        assert!(matches!(empty.encrypt("pw"), Err(LedgerError::EmptyWallet)));
        assert!(matches!(empty.decrypt("pw"), Err(LedgerError::NotEncrypted)));

        let wallet = create_wallet(1);
        wallet.encrypt("pw").unwrap();
        assert!(matches!(wallet.encrypt("pw"), Err(LedgerError::AlreadyEncrypted)));
    }

    #[test]
    fn test_legacy_sha256_kdf() {
        let wallet = create_wallet(1);
        wallet.encrypt_with("pw", Kdf::Sha256).unwrap();
        wallet.write().metadata.remove(META_KDF);
        wallet.decrypt("pw").unwrap();
        assert_eq!(wallet.addresses().len(), 1);
    }

    #[test]
    fn test_decrypt_detects_corruption() {
        let wallet = create_wallet(1);
        wallet.encrypt("pw").unwrap();
        {
            let mut state = wallet.write();
            let data = state.metadata.get_mut(META_ENCRYPTED_DATA).unwrap();
            let flipped = if data.ends_with('0') { '1' } else { '0' };
            data.pop();
            data.push(flipped);
        }
        assert!(matches!(wallet.decrypt("pw"), Err(LedgerError::ChecksumMismatch(_))));

        wallet.write().metadata.remove(META_NONCE);
        assert!(matches!(wallet.decrypt("pw"), Err(LedgerError::MissingField(_))));

        wallet.write().metadata.insert(META_SALT.to_string(), "zz".to_string());
        assert!(matches!(wallet.decrypt("pw"), Err(LedgerError::BadHex(_))));
    }

    #[test]
    fn test_balances_and_outputs() {
        let wallet = create_wallet(2);
        let addresses = wallet.addresses();
        let utxo = UtxoSet::new();
        fund(&utxo, &addresses[0], 10.0, 1);
        fund(&utxo, &addresses[1], 5.0, 2);
        fund(&utxo, &crypto::generate_key_pair().address().to_string(), 99.0, 3);

        assert_eq!(wallet.calculate_balance(&utxo).unwrap(), 15.0);
        assert_eq!(wallet.get_address_balance(&addresses[1], &utxo).unwrap(), 5.0);
        assert_eq!(wallet.get_unspent_outputs(&utxo).unwrap().len(), 2);

        wallet.encrypt("pw").unwrap();
        assert!(matches!(wallet.calculate_balance(&utxo), Err(LedgerError::WalletEncrypted)));
    }

    #[test]
    fn test_sign_transaction_unknown_address() {
        let wallet = create_wallet(1);
        let stranger = KeyPair::generate();
        let mut funding = TxOutput::new(stranger.address(), 1.0);
        funding.tx_id = "ab".repeat(32);
        let mut tx = new_transaction(
            vec![TxInput::new(funding.tx_id.clone(), 0)],
            vec![TxOutput::new(stranger.address(), 0.5)],
        );
        assert!(matches!(
            wallet.sign_transaction(&mut tx, 0, &[funding]),
            Err(LedgerError::UnknownAddress(_))
        ));
    }

    #[test]
    fn test_create_transaction_with_change() {
        let wallet = create_wallet(1);
        let payer = wallet.addresses()[0].clone();
        let payee = KeyPair::generate();
        let utxo = UtxoSet::new();
        fund(&utxo, &payer, 10.0, 1);

        let tx = wallet.create_transaction(payee.address(), 6.0, 0.5, &utxo).unwrap();
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].amount, 6.0);
        assert_eq!(tx.outputs[1].address, payer);
        assert_eq!(tx.outputs[1].amount, 3.5);
        let fee = validate_structure(&tx, &utxo).unwrap();
        assert!((fee - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_create_transaction_across_addresses() {
        let wallet = create_wallet(2);
        let addresses = wallet.addresses();
        let payee = KeyPair::generate();
        let utxo = UtxoSet::new();
        fund(&utxo, &addresses[0], 4.0, 1);
        fund(&utxo, &addresses[1], 3.0, 2);

        let tx = wallet.create_transaction(payee.address(), 6.5, 0.25, &utxo).unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert!(validate_structure(&tx, &utxo).is_ok());

        assert!(matches!(
            wallet.create_transaction(payee.address(), 8.0, 0.0, &utxo),
            Err(LedgerError::InsufficientFunds(_))
        ));
        assert!(matches!(
            wallet.create_transaction("0xbad", 1.0, 0.0, &utxo),
            Err(LedgerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_reserved_metadata_keys() {
        let wallet = create_wallet(1);
        wallet.set_metadata("label", "savings").unwrap();
        assert_eq!(wallet.metadata("label").as_deref(), Some("savings"));
        assert!(wallet.set_metadata(META_SALT, "x").is_err());
    }

    #[test]
    fn test_file_roundtrip_plain_and_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallets").join("main.json");
        let wallet = create_wallet(2);
        wallet.save_to_file(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = Wallet::load_from_file(&path).unwrap();
        assert_eq!(loaded.addresses(), wallet.addresses());
        assert_eq!(loaded.name(), "test");

        wallet.encrypt("pw").unwrap();
        wallet.save_to_file(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(json.get("key_stores").is_none());
        assert!(json["encryption_data"]["salt"].is_string());
        assert!(json["metadata"][META_ENCRYPTED_DATA].is_string());

        let locked = Wallet::load_from_file(&path).unwrap();
        assert!(locked.is_encrypted());
        locked.decrypt("pw").unwrap();
        assert_eq!(locked.addresses(), wallet.addresses());
    }
}
