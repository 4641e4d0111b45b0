//! Error types for ledger operations

use thiserror::Error;

/// Coarse classification of a [`LedgerError`].
///
/// Callers that only need to branch on the category of a failure (retry with a
/// higher fee, unlock the wallet, start from genesis, ...) match on this
/// instead of on the individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadInput,
    NotFound,
    Duplicate,
    InvalidSignature,
    InsufficientFunds,
    InvariantViolation,
    Encrypted,
    NotEncrypted,
    ChecksumMismatch,
    IoError,
    Cancelled,
    Full,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid input: {0}")]
    BadInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Crypto
    #[error("Bad signature: {0}")]
    BadSignature(String),

    #[error("Wrong key type: {0}")]
    WrongKeyType(String),

    #[error("Key mismatch: {0}")]
    KeyMismatch(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Transactions
    #[error("Transaction validation failed: {0}")]
    TransactionValidation(String),

    // UTXO set
    #[error("Duplicate UTXO: {0}")]
    DuplicateUtxo(String),

    #[error("UTXO not found: {0}")]
    UtxoNotFound(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid target amount: {0}")]
    InvalidTarget(String),

    // Mempool
    #[error("Transaction already in mempool: {0}")]
    DuplicateTransaction(String),

    #[error("Transaction too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Non-positive fee: {0}")]
    NonPositiveFee(f64),

    #[error("Fee rate too low: {rate} (min {min})")]
    FeeRateTooLow { rate: f64, min: f64 },

    #[error("Mempool is full: {0}")]
    MempoolFull(String),

    // Chain
    #[error("Chain invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Mining cancelled")]
    Cancelled,

    // Wallet
    #[error("Wallet is encrypted")]
    WalletEncrypted,

    #[error("Wallet is already encrypted")]
    AlreadyEncrypted,

    #[error("Wallet is not encrypted")]
    NotEncrypted,

    #[error("Wallet has no keys")]
    EmptyWallet,

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid hex in {0}")]
    BadHex(String),

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Decryption failed")]
    AeadFailure,

    #[error("Address not owned by wallet: {0}")]
    UnknownAddress(String),

    // Durable store
    #[error("Store not initialized")]
    NotInitialized,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        use LedgerError::*;
        match self {
            BadInput(_) | InvalidAddress(_) | TransactionValidation(_) | InvalidTarget(_)
            | TooLarge { .. } | NonPositiveFee(_) | FeeRateTooLow { .. } | WrongKeyType(_)
            | KeyMismatch(_) | EmptyWallet | MissingField(_) | BadHex(_) | Serialization(_) => {
                ErrorKind::BadInput
            }
            NotFound(_) | UtxoNotFound(_) | UnknownAddress(_) | NotInitialized => {
                ErrorKind::NotFound
            }
            DuplicateUtxo(_) | DuplicateTransaction(_) => ErrorKind::Duplicate,
            BadSignature(_) => ErrorKind::InvalidSignature,
            InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            InvariantViolation(_) => ErrorKind::InvariantViolation,
            WalletEncrypted | AlreadyEncrypted => ErrorKind::Encrypted,
            NotEncrypted => ErrorKind::NotEncrypted,
            ChecksumMismatch(_) | AeadFailure => ErrorKind::ChecksumMismatch,
            Storage(_) | Io(_) | Sled(_) => ErrorKind::IoError,
            Cancelled => ErrorKind::Cancelled,
            MempoolFull(_) => ErrorKind::Full,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
