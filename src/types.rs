//! Core ledger types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Transaction id: 64 lowercase hex characters
pub type TxId = String;

/// Checksummed textual address (`0x` + hex(hash20 || checksum4))
pub type Address = String;

/// Coin amount
pub type Amount = f64;

/// UTXO key: (tx_id, output_index)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_id: impl Into<TxId>, index: u32) -> Self {
        Self { tx_id: tx_id.into(), index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

/// Transaction input: a reference to a previous output plus the proof of
/// ownership. `signature` and `public_key` are hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    #[serde(rename = "tx_id")]
    pub prev_tx_id: TxId,
    #[serde(rename = "index")]
    pub prev_output_index: u32,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub public_key: String,
}

impl TxInput {
    pub fn new(prev_tx_id: impl Into<TxId>, prev_output_index: u32) -> Self {
        Self {
            prev_tx_id: prev_tx_id.into(),
            prev_output_index,
            signature: String::new(),
            public_key: String::new(),
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.prev_tx_id.clone(), self.prev_output_index)
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty() && !self.public_key.is_empty()
    }
}

/// Transaction output. `tx_id` and `output_index` are back-filled once the
/// owning transaction's id is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: Address,
    pub amount: Amount,
    #[serde(default)]
    pub tx_id: TxId,
    #[serde(rename = "index", default)]
    pub output_index: u32,
}

impl TxOutput {
    pub fn new(address: impl Into<Address>, amount: Amount) -> Self {
        Self {
            address: address.into(),
            amount,
            tx_id: String::new(),
            output_index: 0,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_id.clone(), self.output_index)
    }
}

/// Transaction. A coinbase has no inputs and exactly one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub timestamp: u64,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn total_output(&self) -> Amount {
        self.outputs.iter().map(|o| o.amount).sum()
    }
}

/// Shape of a transaction, for observers only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Coinbase,
    SimpleTransfer,
    Consolidation,
    MultiOutput,
    Standard,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Coinbase => "coinbase",
            TransactionKind::SimpleTransfer => "simple_transfer",
            TransactionKind::Consolidation => "consolidation",
            TransactionKind::MultiOutput => "multi_output",
            TransactionKind::Standard => "standard",
        };
        f.write_str(name)
    }
}

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Seconds since the Unix epoch
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
