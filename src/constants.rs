//! Ledger constants

/// Prefix carried by every textual address
pub const ADDRESS_PREFIX: &str = "0x";

/// Bytes of the double-SHA-256 public key hash kept in an address
pub const ADDRESS_HASH_LEN: usize = 20;

/// Bytes of checksum appended to the address hash
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Hex characters in an address body: hex(hash20 || checksum4)
pub const ADDRESS_HEX_LEN: usize = (ADDRESS_HASH_LEN + ADDRESS_CHECKSUM_LEN) * 2;

/// Total address length including the `0x` prefix
pub const ADDRESS_LEN: usize = ADDRESS_PREFIX.len() + ADDRESS_HEX_LEN;

/// Uncompressed SEC1 public key length: 0x04 || X || Y
pub const PUBLIC_KEY_LEN: usize = 65;

/// Hex characters in a transaction id or block hash
pub const HASH_HEX_LEN: usize = 64;

/// Fixed overhead of a serialized transaction (size estimate)
pub const TX_BASE_SIZE: usize = 10;

/// Estimated bytes per input: prev id, index, DER signature, public key
pub const TX_INPUT_SIZE: usize = 180;

/// Estimated bytes per output: address and amount
pub const TX_OUTPUT_SIZE: usize = 34;

/// Mempool: maximum number of transactions
pub const DEFAULT_MEMPOOL_MAX_SIZE: usize = 5000;

/// Mempool: maximum age of an entry, in seconds (24h)
pub const DEFAULT_MEMPOOL_MAX_AGE: u64 = 24 * 60 * 60;

/// Mempool: minimum fee per estimated byte
pub const DEFAULT_MIN_FEE_RATE: f64 = 1e-5;

/// Mempool: maximum estimated transaction size in bytes
pub const DEFAULT_MAX_TX_SIZE: usize = 100_000;

/// Mempool: seconds between age-based cleanups (10min)
pub const DEFAULT_CLEANUP_INTERVAL: u64 = 10 * 60;

/// Scale applied to the fee rate when computing mempool priority
pub const PRIORITY_FEE_SCALE: f64 = 1e8;

/// Default proof-of-work difficulty in leading hex zeros
pub const DEFAULT_DIFFICULTY: u32 = 2;

/// A SHA-256 hash has 64 hex nibbles
pub const MAX_DIFFICULTY: u32 = 64;

/// Default cap on transactions drawn from the mempool per block
pub const DEFAULT_MAX_BLOCK_TRANSACTIONS: usize = 1000;

/// Default cap on estimated bytes drawn from the mempool per block
pub const DEFAULT_MAX_BLOCK_BYTES: usize = 1_000_000;

/// Reward paid for every mined block regardless of difficulty
pub const BASE_BLOCK_REWARD: f64 = 50.0;

/// Additional reward per unit of difficulty
pub const REWARD_PER_DIFFICULTY: f64 = 5.0;

/// Payload of the genesis block
pub const GENESIS_DATA: &str = "Genesis Block";

/// Timestamp of the genesis block (2023-11-14T22:13:20Z)
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// Schema version recorded by the durable store
pub const SCHEMA_VERSION: &str = "1";

/// Length of the random salt used by wallet key derivation
pub const WALLET_SALT_LEN: usize = 16;

/// AES-GCM nonce length
pub const WALLET_NONCE_LEN: usize = 12;

/// Tolerance for floating-point amount comparisons
pub const AMOUNT_EPSILON: f64 = 1e-9;
