//! Shared domain types for the tipwatch status-tracking SDK.
//!
//! - Watch keys scoping one tracked operation
//! - Transaction, relay and balance status snapshots
//! - The SDK-wide error type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// 0x-prefixed hex string (e.g. "0x1234...").
pub type Hex = String;

/// EVM-style numeric chain id.
pub type ChainId = u64;

/// Tipwatch SDK error types.
///
/// `Clone` so that one terminal result can be handed to every caller
/// sharing a single in-flight watch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TipwatchError {
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("bridge api error: {0}")]
    Api(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("watch cancelled: {0}")]
    Cancelled(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl TipwatchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TipwatchError::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TipwatchError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, TipwatchError>;

/// Lowercase a hex hash or address and make sure it carries the `0x` prefix.
pub fn normalize_hex(value: &str) -> Hex {
    let trimmed = value.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Key for balance reads and the balance cache: `(chain, address, token)`.
///
/// `token == None` means the chain's native currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub chain_id: ChainId,
    pub address: Hex,
    pub token: Option<Hex>,
}

impl BalanceKey {
    pub fn new(address: &str, chain_id: ChainId, token: Option<&str>) -> Self {
        Self {
            chain_id,
            address: normalize_hex(address),
            token: token.map(normalize_hex),
        }
    }
}

impl fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.chain_id,
            self.address,
            self.token.as_deref().unwrap_or("native")
        )
    }
}

/// Composite identifier scoping exactly one tracked operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchKey {
    Transaction { chain_id: ChainId, tx_hash: Hex },
    Relay { relay_id: String },
    Balance(BalanceKey),
}

impl WatchKey {
    pub fn transaction(tx_hash: &str, chain_id: ChainId) -> Self {
        WatchKey::Transaction {
            chain_id,
            tx_hash: normalize_hex(tx_hash),
        }
    }

    pub fn relay(relay_id: &str) -> Self {
        WatchKey::Relay {
            relay_id: relay_id.to_string(),
        }
    }

    pub fn balance(address: &str, chain_id: ChainId, token: Option<&str>) -> Self {
        WatchKey::Balance(BalanceKey::new(address, chain_id, token))
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKey::Transaction { chain_id, tx_hash } => write!(f, "tx:{}:{}", chain_id, tx_hash),
            WatchKey::Relay { relay_id } => write!(f, "relay:{}", relay_id),
            WatchKey::Balance(key) => write!(f, "balance:{}", key),
        }
    }
}

/// Status of an on-chain transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
    Dropped,
    Replaced,
    NotFound,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Confirmed | TransactionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Dropped => "dropped",
            TransactionStatus::Replaced => "replaced",
            TransactionStatus::NotFound => "not_found",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution outcome recorded in a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

/// Receipt snapshot. Never mutated once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: Hex,
    pub block_number: u64,
    pub block_hash: Hex,
    pub gas_used: String,
    pub effective_gas_price: String,
    pub status: ExecutionStatus,
    pub confirmations: u64,
    /// Unix milliseconds of the block that included the transaction, when
    /// the source could read it.
    pub block_timestamp: Option<u64>,
    /// Unix milliseconds at which the receipt was observed.
    pub timestamp: u64,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// When the transaction settled: block time, else observation time.
    pub fn settled_at(&self) -> u64 {
        self.block_timestamp.unwrap_or(self.timestamp)
    }
}

/// One update emitted by a transaction watch. The last one is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatusUpdate {
    pub tx_hash: Hex,
    pub chain_id: ChainId,
    pub status: TransactionStatus,
    pub receipt: Option<TransactionReceipt>,
    pub confirmations: u64,
    pub retries: u32,
    pub error: Option<String>,
    pub timestamp: u64,
}

/// Lifecycle of a cross-chain relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Initiated,
    Pending,
    Relaying,
    Completed,
    Failed,
}

impl RelayStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayStatus::Completed | RelayStatus::Failed)
    }

    /// Map a bridging vendor's status string onto the relay lifecycle.
    pub fn from_vendor(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "pending" => RelayStatus::Pending,
            "processing" | "bridging" => RelayStatus::Relaying,
            "completed" | "success" => RelayStatus::Completed,
            "failed" | "error" => RelayStatus::Failed,
            _ => RelayStatus::Initiated,
        }
    }

    /// Progress reported for this status when the source gives none.
    pub fn default_progress(&self) -> u8 {
        match self {
            RelayStatus::Initiated => 10,
            RelayStatus::Pending => 25,
            RelayStatus::Relaying => 50,
            RelayStatus::Completed => 100,
            RelayStatus::Failed => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStatus::Initiated => "initiated",
            RelayStatus::Pending => "pending",
            RelayStatus::Relaying => "relaying",
            RelayStatus::Completed => "completed",
            RelayStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory view of one relay. Not a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub relay_id: String,
    pub source_chain_id: ChainId,
    pub destination_chain_id: ChainId,
    pub source_tx_hash: Hex,
    pub destination_tx_hash: Option<Hex>,
    pub status: RelayStatus,
    /// 0..=100
    pub progress: u8,
    pub estimated_completion: Option<u64>,
    pub actual_completion: Option<u64>,
    pub source_amount: Option<String>,
    pub destination_amount: Option<String>,
    pub token_symbol: Option<String>,
    pub error: Option<String>,
}

impl RelayRecord {
    pub fn new(
        relay_id: &str,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        source_tx_hash: &str,
        status: RelayStatus,
        progress: u8,
    ) -> Self {
        Self {
            relay_id: relay_id.to_string(),
            source_chain_id,
            destination_chain_id,
            source_tx_hash: normalize_hex(source_tx_hash),
            destination_tx_hash: None,
            status,
            progress: progress.min(100),
            estimated_completion: None,
            actual_completion: None,
            source_amount: None,
            destination_amount: None,
            token_symbol: None,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A balance observation. `token == None` means native currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub address: Hex,
    pub token: Option<Hex>,
    /// Decimal string in base units.
    pub balance: String,
    pub previous_balance: Option<String>,
    pub chain_id: ChainId,
    pub timestamp: u64,
}

/// Cached balance plus the unix-ms time it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCacheEntry {
    pub balance: String,
    pub timestamp: u64,
}

/// Bridging vendor's own view of a relay, before mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatusRecord {
    pub relay_id: String,
    pub status: String,
    pub progress: Option<u8>,
    pub destination_tx_hash: Option<Hex>,
    pub source_amount: Option<String>,
    pub destination_amount: Option<String>,
    pub token_symbol: Option<String>,
    pub estimated_completion: Option<u64>,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
}
