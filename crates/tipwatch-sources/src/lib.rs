//! External data sources consumed by the watchers.
//!
//! Defines the collaborator traits every backend must implement:
//! - `ReceiptSource`: receipts and mempool presence per chain
//! - `BalanceSource`: native and token balances per chain
//! - `BridgeStatusApi`: the bridging vendor's relay status
//! - `DestinationResolver`: best-effort destination-tx discovery
//!
//! Provides HTTP backends (`rpc_client`, `bridge_client`) and scripted
//! in-memory backends (`memory`) for testing.

use async_trait::async_trait;
use tipwatch_types::{BridgeStatusRecord, ChainId, Hex, Result, TransactionReceipt};

pub mod bridge_client;
pub mod memory;
pub mod rpc_client;

pub use bridge_client::BridgeApiClient;
pub use rpc_client::JsonRpcClient;

/// Chain receipt reads.
///
/// Errors are transient from the watchers' point of view: they retry.
#[async_trait]
pub trait ReceiptSource: Send + Sync {
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
    ) -> Result<Option<TransactionReceipt>>;

    /// Whether the node knows the transaction at all (mined or in mempool).
    async fn get_transaction_by_hash(&self, tx_hash: &str, chain_id: ChainId) -> Result<bool>;
}

/// Balance reads. Values are decimal strings in base units.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn get_native_balance(&self, address: &str, chain_id: ChainId) -> Result<String>;

    async fn get_token_balance(
        &self,
        address: &str,
        token_address: &str,
        chain_id: ChainId,
    ) -> Result<String>;

    /// Dispatch on `token`: `None` reads the native balance.
    async fn get_balance(
        &self,
        address: &str,
        token_address: Option<&str>,
        chain_id: ChainId,
    ) -> Result<String> {
        match token_address {
            Some(token) => self.get_token_balance(address, token, chain_id).await,
            None => self.get_native_balance(address, chain_id).await,
        }
    }
}

/// Authoritative relay status from the bridging vendor. Optional.
#[async_trait]
pub trait BridgeStatusApi: Send + Sync {
    async fn get_status(&self, relay_id: &str) -> Result<Option<BridgeStatusRecord>>;
}

/// Locates the destination-chain transaction of a relay.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn find_destination_transaction(
        &self,
        source_tx_hash: &str,
        destination_chain_id: ChainId,
        relay_id: &str,
    ) -> Result<Option<Hex>>;
}

/// Resolver that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDestinationResolver;

#[async_trait]
impl DestinationResolver for NoDestinationResolver {
    async fn find_destination_transaction(
        &self,
        _source_tx_hash: &str,
        _destination_chain_id: ChainId,
        _relay_id: &str,
    ) -> Result<Option<Hex>> {
        Ok(None)
    }
}
