//! JSON-RPC client for EVM chains.
//!
//! Methods used:
//! - eth_getTransactionReceipt / eth_blockNumber (receipt + confirmations)
//! - eth_getBlockByNumber (block time of a receipt)
//! - eth_getTransactionByHash (mempool presence)
//! - eth_getBalance (native balance)
//! - eth_call balanceOf(address) (ERC-20 balance)

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tipwatch_types::{
    normalize_hex, now_millis, ChainId, ExecutionStatus, Hex, Result, TipwatchError,
    TransactionReceipt,
};
use tracing::{debug, warn};

use crate::{BalanceSource, ReceiptSource};

/// `balanceOf(address)` selector.
const BALANCE_OF_SELECTOR: &str = "70a08231";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Receipt as returned by the node, all quantities hex-encoded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: Hex,
    block_number: Option<Hex>,
    block_hash: Option<Hex>,
    gas_used: Hex,
    effective_gas_price: Option<Hex>,
    status: Option<Hex>,
}

/// Block header fields we read.
#[derive(Debug, Clone, Deserialize)]
struct RawBlock {
    timestamp: Hex,
}

/// Multi-chain JSON-RPC client, one endpoint per chain id.
pub struct JsonRpcClient {
    endpoints: HashMap<ChainId, String>,
    client: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(endpoints: HashMap<ChainId, String>, timeout_ms: Option<u64>) -> Self {
        let timeout_ms = timeout_ms.unwrap_or(15_000);
        Self {
            endpoints,
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            timeout: Duration::from_millis(timeout_ms),
            next_id: AtomicU64::new(1),
        }
    }

    fn endpoint(&self, chain_id: ChainId) -> Result<&str> {
        self.endpoints
            .get(&chain_id)
            .map(String::as_str)
            .ok_or_else(|| TipwatchError::Config(format!("no rpc endpoint for chain {}", chain_id)))
    }

    /// Issue one JSON-RPC call. A JSON `null` result is returned as `None`.
    async fn call<T: DeserializeOwned>(
        &self,
        chain_id: ChainId,
        method: &str,
        params: Value,
    ) -> Result<Option<T>> {
        let url = self.endpoint(chain_id)?;
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let resp = self
            .client
            .post(url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TipwatchError::Rpc(format!("{} request failed: {}", method, e)))?;

        if !resp.status().is_success() {
            return Err(TipwatchError::Rpc(format!(
                "{} returned status {}",
                method,
                resp.status()
            )));
        }

        let body: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| TipwatchError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(err) = body.error {
            return Err(TipwatchError::Rpc(format!(
                "{} failed with code {}: {}",
                method, err.code, err.message
            )));
        }

        Ok(body.result)
    }

    async fn block_number(&self, chain_id: ChainId) -> Result<u64> {
        let hex: Hex = self
            .call(chain_id, "eth_blockNumber", json!([]))
            .await?
            .ok_or_else(|| TipwatchError::InvalidResponse("empty eth_blockNumber".into()))?;
        parse_quantity(&hex)
    }

    /// Unix ms of block `number`.
    async fn block_time(&self, chain_id: ChainId, number: u64) -> Result<u64> {
        let block: RawBlock = self
            .call(
                chain_id,
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", number), false]),
            )
            .await?
            .ok_or_else(|| TipwatchError::InvalidResponse(format!("no block {}", number)))?;
        block_time_millis(&block.timestamp)
    }
}

#[async_trait]
impl ReceiptSource for JsonRpcClient {
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
    ) -> Result<Option<TransactionReceipt>> {
        let raw: Option<RawReceipt> = self
            .call(chain_id, "eth_getTransactionReceipt", json!([normalize_hex(tx_hash)]))
            .await?;

        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(None),
        };
        // Pending receipts (some nodes) have no block yet.
        let (block_number, block_hash) = match (raw.block_number, raw.block_hash) {
            (Some(n), Some(h)) => (parse_quantity(&n)?, h),
            _ => return Ok(None),
        };

        let latest = self.block_number(chain_id).await?;
        let confirmations = latest.saturating_sub(block_number) + 1;
        let block_timestamp = match self.block_time(chain_id, block_number).await {
            Ok(ms) => Some(ms),
            Err(e) => {
                warn!("block {} time on chain {} unavailable: {}", block_number, chain_id, e);
                None
            }
        };
        debug!(
            "receipt for {} on chain {}: block {}, {} confirmations",
            tx_hash, chain_id, block_number, confirmations
        );

        Ok(Some(TransactionReceipt {
            transaction_hash: normalize_hex(&raw.transaction_hash),
            block_number,
            block_hash,
            gas_used: quantity_to_decimal(&raw.gas_used)?,
            effective_gas_price: match raw.effective_gas_price {
                Some(price) => quantity_to_decimal(&price)?,
                None => "0".to_string(),
            },
            status: match raw.status.as_deref() {
                Some("0x0") => ExecutionStatus::Failure,
                _ => ExecutionStatus::Success,
            },
            confirmations,
            block_timestamp,
            timestamp: now_millis(),
        }))
    }

    async fn get_transaction_by_hash(&self, tx_hash: &str, chain_id: ChainId) -> Result<bool> {
        let tx: Option<Value> = self
            .call(chain_id, "eth_getTransactionByHash", json!([normalize_hex(tx_hash)]))
            .await?;
        Ok(tx.is_some())
    }
}

#[async_trait]
impl BalanceSource for JsonRpcClient {
    async fn get_native_balance(&self, address: &str, chain_id: ChainId) -> Result<String> {
        let hex: Hex = self
            .call(chain_id, "eth_getBalance", json!([normalize_hex(address), "latest"]))
            .await?
            .ok_or_else(|| TipwatchError::InvalidResponse("empty eth_getBalance".into()))?;
        quantity_to_decimal(&hex)
    }

    async fn get_token_balance(
        &self,
        address: &str,
        token_address: &str,
        chain_id: ChainId,
    ) -> Result<String> {
        let call = json!({
            "to": normalize_hex(token_address),
            "data": balance_of_calldata(address)?,
        });
        let hex: Hex = self
            .call(chain_id, "eth_call", json!([call, "latest"]))
            .await?
            .ok_or_else(|| TipwatchError::InvalidResponse("empty eth_call".into()))?;
        quantity_to_decimal(&hex)
    }
}

/// ABI-encode `balanceOf(address)`.
fn balance_of_calldata(address: &str) -> Result<Hex> {
    let body = normalize_hex(address);
    let bytes = hex::decode(&body[2..])
        .map_err(|e| TipwatchError::Other(format!("invalid address {}: {}", address, e)))?;
    if bytes.len() != 20 {
        return Err(TipwatchError::Other(format!("invalid address length: {}", address)));
    }
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&bytes);
    Ok(format!("0x{}{}", BALANCE_OF_SELECTOR, hex::encode(word)))
}

/// Parse a hex quantity that must fit in a u64 (block numbers).
fn parse_quantity(value: &str) -> Result<u64> {
    let body = value.strip_prefix("0x").unwrap_or(value);
    if body.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(body, 16)
        .map_err(|e| TipwatchError::InvalidResponse(format!("bad quantity {}: {}", value, e)))
}

/// Block timestamps are hex seconds.
fn block_time_millis(value: &str) -> Result<u64> {
    Ok(parse_quantity(value)?.saturating_mul(1_000))
}

/// Convert an arbitrary-width hex quantity (up to uint256 and beyond) to a
/// decimal string.
fn quantity_to_decimal(value: &str) -> Result<String> {
    let body = value.strip_prefix("0x").unwrap_or(value);
    let padded = if body.len() % 2 == 1 {
        format!("0{}", body)
    } else {
        body.to_string()
    };
    let bytes = hex::decode(&padded)
        .map_err(|e| TipwatchError::InvalidResponse(format!("bad quantity {}: {}", value, e)))?;

    // Little-endian base-1e9 limbs.
    let mut limbs: Vec<u32> = Vec::new();
    for byte in bytes {
        let mut carry = byte as u64;
        for limb in limbs.iter_mut() {
            let v = (*limb as u64) * 256 + carry;
            *limb = (v % 1_000_000_000) as u32;
            carry = v / 1_000_000_000;
        }
        while carry > 0 {
            limbs.push((carry % 1_000_000_000) as u32);
            carry /= 1_000_000_000;
        }
    }

    let mut out = match limbs.last() {
        Some(top) => top.to_string(),
        None => return Ok("0".to_string()),
    };
    for limb in limbs.iter().rev().skip(1) {
        out.push_str(&format!("{:09}", limb));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_to_decimal() {
        assert_eq!(quantity_to_decimal("0x0").unwrap(), "0");
        assert_eq!(quantity_to_decimal("0x").unwrap(), "0");
        assert_eq!(quantity_to_decimal("0x5208").unwrap(), "21000");
        assert_eq!(
            quantity_to_decimal("0xde0b6b3a7640000").unwrap(),
            "1000000000000000000"
        );
        // 2^128
        assert_eq!(
            quantity_to_decimal("0x100000000000000000000000000000000").unwrap(),
            "340282366920938463463374607431768211456"
        );
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_block_time_is_millis() {
        assert_eq!(block_time_millis("0x6553f100").unwrap(), 1_700_000_000_000);
        assert!(block_time_millis("0xnope").is_err());
    }

    #[test]
    fn test_balance_of_calldata() {
        let data = balance_of_calldata("0x00000000000000000000000000000000000000AB").unwrap();
        assert!(data.starts_with("0x70a08231"));
        assert_eq!(data.len(), 2 + 8 + 64);
        assert!(data.ends_with("ab"));
        assert!(balance_of_calldata("0x1234").is_err());
    }

    #[test]
    fn test_missing_endpoint_is_config_error() {
        let client = JsonRpcClient::new(HashMap::new(), None);
        assert!(matches!(client.endpoint(10), Err(TipwatchError::Config(_))));
    }
}
