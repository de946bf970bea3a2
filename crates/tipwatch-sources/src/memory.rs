//! Scripted in-memory sources (for testing and ephemeral use).
//!
//! Each scripted key holds a queue of responses. Reads pop the front until
//! one response is left, which then repeats forever.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::*;
use tipwatch_types::{
    normalize_hex, now_millis, BalanceKey, BridgeStatusRecord, ChainId, ExecutionStatus, Hex,
    Result, TipwatchError, TransactionReceipt,
};

fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

fn take_failure(pending: &AtomicU32) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Build a receipt with placeholder block data, mined and observed now.
pub fn mock_receipt(tx_hash: &str, success: bool, confirmations: u64) -> TransactionReceipt {
    let now = now_millis();
    TransactionReceipt {
        transaction_hash: normalize_hex(tx_hash),
        block_number: 100,
        block_hash: format!("0x{}", "b".repeat(64)),
        gas_used: "21000".into(),
        effective_gas_price: "1000000000".into(),
        status: if success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        },
        confirmations,
        block_timestamp: Some(now),
        timestamp: now,
    }
}

/// In-memory receipt source.
pub struct MemoryReceiptSource {
    receipts: Mutex<HashMap<(ChainId, Hex), VecDeque<Option<TransactionReceipt>>>>,
    known: Mutex<HashSet<(ChainId, Hex)>>,
    failures: AtomicU32,
    receipt_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
}

impl MemoryReceiptSource {
    pub fn new() -> Self {
        Self {
            receipts: Mutex::new(HashMap::new()),
            known: Mutex::new(HashSet::new()),
            failures: AtomicU32::new(0),
            receipt_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
        }
    }

    /// Always return `receipt` for this transaction.
    pub fn set_receipt(&self, chain_id: ChainId, tx_hash: &str, receipt: TransactionReceipt) {
        self.script_receipts(chain_id, tx_hash, vec![Some(receipt)]);
    }

    /// Return the scripted responses in order; the last one repeats.
    pub fn script_receipts(
        &self,
        chain_id: ChainId,
        tx_hash: &str,
        responses: Vec<Option<TransactionReceipt>>,
    ) {
        let mut receipts = self.receipts.lock().unwrap();
        receipts.insert((chain_id, normalize_hex(tx_hash)), responses.into());
    }

    /// Mark a transaction as present in the mempool.
    pub fn add_pending(&self, chain_id: ChainId, tx_hash: &str) {
        let mut known = self.known.lock().unwrap();
        known.insert((chain_id, normalize_hex(tx_hash)));
    }

    /// Make the next `n` reads of any kind fail with an RPC error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn receipt_calls(&self) -> usize {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryReceiptSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReceiptSource for MemoryReceiptSource {
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
    ) -> Result<Option<TransactionReceipt>> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(TipwatchError::Rpc("scripted receipt failure".into()));
        }
        let mut receipts = self.receipts.lock().unwrap();
        Ok(receipts
            .get_mut(&(chain_id, normalize_hex(tx_hash)))
            .and_then(next_scripted)
            .flatten())
    }

    async fn get_transaction_by_hash(&self, tx_hash: &str, chain_id: ChainId) -> Result<bool> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(TipwatchError::Rpc("scripted lookup failure".into()));
        }
        let known = self.known.lock().unwrap();
        Ok(known.contains(&(chain_id, normalize_hex(tx_hash))))
    }
}

/// In-memory balance source. Unscripted keys read as "0".
pub struct MemoryBalanceSource {
    balances: Mutex<HashMap<BalanceKey, VecDeque<String>>>,
    failures: AtomicU32,
    calls: AtomicUsize,
}

impl MemoryBalanceSource {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_balance(&self, address: &str, chain_id: ChainId, token: Option<&str>, balance: &str) {
        self.script_balances(address, chain_id, token, vec![balance]);
    }

    /// Return the scripted balances in order; the last one repeats.
    pub fn script_balances(
        &self,
        address: &str,
        chain_id: ChainId,
        token: Option<&str>,
        balances: Vec<&str>,
    ) {
        let mut store = self.balances.lock().unwrap();
        store.insert(
            BalanceKey::new(address, chain_id, token),
            balances.into_iter().map(String::from).collect(),
        );
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn read(&self, key: BalanceKey) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(TipwatchError::Rpc(format!("scripted balance failure for {}", key)));
        }
        let mut store = self.balances.lock().unwrap();
        Ok(store
            .get_mut(&key)
            .and_then(next_scripted)
            .unwrap_or_else(|| "0".to_string()))
    }
}

impl Default for MemoryBalanceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceSource for MemoryBalanceSource {
    async fn get_native_balance(&self, address: &str, chain_id: ChainId) -> Result<String> {
        self.read(BalanceKey::new(address, chain_id, None))
    }

    async fn get_token_balance(
        &self,
        address: &str,
        token_address: &str,
        chain_id: ChainId,
    ) -> Result<String> {
        self.read(BalanceKey::new(address, chain_id, Some(token_address)))
    }
}

/// In-memory bridging API. Unknown relays are absent.
pub struct MemoryBridgeApi {
    records: Mutex<HashMap<String, BridgeStatusRecord>>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryBridgeApi {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_status(&self, record: BridgeStatusRecord) {
        let mut records = self.records.lock().unwrap();
        records.insert(record.relay_id.clone(), record);
    }

    /// While unavailable every call errors.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBridgeApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BridgeStatusApi for MemoryBridgeApi {
    async fn get_status(&self, relay_id: &str) -> Result<Option<BridgeStatusRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TipwatchError::Api("bridge api unavailable".into()));
        }
        let records = self.records.lock().unwrap();
        Ok(records.get(relay_id).cloned())
    }
}

/// In-memory destination resolver keyed by relay id.
pub struct MemoryDestinationResolver {
    destinations: Mutex<HashMap<String, Hex>>,
    calls: AtomicUsize,
}

impl MemoryDestinationResolver {
    pub fn new() -> Self {
        Self {
            destinations: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_destination(&self, relay_id: &str, tx_hash: &str) {
        let mut destinations = self.destinations.lock().unwrap();
        destinations.insert(relay_id.to_string(), normalize_hex(tx_hash));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryDestinationResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DestinationResolver for MemoryDestinationResolver {
    async fn find_destination_transaction(
        &self,
        _source_tx_hash: &str,
        _destination_chain_id: ChainId,
        relay_id: &str,
    ) -> Result<Option<Hex>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let destinations = self.destinations.lock().unwrap();
        Ok(destinations.get(relay_id).cloned())
    }
}
