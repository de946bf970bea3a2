//! Transaction watcher: polls a chain's receipt source until a transaction
//! is confirmed, fails, or a retry/timeout budget runs out.
//!
//! - One poll loop per `(chain, tx_hash)`; repeat callers share its result
//! - Transient read errors consume one retry and never reach the caller
//! - The deadline is checked before every read and wins over retries

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tipwatch_flight::{
    CancellationToken, Clock, Listener, Listeners, PollSchedule, SharedResult, SingleFlight, Stop,
    SystemClock,
};
use tipwatch_sources::ReceiptSource;
use tipwatch_types::{
    normalize_hex, ChainId, Hex, Result, TipwatchError, TransactionReceipt, TransactionStatus,
    TransactionStatusUpdate, WatchKey,
};
use tracing::{debug, info, warn};

/// Callback receiving every update of a transaction watch.
pub type TransactionUpdateHandler = Listener<TransactionStatusUpdate>;

/// Per-watch options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Re-polls allowed before giving up on a missing or shallow receipt.
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    /// Wall-clock budget for the whole watch.
    pub timeout_ms: u64,
    pub confirmations_required: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            max_retries: 100,
            retry_interval_ms: 3_000,
            timeout_ms: 300_000,
            confirmations_required: 1,
        }
    }
}

impl WatchOptions {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

struct Inner {
    source: Arc<dyn ReceiptSource>,
    clock: Arc<dyn Clock>,
    defaults: WatchOptions,
    flights: SingleFlight<WatchKey, TransactionStatusUpdate, TransactionStatusUpdate>,
}

/// Watches transactions across chains.
///
/// Cheap to clone; clones share the same registry of running watches.
#[derive(Clone)]
pub struct TransactionWatcher {
    inner: Arc<Inner>,
}

impl TransactionWatcher {
    pub fn new(source: Arc<dyn ReceiptSource>) -> Self {
        Self::with_options(source, WatchOptions::default(), Arc::new(SystemClock))
    }

    pub fn with_options(
        source: Arc<dyn ReceiptSource>,
        defaults: WatchOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                clock,
                defaults,
                flights: SingleFlight::new(),
            }),
        }
    }

    pub fn defaults(&self) -> &WatchOptions {
        &self.inner.defaults
    }

    /// Watch until terminal. Resolves to a `confirmed` or `failed` update;
    /// errors only on cancellation.
    pub async fn watch(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
        options: Option<WatchOptions>,
    ) -> Result<TransactionStatusUpdate> {
        self.watch_shared(tx_hash, chain_id, options).await
    }

    /// The shared result handle of the watch for this transaction, starting
    /// one if none is running. Every handle for the same key resolves to
    /// the same update.
    ///
    /// `options` only apply when this call starts the watch.
    pub fn watch_shared(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
        options: Option<WatchOptions>,
    ) -> SharedResult<TransactionStatusUpdate> {
        self.join(tx_hash, chain_id, options, None)
    }

    /// Like `watch`, also invoking `on_update` with an interim `pending`
    /// update before every re-poll and once with the terminal update.
    pub async fn watch_with_progress(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
        on_update: TransactionUpdateHandler,
        options: Option<WatchOptions>,
    ) -> Result<TransactionStatusUpdate> {
        self.join(tx_hash, chain_id, options, Some(on_update)).await
    }

    fn join(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
        options: Option<WatchOptions>,
        on_update: Option<TransactionUpdateHandler>,
    ) -> SharedResult<TransactionStatusUpdate> {
        let key = WatchKey::transaction(tx_hash, chain_id);
        let tx_hash = normalize_hex(tx_hash);
        let options = options.unwrap_or_else(|| self.inner.defaults.clone());
        let inner = Arc::clone(&self.inner);
        let mut pending_handler = on_update;

        let joined = self.inner.flights.get_or_start(key, |token, listeners| {
            // Registered before the loop is spawned so no update is missed.
            if let Some(handler) = pending_handler.take() {
                listeners.add(handler);
            }
            run_watch(inner, tx_hash, chain_id, options, token, listeners)
        });
        if let Some(handler) = pending_handler {
            joined.listeners.add(handler);
        }
        joined.result
    }

    /// Single receipt read.
    pub async fn get_receipt(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
    ) -> Result<Option<TransactionReceipt>> {
        self.inner
            .source
            .get_transaction_receipt(&normalize_hex(tx_hash), chain_id)
            .await
    }

    /// Single-shot status: receipt first, then mempool presence.
    pub async fn get_status(&self, tx_hash: &str, chain_id: ChainId) -> Result<TransactionStatus> {
        let (status, _) = self.get_status_and_receipt(tx_hash, chain_id).await?;
        Ok(status)
    }

    /// `get_status` plus the receipt it was derived from, if any.
    pub async fn get_status_and_receipt(
        &self,
        tx_hash: &str,
        chain_id: ChainId,
    ) -> Result<(TransactionStatus, Option<TransactionReceipt>)> {
        let tx_hash = normalize_hex(tx_hash);
        let required = self.inner.defaults.confirmations_required.max(1);
        match self.inner.source.get_transaction_receipt(&tx_hash, chain_id).await? {
            Some(receipt) => {
                let status = if receipt.confirmations < required {
                    TransactionStatus::Pending
                } else if receipt.succeeded() {
                    TransactionStatus::Confirmed
                } else {
                    TransactionStatus::Failed
                };
                Ok((status, Some(receipt)))
            }
            None => {
                if self.inner.source.get_transaction_by_hash(&tx_hash, chain_id).await? {
                    Ok((TransactionStatus::Pending, None))
                } else {
                    Ok((TransactionStatus::NotFound, None))
                }
            }
        }
    }

    /// Cancel the watch for this transaction. Its result fails with a
    /// cancellation error.
    pub fn cancel(&self, tx_hash: &str, chain_id: ChainId) -> bool {
        let cancelled = self.inner.flights.cancel(&WatchKey::transaction(tx_hash, chain_id));
        if cancelled {
            info!("cancelled watch for {} on chain {}", tx_hash, chain_id);
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let cancelled = self.inner.flights.cancel_all();
        if cancelled > 0 {
            info!("cancelled {} transaction watches", cancelled);
        }
        cancelled
    }

    pub fn is_watching(&self, tx_hash: &str, chain_id: ChainId) -> bool {
        self.inner.flights.contains(&WatchKey::transaction(tx_hash, chain_id))
    }

    pub fn active_count(&self) -> usize {
        self.inner.flights.len()
    }
}

impl std::fmt::Debug for TransactionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionWatcher")
            .field("defaults", &self.inner.defaults)
            .field("active", &self.inner.flights.len())
            .finish()
    }
}

/// State threaded through one poll loop.
struct WatchRun {
    inner: Arc<Inner>,
    tx_hash: Hex,
    chain_id: ChainId,
    listeners: Listeners<TransactionStatusUpdate>,
    /// Retry waits entered, including one cut short by the deadline.
    retries: u32,
}

impl WatchRun {
    fn update(
        &self,
        status: TransactionStatus,
        receipt: Option<TransactionReceipt>,
        error: Option<String>,
    ) -> TransactionStatusUpdate {
        TransactionStatusUpdate {
            tx_hash: self.tx_hash.clone(),
            chain_id: self.chain_id,
            status,
            confirmations: receipt.as_ref().map_or(0, |r| r.confirmations),
            receipt,
            retries: self.retries,
            error,
            timestamp: self.inner.clock.now_millis(),
        }
    }

    fn emit(&self, update: TransactionStatusUpdate) -> TransactionStatusUpdate {
        self.listeners.notify(&update);
        update
    }

    fn fail(&self, receipt: Option<TransactionReceipt>, reason: String) -> TransactionStatusUpdate {
        info!("tx {} on chain {} failed: {}", self.tx_hash, self.chain_id, reason);
        self.emit(self.update(TransactionStatus::Failed, receipt, Some(reason)))
    }
}

async fn run_watch(
    inner: Arc<Inner>,
    tx_hash: Hex,
    chain_id: ChainId,
    options: WatchOptions,
    token: CancellationToken,
    listeners: Listeners<TransactionStatusUpdate>,
) -> Result<TransactionStatusUpdate> {
    let mut schedule = PollSchedule::new(token, options.retry_interval(), Some(options.timeout()));
    let mut run = WatchRun {
        inner,
        tx_hash,
        chain_id,
        listeners,
        retries: 0,
    };

    loop {
        match schedule.begin_tick() {
            Ok(()) => {}
            Err(Stop::Cancelled) => {
                run.fail(None, "cancelled".to_string());
                return Err(TipwatchError::Cancelled(format!(
                    "watch for {} on chain {}",
                    run.tx_hash, run.chain_id
                )));
            }
            Err(Stop::Deadline) => {
                return Ok(run.fail(
                    None,
                    format!("timeout after {}ms waiting for confirmation", options.timeout_ms),
                ));
            }
        }

        debug!(
            "tick {} for {} on chain {} ({:?})",
            schedule.ticks(),
            run.tx_hash,
            run.chain_id,
            schedule.state()
        );

        let receipt = match run
            .inner
            .source
            .get_transaction_receipt(&run.tx_hash, run.chain_id)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    "receipt read for {} on chain {} failed (attempt {}): {}",
                    run.tx_hash,
                    run.chain_id,
                    schedule.ticks(),
                    e
                );
                None
            }
        };

        if let Some(ref r) = receipt {
            if r.confirmations >= options.confirmations_required {
                schedule.finish();
                if r.succeeded() {
                    info!(
                        "tx {} on chain {} confirmed in block {}",
                        run.tx_hash, run.chain_id, r.block_number
                    );
                    return Ok(run.emit(run.update(TransactionStatus::Confirmed, receipt, None)));
                }
                return Ok(run.fail(receipt, "transaction reverted".to_string()));
            }
            debug!(
                "tx {} has {} of {} confirmations",
                run.tx_hash, r.confirmations, options.confirmations_required
            );
        }

        if run.retries >= options.max_retries {
            schedule.finish();
            let reason = match receipt {
                Some(ref r) => format!(
                    "only {} of {} confirmations after maximum retries ({} attempts)",
                    r.confirmations,
                    options.confirmations_required,
                    schedule.ticks()
                ),
                None => format!(
                    "transaction not found after maximum retries ({} attempts)",
                    schedule.ticks()
                ),
            };
            return Ok(run.fail(receipt, reason));
        }

        run.retries += 1;
        run.emit(run.update(TransactionStatus::Pending, receipt, None));
        // A cancelled sleep falls through to the next begin_tick.
        schedule.sleep().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tipwatch_sources::memory::{mock_receipt, MemoryReceiptSource};
    use tokio::time::Instant;

    const CHAIN: ChainId = 8453;
    const TX: &str = "0xabc123";

    fn watcher(source: Arc<MemoryReceiptSource>) -> TransactionWatcher {
        TransactionWatcher::new(source)
    }

    fn options(max_retries: u32, retry_interval_ms: u64, timeout_ms: u64) -> Option<WatchOptions> {
        Some(WatchOptions {
            max_retries,
            retry_interval_ms,
            timeout_ms,
            confirmations_required: 1,
        })
    }

    fn recorder() -> (TransactionUpdateHandler, Arc<Mutex<Vec<TransactionStatusUpdate>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: TransactionUpdateHandler = Arc::new(move |update: &TransactionStatusUpdate| {
            sink.lock().unwrap().push(update.clone());
        });
        (handler, seen)
    }

    #[test]
    fn test_default_options() {
        let options = WatchOptions::default();
        assert_eq!(options.max_retries, 100);
        assert_eq!(options.retry_interval(), Duration::from_secs(3));
        assert_eq!(options.timeout(), Duration::from_secs(300));
        assert_eq!(options.confirmations_required, 1);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: WatchOptions = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.retry_interval_ms, 3_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirms_on_second_attempt() {
        let source = Arc::new(MemoryReceiptSource::new());
        source.script_receipts(CHAIN, TX, vec![None, Some(mock_receipt(TX, true, 1))]);
        let watcher = watcher(source.clone());
        let (handler, seen) = recorder();

        let update = watcher
            .watch_with_progress(TX, CHAIN, handler, None)
            .await
            .unwrap();

        assert_eq!(update.status, TransactionStatus::Confirmed);
        assert!(update.receipt.is_some());
        assert_eq!(source.receipt_calls(), 2);

        let seen = seen.lock().unwrap();
        let statuses: Vec<_> = seen.iter().map(|u| u.status).collect();
        assert_eq!(statuses, vec![TransactionStatus::Pending, TransactionStatus::Confirmed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_max_retries() {
        let source = Arc::new(MemoryReceiptSource::new());
        let watcher = watcher(source.clone());

        let update = watcher.watch(TX, CHAIN, options(3, 1_000, 60_000)).await.unwrap();

        assert_eq!(update.status, TransactionStatus::Failed);
        assert_eq!(update.retries, 3);
        assert!(update.error.unwrap().contains("maximum retries"));
        // The initial read plus three retries.
        assert_eq!(source.receipt_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wins_over_retry_interval() {
        let source = Arc::new(MemoryReceiptSource::new());
        let watcher = watcher(source.clone());
        let started = Instant::now();

        let update = watcher.watch(TX, CHAIN, options(100, 2_000, 1_000)).await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed < Duration::from_millis(2_000));
        assert_eq!(update.status, TransactionStatus::Failed);
        assert!(update.error.unwrap().contains("timeout"));
        assert_eq!(source.receipt_calls(), 1);
        // The wait was charged before the deadline cut it short.
        assert_eq!(update.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_transaction_fails() {
        let source = Arc::new(MemoryReceiptSource::new());
        source.set_receipt(CHAIN, TX, mock_receipt(TX, false, 3));
        let watcher = watcher(source);

        let update = watcher.watch(TX, CHAIN, None).await.unwrap();
        assert_eq!(update.status, TransactionStatus::Failed);
        assert_eq!(update.error.as_deref(), Some("transaction reverted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_required_confirmations() {
        let source = Arc::new(MemoryReceiptSource::new());
        source.script_receipts(
            CHAIN,
            TX,
            vec![
                Some(mock_receipt(TX, true, 1)),
                Some(mock_receipt(TX, true, 2)),
                Some(mock_receipt(TX, true, 3)),
            ],
        );
        let watcher = watcher(source.clone());
        let mut opts = WatchOptions::default();
        opts.confirmations_required = 3;

        let update = watcher.watch(TX, CHAIN, Some(opts)).await.unwrap();
        assert_eq!(update.status, TransactionStatus::Confirmed);
        assert_eq!(update.confirmations, 3);
        assert_eq!(update.retries, 2);
        assert_eq!(source.receipt_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_consume_retries() {
        let source = Arc::new(MemoryReceiptSource::new());
        source.set_receipt(CHAIN, TX, mock_receipt(TX, true, 1));
        source.fail_next(2);
        let watcher = watcher(source.clone());

        let update = watcher.watch(TX, CHAIN, None).await.unwrap();
        assert_eq!(update.status, TransactionStatus::Confirmed);
        assert_eq!(update.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_watches_share_one_loop() {
        let source = Arc::new(MemoryReceiptSource::new());
        source.script_receipts(CHAIN, TX, vec![None, None, Some(mock_receipt(TX, true, 1))]);
        let watcher = watcher(source.clone());

        let first = watcher.watch_shared(TX, CHAIN, None);
        let second = watcher.watch_shared(&TX.to_uppercase().replace("0X", "0x"), CHAIN, None);
        assert_eq!(watcher.active_count(), 1);

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.receipt_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joining_caller_receives_progress() {
        let source = Arc::new(MemoryReceiptSource::new());
        source.script_receipts(CHAIN, TX, vec![None, None, Some(mock_receipt(TX, true, 1))]);
        let watcher = watcher(source);

        let first = watcher.watch_shared(TX, CHAIN, None);
        let (handler, seen) = recorder();
        let second = watcher.watch_with_progress(TX, CHAIN, handler, None);

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap().status, TransactionStatus::Confirmed);
        assert_eq!(b.unwrap().status, TransactionStatus::Confirmed);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().map(|u| u.status), Some(TransactionStatus::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_result_and_clears_registry() {
        let source = Arc::new(MemoryReceiptSource::new());
        let watcher = watcher(source);
        let (handler, seen) = recorder();

        let pending = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.watch_with_progress(TX, CHAIN, handler, None).await })
        };
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(watcher.is_watching(TX, CHAIN));

        assert!(watcher.cancel(TX, CHAIN));
        assert!(!watcher.is_watching(TX, CHAIN));

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(watcher.active_count(), 0);

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.status, TransactionStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_status_classification() {
        let source = Arc::new(MemoryReceiptSource::new());
        source.set_receipt(CHAIN, "0x01", mock_receipt("0x01", true, 5));
        source.set_receipt(CHAIN, "0x02", mock_receipt("0x02", false, 5));
        source.add_pending(CHAIN, "0x03");
        let watcher = watcher(source);

        assert_eq!(watcher.get_status("0x01", CHAIN).await.unwrap(), TransactionStatus::Confirmed);
        assert_eq!(watcher.get_status("0x02", CHAIN).await.unwrap(), TransactionStatus::Failed);
        assert_eq!(watcher.get_status("0x03", CHAIN).await.unwrap(), TransactionStatus::Pending);
        assert_eq!(watcher.get_status("0x04", CHAIN).await.unwrap(), TransactionStatus::NotFound);
        assert!(watcher.get_receipt("0x01", CHAIN).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_status_propagates_read_errors() {
        let source = Arc::new(MemoryReceiptSource::new());
        source.fail_next(1);
        let watcher = watcher(source);
        assert!(watcher.get_status(TX, CHAIN).await.is_err());
    }
}
