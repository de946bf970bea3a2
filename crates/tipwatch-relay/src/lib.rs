//! Relay tracker: infers cross-chain relay completion.
//!
//! Source-chain settlement comes from the transaction watcher. Once the
//! source is confirmed, a `StatusResolver` decides the relay state: the
//! bridging API when it answers, a time-based heuristic otherwise.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tipwatch_flight::{
    lock, CancellationToken, Clock, Listener, Listeners, PollSchedule, SharedResult, SingleFlight,
    Stop, SystemClock,
};
use tipwatch_sources::{BridgeStatusApi, DestinationResolver};
use tipwatch_tx::TransactionWatcher;
use tipwatch_types::{
    normalize_hex, ChainId, Hex, RelayRecord, RelayStatus, TipwatchError, TransactionStatus,
    WatchKey,
};
use tracing::{debug, info, warn};

pub mod resolver;

pub use resolver::{
    estimate_relay_duration, interpolate_progress, BridgeApiResolver, ChainProfile,
    FallbackResolver, HeuristicResolver, RelayContext, StatusResolver,
};

/// Callback receiving relay updates.
pub type RelayUpdateHandler = Listener<RelayRecord>;

/// Per-relay tracking options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    pub max_wait_time_ms: u64,
    pub poll_interval_ms: u64,
    /// When false, callbacks fire only when progress changes or the relay
    /// reaches a terminal state.
    pub enable_progress_updates: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            max_wait_time_ms: 600_000,
            poll_interval_ms: 5_000,
            enable_progress_updates: true,
        }
    }
}

impl RelayOptions {
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// What the tracker remembers about a relay while it is tracked.
struct TrackedRelay {
    loop_id: u64,
    record: Option<RelayRecord>,
    source_confirmed_at: Option<u64>,
}

struct Inner {
    transactions: TransactionWatcher,
    resolver: Arc<dyn StatusResolver>,
    clock: Arc<dyn Clock>,
    defaults: RelayOptions,
    flights: SingleFlight<WatchKey, RelayRecord, RelayRecord>,
    tracked: Mutex<HashMap<String, TrackedRelay>>,
    next_loop: AtomicU64,
}

/// Tracks relays from source submission to destination settlement.
#[derive(Clone)]
pub struct RelayTracker {
    inner: Arc<Inner>,
}

impl RelayTracker {
    /// Tracker using the bridging API when given, with the heuristic as
    /// fallback.
    pub fn new(
        transactions: TransactionWatcher,
        bridge_api: Option<Arc<dyn BridgeStatusApi>>,
        destinations: Arc<dyn DestinationResolver>,
    ) -> Self {
        Self::from_sources(
            transactions,
            bridge_api,
            destinations,
            ChainProfile::default(),
            RelayOptions::default(),
            Arc::new(SystemClock),
        )
    }

    pub fn from_sources(
        transactions: TransactionWatcher,
        bridge_api: Option<Arc<dyn BridgeStatusApi>>,
        destinations: Arc<dyn DestinationResolver>,
        profile: ChainProfile,
        defaults: RelayOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let heuristic: Arc<dyn StatusResolver> = Arc::new(HeuristicResolver::new(
            transactions.clone(),
            destinations,
            Arc::clone(&clock),
            profile,
        ));
        let resolver: Arc<dyn StatusResolver> = match bridge_api {
            Some(api) => Arc::new(FallbackResolver::new(
                Arc::new(BridgeApiResolver::new(api)),
                heuristic,
            )),
            None => heuristic,
        };
        Self::with_resolver(transactions, resolver, defaults, clock)
    }

    pub fn with_resolver(
        transactions: TransactionWatcher,
        resolver: Arc<dyn StatusResolver>,
        defaults: RelayOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transactions,
                resolver,
                clock,
                defaults,
                flights: SingleFlight::new(),
                tracked: Mutex::new(HashMap::new()),
                next_loop: AtomicU64::new(1),
            }),
        }
    }

    /// Track until `completed` or `failed`. Errors only on cancellation.
    pub async fn track(
        &self,
        relay_id: &str,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        source_tx_hash: &str,
        options: Option<RelayOptions>,
    ) -> tipwatch_types::Result<RelayRecord> {
        self.track_shared(relay_id, source_chain_id, destination_chain_id, source_tx_hash, options)
            .await
    }

    /// Shared result handle for the relay, starting a tracking loop if none
    /// is running. `options` only apply when this call starts the loop.
    pub fn track_shared(
        &self,
        relay_id: &str,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        source_tx_hash: &str,
        options: Option<RelayOptions>,
    ) -> SharedResult<RelayRecord> {
        let request = RelayRequest::new(relay_id, source_chain_id, destination_chain_id, source_tx_hash);
        self.join(request, options, None)
    }

    /// Like `track`, invoking `on_update` as progress is observed. Reported
    /// progress never decreases while the relay is healthy.
    pub async fn track_with_progress(
        &self,
        relay_id: &str,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        source_tx_hash: &str,
        on_update: RelayUpdateHandler,
        options: Option<RelayOptions>,
    ) -> tipwatch_types::Result<RelayRecord> {
        let request = RelayRequest::new(relay_id, source_chain_id, destination_chain_id, source_tx_hash);
        self.join(request, options, Some(on_update)).await
    }

    fn join(
        &self,
        request: RelayRequest,
        options: Option<RelayOptions>,
        on_update: Option<RelayUpdateHandler>,
    ) -> SharedResult<RelayRecord> {
        let key = WatchKey::relay(&request.relay_id);
        let options = options.unwrap_or_else(|| self.inner.defaults.clone());
        let inner = Arc::clone(&self.inner);
        let mut pending_handler = on_update;

        let joined = self.inner.flights.get_or_start(key, |token, listeners| {
            if let Some(handler) = pending_handler.take() {
                listeners.add(handler);
            }
            let loop_id = inner.next_loop.fetch_add(1, Ordering::Relaxed);
            lock(&inner.tracked).insert(
                request.relay_id.clone(),
                TrackedRelay {
                    loop_id,
                    record: None,
                    source_confirmed_at: None,
                },
            );
            run_tracking(inner, request, options, loop_id, token, listeners)
        });
        if let Some(handler) = pending_handler {
            joined.listeners.add(handler);
        }
        joined.result
    }

    /// Single-shot status derivation; never loops and never fails.
    pub async fn get_status(
        &self,
        relay_id: &str,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        source_tx_hash: &str,
    ) -> RelayRecord {
        let request = RelayRequest::new(relay_id, source_chain_id, destination_chain_id, source_tx_hash);
        let known = lock(&self.inner.tracked)
            .get(relay_id)
            .and_then(|t| t.source_confirmed_at);
        derive_status(&self.inner, &request, known).await.0
    }

    /// Last record observed by a running tracking loop.
    pub fn get_record(&self, relay_id: &str) -> Option<RelayRecord> {
        lock(&self.inner.tracked)
            .get(relay_id)
            .and_then(|t| t.record.clone())
    }

    /// Cancel tracking. The pending result fails with a cancellation error.
    pub fn cancel(&self, relay_id: &str) -> bool {
        let cancelled = self.inner.flights.cancel(&WatchKey::relay(relay_id));
        if cancelled {
            info!("cancelled tracking of relay {}", relay_id);
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let cancelled = self.inner.flights.cancel_all();
        if cancelled > 0 {
            info!("cancelled {} relay trackers", cancelled);
        }
        cancelled
    }

    pub fn is_tracking(&self, relay_id: &str) -> bool {
        self.inner.flights.contains(&WatchKey::relay(relay_id))
    }

    pub fn active_count(&self) -> usize {
        self.inner.flights.len()
    }
}

impl std::fmt::Debug for RelayTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTracker")
            .field("resolver", &self.inner.resolver.name())
            .field("defaults", &self.inner.defaults)
            .field("active", &self.inner.flights.len())
            .finish()
    }
}

/// Identity of one relay.
#[derive(Debug, Clone)]
struct RelayRequest {
    relay_id: String,
    source_chain_id: ChainId,
    destination_chain_id: ChainId,
    source_tx_hash: Hex,
}

impl RelayRequest {
    fn new(
        relay_id: &str,
        source_chain_id: ChainId,
        destination_chain_id: ChainId,
        source_tx_hash: &str,
    ) -> Self {
        Self {
            relay_id: relay_id.to_string(),
            source_chain_id,
            destination_chain_id,
            source_tx_hash: normalize_hex(source_tx_hash),
        }
    }

    fn record(&self, status: RelayStatus, progress: u8) -> RelayRecord {
        RelayRecord::new(
            &self.relay_id,
            self.source_chain_id,
            self.destination_chain_id,
            &self.source_tx_hash,
            status,
            progress,
        )
    }
}

/// Derive the relay state once. Also returns the source confirmation time
/// to remember for later ticks.
async fn derive_status(
    inner: &Inner,
    request: &RelayRequest,
    known_confirmed_at: Option<u64>,
) -> (RelayRecord, Option<u64>) {
    let (source_status, receipt) = match inner
        .transactions
        .get_status_and_receipt(&request.source_tx_hash, request.source_chain_id)
        .await
    {
        Ok(found) => found,
        Err(e) => {
            warn!(
                "source status for relay {} unavailable: {}",
                request.relay_id, e
            );
            return (request.record(RelayStatus::Initiated, 10), known_confirmed_at);
        }
    };

    match source_status {
        TransactionStatus::NotFound => (
            request
                .record(RelayStatus::Failed, 0)
                .with_error("source transaction not found"),
            None,
        ),
        TransactionStatus::Failed | TransactionStatus::Dropped | TransactionStatus::Replaced => (
            request
                .record(RelayStatus::Failed, 0)
                .with_error("source transaction failed"),
            None,
        ),
        TransactionStatus::Pending => (request.record(RelayStatus::Pending, 25), None),
        TransactionStatus::Confirmed => {
            let confirmed_at = known_confirmed_at
                .or_else(|| receipt.map(|r| r.settled_at()))
                .unwrap_or_else(|| inner.clock.now_millis());
            let ctx = RelayContext {
                relay_id: request.relay_id.clone(),
                source_chain_id: request.source_chain_id,
                destination_chain_id: request.destination_chain_id,
                source_tx_hash: request.source_tx_hash.clone(),
                source_confirmed_at: confirmed_at,
            };
            let record = match inner.resolver.resolve(&ctx).await {
                Ok(Some(record)) => record,
                Ok(None) => request.record(RelayStatus::Initiated, 10),
                Err(e) => {
                    warn!("{} failed for relay {}: {}", inner.resolver.name(), request.relay_id, e);
                    request.record(RelayStatus::Initiated, 10)
                }
            };
            (record, Some(confirmed_at))
        }
    }
}

/// Drops the tracked entry of a finished loop, unless a newer loop for the
/// same relay has replaced it.
struct TrackedGuard {
    inner: Arc<Inner>,
    relay_id: String,
    loop_id: u64,
}

impl Drop for TrackedGuard {
    fn drop(&mut self) {
        let mut tracked = lock(&self.inner.tracked);
        if tracked.get(&self.relay_id).map(|t| t.loop_id) == Some(self.loop_id) {
            tracked.remove(&self.relay_id);
        }
    }
}

async fn run_tracking(
    inner: Arc<Inner>,
    request: RelayRequest,
    options: RelayOptions,
    loop_id: u64,
    token: CancellationToken,
    listeners: Listeners<RelayRecord>,
) -> tipwatch_types::Result<RelayRecord> {
    let _guard = TrackedGuard {
        inner: Arc::clone(&inner),
        relay_id: request.relay_id.clone(),
        loop_id,
    };
    let mut schedule =
        PollSchedule::new(token, options.poll_interval(), Some(options.max_wait_time()));
    let mut last: Option<RelayRecord> = None;

    loop {
        match schedule.begin_tick() {
            Ok(()) => {}
            Err(stop) => {
                let progress = last.as_ref().map_or(0, |r| r.progress);
                let status_before = last.as_ref().map(|r| r.status);
                let mut record = last
                    .take()
                    .unwrap_or_else(|| request.record(RelayStatus::Initiated, 0));
                record.status = RelayStatus::Failed;
                record.progress = progress;
                match stop {
                    Stop::Cancelled => {
                        listeners.notify(&record.with_error("cancelled"));
                        return Err(TipwatchError::Cancelled(format!("relay {}", request.relay_id)));
                    }
                    Stop::Deadline => {
                        let record = record.with_error(format!(
                            "timeout after {}ms (last status {})",
                            options.max_wait_time_ms,
                            status_before.map_or("unknown", |s| s.as_str())
                        ));
                        info!("relay {} timed out", request.relay_id);
                        listeners.notify(&record);
                        return Ok(record);
                    }
                }
            }
        }

        let known = lock(&inner.tracked)
            .get(&request.relay_id)
            .and_then(|t| t.source_confirmed_at);
        let (mut record, confirmed_at) = derive_status(&inner, &request, known).await;

        let previous = last.as_ref().map(|r| r.progress);
        if record.status != RelayStatus::Failed {
            if let Some(previous) = previous {
                record.progress = record.progress.max(previous);
            }
        }

        if let Some(tracked) = lock(&inner.tracked).get_mut(&request.relay_id) {
            if tracked.loop_id == loop_id {
                tracked.source_confirmed_at = tracked.source_confirmed_at.or(confirmed_at);
                tracked.record = Some(record.clone());
            }
        }

        let terminal = record.status.is_terminal();
        if terminal || options.enable_progress_updates || previous != Some(record.progress) {
            listeners.notify(&record);
        }
        debug!(
            "relay {} tick {}: {} at {}%",
            request.relay_id,
            schedule.ticks(),
            record.status,
            record.progress
        );

        if terminal {
            schedule.finish();
            info!("relay {} finished as {}", request.relay_id, record.status);
            return Ok(record);
        }

        last = Some(record);
        schedule.sleep().await;
    }
}
