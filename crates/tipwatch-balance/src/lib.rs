//! Balance watcher: cached balance reads, persistent change watches and
//! post-transaction refreshes.
//!
//! Every read goes through one cache update that compares the new value
//! with the cached one, so a change is reported to each registered watch
//! exactly once no matter which path observed it. Reads are ordered by
//! when they started: a read that finishes after a newer one has been
//! cached is dropped.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tipwatch_flight::{
    lock, CancellationToken, Clock, Listener, PollSchedule, SingleFlight, SystemClock,
};
use tipwatch_sources::BalanceSource;
use tipwatch_types::{
    BalanceCacheEntry, BalanceKey, BalanceRecord, ChainId, Hex, Result, TipwatchError, WatchKey,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Callback receiving balance changes. `previous_balance` holds the old
/// value.
pub type BalanceChangeHandler = Listener<BalanceRecord>;

/// Balance watcher options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceOptions {
    /// Default interval of persistent watches.
    pub poll_interval_ms: u64,
    /// Freshness window of cached balances.
    pub cache_ttl_ms: u64,
    pub refresh_interval_ms: u64,
    /// Default wait of `refresh_after_transaction`.
    pub refresh_max_wait_ms: u64,
}

impl Default for BalanceOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            cache_ttl_ms: 5_000,
            refresh_interval_ms: 2_000,
            refresh_max_wait_ms: 30_000,
        }
    }
}

impl BalanceOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn refresh_max_wait(&self) -> Duration {
        Duration::from_millis(self.refresh_max_wait_ms)
    }
}

/// Identifies one `watch` registration. Several registrations may share a
/// balance key; each is cancelled on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BalanceWatchId {
    pub key: BalanceKey,
    pub seq: u64,
}

impl fmt::Display for BalanceWatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.seq)
    }
}

struct CachedBalance {
    entry: BalanceCacheEntry,
    read_at: Instant,
    /// Start order of the read that produced `entry`.
    seq: u64,
}

type Registrations = HashMap<BalanceKey, Vec<(u64, BalanceChangeHandler)>>;

struct Inner {
    source: Arc<dyn BalanceSource>,
    clock: Arc<dyn Clock>,
    options: BalanceOptions,
    cache: Mutex<HashMap<BalanceKey, CachedBalance>>,
    registrations: Mutex<Registrations>,
    flights: SingleFlight<WatchKey, ()>,
    next_seq: AtomicU64,
    next_read: AtomicU64,
}

impl Inner {
    /// Uncached read that updates the cache and reports a change to every
    /// registration of the key.
    ///
    /// A read overtaken by a newer one returns the newer cached value and
    /// reports nothing.
    async fn read(&self, key: &BalanceKey) -> Result<BalanceRecord> {
        let seq = self.next_read.fetch_add(1, Ordering::Relaxed);
        let balance = self
            .source
            .get_balance(&key.address, key.token.as_deref(), key.chain_id)
            .await?;
        Ok(self.record(key, balance, seq))
    }

    fn record(&self, key: &BalanceKey, balance: String, seq: u64) -> BalanceRecord {
        let timestamp = self.clock.now_millis();
        let previous = {
            let mut cache = lock(&self.cache);
            if let Some(newer) = cache.get(key).filter(|c| c.seq > seq) {
                debug!("dropping stale read of {} ({})", key, balance);
                return BalanceRecord {
                    address: key.address.clone(),
                    token: key.token.clone(),
                    balance: newer.entry.balance.clone(),
                    previous_balance: None,
                    chain_id: key.chain_id,
                    timestamp: newer.entry.timestamp,
                };
            }
            cache.insert(
                key.clone(),
                CachedBalance {
                    entry: BalanceCacheEntry {
                        balance: balance.clone(),
                        timestamp,
                    },
                    read_at: Instant::now(),
                    seq,
                },
            )
        };
        let record = BalanceRecord {
            address: key.address.clone(),
            token: key.token.clone(),
            balance,
            previous_balance: previous.map(|p| p.entry.balance),
            chain_id: key.chain_id,
            timestamp,
        };

        if let Some(previous) = &record.previous_balance {
            if *previous != record.balance {
                let handlers: Vec<BalanceChangeHandler> = lock(&self.registrations)
                    .get(key)
                    .map(|regs| regs.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default();
                debug!(
                    "balance {} changed {} -> {} ({} watches)",
                    key,
                    previous,
                    record.balance,
                    handlers.len()
                );
                for handler in handlers {
                    handler(&record);
                }
            }
        }
        record
    }

    fn fresh(&self, key: &BalanceKey) -> Option<String> {
        let cache = lock(&self.cache);
        cache
            .get(key)
            .filter(|c| c.read_at.elapsed() < self.options.cache_ttl())
            .map(|c| c.entry.balance.clone())
    }

    /// Stop polling `key` and forget its cached value. Caller holds the
    /// registrations lock.
    fn stop_key(&self, key: &BalanceKey) {
        self.flights.cancel(&WatchKey::Balance(key.clone()));
        lock(&self.cache).remove(key);
    }
}

/// Watches balances across chains.
#[derive(Clone)]
pub struct BalanceWatcher {
    inner: Arc<Inner>,
}

impl BalanceWatcher {
    pub fn new(source: Arc<dyn BalanceSource>) -> Self {
        Self::with_options(source, BalanceOptions::default(), Arc::new(SystemClock))
    }

    pub fn with_options(
        source: Arc<dyn BalanceSource>,
        options: BalanceOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                clock,
                options,
                cache: Mutex::new(HashMap::new()),
                registrations: Mutex::new(HashMap::new()),
                flights: SingleFlight::new(),
                next_seq: AtomicU64::new(1),
                next_read: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &BalanceOptions {
        &self.inner.options
    }

    /// Start a persistent watch. Does an uncached read, then polls every
    /// `poll_interval` until cancelled, calling `on_change` whenever the
    /// balance differs from the last cached value.
    ///
    /// All watches of one balance share a single poll loop; `poll_interval`
    /// only applies when this call starts it.
    pub async fn watch(
        &self,
        address: &str,
        chain_id: ChainId,
        token: Option<&str>,
        on_change: BalanceChangeHandler,
        poll_interval: Option<Duration>,
    ) -> BalanceWatchId {
        let key = BalanceKey::new(address, chain_id, token);
        if let Err(e) = self.inner.read(&key).await {
            warn!("initial balance read for {} failed: {}", key, e);
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let interval = poll_interval.unwrap_or_else(|| self.inner.options.poll_interval());
        let inner = Arc::clone(&self.inner);
        let loop_key = key.clone();
        // Registration and loop start happen under one lock so a concurrent
        // cancel never sees a registration without its loop.
        let started = {
            let mut registrations = lock(&self.inner.registrations);
            registrations
                .entry(key.clone())
                .or_default()
                .push((seq, on_change));
            self.inner
                .flights
                .get_or_start(WatchKey::Balance(key.clone()), |token, _| {
                    run_balance_poll(inner, loop_key, interval, token)
                })
                .started
        };

        let id = BalanceWatchId { key, seq };
        if started {
            info!("watching balance {} every {:?}", id.key, interval);
        } else {
            debug!("balance watch {} joined running poll", id);
        }
        id
    }

    /// Balance as a decimal string. With `use_cache`, a cached value inside
    /// the freshness window is returned without a read.
    pub async fn get_balance(
        &self,
        address: &str,
        chain_id: ChainId,
        token: Option<&str>,
        use_cache: bool,
    ) -> Result<String> {
        let key = BalanceKey::new(address, chain_id, token);
        if use_cache {
            if let Some(balance) = self.inner.fresh(&key) {
                return Ok(balance);
            }
        }
        Ok(self.inner.read(&key).await?.balance)
    }

    /// Wait for the balance to move after `tx_hash`. Takes an uncached
    /// baseline, then re-reads every `refresh_interval` until the value
    /// differs. Errors with `Timeout` once `max_wait` passes.
    pub async fn refresh_after_transaction(
        &self,
        tx_hash: &str,
        address: &str,
        chain_id: ChainId,
        token: Option<&str>,
        max_wait: Option<Duration>,
    ) -> Result<BalanceRecord> {
        let key = BalanceKey::new(address, chain_id, token);
        let max_wait = max_wait.unwrap_or_else(|| self.inner.options.refresh_max_wait());
        let baseline = self.inner.read(&key).await?.balance;
        debug!("refreshing {} after {} from {}", key, tx_hash, baseline);

        let mut schedule = PollSchedule::new(
            CancellationToken::new(),
            self.inner.options.refresh_interval(),
            Some(max_wait),
        );
        loop {
            schedule.sleep().await;
            if schedule.begin_tick().is_err() {
                return Err(TipwatchError::Timeout(format!(
                    "balance {} unchanged {}ms after {}",
                    key,
                    max_wait.as_millis(),
                    tx_hash
                )));
            }
            match self.inner.read(&key).await {
                Ok(record) if record.balance != baseline => {
                    schedule.finish();
                    info!("balance {} moved to {} after {}", key, record.balance, tx_hash);
                    return Ok(BalanceRecord {
                        previous_balance: Some(baseline),
                        ..record
                    });
                }
                Ok(_) => {}
                Err(e) => warn!("refresh read for {} failed: {}", key, e),
            }
        }
    }

    /// Balances for several chains at once, concurrently. `tokens` maps a
    /// chain to its token; unmapped chains read native balance. Chains that
    /// fail to read are left out.
    pub async fn get_multi_chain_balances(
        &self,
        address: &str,
        chains: &[ChainId],
        tokens: &HashMap<ChainId, Hex>,
    ) -> HashMap<ChainId, String> {
        let reads = chains.iter().map(|&chain_id| async move {
            let token = tokens.get(&chain_id).map(String::as_str);
            (chain_id, self.get_balance(address, chain_id, token, true).await)
        });

        let mut balances = HashMap::new();
        for (chain_id, read) in join_all(reads).await {
            match read {
                Ok(balance) => {
                    balances.insert(chain_id, balance);
                }
                Err(e) => warn!("balance of {} on chain {} unavailable: {}", address, chain_id, e),
            }
        }
        balances
    }

    /// Cancel one watch. Polling stops and the cache entry is cleared once
    /// no watch of that balance remains.
    pub fn cancel(&self, id: &BalanceWatchId) -> bool {
        let mut registrations = lock(&self.inner.registrations);
        let Some(regs) = registrations.get_mut(&id.key) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|(seq, _)| *seq != id.seq);
        let removed = regs.len() != before;
        if regs.is_empty() {
            registrations.remove(&id.key);
            self.inner.stop_key(&id.key);
            info!("stopped watching balance {}", id.key);
        }
        removed
    }

    /// Cancel every watch of one balance. Returns how many were cancelled.
    pub fn cancel_all_for(&self, address: &str, chain_id: ChainId, token: Option<&str>) -> usize {
        let key = BalanceKey::new(address, chain_id, token);
        let mut registrations = lock(&self.inner.registrations);
        let cancelled = registrations.remove(&key).map_or(0, |regs| regs.len());
        if cancelled > 0 {
            self.inner.stop_key(&key);
            info!("cancelled {} watches of balance {}", cancelled, key);
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let mut registrations = lock(&self.inner.registrations);
        let mut cancelled = 0;
        for (key, regs) in registrations.drain() {
            cancelled += regs.len();
            self.inner.stop_key(&key);
        }
        if cancelled > 0 {
            info!("cancelled {} balance watches", cancelled);
        }
        cancelled
    }

    /// Cached entry regardless of age.
    pub fn get_cached(
        &self,
        address: &str,
        chain_id: ChainId,
        token: Option<&str>,
    ) -> Option<BalanceCacheEntry> {
        let key = BalanceKey::new(address, chain_id, token);
        lock(&self.inner.cache).get(&key).map(|c| c.entry.clone())
    }

    pub fn is_watching(&self, address: &str, chain_id: ChainId, token: Option<&str>) -> bool {
        let key = BalanceKey::new(address, chain_id, token);
        lock(&self.inner.registrations).contains_key(&key)
    }

    /// Number of live watch registrations.
    pub fn active_count(&self) -> usize {
        lock(&self.inner.registrations).values().map(Vec::len).sum()
    }
}

impl fmt::Debug for BalanceWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalanceWatcher")
            .field("options", &self.inner.options)
            .field("polls", &self.inner.flights.len())
            .finish()
    }
}

async fn run_balance_poll(
    inner: Arc<Inner>,
    key: BalanceKey,
    interval: Duration,
    token: CancellationToken,
) -> Result<()> {
    let mut schedule = PollSchedule::new(token, interval, None);
    loop {
        schedule.sleep().await;
        if schedule.begin_tick().is_err() {
            break;
        }
        match inner.read(&key).await {
            Ok(record) => debug!("balance {} tick {}: {}", key, schedule.ticks(), record.balance),
            Err(e) => warn!("balance read for {} failed: {}", key, e),
        }
    }
    schedule.finish();
    debug!("balance poll for {} stopped", key);
    Ok(())
}
