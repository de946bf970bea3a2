//! Keyed single-flight registry.
//!
//! `get_or_start` either joins the running flight for a key or spawns a new
//! one. The registry entry is removed when the spawned task ends, on every
//! exit path, by a drop guard owned by the task.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tipwatch_types::{Result, TipwatchError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{lock, Listeners};

/// Result handle every caller of one flight awaits.
pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Flight<T, U> {
    id: u64,
    token: CancellationToken,
    result: SharedResult<T>,
    listeners: Listeners<U>,
}

type FlightMap<K, T, U> = Arc<Mutex<HashMap<K, Flight<T, U>>>>;

/// What a caller gets back from `get_or_start`.
pub struct Joined<T, U> {
    pub result: SharedResult<T>,
    pub listeners: Listeners<U>,
    /// `false` when the caller attached to a flight that was already running.
    pub started: bool,
}

/// Removes its flight from the registry when dropped, unless the key has
/// since been taken over by a newer flight.
struct FlightGuard<K: Eq + Hash, T, U> {
    flights: FlightMap<K, T, U>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T, U> Drop for FlightGuard<K, T, U> {
    fn drop(&mut self) {
        let mut flights = lock(&self.flights);
        if flights.get(&self.key).map(|f| f.id) == Some(self.id) {
            flights.remove(&self.key);
        }
    }
}

/// At most one running flight per key.
pub struct SingleFlight<K, T, U = ()> {
    flights: FlightMap<K, T, U>,
    next_id: AtomicU64,
}

impl<K, T, U> SingleFlight<K, T, U>
where
    K: Eq + Hash + Clone + std::fmt::Display + Send + 'static,
    T: Clone + Send + Sync + 'static,
    U: 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join the flight running for `key`, or start one with `start`.
    ///
    /// Lookup and registration happen under one lock acquisition, so two
    /// concurrent callers for the same key never both start a flight.
    pub fn get_or_start<F, Fut>(&self, key: K, start: F) -> Joined<T, U>
    where
        F: FnOnce(CancellationToken, Listeners<U>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        U: Send,
    {
        let mut flights = lock(&self.flights);
        if let Some(flight) = flights.get(&key) {
            debug!("joining running watch {}", key);
            return Joined {
                result: flight.result.clone(),
                listeners: flight.listeners.clone(),
                started: false,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let listeners = Listeners::new();
        let guard = FlightGuard {
            flights: Arc::clone(&self.flights),
            key: key.clone(),
            id,
        };
        let work = start(token.clone(), listeners.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });
        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(TipwatchError::Other(format!("watch task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        debug!("starting watch {}", key);
        flights.insert(
            key,
            Flight {
                id,
                token,
                result: result.clone(),
                listeners: listeners.clone(),
            },
        );

        Joined {
            result,
            listeners,
            started: true,
        }
    }

    /// Signal cancellation and drop the registry entry. Returns whether a
    /// flight was running.
    pub fn cancel(&self, key: &K) -> bool {
        let flight = lock(&self.flights).remove(key);
        match flight {
            Some(flight) => {
                flight.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running flight. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Flight<T, U>> = lock(&self.flights).drain().map(|(_, f)| f).collect();
        for flight in &drained {
            flight.token.cancel();
        }
        drained.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.flights).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.flights).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T, U> Default for SingleFlight<K, T, U>
where
    K: Eq + Hash + Clone + std::fmt::Display + Send + 'static,
    T: Clone + Send + Sync + 'static,
    U: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_second_caller_joins_first_flight() {
        let flights: SingleFlight<String, u32> = SingleFlight::new();
        let starts = Arc::new(AtomicUsize::new(0));

        let start = |starts: Arc<AtomicUsize>| {
            move |_token: CancellationToken, _listeners: Listeners<()>| {
                starts.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(7)
                }
            }
        };

        let a = flights.get_or_start("k".to_string(), start(starts.clone()));
        let b = flights.get_or_start("k".to_string(), start(starts.clone()));
        assert!(a.started);
        assert!(!b.started);
        assert_eq!(flights.len(), 1);

        assert_eq!(a.result.await.unwrap(), 7);
        assert_eq!(b.result.await.unwrap(), 7);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        tokio::task::yield_now().await;
        assert!(flights.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flight_is_removed() {
        let flights: SingleFlight<String, u32> = SingleFlight::new();
        let joined = flights.get_or_start("k".to_string(), |_, _| async {
            Err(TipwatchError::Other("boom".into()))
        });
        assert!(joined.result.await.is_err());
        tokio::task::yield_now().await;
        assert!(!flights.contains(&"k".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_signals_token_and_removes_entry() {
        let flights: SingleFlight<String, u32> = SingleFlight::new();
        let joined = flights.get_or_start("k".to_string(), |token, _| async move {
            token.cancelled().await;
            Err(TipwatchError::Cancelled("k".into()))
        });

        assert!(flights.cancel(&"k".to_string()));
        assert!(!flights.contains(&"k".to_string()));
        assert!(joined.result.await.unwrap_err().is_cancelled());
        assert!(!flights.cancel(&"k".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_guard_keeps_newer_flight() {
        let flights: SingleFlight<String, u32> = SingleFlight::new();
        let first = flights.get_or_start("k".to_string(), |token, _| async move {
            token.cancelled().await;
            Err(TipwatchError::Cancelled("k".into()))
        });
        flights.cancel(&"k".to_string());

        let second = flights.get_or_start("k".to_string(), |_, _| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        });
        assert!(second.started);

        assert!(first.result.await.is_err());
        tokio::task::yield_now().await;
        assert!(flights.contains(&"k".to_string()));
        assert_eq!(second.result.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let flights: SingleFlight<String, u32> = SingleFlight::new();
        let mut results = Vec::new();
        for key in ["a", "b", "c"] {
            let joined = flights.get_or_start(key.to_string(), |token, _| async move {
                token.cancelled().await;
                Err(TipwatchError::Cancelled("all".into()))
            });
            results.push(joined.result);
        }
        assert_eq!(flights.cancel_all(), 3);
        assert!(flights.is_empty());
        for result in results {
            assert!(result.await.unwrap_err().is_cancelled());
        }
    }
}
