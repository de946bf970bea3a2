//! Runtime primitives shared by the watchers.
//!
//! - `SingleFlight`: at most one running watch per key, shared result
//! - `PollSchedule`: deadline/cancellation bookkeeping for one poll loop
//! - `Listeners`: progress callbacks attached to a running watch
//! - `Clock`: wall-clock source for record timestamps

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod schedule;
pub mod single_flight;

pub use schedule::{PollSchedule, PollState, Stop};
pub use single_flight::{Joined, SharedResult, SingleFlight};
pub use tokio_util::sync::CancellationToken;

/// Lock a registry mutex, recovering the data if a callback panicked
/// while it was held.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wall-clock source for the unix-ms timestamps written into records.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        tipwatch_types::now_millis()
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Callback invoked with each update of a watch.
pub type Listener<U> = Arc<dyn Fn(&U) + Send + Sync>;

/// The set of callbacks attached to one running watch.
///
/// Callers that join an existing watch add themselves here and receive
/// every update emitted after they joined.
pub struct Listeners<U> {
    inner: Arc<Mutex<Vec<Listener<U>>>>,
}

impl<U> Listeners<U> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Listener<U>) {
        lock(&self.inner).push(listener);
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener. The lock is not held during the calls.
    pub fn notify(&self, update: &U) {
        let listeners: Vec<Listener<U>> = lock(&self.inner).clone();
        for listener in listeners {
            listener(update);
        }
    }
}

impl<U> Clone for Listeners<U> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<U> Default for Listeners<U> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_notify_all() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let seen = seen.clone();
            listeners.add(Arc::new(move |v: &u32| {
                seen.fetch_add(*v as usize, Ordering::SeqCst);
            }));
        }
        listeners.notify(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 6);
        assert_eq!(listeners.len(), 2);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_millis(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
