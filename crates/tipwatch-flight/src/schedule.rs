//! Tick bookkeeping for a single poll loop.
//!
//! Each tick runs `begin_tick` (cancellation first, then the deadline),
//! does its read, and either finishes or calls `sleep`. Sleeps never run
//! past the deadline and end early on cancellation; reads are never
//! interrupted.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where a poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Scheduled,
    Reading,
    Sleeping,
    Terminal,
}

/// Why a loop must stop before reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Cancelled,
    Deadline,
}

/// Deadline, interval and cancellation for one loop.
#[derive(Debug)]
pub struct PollSchedule {
    token: CancellationToken,
    started: Instant,
    deadline: Option<Instant>,
    interval: Duration,
    state: PollState,
    ticks: u32,
}

impl PollSchedule {
    /// `timeout == None` polls until cancelled.
    pub fn new(token: CancellationToken, interval: Duration, timeout: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            token,
            started,
            deadline: timeout.map(|t| started + t),
            interval,
            state: PollState::Scheduled,
            ticks: 0,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Number of ticks that got past `begin_tick`.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Start a tick. Cancellation is checked before the deadline, and both
    /// before any read.
    pub fn begin_tick(&mut self) -> Result<(), Stop> {
        if self.token.is_cancelled() {
            self.state = PollState::Terminal;
            return Err(Stop::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.state = PollState::Terminal;
                return Err(Stop::Deadline);
            }
        }
        self.state = PollState::Reading;
        self.ticks += 1;
        Ok(())
    }

    /// Mark the loop finished.
    pub fn finish(&mut self) {
        self.state = PollState::Terminal;
    }

    /// Wait one interval, clamped to the deadline. Returns `false` if the
    /// wait was cut short by cancellation.
    pub async fn sleep(&mut self) -> bool {
        self.sleep_for(self.interval).await
    }

    /// Same as `sleep` with an explicit interval.
    pub async fn sleep_for(&mut self, interval: Duration) -> bool {
        let mut wake = Instant::now() + interval;
        if let Some(deadline) = self.deadline {
            wake = wake.min(deadline);
        }
        self.state = PollState::Sleeping;
        let completed = tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep_until(wake) => true,
        };
        self.state = PollState::Scheduled;
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_checked_before_deadline() {
        let token = CancellationToken::new();
        let mut schedule =
            PollSchedule::new(token.clone(), Duration::from_secs(1), Some(Duration::ZERO));
        token.cancel();
        assert_eq!(schedule.begin_tick(), Err(Stop::Cancelled));
        assert_eq!(schedule.state(), PollState::Terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_clamped_to_deadline() {
        let mut schedule = PollSchedule::new(
            CancellationToken::new(),
            Duration::from_secs(10),
            Some(Duration::from_secs(3)),
        );
        assert!(schedule.begin_tick().is_ok());
        let before = Instant::now();
        assert!(schedule.sleep().await);
        let slept = before.elapsed();
        assert!(slept >= Duration::from_secs(3) && slept < Duration::from_secs(4));
        assert_eq!(schedule.begin_tick(), Err(Stop::Deadline));
        assert_eq!(schedule.ticks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_sleep() {
        let token = CancellationToken::new();
        let mut schedule = PollSchedule::new(token.clone(), Duration::from_secs(60), None);
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let before = Instant::now();
        assert!(!schedule.sleep().await);
        assert!(before.elapsed() < Duration::from_secs(60));
        assert_eq!(schedule.begin_tick(), Err(Stop::Cancelled));
    }
}
