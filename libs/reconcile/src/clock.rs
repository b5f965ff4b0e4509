//! Time sources.
//!
//! Every loop that waits goes through a [`Clock`] so tests can run the
//! full poll schedule without sleeping.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Wall-clock time and suspension.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// The real clock, backed by `chrono::Utc` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A manually driven clock for tests.
///
/// `sleep` returns immediately, advances `now` by the requested duration
/// and records the request.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Create a clock frozen at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += to_chrono(duration);
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Sum of all requested sleeps.
    pub fn total_slept(&self) -> Duration {
        self.lock().sleeps.iter().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // A poisoned clock only means a test already panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += to_chrono(duration);
        state.sleeps.push(duration);
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances_time() {
        let start = Utc::now();
        let clock = ManualClock::new(start);

        clock.sleep(Duration::from_secs(30)).await;
        clock.sleep(Duration::from_secs(30)).await;

        assert_eq!(clock.now() - start, chrono::Duration::seconds(60));
        assert_eq!(clock.sleeps().len(), 2);
        assert_eq!(clock.total_slept(), Duration::from_secs(60));
    }

    #[test]
    fn test_manual_clock_advance_is_not_a_sleep() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(5));

        assert_eq!(clock.now() - start, chrono::Duration::seconds(5));
        assert!(clock.sleeps().is_empty());
    }
}
