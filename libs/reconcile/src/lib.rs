//! Reconciliation loop primitives.
//!
//! This library provides the waiting machinery shared by every loop that
//! drives an external system toward a desired state:
//!
//! - **Poller**: call a check at a fixed interval until it is ready, fails,
//!   or a hard attempt cap is reached.
//! - **Clock**: the time source loops sleep on, swappable for tests.
//! - **Transient errors**: throttling and network blips are retried inside
//!   the loop instead of failing it.
//!
//! # Invariants
//!
//! - Every loop is bounded; exhaustion is reported as [`PollError::Timeout`],
//!   which is distinct from a failure the check itself reported
//! - A transient error never escalates into a terminal one
//! - No sleep happens after the final attempt or after a ready result

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// Classifies errors that are safe to retry with the same call.
pub trait Transient {
    /// Returns true for throttling, network and other retryable errors.
    fn is_transient(&self) -> bool;
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    /// The awaited condition holds.
    Ready(T),

    /// Not there yet, check again after the interval.
    Pending,
}

/// One observation of the system being waited on.
///
/// Implementors may keep state between attempts (for example a running
/// tally of sightings).
#[async_trait]
pub trait Check: Send {
    /// Value produced once the check is ready.
    type Output: Send;

    /// Error produced by the underlying call.
    type Error: Transient + fmt::Display + Send;

    /// Perform the observation. `attempt` starts at 1.
    async fn check(&mut self, attempt: u32) -> Result<PollStep<Self::Output>, Self::Error>;
}

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The attempt cap was reached before the check became ready.
    #[error("gave up after {attempts} attempts ({waited:?} waited)")]
    Timeout { attempts: u32, waited: Duration },

    /// The check reported a non-transient error.
    #[error("{0}")]
    Failed(E),
}

impl<E> PollError<E> {
    /// Returns true if the loop ran out of attempts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Fixed-interval, attempt-capped poll schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    /// Time between consecutive attempts.
    pub interval: Duration,

    /// Hard cap on the number of attempts.
    pub max_attempts: u32,
}

impl Poller {
    /// Create a poll schedule.
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping by one `poll_until` call.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    /// Run `check` until it is ready, fails terminally, or attempts run out.
    pub async fn poll_until<C>(
        &self,
        clock: &dyn Clock,
        check: &mut C,
    ) -> Result<C::Output, PollError<C::Error>>
    where
        C: Check,
    {
        let mut waited = Duration::ZERO;

        for attempt in 1..=self.max_attempts {
            match check.check(attempt).await {
                Ok(PollStep::Ready(output)) => {
                    debug!(attempt, "poll condition reached");
                    return Ok(output);
                }
                Ok(PollStep::Pending) => {}
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "transient error while polling, retrying next tick");
                }
                Err(e) => return Err(PollError::Failed(e)),
            }

            if attempt < self.max_attempts {
                clock.sleep(self.interval).await;
                waited += self.interval;
            }
        }

        Err(PollError::Timeout {
            attempts: self.max_attempts,
            waited,
        })
    }
}

/// Run `op`, retrying exactly once after `delay` if it fails transiently.
///
/// The second error, transient or not, is returned unchanged.
pub async fn retry_transient<T, E, F, Fut>(clock: &dyn Clock, delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + fmt::Display,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!(error = %e, "transient error, retrying once");
            clock.sleep(delay).await;
            op().await
        }
        other => other,
    }
}

/// Default delay before the single transient retry of a one-shot call.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        Throttled,
        Broken,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Throttled)
        }
    }

    /// Replays a fixed script of observations, then stays pending.
    struct Scripted {
        script: VecDeque<Result<PollStep<&'static str>, TestError>>,
        calls: u32,
    }

    impl Scripted {
        fn new(script: Vec<Result<PollStep<&'static str>, TestError>>) -> Self {
            Self {
                script: script.into(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl Check for Scripted {
        type Output = &'static str;
        type Error = TestError;

        async fn check(&mut self, attempt: u32) -> Result<PollStep<&'static str>, TestError> {
            self.calls += 1;
            assert_eq!(attempt, self.calls);
            self.script.pop_front().unwrap_or(Ok(PollStep::Pending))
        }
    }

    #[tokio::test]
    async fn test_ready_stops_without_trailing_sleep() {
        let clock = ManualClock::starting_now();
        let poller = Poller::new(Duration::from_secs(30), 10);
        let mut check = Scripted::new(vec![Ok(PollStep::Pending), Ok(PollStep::Ready("done"))]);

        let out = poller.poll_until(&clock, &mut check).await.unwrap();

        assert_eq!(out, "done");
        assert_eq!(check.calls, 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn test_exhaustion_is_timeout() {
        let clock = ManualClock::starting_now();
        let poller = Poller::new(Duration::from_secs(30), 240);
        let mut check = Scripted::new(vec![]);

        let err = poller.poll_until(&clock, &mut check).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(check.calls, 240);
        assert_eq!(clock.total_slept(), poller.ceiling());
        assert_eq!(poller.ceiling(), Duration::from_secs(30 * 239));
    }

    #[tokio::test]
    async fn test_transient_error_consumes_attempt_and_continues() {
        let clock = ManualClock::starting_now();
        let poller = Poller::new(Duration::from_secs(1), 5);
        let mut check = Scripted::new(vec![
            Err(TestError::Throttled),
            Err(TestError::Throttled),
            Ok(PollStep::Ready("ok")),
        ]);

        let out = poller.poll_until(&clock, &mut check).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(check.calls, 3);
    }

    #[tokio::test]
    async fn test_terminal_error_stops_immediately() {
        let clock = ManualClock::starting_now();
        let poller = Poller::new(Duration::from_secs(1), 5);
        let mut check = Scripted::new(vec![Ok(PollStep::Pending), Err(TestError::Broken)]);

        let err = poller.poll_until(&clock, &mut check).await.unwrap_err();
        assert!(matches!(err, PollError::Failed(TestError::Broken)));
        assert_eq!(check.calls, 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_times_out_without_calling() {
        let clock = ManualClock::starting_now();
        let poller = Poller::new(Duration::from_secs(1), 0);
        let mut check = Scripted::new(vec![Ok(PollStep::Ready("never"))]);

        let err = poller.poll_until(&clock, &mut check).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(check.calls, 0);
    }

    #[tokio::test]
    async fn test_retry_transient_retries_once() {
        let clock = ManualClock::starting_now();
        let mut calls = 0;

        let result: Result<(), TestError> = retry_transient(&clock, DEFAULT_RETRY_DELAY, || {
            calls += 1;
            async { Err(TestError::Throttled) }
        })
        .await;

        assert_eq!(result, Err(TestError::Throttled));
        assert_eq!(calls, 2);
        assert_eq!(clock.sleeps(), vec![DEFAULT_RETRY_DELAY]);
    }

    #[tokio::test]
    async fn test_retry_transient_does_not_retry_terminal() {
        let clock = ManualClock::starting_now();
        let mut calls = 0;

        let result: Result<(), TestError> = retry_transient(&clock, DEFAULT_RETRY_DELAY, || {
            calls += 1;
            async { Err(TestError::Broken) }
        })
        .await;

        assert_eq!(result, Err(TestError::Broken));
        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_pending_forever_sleeps_exactly_ceiling(attempts in 1u32..50, secs in 1u64..60) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let clock = ManualClock::starting_now();
            let poller = Poller::new(Duration::from_secs(secs), attempts);
            let mut check = Scripted::new(vec![]);

            let err = rt.block_on(poller.poll_until(&clock, &mut check)).unwrap_err();
            proptest::prop_assert!(err.is_timeout());
            proptest::prop_assert_eq!(clock.total_slept(), poller.ceiling());
        }
    }
}
