//! Bounded polling with pluggable backoff.
//!
//! [`await_condition`] repeatedly evaluates a caller-supplied check until it
//! reports done, reports an error, or the policy's maximum elapsed time runs
//! out. The poller does no error classification: a check that wants to abort
//! (for example because the provider reports a hard failure state) returns
//! `Err`, and that error is handed back untouched.
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{await_condition, BackoffPolicy};
//!
//! let policy = BackoffPolicy::constant(Duration::from_secs(20), Duration::from_secs(3600));
//! await_condition(&policy, "cluster running", || async {
//!     let snapshot = driver.fetch_status().await?;
//!     Ok(snapshot.status == ClusterStatus::Running)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::Error;

/// Delay schedule between two evaluations of a condition
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay after every attempt
    Constant(Duration),
    /// Delay grows by `multiplier` after every attempt, capped at `max_delay`
    Exponential {
        /// Delay after the first attempt
        initial: Duration,
        /// Upper bound for any single delay
        max_delay: Duration,
        /// Growth factor per attempt
        multiplier: f64,
    },
}

/// How long to wait between checks and when to give up
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay schedule
    pub backoff: Backoff,
    /// Total time budget measured from the first evaluation
    pub max_elapsed: Duration,
    /// Scale each delay by a random factor in 0.5..1.5 to spread out callers
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Constant delay between attempts
    pub fn constant(delay: Duration, max_elapsed: Duration) -> Self {
        Self {
            backoff: Backoff::Constant(delay),
            max_elapsed,
            jitter: false,
        }
    }

    /// Doubling delay between attempts, capped at `max_delay`
    pub fn exponential(initial: Duration, max_delay: Duration, max_elapsed: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential {
                initial,
                max_delay,
                multiplier: 2.0,
            },
            max_elapsed,
            jitter: false,
        }
    }

    /// Enable jitter on every delay
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay to sleep after the given (1-based) failed attempt, before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Constant(delay) => *delay,
            Backoff::Exponential {
                initial,
                max_delay,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                Duration::from_secs_f64(secs.min(max_delay.as_secs_f64()))
            }
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }
}

/// Why a bounded wait ended without success
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The maximum elapsed time ran out before the condition was met
    #[error("timed out after {elapsed:?} ({attempts} attempts)")]
    Timeout {
        /// Number of completed evaluations
        attempts: u32,
        /// Time spent waiting
        elapsed: Duration,
    },
    /// The condition reported an error
    #[error("{0}")]
    Condition(E),
}

impl PollError<Error> {
    /// Collapse into the crate error, mapping a timeout to [`Error::Timeout`]
    pub fn into_error(self, cluster: &str, operation: &str) -> Error {
        match self {
            PollError::Timeout { elapsed, .. } => Error::timeout(cluster, operation, elapsed),
            PollError::Condition(err) => err,
        }
    }
}

/// Evaluate `condition` until it returns `Ok(true)`, returns `Err`, or
/// `policy.max_elapsed` has passed.
///
/// * `Ok(false)` - not ready yet, sleep per the policy and check again
/// * `Ok(true)` - done
/// * `Err(e)` - abort immediately with [`PollError::Condition`]
///
/// The condition is always evaluated at least once. Sleeps never extend past
/// the deadline, and an evaluation still running at the deadline is abandoned,
/// so a timeout is reported no later than one scheduler tick after
/// `max_elapsed`.
pub async fn await_condition<F, Fut, E>(
    policy: &BackoffPolicy,
    operation_name: &str,
    mut condition: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let start = Instant::now();
    let deadline = start + policy.max_elapsed;
    let mut attempts = 0u32;

    loop {
        let outcome = tokio::time::timeout_at(deadline, condition()).await;
        attempts += 1;

        match outcome {
            Ok(Ok(true)) => {
                debug!(
                    operation = %operation_name,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis(),
                    "condition met"
                );
                return Ok(());
            }
            Ok(Ok(false)) => {
                trace!(operation = %operation_name, attempts, "condition not met yet");
            }
            Ok(Err(e)) => return Err(PollError::Condition(e)),
            Err(_) => {
                return Err(PollError::Timeout {
                    attempts,
                    elapsed: start.elapsed(),
                })
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                attempts,
                elapsed: now - start,
            });
        }

        let delay = policy.delay(attempts).min(deadline - now);
        trace!(
            operation = %operation_name,
            delay_ms = delay.as_millis(),
            "waiting before next check"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let policy = BackoffPolicy::constant(Duration::ZERO, Duration::from_secs(1));
        let result: Result<(), PollError<&str>> =
            await_condition(&policy, "op", || async { Ok(true) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_n_false_results_take_n_plus_one_evaluations() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let policy = BackoffPolicy::constant(Duration::ZERO, Duration::from_secs(5));

        let result: Result<(), PollError<&str>> = await_condition(&policy, "op", || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 4) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_condition_error_aborts_without_retry() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let policy = BackoffPolicy::constant(Duration::from_millis(1), Duration::from_secs(5));

        let result = await_condition(&policy, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<bool, _>("provider reported failure")
            }
        })
        .await;

        match result {
            Err(PollError::Condition(e)) => assert_eq!(e, "provider reported failure"),
            other => panic!("expected condition error, got {other:?}"),
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_within_one_delay_of_max_elapsed() {
        let policy =
            BackoffPolicy::constant(Duration::from_millis(30), Duration::from_millis(100));
        let start = Instant::now();

        let result: Result<(), PollError<&str>> =
            await_condition(&policy, "never", || async { Ok(false) }).await;

        let elapsed = start.elapsed();
        match result {
            Err(PollError::Timeout { attempts, .. }) => assert!(attempts >= 4),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(130));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_condition_is_abandoned_at_deadline() {
        let policy = BackoffPolicy::constant(Duration::ZERO, Duration::from_millis(100));
        let start = Instant::now();

        let result: Result<(), PollError<&str>> = await_condition(&policy, "slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(true)
        })
        .await;

        assert!(matches!(result, Err(PollError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = BackoffPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_millis(500),
            Duration::from_secs(10),
        );
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(500));
        assert_eq!(policy.base_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy =
            BackoffPolicy::constant(Duration::from_millis(100), Duration::from_secs(1)).with_jitter();
        for attempt in 1..50 {
            let delay = policy.delay(attempt);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_timeout_maps_to_crate_error() {
        let err = PollError::<Error>::Timeout {
            attempts: 3,
            elapsed: Duration::from_secs(60),
        }
        .into_error("demo", "cluster running");
        assert!(err.is_timeout());
        assert_eq!(err.cluster(), Some("demo"));

        let err = PollError::Condition(Error::provider_for("demo", "gke", "ERROR"))
            .into_error("demo", "cluster running");
        assert!(matches!(err, Error::Provider { .. }));
    }
}
