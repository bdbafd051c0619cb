//! Exponential backoff for transient storage failures.

use std::{future::Future, time::Duration};

use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::StorageError;
use crate::execution::CancellationFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Hard ceiling on time spent sleeping between attempts.
    pub max_total_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_total_wait: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy gives up.
///
/// `op` receives the 1-based attempt number. Only [`StorageError::Transient`]
/// is retried. The cancellation flag is checked before every attempt after
/// the first and after every backoff sleep.
///
/// # Errors
///
/// The last error seen, or [`StorageError::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationFlag>,
    mut op: F,
) -> Result<T, StorageError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let started = Instant::now();
    let mut waited = Duration::ZERO;
    let mut attempt = 1;

    loop {
        let err = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, elapsed = ?started.elapsed(), "storage call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= policy.max_attempts {
            return Err(err);
        }
        let delay = policy.delay_after(attempt);
        if waited + delay > policy.max_total_wait {
            warn!(attempt, ?waited, "retry budget exhausted");
            return Err(err);
        }

        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient storage failure, retrying"
        );
        if cancel.is_some_and(CancellationFlag::is_cancelled) {
            return Err(StorageError::Cancelled);
        }
        sleep(delay).await;
        waited += delay;
        if cancel.is_some_and(CancellationFlag::is_cancelled) {
            return Err(StorageError::Cancelled);
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            max_total_wait: Duration::from_secs(5),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = policy();
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(250));
        assert_eq!(p.delay_after(40), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success_is_invisible() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry(&policy(), None, |attempt| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt == 1 {
                    Err(StorageError::Transient("connection reset".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&policy(), None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Permanent("syntax error".into())) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&policy(), None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Transient("busy".into())) }
        })
        .await;

        assert!(matches!(result, Err(StorageError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn total_wait_ceiling_stops_early() {
        let tight = RetryPolicy {
            max_attempts: 10,
            max_total_wait: Duration::from_millis(150),
            ..policy()
        };
        let calls = AtomicU32::new(0);
        let _: Result<(), _> = with_retry(&tight, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Transient("busy".into())) }
        })
        .await;

        // 100ms after the first failure fits, the next 200ms does not.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_observed_between_attempts() {
        let cancel = CancellationFlag::new();
        let result: Result<(), _> = with_retry(&policy(), Some(&cancel), |_| {
            cancel.cancel();
            async { Err(StorageError::Transient("busy".into())) }
        })
        .await;

        assert_eq!(result, Err(StorageError::Cancelled));
    }
}
