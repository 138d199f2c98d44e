use std::future::Future;

use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::util::errors::Error;

/// Bounds for a convergence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    /// Upper bound for the whole wait, checks included.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Result of a bounded wait.
#[derive(Debug)]
pub enum PollOutcome<T> {
    Converged(T),
    /// Attempts or time ran out while the condition was still unmet.
    TimedOut,
    /// Attempts ran out and the last check failed.
    Failed(Error),
}

/// Polls `check` until it yields a value, the attempts run out or the timeout elapses.
///
/// `Ok(None)` means "not yet". Errors are treated as transient until the final
/// attempt, whose error is returned as [`PollOutcome::Failed`].
pub async fn poll_until<F, Fut, T>(policy: &RetryPolicy, context: &str, mut check: F) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let start = Instant::now();
    let attempts = policy.max_attempts.max(1);

    let polling = async {
        let mut last_error = None;
        for attempt in 1..=attempts {
            match check().await {
                Ok(Some(value)) => {
                    debug!(context, attempt, elapsed_ms = start.elapsed().as_millis(), "condition met");
                    return PollOutcome::Converged(value);
                }
                Ok(None) => {
                    debug!(context, attempt, "condition not met yet");
                    last_error = None;
                }
                Err(e) => {
                    warn!(context, attempt, error = %e, "condition check failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                sleep(policy.interval).await;
            }
        }
        match last_error {
            Some(e) => PollOutcome::Failed(e),
            None => PollOutcome::TimedOut,
        }
    };

    match timeout(policy.timeout, polling).await {
        Ok(outcome) => outcome,
        Err(_) => {
            info!(context, timeout_ms = policy.timeout.as_millis(), "wait timed out");
            PollOutcome::TimedOut
        }
    }
}

/// Exponential backoff for the `errors`-th consecutive failure, capped at `max`.
pub fn backoff_delay(errors: u32, base: Duration, max: Duration) -> Duration {
    if errors == 0 {
        return base.min(max);
    }
    let factor = 2u32.checked_pow(errors - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::errors::StdError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn converges_once_condition_holds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome = poll_until(&fast(5), "test", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((n == 3).then_some(n))
        })
        .await;
        assert!(matches!(outcome, PollOutcome::Converged(3)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_times_out() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome: PollOutcome<()> = poll_until(&fast(4), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await;
        assert!(matches!(outcome, PollOutcome::TimedOut));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn last_error_is_reported() {
        let outcome: PollOutcome<()> = poll_until(&fast(2), "test", || async {
            Err(Error::StdError(StdError::HttpError("connection refused".to_string())))
        })
        .await;
        assert!(matches!(outcome, PollOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn overall_timeout_bounds_slow_checks() {
        let policy = RetryPolicy {
            max_attempts: 100,
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        };
        let outcome: PollOutcome<()> = poll_until(&policy, "test", || async {
            sleep(Duration::from_millis(10)).await;
            Ok(None)
        })
        .await;
        assert!(matches!(outcome, PollOutcome::TimedOut));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(0, base, max), base);
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(5));
        assert_eq!(backoff_delay(2, base, max), Duration::from_secs(10));
        assert_eq!(backoff_delay(4, base, max), Duration::from_secs(40));
        assert_eq!(backoff_delay(7, base, max), max);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }
}
