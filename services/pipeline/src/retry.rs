//! Bounded retry with exponential backoff, and per-call deadlines.
//!
//! Every blocking call a stage makes (storage, warehouse, channel publish) is
//! wrapped in [`with_deadline`] so a hang surfaces as a transient error, and
//! in [`retry_transient`] so transient errors are retried a bounded number of
//! times before the caller classifies the failure.

use crate::config::RetryConfig;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Classification used to decide whether an error is worth retrying
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// A call did not complete within its deadline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} timed out after {after:?}")]
pub struct TimedOut {
    pub operation: String,
    pub after: Duration,
}

/// Run `fut`, failing with [`TimedOut`] if it does not finish within `limit`
pub async fn with_deadline<T, E, Fut>(limit: Duration, operation: &str, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<TimedOut>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TimedOut {
            operation: operation.to_string(),
            after: limit,
        }
        .into()),
    }
}

fn build_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_interval())
        .with_max_interval(config.max_interval())
        .with_multiplier(config.multiplier)
        .with_max_elapsed_time(None)
        .build()
}

/// Retry `operation` while it fails with a transient error.
///
/// Returns the first success, the first non-transient error, or the last
/// transient error once `max_attempts` is spent.
pub async fn retry_transient<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut backoff = build_backoff(config);
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation,
                    attempts = attempt,
                    error = %e,
                    "Retry budget exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or_else(|| config.max_interval());
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("broken")]
        Broken,
        #[error(transparent)]
        Timeout(#[from] TimedOut),
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            !matches!(self, TestError::Broken)
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_interval_ms: 1,
            max_interval_ms: 2,
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<u32, TestError> = retry_transient(&fast_retry(5), "flaky op", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(TestError::Flaky)
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_at_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), TestError> = retry_transient(&fast_retry(4), "always flaky", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Flaky)
        })
        .await;

        assert!(matches!(result, Err(TestError::Flaky)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), TestError> = retry_transient(&fast_retry(5), "broken op", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Broken)
        })
        .await;

        assert!(matches!(result, Err(TestError::Broken)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_converts_hang_to_timeout() {
        let result: Result<(), TestError> = with_deadline(
            Duration::from_millis(10),
            "hanging call",
            std::future::pending::<Result<(), TestError>>(),
        )
        .await;

        match result {
            Err(TestError::Timeout(t)) => {
                assert_eq!(t.operation, "hanging call");
                assert!(TestError::Timeout(t).is_transient());
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
