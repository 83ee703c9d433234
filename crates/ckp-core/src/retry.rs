//! Retry engine with exponential backoff and explicit bail.
//!
//! The operation decides per failure whether another attempt makes sense by
//! returning [`Failure::Retry`] or [`Failure::Bail`]. Delays grow as
//! `min_delay * factor^(attempt - 1)` and are capped at `max_delay`.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::ResponseAware;

/// Backoff policy for a single retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `retries + 1` attempts in total.
    pub retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            retries: config.retries,
            min_delay: config.min_delay(),
            max_delay: config.max_delay(),
            factor: config.factor,
        }
    }
}

impl RetryPolicy {
    /// Same backoff shape, different retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let min_ms = self.min_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let raw = min_ms * self.factor.max(1.0).powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.max(min_ms) as u64)
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure<E> {
    /// Try again after backoff, if attempts remain.
    Retry(E),
    /// Abort now and surface this error.
    Bail(E),
}

impl<E> Failure<E> {
    pub fn into_inner(self) -> E {
        match self {
            Failure::Retry(e) | Failure::Bail(e) => e,
        }
    }
}

impl<E> From<E> for Failure<E> {
    fn from(e: E) -> Self {
        Failure::Retry(e)
    }
}

/// Run `op` until it succeeds, bails, or runs out of attempts.
///
/// `op` receives the 1-based attempt number. On exhaustion the error of the
/// final attempt is returned; on bail the bailed error is returned.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Failure<E>>>,
    E: std::fmt::Display,
{
    let attempts = policy.retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Failure::Bail(e)) => {
                debug!(attempt, error = %e, "operation bailed");
                return Err(e);
            }
            Err(Failure::Retry(e)) => {
                if attempt >= attempts {
                    warn!(attempt, error = %e, "retries exhausted");
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry only failures that never reached the server.
///
/// An error that carries a response is a rejection and is bailed on the spot.
pub async fn retry_on_network_error<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ResponseAware + std::fmt::Display,
{
    retry(policy, |attempt| {
        let fut = op(attempt);
        async move {
            fut.await.map_err(|e| {
                if e.carries_response() {
                    Failure::Bail(e)
                } else {
                    Failure::Retry(e)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            factor: 2.0,
        }
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let p = policy(10);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_retriable_runs_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), String> = retry(&policy(4), move |attempt| {
            c.fetch_add(1, Ordering::SeqCst);
            async move { Err(Failure::Retry(format!("attempt {}", attempt))) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(result.unwrap_err(), "attempt 5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bail_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), String> = retry(&policy(10), move |attempt| {
            c.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 3 {
                    Err(Failure::Bail("fatal".to_string()))
                } else {
                    Err(Failure::Retry("flaky".to_string()))
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), "fatal");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures() {
        let result: Result<u32, String> = retry(&policy(3), |attempt| async move {
            if attempt < 3 {
                Err(Failure::from("not yet".to_string()))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let _: Result<(), String> =
            retry(&policy(3), |_| async { Err(Failure::Retry("x".to_string())) }).await;
        // 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retry_bails_on_response() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), ServiceError> = retry_on_network_error(&policy(5), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ServiceError::Rejected {
                    status: 500,
                    message: "boom".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ServiceError::Rejected { status: 500, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_retry_retries_transport() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<&str, ServiceError> = retry_on_network_error(&policy(5), move |_| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ServiceError::Transport("reset".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
