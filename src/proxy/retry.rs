//! Retry with exponential backoff for upstream rate limiting.
//!
//! Only provider `429` responses are retried (see [`Error::is_retryable`]).
//! Every other failure, including connection errors, is returned after the
//! first attempt.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Attempt budget and backoff base for [`with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each one after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt with index `attempt` (0-based):
    /// `base_delay * 2^attempt`, i.e. 1s, 2s, 4s with the default base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent.
///
/// Waiting uses `tokio::time::sleep`, so only the calling task is suspended.
/// When every attempt is rate limited the result is
/// [`Error::RetriesExhausted`].
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<Error> = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.backoff(attempt - 1)).await;
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "upstream call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                let remaining = policy.max_attempts - attempt - 1;
                if remaining > 0 {
                    tracing::warn!(
                        attempt = attempt + 1,
                        remaining,
                        delay_ms = policy.backoff(attempt).as_millis() as u64,
                        error = %err,
                        "upstream rate limited, backing off"
                    );
                }
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    let message = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempts were made".to_string());
    tracing::error!(
        attempts = policy.max_attempts,
        last_error = %message,
        "upstream retries exhausted"
    );
    Err(Error::RetriesExhausted {
        attempts: policy.max_attempts,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn counting_op(
        calls: Arc<AtomicU32>,
        respond: impl Fn(u32) -> Result<&'static str>,
    ) -> impl FnMut() -> std::future::Ready<Result<&'static str>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(respond(n))
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(40), Duration::from_secs(u32::MAX as u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = with_retry(
            &RetryPolicy::default(),
            counting_op(calls.clone(), |_| Ok("ok")),
        )
        .await;

        assert_eq!(assert_ok!(result), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = with_retry(
            &RetryPolicy::default(),
            counting_op(calls.clone(), |n| {
                if n < 2 {
                    Err(Error::upstream(429, "rate limited"))
                } else {
                    Ok("recovered")
                }
            }),
        )
        .await;

        assert_eq!(assert_ok!(result), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(
            &RetryPolicy::default(),
            counting_op(calls.clone(), |_| Err(Error::upstream(429, "rate limited"))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(err @ Error::RetriesExhausted { attempts: 3, .. }) => {
                assert!(err.status().is_server_error());
                assert!(err.to_string().contains("rate limited"));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = with_retry(
            &RetryPolicy::default(),
            counting_op(calls.clone(), |_| Err(Error::upstream(500, "boom"))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(
            result,
            Err(Error::Upstream {
                status: Some(500),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(
            &RetryPolicy::default(),
            counting_op(calls.clone(), |_| {
                Err(Error::Upstream {
                    status: None,
                    message: "connection reset".to_string(),
                    headers: Default::default(),
                })
            }),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Upstream { status: None, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_after_retry_stops() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry(
            &RetryPolicy::default(),
            counting_op(calls.clone(), |n| {
                if n == 0 {
                    Err(Error::upstream(429, "rate limited"))
                } else {
                    Err(Error::upstream(401, "No auth credentials found"))
                }
            }),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(
            result,
            Err(Error::Upstream {
                status: Some(401),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
        };

        let result = with_retry(
            &policy,
            counting_op(calls.clone(), |_| Err(Error::upstream(429, "rate limited"))),
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts: 4, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 10 + 20 + 40 ms
        assert_eq!(start.elapsed(), Duration::from_millis(70));
    }
}
