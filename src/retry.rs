//! Single retry policy shared by every external-service adapter.
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::ServiceError;

/// Bounded exponential backoff: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0 = first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, service: &'static str, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(?err, service, attempt, ?delay, "retrying external call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Queue redelivery delay: 5s * 2^attempt, capped at `max_cap_secs` when positive.
pub fn redelivery_backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn redelivery_backoff_respects_cap() {
        assert_eq!(redelivery_backoff_secs(0, 60), 5);
        assert_eq!(redelivery_backoff_secs(2, 60), 20);
        assert_eq!(redelivery_backoff_secs(5, 60), 60);
        assert_eq!(redelivery_backoff_secs(3, 0), 40);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = fast()
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ServiceError::Timeout { service: "test" })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run::<(), _, _>("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ServiceError::Status {
                        service: "test",
                        status: 503,
                        body: String::new(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 503, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let calls = AtomicU32::new(0);
        let _ = fast()
            .run::<(), _, _>("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ServiceError::Status {
                        service: "test",
                        status: 400,
                        body: String::new(),
                    })
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
