//! Bounded retry with exponential backoff and a per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::LlmError;

/// Retry policy for model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each failure.
    pub backoff_rate: f64,
    /// Upper bound on a single delay.
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(2),
            backoff_rate: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_rate.powi(exp);
        Duration::from_secs_f64(secs).min(self.max_interval)
    }

    /// Longest a retried call can take when every attempt runs into
    /// `per_attempt` and every delay is waited out in full.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let delays: Duration = (1..attempts).map(|a| self.delay_after(a)).sum();
        per_attempt * attempts + delays
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Each attempt is bounded by `timeout`; an elapsed attempt counts as a
/// transient failure.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    provider: &str,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                provider: provider.to_string(),
                after: timeout,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                return Err(LlmError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = match &e {
                    LlmError::RateLimited {
                        retry_after: Some(after),
                        ..
                    } => (*after).min(policy.max_interval),
                    _ => policy.delay_after(attempt),
                };
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Model call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            backoff_rate: 2.0,
            max_interval: Duration::from_millis(5),
        }
    }

    fn transient() -> LlmError {
        LlmError::RequestFailed {
            provider: "test".into(),
            reason: "503".into(),
        }
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(10), Duration::from_secs(30));
    }

    #[test]
    fn worst_case_counts_attempts_and_delays() {
        let policy = RetryPolicy::default();
        // 3 × 30 s attempts plus 2 s and 4 s waits
        assert_eq!(policy.worst_case(Duration::from_secs(30)), Duration::from_secs(96));

        let single = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        assert_eq!(single.worst_case(Duration::from_secs(30)), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(&fast_policy(3), Duration::from_secs(1), "test", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> =
            with_retry(&fast_policy(3), Duration::from_secs(1), "test", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(LlmError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> =
            with_retry(&fast_policy(3), Duration::from_secs(1), "test", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::AuthFailed {
                        provider: "test".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let result: Result<(), _> =
            with_retry(&fast_policy(2), Duration::from_millis(10), "test", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        match result {
            Err(LlmError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, LlmError::Timeout { .. }));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }
}
