//! Retry wrapper for provider calls.
//!
//! Exponential backoff with jitter over a typed retryable predicate.
//! Rate-limit hints from the provider are honored as a minimum delay.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::LlmError;

/// Backoff parameters for [`retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Jitter fraction applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// The backoff for a zero-indexed attempt, before jitter.
    ///
    /// A rate-limit hint acts as a floor: the provider knows better
    /// than our schedule.
    pub fn delay_for(&self, attempt: u32, hint_secs: Option<u64>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        match hint_secs {
            Some(secs) => exponential.max(Duration::from_secs(secs)),
            None => exponential,
        }
    }

    /// Apply ±jitter to a delay.
    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }
}

/// Run `op` until it succeeds, the error is not retryable, or attempts
/// are exhausted. Returns the final error in the latter cases.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let last_attempt = attempt + 1 >= policy.max_attempts;
                if last_attempt || !err.is_retryable() {
                    return Err(err);
                }
                let delay = policy.with_jitter(policy.delay_for(attempt, err.retry_hint_secs()));
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying LLM call",
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(1, None), Duration::from_millis(400));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(800));
        assert_eq!(p.delay_for(10, None), Duration::from_secs(5));
    }

    #[test]
    fn hint_is_a_floor_not_a_replacement() {
        let p = policy();
        assert_eq!(p.delay_for(0, Some(2)), Duration::from_secs(2));
        // A hint below the computed backoff does not shorten it.
        assert_eq!(p.delay_for(10, Some(1)), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::Timeout { seconds: 30 })
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.expect("ok"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::Api {
                    status: 401,
                    message: "invalid key".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parse_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Parse("bad".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
