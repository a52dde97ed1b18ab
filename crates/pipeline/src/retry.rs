//! Bounded exponential backoff for transient store failures.
//!
//! Only errors for which [`StoreError::is_transient`] holds are retried.
//! Duplicate keys and missing tables fail immediately.

use std::future::Future;
use std::time::Duration;

use logwarden_core::error::StoreError;

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Calculate the next backoff delay, clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
///
/// `what` names the operation in log lines.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{what} failed, retrying",
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, policy);
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(attempt, error = %e, "{what} failed, giving up");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[test]
    fn next_delay_doubles_then_clamps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let mut delay = policy.initial_delay;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(delay.as_secs());
            delay = next_delay(delay, &policy);
        }
        assert_eq!(seen, vec![1, 2, 4, 5, 5]);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(&fast(3), "insert", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Timeout)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(3), "insert", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Backend("connection reset".into()))
        })
        .await;
        assert_matches!(result, Err(StoreError::Backend(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(5), "insert", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::SchemaMissing("iis_logs".into()))
        })
        .await;
        assert_matches!(result, Err(StoreError::SchemaMissing(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = &AtomicU32::new(0);
        let _ = with_retry(&fast(0), "insert", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::Timeout)
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
