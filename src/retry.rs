//! Connection retry with exponential backoff.
//!
//! Used only while establishing the broker connection. A process that cannot
//! reach its broker retries for a bounded number of attempts and then fails
//! with [`RpcError::Connection`](crate::RpcError::Connection); it never keeps
//! running without consumers.
//!
//! # Retry Strategy
//!
//! - Only retries errors for which [`RpcError::is_retryable`](crate::RpcError::is_retryable) holds
//! - Uses exponential backoff with randomized jitter to prevent thundering herd
//! - Caps delay at `max_delay` to prevent excessive wait times

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration with exponential backoff.
///
/// # Example
///
/// ```
/// use queue_rpc::RetryConfig;
/// use std::time::Duration;
///
/// let retry_config = RetryConfig {
///     max_attempts: 5,
///     multiplier: 2.0,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// - `max_attempts`: 5
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 200ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 5,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run `operation`, retrying retryable failures according to `retry_config`.
///
/// With `None` the operation runs exactly once. Non-retryable errors are
/// returned immediately; once attempts are exhausted the last error is returned.
#[cfg_attr(not(feature = "transport_lapin"), allow(dead_code))]
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let Some(retry_config) = retry_config else {
        return operation().await;
    };

    let mut attempt = 0;
    let mut current_delay = retry_config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() => {
                attempt += 1;

                if attempt > retry_config.max_attempts {
                    crate::log_error!(
                        "giving up after {} retries, last error: {err}",
                        retry_config.max_attempts
                    );
                    return Err(err);
                }

                let jittered_delay = apply_jitter(current_delay);

                crate::log_warn!(
                    "attempt {}/{} failed ({err}), retrying in {:?}",
                    attempt,
                    retry_config.max_attempts,
                    jittered_delay
                );

                sleep(jittered_delay).await;

                let next_delay = Duration::from_secs_f64(
                    current_delay.as_secs_f64() * retry_config.multiplier as f64,
                );
                current_delay = next_delay.min(retry_config.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Apply ±25% jitter: `delay * (0.75 + random(0.0..0.5))`.
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let hash = RandomState::new().hash_one(std::time::SystemTime::now());
    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::RpcError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_connects_after_transient_failures() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry_with_backoff(Some(&fast_retry(3)), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RpcError::Connection("refused".into()))
                } else {
                    Ok("connected")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fails_fast_when_exhausted() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: crate::Result<()> = retry_with_backoff(Some(&fast_retry(2)), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::Connection("refused".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(RpcError::Connection(_))));
        // Initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_none_config_executes_once() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: crate::Result<()> = retry_with_backoff(None, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::Connection("refused".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_on_config_error() {
        // ---
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: crate::Result<()> = retry_with_backoff(Some(&fast_retry(5)), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::InvalidConfig("bad scheme".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(RpcError::InvalidConfig(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_range() {
        // ---
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = apply_jitter(delay);
            assert!(jittered >= Duration::from_millis(75), "jitter too low: {jittered:?}");
            assert!(jittered <= Duration::from_millis(125), "jitter too high: {jittered:?}");
        }
    }
}
