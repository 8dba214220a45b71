//! Retry and timeout wrapper used around every database and HTTP round-trip.
//!
//! Transient failures (deadlocks, lock wait timeouts, dropped connections,
//! query timeouts, rate-limited upstream calls) are retried with exponential
//! backoff and jitter. Everything else is returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{FeatureError, Result};

/// Largest accepted `max_retries`.
pub const MAX_RETRY_LIMIT: u32 = 20;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Adds ±25% jitter to each delay.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        // Large attempts overflow to infinity before the cap applies
        let secs = if secs.is_finite() { secs.clamp(0.0, cap) } else { cap };
        let delay = Duration::from_secs_f64(secs).min(self.max_delay);

        if self.add_jitter && !delay.is_zero() {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is exhausted. The last error is returned.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation_name: &str, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= config.max_retries => {
                warn!(
                    operation = operation_name,
                    error = %e,
                    attempts = attempt + 1,
                    "Retry budget exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Bound a single round-trip. Elapsed deadlines become retryable `Timeout` errors.
pub async fn with_timeout<T, Fut>(limit: Duration, operation_name: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FeatureError::Timeout {
            operation: operation_name.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retries_deadlock_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast_config(3), "upsert", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FeatureError::Deadlock("Deadlock found when trying to get lock".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<()> = with_retry(&fast_config(5), "read", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(FeatureError::SchemaMismatch("Unknown column 'rsi_14'".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(FeatureError::SchemaMismatch(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<()> = with_retry(&fast_config(2), "read", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(FeatureError::Connection("reset by peer".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_retryable_error() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), "slow query", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, FeatureError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            add_jitter: false,
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(8), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_saturates_for_large_attempts() {
        let config = RetryConfig {
            max_retries: MAX_RETRY_LIMIT,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
        };
        assert_eq!(config.delay_for(70), Duration::from_secs(30));
        assert_eq!(config.delay_for(2_000), Duration::from_secs(30));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(30));

        let jittered = RetryConfig { add_jitter: true, ..config };
        assert!(jittered.delay_for(1_100) <= Duration::from_millis(37_500));
    }
}
