use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{error, warn};

use crate::models::common::RetrySettings;
use crate::models::errors::RpcError;
use crate::utils::strip_html;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 20_000,
            exponential: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            ..Self::default()
        }
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for anyhow::Error {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the attempt
/// budget is spent. The last error is returned unchanged so callers can classify it.
pub async fn retry<F, Fut, T, E>(operation: F, config: &RetryConfig, context: &str) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        "Operation '{}' failed after {} attempts. Final error: {}",
                        context,
                        attempt,
                        strip_html(&e.to_string())
                    );
                    return Err(e);
                }

                let delay = backoff_delay(config, attempt);
                warn!(
                    "Attempt {}/{} for '{}' failed: {}. Retrying in {}ms...",
                    attempt,
                    config.max_attempts,
                    context,
                    strip_html(&e.to_string()),
                    delay
                );

                sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

/// Delay before retrying after failed attempt `attempt` (1-based).
///
/// The ceiling grows as `base * exponential^(attempt - 1)` up to `max_delay_ms`;
/// the actual delay is drawn uniformly from the upper half of it (equal jitter).
/// https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let ceiling = config.base_delay_ms as f64 * config.exponential.max(1.0).powi(exponent);
    let ceiling = if ceiling.is_finite() {
        (ceiling as u64).min(config.max_delay_ms)
    } else {
        config.max_delay_ms
    };
    fastrand::u64(ceiling / 2..=ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            exponential: 2.0,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RpcError::Transient("connection reset".to_string()))
                } else {
                    Ok(42)
                }
            },
            &fast_config(5),
            "flaky",
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_budget_is_spent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RpcError> = retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::Transient("503".to_string()))
            },
            &fast_config(3),
            "down",
        )
        .await;

        assert!(matches!(result, Err(RpcError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_grows_with_attempts_until_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 20,
            max_delay_ms: 1_000,
            exponential: 2.0,
        };
        let mean = |attempt: u32| {
            (0..2_000)
                .map(|_| backoff_delay(&config, attempt))
                .sum::<u64>() as f64
                / 2_000.0
        };

        // Ceilings 20, 40, 80, 160, 320
        let means: Vec<f64> = (1..=5).map(mean).collect();
        for pair in means.windows(2) {
            assert!(pair[1] > pair[0] * 1.5, "means {means:?}");
        }
        assert!((10..=20).contains(&backoff_delay(&config, 1)));
        assert!((160..=320).contains(&backoff_delay(&config, 5)));

        // 20 * 2^9 exceeds the cap
        for _ in 0..100 {
            assert!((500..=1_000).contains(&backoff_delay(&config, 10)));
        }
        assert!((500..=1_000).contains(&backoff_delay(&config, u32::MAX)));
    }

    #[tokio::test]
    async fn does_not_retry_too_large_or_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RpcError> = retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::TooLarge)
            },
            &fast_config(5),
            "oversized",
        )
        .await;

        assert_eq!(result, Err(RpcError::TooLarge));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
