//! Retry logic with exponential backoff and jitter.
//!
//! Steps use it for provider calls that fail transiently (throttling) and for
//! connecting a communicator to a machine that is still booting.

use crate::cancel::CancellationToken;
use crate::config::StepConfig;
use crate::{PluginError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backoff for provider throttling errors.
    pub fn throttle() -> Self {
        Self::new()
            .with_max_attempts(StepConfig::THROTTLE_RETRY_ATTEMPTS)
            .with_base_delay(StepConfig::THROTTLE_BASE_DELAY)
            .with_max_delay(StepConfig::THROTTLE_MAX_DELAY)
    }

    /// Backoff for connecting to a machine that is still booting.
    pub fn communicator() -> Self {
        Self::new()
            .with_max_attempts(StepConfig::COMMUNICATOR_RETRY_ATTEMPTS)
            .with_base_delay(StepConfig::COMMUNICATOR_BASE_DELAY)
            .with_max_delay(StepConfig::COMMUNICATOR_MAX_DELAY)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5): same mean, never near zero.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub success: bool,
    pub last_error: Option<String>,
}

/// Retry an async operation with exponential backoff.
///
/// `should_retry` decides which errors are worth another attempt.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (std::result::Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;

        let e = match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };
        stats.last_error = Some(e.to_string());

        if !should_retry(&e) {
            debug!("Error is not retryable: {}", e);
            return (Err(e), stats);
        }
        if attempt + 1 >= config.max_attempts {
            warn!(
                "All {} retry attempts exhausted. Last error: {}",
                config.max_attempts, e
            );
            return (Err(e), stats);
        }

        let delay = config.calculate_delay(attempt);
        stats.total_delay += delay;
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            config.max_attempts,
            e,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Retry a step operation on [`PluginError::is_retryable`] errors, giving up
/// with [`PluginError::Cancelled`] as soon as `cancel` fires.
pub async fn retry_step<F, Fut, T>(config: &RetryConfig, cancel: &CancellationToken, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let (result, stats) = retry_async(
        config,
        || {
            let attempt = operation();
            async move {
                if cancel.is_cancelled() {
                    return Err(PluginError::Cancelled);
                }
                tokio::select! {
                    result = attempt => result,
                    _ = cancel.cancelled() => Err(PluginError::Cancelled),
                }
            }
        },
        |e: &PluginError| e.is_retryable() && !cancel.is_cancelled(),
    )
    .await;
    if stats.attempts > 1 {
        debug!("Step operation took {} attempts", stats.attempts);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_calculation_no_jitter() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);

        assert_eq!(config.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(config.calculate_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(false);

        assert_eq!(config.calculate_delay(3), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_with_jitter() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(2))
            .with_jitter(true);

        for _ in 0..20 {
            let delay = config.calculate_delay(0);
            assert!(
                delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3),
                "Delay {:?} should be between 1s and 3s",
                delay
            );
        }
    }

    #[test]
    fn test_throttle_preset() {
        let config = RetryConfig::throttle();
        assert_eq!(config.max_attempts, 11);
        assert!(config.calculate_delay(20) <= StepConfig::THROTTLE_MAX_DELAY);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false);

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, stats) = retry_async(
            &config,
            || {
                let counter = counter_clone.clone();
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err("temporary failure".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 3);
        assert!(stats.success);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let config = RetryConfig::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false);

        let (result, stats) = retry_async(
            &config,
            || async { Err::<i32, _>("always fails".to_string()) },
            |_: &String| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.last_error, Some("always fails".to_string()));
    }

    #[tokio::test]
    async fn test_retry_step_retries_throttling_only() {
        let config = RetryConfig::throttle()
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = retry_step(&config, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 4 {
                    Err(PluginError::RateLimited {
                        service: "ec2".into(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 4);

        calls.store(0, Ordering::SeqCst);
        let result: Result<()> = retry_step(&config, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PluginError::Other("AMI not found".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_step_stops_on_cancel() {
        let config = RetryConfig::throttle();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = retry_step(&config, &cancel, || async {
            Err(PluginError::RateLimited {
                service: "ec2".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(PluginError::Cancelled)));
    }
}
