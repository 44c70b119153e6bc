//! Fixed-interval polling for "wait until the resource is ready" steps.

use crate::cancel::CancellationToken;
use crate::config::StepConfig;
use crate::{PluginError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Overall deadline, measured from the first check.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: StepConfig::POLL_INTERVAL,
            timeout: StepConfig::POLL_TIMEOUT,
        }
    }
}

impl PollConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Call `check` every `interval` until it yields a value.
///
/// `Ok(None)` means "not ready yet"; an error from `check` ends the poll.
/// Fails with [`PluginError::Timeout`] after `timeout` and with
/// [`PluginError::Cancelled`] as soon as `cancel` fires.
pub async fn poll_until<F, Fut, T>(config: &PollConfig, cancel: Option<&CancellationToken>, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut polls = 0u32;

    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(PluginError::Cancelled);
        }

        polls += 1;
        if let Some(value) = check().await? {
            debug!("Poll ready after {} checks", polls);
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PluginError::Timeout(config.timeout));
        }
        let wait = config.interval.min(deadline - now);

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = token.cancelled() => return Err(PluginError::Cancelled),
                }
            }
            None => sleep(wait).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready() {
        let config = PollConfig::new().with_interval(Duration::from_secs(2));
        let checks = AtomicU32::new(0);

        let state = poll_until(&config, None, || {
            let n = checks.fetch_add(1, Ordering::SeqCst);
            async move { Ok((n == 3).then_some("running")) }
        })
        .await
        .unwrap();

        assert_eq!(state, "running");
        assert_eq!(checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let config = PollConfig::new()
            .with_interval(Duration::from_secs(2))
            .with_timeout(Duration::from_secs(9));

        let result: Result<()> = poll_until(&config, None, || async { Ok(None) }).await;
        match result {
            Err(PluginError::Timeout(timeout)) => assert_eq!(timeout, Duration::from_secs(9)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_error_stops_polling() {
        let checks = AtomicU32::new(0);
        let result: Result<()> = poll_until(&PollConfig::new(), None, || {
            checks.fetch_add(1, Ordering::SeqCst);
            async { Err(PluginError::Other("instance terminated".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cancelled_while_waiting() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        let result: Result<()> = poll_until(&PollConfig::new(), Some(&token), || async { Ok(None) }).await;
        assert!(matches!(result, Err(PluginError::Cancelled)));
    }
}
