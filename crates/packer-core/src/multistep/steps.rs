//! Steps most builders share.

use super::retry::{retry_async, RetryConfig};
use super::{keys, Step, StepAction, StateBag};
use crate::component::Communicator;
use crate::config::BuildConfig;
use crate::{PluginError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Opens a communicator to the machine a builder created.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, state: &StateBag) -> Result<Arc<dyn Communicator>>;
}

/// Connects a communicator, retrying while the machine boots, and stores it
/// under [`keys::COMMUNICATOR`].
pub struct StepConnect {
    connector: Box<dyn Connector>,
    retry: RetryConfig,
}

impl StepConnect {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            retry: RetryConfig::communicator(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn connect(&self, state: &StateBag) -> Result<Arc<dyn Communicator>> {
        let cancel = state.cancel_token().unwrap_or_default();
        let cancel = &cancel;
        let connector = self.connector.as_ref();
        let (result, stats) = retry_async(
            &self.retry,
            || async move {
                if cancel.is_cancelled() {
                    return Err(PluginError::Cancelled);
                }
                tokio::select! {
                    result = connector.connect(state) => result,
                    _ = cancel.cancelled() => Err(PluginError::Cancelled),
                }
            },
            |e: &PluginError| !matches!(e, PluginError::Cancelled),
        )
        .await;
        if result.is_ok() {
            info!("Communicator connected after {} attempts", stats.attempts);
        }
        result
    }
}

#[async_trait]
impl Step for StepConnect {
    fn name(&self) -> &str {
        "connect"
    }

    async fn run(&mut self, state: &mut StateBag) -> StepAction {
        if let Ok(ui) = state.ui() {
            ui.say("Waiting for communicator to become available...").await;
        }

        match self.connect(state).await {
            Ok(communicator) => {
                if let Ok(ui) = state.ui() {
                    ui.say("Connected to communicator").await;
                }
                state.put(keys::COMMUNICATOR, communicator);
                StepAction::Continue
            }
            Err(e) => {
                warn!("Failed to connect communicator: {}", e);
                state.set_error(e);
                StepAction::Halt
            }
        }
    }

    async fn cleanup(&mut self, state: &mut StateBag) {
        state.remove::<Arc<dyn Communicator>>(keys::COMMUNICATOR);
    }
}

/// Runs the provision hook with the bag's communicator and generated data.
#[derive(Debug, Default)]
pub struct StepProvision;

impl StepProvision {
    pub fn new() -> Self {
        Self
    }

    async fn provision(state: &StateBag) -> Result<()> {
        let ui = state.ui()?;
        let hook = state.hook()?;
        let data = state
            .get::<Value>(keys::GENERATED_DATA)
            .cloned()
            .unwrap_or(Value::Null);

        ui.say("Provisioning with the provision hook").await;
        hook.run(BuildConfig::PROVISION_HOOK, ui, state.communicator(), data)
            .await
    }
}

#[async_trait]
impl Step for StepProvision {
    fn name(&self) -> &str {
        "provision"
    }

    async fn run(&mut self, state: &mut StateBag) -> StepAction {
        match Self::provision(state).await {
            Ok(()) => StepAction::Continue,
            Err(PluginError::Cancelled) => {
                state.set_error(PluginError::Cancelled);
                StepAction::Halt
            }
            Err(e) => {
                state.set_error(PluginError::Step {
                    step: self.name().to_string(),
                    message: e.to_string(),
                });
                StepAction::Halt
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::communicator::LocalCommunicator;
    use crate::component::{Hook, RecordingUi, Ui};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyConnector {
        failures: u32,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _state: &StateBag) -> Result<Arc<dyn Communicator>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(PluginError::transport("connection refused"))
            } else {
                Ok(Arc::new(LocalCommunicator::new()))
            }
        }
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    fn state_with_ui() -> (StateBag, Arc<RecordingUi>) {
        let ui = Arc::new(RecordingUi::new());
        let mut state = StateBag::new();
        state.put(keys::UI, ui.clone() as Arc<dyn Ui>);
        (state, ui)
    }

    #[tokio::test]
    async fn test_connect_retries_until_available() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut step = StepConnect::new(FlakyConnector {
            failures: 2,
            attempts: attempts.clone(),
        })
        .with_retry(fast_retry(5));
        let (mut state, ui) = state_with_ui();

        assert_eq!(step.run(&mut state).await, StepAction::Continue);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(state.communicator().is_some());
        assert!(ui.said().contains(&"Connected to communicator".to_string()));

        step.cleanup(&mut state).await;
        assert!(state.communicator().is_none());
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let mut step = StepConnect::new(FlakyConnector {
            failures: u32::MAX,
            attempts: Arc::new(AtomicU32::new(0)),
        })
        .with_retry(fast_retry(2));
        let (mut state, _ui) = state_with_ui();

        assert_eq!(step.run(&mut state).await, StepAction::Halt);
        assert!(state.error().unwrap().is_transport());
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let mut step = StepConnect::new(FlakyConnector {
            failures: u32::MAX,
            attempts: Arc::new(AtomicU32::new(0)),
        });
        let (mut state, _ui) = state_with_ui();
        state.put(keys::CANCEL, token);

        assert_eq!(step.run(&mut state).await, StepAction::Halt);
        assert!(matches!(state.error(), Some(PluginError::Cancelled)));
    }

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, bool, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        async fn run(
            &self,
            name: &str,
            _ui: Arc<dyn Ui>,
            communicator: Option<Arc<dyn Communicator>>,
            data: Value,
        ) -> Result<()> {
            self.calls
                .lock()
                .push((name.to_string(), communicator.is_some(), data));
            if self.fail {
                return Err(PluginError::Remote {
                    message: "script failed".into(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_provision_runs_hook_with_generated_data() {
        let hook = Arc::new(RecordingHook::default());
        let (mut state, _ui) = state_with_ui();
        state.put(keys::HOOK, hook.clone() as Arc<dyn Hook>);
        state.put(
            keys::COMMUNICATOR,
            Arc::new(LocalCommunicator::new()) as Arc<dyn Communicator>,
        );
        state.put(keys::GENERATED_DATA, json!({"SourceAMI": "ami-1"}));

        assert_eq!(StepProvision::new().run(&mut state).await, StepAction::Continue);
        assert_eq!(
            hook.calls.lock().clone(),
            vec![(
                "packer_provision".to_string(),
                true,
                json!({"SourceAMI": "ami-1"})
            )]
        );
    }

    #[tokio::test]
    async fn test_provision_failure_halts() {
        let hook = Arc::new(RecordingHook {
            fail: true,
            ..Default::default()
        });
        let (mut state, _ui) = state_with_ui();
        state.put(keys::HOOK, hook.clone() as Arc<dyn Hook>);

        assert_eq!(StepProvision::new().run(&mut state).await, StepAction::Halt);
        match state.error() {
            Some(PluginError::Step { step, message }) => {
                assert_eq!(step, "provision");
                assert!(message.contains("script failed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hook.calls.lock()[0].2, Value::Null);
    }
}
