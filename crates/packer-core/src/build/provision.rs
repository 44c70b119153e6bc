//! The provision hook and the provisioner wrappers a build applies.

use crate::cancel::CancellationToken;
use crate::component::{Communicator, Hook, Provisioner, Ui};
use crate::{PluginError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A prepared provisioner and the type name it was configured as.
#[derive(Clone)]
pub struct HookedProvisioner {
    pub type_name: String,
    pub provisioner: Arc<dyn Provisioner>,
}

impl HookedProvisioner {
    pub fn new(type_name: impl Into<String>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            type_name: type_name.into(),
            provisioner,
        }
    }
}

/// Runs provisioners in order when a builder calls the provision hook.
pub struct ProvisionHook {
    provisioners: Vec<HookedProvisioner>,
    cancel: CancellationToken,
}

impl ProvisionHook {
    pub fn new(provisioners: Vec<HookedProvisioner>, cancel: CancellationToken) -> Self {
        Self {
            provisioners,
            cancel,
        }
    }
}

/// Provisioners always receive an object; anything else becomes `{}`.
fn generated_object(data: Value) -> Value {
    match data {
        Value::Object(map) => Value::Object(map),
        Value::Null => Value::Object(Map::new()),
        other => {
            warn!("Generated data is not an object, using an empty one: {}", other);
            Value::Object(Map::new())
        }
    }
}

#[async_trait]
impl Hook for ProvisionHook {
    async fn run(
        &self,
        name: &str,
        ui: Arc<dyn Ui>,
        communicator: Option<Arc<dyn Communicator>>,
        data: Value,
    ) -> Result<()> {
        if self.provisioners.is_empty() {
            return Ok(());
        }
        let communicator = communicator.ok_or_else(|| PluginError::Config {
            message: "No communicator found for provisioners! This is usually because the \
                      `communicator` config was set to \"none\". A communicator is required \
                      when provisioners are configured."
                .to_string(),
        })?;

        let generated = generated_object(data);
        for hooked in &self.provisioners {
            self.cancel.check()?;
            info!("Hook {}: running provisioner {}", name, hooked.type_name);
            hooked
                .provisioner
                .provision(
                    ui.clone(),
                    communicator.clone(),
                    generated.clone(),
                    self.cancel.clone(),
                )
                .await?;
        }
        Ok(())
    }
}

/// Waits a fixed time before running the wrapped provisioner.
pub struct PausedProvisioner {
    pause_before: Duration,
    provisioner: Arc<dyn Provisioner>,
}

impl PausedProvisioner {
    pub fn new(pause_before: Duration, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            pause_before,
            provisioner,
        }
    }
}

#[async_trait]
impl Provisioner for PausedProvisioner {
    async fn prepare(&self, raws: Vec<Value>) -> Result<()> {
        self.provisioner.prepare(raws).await
    }

    async fn provision(
        &self,
        ui: Arc<dyn Ui>,
        communicator: Arc<dyn Communicator>,
        generated: Value,
        cancel: CancellationToken,
    ) -> Result<()> {
        ui.say(&format!(
            "Pausing {:?} before the next provisioner...",
            self.pause_before
        ))
        .await;
        tokio::select! {
            _ = tokio::time::sleep(self.pause_before) => {}
            _ = cancel.cancelled() => return Err(PluginError::Cancelled),
        }
        self.provisioner
            .provision(ui, communicator, generated, cancel)
            .await
    }
}

/// Runs the wrapped provisioner again, up to `max_retries` more times, when
/// it fails.
pub struct RetriedProvisioner {
    max_retries: u32,
    provisioner: Arc<dyn Provisioner>,
}

impl RetriedProvisioner {
    pub fn new(max_retries: u32, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            max_retries,
            provisioner,
        }
    }
}

#[async_trait]
impl Provisioner for RetriedProvisioner {
    async fn prepare(&self, raws: Vec<Value>) -> Result<()> {
        self.provisioner.prepare(raws).await
    }

    async fn provision(
        &self,
        ui: Arc<dyn Ui>,
        communicator: Arc<dyn Communicator>,
        generated: Value,
        cancel: CancellationToken,
    ) -> Result<()> {
        cancel.check()?;
        let mut last_error = match self
            .provisioner
            .provision(ui.clone(), communicator.clone(), generated.clone(), cancel.clone())
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        for left in (1..=self.max_retries).rev() {
            cancel.check()?;
            ui.say(&format!(
                "Provisioner failed with \"{last_error}\", retrying with {left} trie(s) left"
            ))
            .await;
            match self
                .provisioner
                .provision(ui.clone(), communicator.clone(), generated.clone(), cancel.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Provisioner retry failed: {}", e);
                    last_error = e;
                }
            }
        }

        if self.max_retries > 0 {
            ui.say("retry limit reached.").await;
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::LocalCommunicator;
    use crate::component::RecordingUi;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` runs, records the generated data it saw.
    #[derive(Default)]
    struct CountingProvisioner {
        failures: u32,
        runs: AtomicU32,
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Provisioner for CountingProvisioner {
        async fn prepare(&self, _raws: Vec<Value>) -> Result<()> {
            Ok(())
        }

        async fn provision(
            &self,
            _ui: Arc<dyn Ui>,
            _communicator: Arc<dyn Communicator>,
            generated: Value,
            _cancel: CancellationToken,
        ) -> Result<()> {
            self.seen.lock().push(generated);
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures {
                Err(PluginError::Remote {
                    message: format!("attempt {run} failed"),
                })
            } else {
                Ok(())
            }
        }
    }

    fn local() -> Option<Arc<dyn Communicator>> {
        Some(Arc::new(LocalCommunicator::new()))
    }

    #[tokio::test]
    async fn test_hook_runs_provisioners_in_order() {
        let first = Arc::new(CountingProvisioner::default());
        let second = Arc::new(CountingProvisioner::default());
        let hook = ProvisionHook::new(
            vec![
                HookedProvisioner::new("shell", first.clone()),
                HookedProvisioner::new("file", second.clone()),
            ],
            CancellationToken::new(),
        );

        hook.run(
            "packer_provision",
            Arc::new(RecordingUi::new()),
            local(),
            json!({"Host": "10.0.0.1"}),
        )
        .await
        .unwrap();

        assert_eq!(first.seen.lock().clone(), vec![json!({"Host": "10.0.0.1"})]);
        assert_eq!(second.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hook_stops_at_first_failure() {
        let failing = Arc::new(CountingProvisioner {
            failures: 1,
            ..Default::default()
        });
        let never = Arc::new(CountingProvisioner::default());
        let hook = ProvisionHook::new(
            vec![
                HookedProvisioner::new("shell", failing),
                HookedProvisioner::new("file", never.clone()),
            ],
            CancellationToken::new(),
        );

        let result = hook
            .run("packer_provision", Arc::new(RecordingUi::new()), local(), Value::Null)
            .await;
        assert!(result.is_err());
        assert_eq!(never.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hook_requires_communicator() {
        let hook = ProvisionHook::new(
            vec![HookedProvisioner::new("shell", Arc::new(CountingProvisioner::default()))],
            CancellationToken::new(),
        );
        match hook
            .run("packer_provision", Arc::new(RecordingUi::new()), None, Value::Null)
            .await
        {
            Err(PluginError::Config { message }) => assert!(message.contains("No communicator")),
            other => panic!("unexpected result: {other:?}"),
        }

        // Without provisioners a missing communicator is fine.
        let empty = ProvisionHook::new(Vec::new(), CancellationToken::new());
        empty
            .run("packer_provision", Arc::new(RecordingUi::new()), None, Value::Null)
            .await
            .unwrap();
    }

    #[test]
    fn test_non_object_data_becomes_empty_object() {
        assert_eq!(generated_object(json!([1, 2])), json!({}));
        assert_eq!(generated_object(Value::Null), json!({}));
        assert_eq!(generated_object(json!({"ID": "i-1"})), json!({"ID": "i-1"}));
    }

    #[tokio::test]
    async fn test_retried_provisioner() {
        let inner = Arc::new(CountingProvisioner {
            failures: 2,
            ..Default::default()
        });
        let ui = Arc::new(RecordingUi::new());
        RetriedProvisioner::new(3, inner.clone())
            .provision(
                ui.clone(),
                Arc::new(LocalCommunicator::new()),
                json!({}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(inner.runs.load(Ordering::SeqCst), 3);
        assert_eq!(ui.said().len(), 2);

        let hopeless = Arc::new(CountingProvisioner {
            failures: u32::MAX,
            ..Default::default()
        });
        let ui = Arc::new(RecordingUi::new());
        let result = RetriedProvisioner::new(1, hopeless.clone())
            .provision(
                ui.clone(),
                Arc::new(LocalCommunicator::new()),
                json!({}),
                CancellationToken::new(),
            )
            .await;
        assert!(result.unwrap_err().to_string().contains("attempt 1 failed"));
        assert_eq!(hopeless.runs.load(Ordering::SeqCst), 2);
        assert_eq!(ui.said().last().unwrap(), "retry limit reached.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_provisioner_waits_and_honours_cancel() {
        let inner = Arc::new(CountingProvisioner::default());
        let paused = PausedProvisioner::new(Duration::from_secs(10), inner.clone());
        let started = tokio::time::Instant::now();
        paused
            .provision(
                Arc::new(RecordingUi::new()),
                Arc::new(LocalCommunicator::new()),
                json!({}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(inner.runs.load(Ordering::SeqCst), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = paused
            .provision(
                Arc::new(RecordingUi::new()),
                Arc::new(LocalCommunicator::new()),
                json!({}),
                cancel,
            )
            .await;
        assert!(matches!(result, Err(PluginError::Cancelled)));
        assert_eq!(inner.runs.load(Ordering::SeqCst), 1);
    }
}
