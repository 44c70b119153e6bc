//! Core-side build orchestration: hooks, the build object and running
//! several builds at once.

mod core_build;
mod provision;
mod run;

pub use core_build::{CoreBuild, CorePostProcessor, CoreProvisioner};
pub use provision::{HookedProvisioner, PausedProvisioner, ProvisionHook, RetriedProvisioner};
pub use run::{run_builds, BuildOutcome};

use crate::cancel::CancellationToken;
use crate::component::{Communicator, Hook, Ui};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Routes a hook call to every hook registered under its name, in
/// registration order. Names without hooks succeed immediately.
#[derive(Default)]
pub struct DispatchHook {
    hooks: HashMap<String, Vec<Arc<dyn Hook>>>,
    cancel: Option<CancellationToken>,
}

impl DispatchHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> &mut Self {
        self.hooks.entry(name.into()).or_default().push(hook);
        self
    }

    pub fn with_hook(mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> Self {
        self.add(name, hook);
        self
    }

    /// Stop between hooks once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.keys().map(String::as_str)
    }
}

#[async_trait]
impl Hook for DispatchHook {
    async fn run(
        &self,
        name: &str,
        ui: Arc<dyn Ui>,
        communicator: Option<Arc<dyn Communicator>>,
        data: Value,
    ) -> Result<()> {
        let Some(hooks) = self.hooks.get(name) else {
            debug!("No hooks registered for {}", name);
            return Ok(());
        };

        for hook in hooks {
            if let Some(cancel) = &self.cancel {
                cancel.check()?;
            }
            hook.run(name, ui.clone(), communicator.clone(), data.clone())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::RecordingUi;
    use crate::PluginError;
    use parking_lot::Mutex;

    struct TagHook {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Hook for TagHook {
        async fn run(
            &self,
            name: &str,
            _ui: Arc<dyn Ui>,
            _communicator: Option<Arc<dyn Communicator>>,
            _data: Value,
        ) -> Result<()> {
            self.log.lock().push(format!("{name}:{}", self.tag));
            Ok(())
        }
    }

    fn tag(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Hook> {
        Arc::new(TagHook {
            tag,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_by_name_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hook = DispatchHook::new()
            .with_hook("packer_provision", tag("a", &log))
            .with_hook("packer_provision", tag("b", &log))
            .with_hook("packer_cleanup", tag("c", &log));

        hook.run("packer_provision", Arc::new(RecordingUi::new()), None, Value::Null)
            .await
            .unwrap();
        hook.run("unknown", Arc::new(RecordingUi::new()), None, Value::Null)
            .await
            .unwrap();

        assert_eq!(
            log.lock().clone(),
            vec!["packer_provision:a".to_string(), "packer_provision:b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dispatch_stops_when_cancelled() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let hook = DispatchHook::new()
            .with_hook("packer_provision", tag("a", &log))
            .with_cancel(cancel);

        let result = hook
            .run("packer_provision", Arc::new(RecordingUi::new()), None, Value::Null)
            .await;
        assert!(matches!(result, Err(PluginError::Cancelled)));
        assert!(log.lock().is_empty());
    }
}
