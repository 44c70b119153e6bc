//! Connects to the local machine and runs provisioners on it without
//! producing an artifact.

use super::run_result;
use async_trait::async_trait;
use packer_core::multistep::{keys, Connector, RetryConfig, StepConnect, StepProvision};
use packer_core::{
    decode_config, new_runner, Artifact, BuildContext, Builder, Communicator, LocalCommunicator,
    PluginError, PrepareOutput, Result, StateBag, Step,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NullConfig {
    /// Directory commands run in; the plugin's working directory if unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(rename = "packer_debug", default)]
    pub debug: bool,
}

fn default_connect_attempts() -> u32 {
    3
}

/// Hands out a [`LocalCommunicator`], failing if the working directory is
/// missing.
struct LocalConnector {
    working_dir: Option<PathBuf>,
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, _state: &StateBag) -> Result<Arc<dyn Communicator>> {
        let communicator = match &self.working_dir {
            Some(dir) => {
                let meta = tokio::fs::metadata(dir)
                    .await
                    .map_err(|e| PluginError::io_with_path(e, dir))?;
                if !meta.is_dir() {
                    return Err(PluginError::Config {
                        message: format!("{} is not a directory", dir.display()),
                    });
                }
                LocalCommunicator::new().with_working_dir(dir)
            }
            None => LocalCommunicator::new(),
        };
        Ok(Arc::new(communicator))
    }
}

#[derive(Debug, Default)]
pub struct NullBuilder {
    config: Mutex<Option<NullConfig>>,
}

#[async_trait]
impl Builder for NullBuilder {
    async fn prepare(&self, raws: Vec<Value>) -> Result<PrepareOutput> {
        let config: NullConfig = decode_config(&raws)?;
        if config.connect_attempts == 0 {
            return Err(PluginError::Config {
                message: "`connect_attempts` must be at least 1".into(),
            });
        }
        *self.config.lock() = Some(config);
        Ok(PrepareOutput {
            generated_vars: vec!["ConnType".into(), "WorkingDir".into()],
            warnings: Vec::new(),
        })
    }

    async fn run(&self, ctx: BuildContext) -> Result<Option<Arc<dyn Artifact>>> {
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| PluginError::Other("null builder was not prepared".into()))?;

        let working_dir = config
            .working_dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut state = StateBag::from_context(&ctx);
        state.put(
            keys::GENERATED_DATA,
            json!({ "ConnType": "local", "WorkingDir": working_dir }),
        );

        let connect = StepConnect::new(LocalConnector {
            working_dir: config.working_dir.clone(),
        })
        .with_retry(RetryConfig::communicator().with_max_attempts(config.connect_attempts));
        let steps: Vec<Box<dyn Step>> = vec![Box::new(connect), Box::new(StepProvision::new())];
        let mut runner = new_runner(steps, config.debug, ctx.ui.clone());
        runner.run(&mut state).await;
        run_result(&mut state)?;

        Ok(None)
    }
}
