//! Domain interfaces shared by the core and plugins.
//!
//! Every interface here has an in-process implementation on one side of the
//! plugin boundary and a client proxy (see [`crate::proxy`]) on the other, so
//! callers never know which they hold.

mod artifact;
mod ui;

pub use artifact::BasicArtifact;
pub use ui::{BasicUi, PrefixedUi, RecordingUi, UiEvent};

use crate::cancel::CancellationToken;
use crate::{PluginError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Terminal output and input of the core.
#[async_trait]
pub trait Ui: Send + Sync {
    async fn say(&self, message: &str);
    async fn message(&self, message: &str);
    async fn error(&self, message: &str);
    async fn machine(&self, kind: &str, args: &[String]);
    async fn ask(&self, query: &str) -> Result<String>;
}

/// Named extension point a builder calls during its run.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(
        &self,
        name: &str,
        ui: Arc<dyn Ui>,
        communicator: Option<Arc<dyn Communicator>>,
        data: Value,
    ) -> Result<()>;
}

/// A command to run on the machine being built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCmd {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

impl RemoteCmd {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CmdOutput {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Access to the machine being built.
#[async_trait]
pub trait Communicator: Send + Sync {
    async fn start(&self, cmd: RemoteCmd) -> Result<CmdOutput>;
    async fn upload(&self, path: &str, data: Vec<u8>) -> Result<()>;
    async fn upload_dir(&self, dst: &str, src: &str, exclude: &[String]) -> Result<()>;
    async fn download(&self, path: &str) -> Result<Vec<u8>>;
    async fn download_dir(&self, src: &str, dst: &str, exclude: &[String]) -> Result<()>;
}

/// The result of a build or post-processor.
#[async_trait]
pub trait Artifact: Send + Sync {
    async fn builder_id(&self) -> Result<String>;
    async fn files(&self) -> Result<Vec<String>>;
    async fn id(&self) -> Result<String>;
    async fn description(&self) -> Result<String>;
    async fn state(&self, name: &str) -> Result<Option<Value>>;
    async fn destroy(&self) -> Result<()>;
}

/// Named locks over shared downloaded files.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Exclusive lock; returns the path to write.
    async fn lock(&self, key: &str) -> Result<PathBuf>;
    async fn unlock(&self, key: &str) -> Result<()>;
    /// Shared lock; returns the path and whether it exists.
    async fn rlock(&self, key: &str) -> Result<(PathBuf, bool)>;
    async fn runlock(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrepareOutput {
    /// Names of variables the builder makes available to provisioners.
    pub generated_vars: Vec<String>,
    pub warnings: Vec<String>,
}

/// What a builder receives for one run.
#[derive(Clone)]
pub struct BuildContext {
    pub ui: Arc<dyn Ui>,
    pub hook: Arc<dyn Hook>,
    pub cache: Arc<dyn Cache>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn prepare(&self, raws: Vec<Value>) -> Result<PrepareOutput>;
    async fn run(&self, ctx: BuildContext) -> Result<Option<Arc<dyn Artifact>>>;
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn prepare(&self, raws: Vec<Value>) -> Result<()>;
    async fn provision(
        &self,
        ui: Arc<dyn Ui>,
        communicator: Arc<dyn Communicator>,
        generated: Value,
        cancel: CancellationToken,
    ) -> Result<()>;
}

pub struct PostProcessOutput {
    pub artifact: Option<Arc<dyn Artifact>>,
    /// Keep the input artifact.
    pub keep: bool,
    /// `keep` overrides the user's `keep_input_artifact` setting.
    pub force_override: bool,
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn configure(&self, raws: Vec<Value>) -> Result<()>;
    async fn post_process(
        &self,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
        cancel: CancellationToken,
    ) -> Result<PostProcessOutput>;
}

#[async_trait]
pub trait PreProcessor: Send + Sync {
    async fn configure(&self, raws: Vec<Value>) -> Result<()>;
    async fn pre_process(&self, ui: Arc<dyn Ui>, input: Value) -> Result<Value>;
}

#[async_trait]
pub trait Datasource: Send + Sync {
    async fn configure(&self, raws: Vec<Value>) -> Result<()>;
    /// Names of the values `execute` produces.
    async fn output_spec(&self) -> Result<Vec<String>>;
    async fn execute(&self) -> Result<Value>;
}

/// What to do with a failed build's resources.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Cleanup,
    Abort,
}

impl OnError {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnError::Cleanup => "cleanup",
            OnError::Abort => "abort",
        }
    }
}

/// One configured build: a builder plus its provisioners and post-processors.
#[async_trait]
pub trait Build: Send + Sync {
    async fn name(&self) -> Result<String>;
    /// Returns warnings.
    async fn prepare(&self) -> Result<Vec<String>>;
    async fn run(&self, ui: Arc<dyn Ui>, cancel: CancellationToken) -> Result<Vec<Arc<dyn Artifact>>>;
    async fn set_debug(&self, debug: bool) -> Result<()>;
    async fn set_force(&self, force: bool) -> Result<()>;
    async fn set_on_error(&self, on_error: OnError) -> Result<()>;
}

/// Merge raw configuration objects (later keys win) and decode them.
///
/// Non-object raws are rejected; `null` raws are skipped.
pub fn decode_config<T: DeserializeOwned>(raws: &[Value]) -> Result<T> {
    let mut merged = serde_json::Map::new();
    for raw in raws {
        match raw {
            Value::Object(map) => {
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                return Err(PluginError::Config {
                    message: format!("expected a configuration object, got {other}"),
                })
            }
        }
    }
    serde_json::from_value(Value::Object(merged)).map_err(|e| PluginError::Config {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        #[serde(default)]
        count: u32,
    }

    #[test]
    fn test_decode_config_later_wins() {
        let raws = vec![
            json!({"name": "a", "count": 1}),
            Value::Null,
            json!({"name": "b", "packer_build_name": "ignored"}),
        ];
        let sample: Sample = decode_config(&raws).unwrap();
        assert_eq!(
            sample,
            Sample {
                name: "b".into(),
                count: 1
            }
        );
    }

    #[test]
    fn test_decode_config_rejects_non_objects() {
        match decode_config::<Sample>(&[json!([1, 2])]) {
            Err(PluginError::Config { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_config_missing_field() {
        assert!(decode_config::<Sample>(&[json!({"count": 3})]).is_err());
    }

    #[test]
    fn test_on_error_serde() {
        assert_eq!(serde_json::to_value(OnError::Abort).unwrap(), json!("abort"));
        assert_eq!(OnError::default(), OnError::Cleanup);
    }
}
