//! Builds a single local file from inline content or a source file.

use super::run_result;
use async_trait::async_trait;
use packer_core::multistep::{keys, StepProvision};
use packer_core::{
    decode_config, new_runner, Artifact, BasicArtifact, BuildContext, Builder, Communicator,
    LocalCommunicator, PluginError, PrepareOutput, Result, StateBag, Step, StepAction,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

pub const BUILDER_ID: &str = "packer.file";

const CONFIG_KEY: &str = "file_config";

#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// Inline content of the target file.
    #[serde(default)]
    pub content: Option<String>,
    /// File to copy to the target.
    #[serde(default)]
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    #[serde(rename = "packer_debug", default)]
    pub debug: bool,
}

impl FileConfig {
    fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        match (&self.content, &self.source) {
            (Some(_), Some(_)) => {
                return Err(PluginError::Config {
                    message: "only one of `content` or `source` may be set".into(),
                })
            }
            (None, None) => warnings.push("Neither `content` nor `source` is set, the target will be empty".into()),
            _ => {}
        }
        if self.target.as_os_str().is_empty() {
            return Err(PluginError::Config {
                message: "`target` must be set".into(),
            });
        }
        Ok(warnings)
    }
}

#[derive(Debug, Default)]
pub struct FileBuilder {
    config: Mutex<Option<FileConfig>>,
}

#[async_trait]
impl Builder for FileBuilder {
    async fn prepare(&self, raws: Vec<Value>) -> Result<PrepareOutput> {
        let config: FileConfig = decode_config(&raws)?;
        let warnings = config.validate()?;
        *self.config.lock() = Some(config);
        Ok(PrepareOutput {
            generated_vars: vec!["Path".into()],
            warnings,
        })
    }

    async fn run(&self, ctx: BuildContext) -> Result<Option<Arc<dyn Artifact>>> {
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| PluginError::Other("file builder was not prepared".into()))?;
        let target = config.target.to_string_lossy().into_owned();

        let mut state = StateBag::from_context(&ctx);
        state.put(CONFIG_KEY, config.clone());
        state.put(keys::GENERATED_DATA, json!({ "Path": target }));
        // The file lives on this machine, so provisioners work on it locally.
        let communicator: Arc<dyn Communicator> = Arc::new(LocalCommunicator::new());
        state.put(keys::COMMUNICATOR, communicator);

        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(StepCheckSource),
            Box::new(StepWriteFile::default()),
            Box::new(StepProvision::new()),
        ];
        let mut runner = new_runner(steps, config.debug, ctx.ui.clone());
        runner.run(&mut state).await;
        run_result(&mut state)?;

        Ok(Some(Arc::new(
            BasicArtifact::new(BUILDER_ID, target.clone())
                .with_description(format!("Stored file: {target}"))
                .with_files([target]),
        )))
    }
}

fn config(state: &StateBag) -> Result<FileConfig> {
    state.require::<FileConfig>(CONFIG_KEY).cloned()
}

/// Halts early when the configured source has gone away since prepare.
struct StepCheckSource;

#[async_trait]
impl Step for StepCheckSource {
    fn name(&self) -> &str {
        "check-source"
    }

    async fn run(&mut self, state: &mut StateBag) -> StepAction {
        let source = match config(state) {
            Ok(config) => config.source,
            Err(e) => {
                state.set_error(e);
                return StepAction::Halt;
            }
        };
        let Some(source) = source else {
            return StepAction::Continue;
        };
        match tokio::fs::metadata(&source).await {
            Ok(meta) if meta.is_file() => StepAction::Continue,
            Ok(_) => {
                state.set_error(PluginError::Config {
                    message: format!("source {} is not a file", source.display()),
                });
                StepAction::Halt
            }
            Err(e) => {
                state.set_error(PluginError::io_with_path(e, &source));
                StepAction::Halt
            }
        }
    }
}

/// Writes the target and removes it again if the build fails later.
#[derive(Default)]
struct StepWriteFile {
    written: Option<PathBuf>,
}

impl StepWriteFile {
    async fn write(config: &FileConfig) -> Result<()> {
        if let Some(parent) = config.target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PluginError::io_with_path(e, parent))?;
        }
        match &config.source {
            Some(source) => {
                tokio::fs::copy(source, &config.target)
                    .await
                    .map_err(|e| PluginError::io_with_path(e, source))?;
            }
            None => {
                let content = config.content.clone().unwrap_or_default();
                tokio::fs::write(&config.target, content)
                    .await
                    .map_err(|e| PluginError::io_with_path(e, &config.target))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step for StepWriteFile {
    fn name(&self) -> &str {
        "write-file"
    }

    async fn run(&mut self, state: &mut StateBag) -> StepAction {
        let config = match config(state) {
            Ok(config) => config,
            Err(e) => {
                state.set_error(e);
                return StepAction::Halt;
            }
        };
        if let Ok(ui) = state.ui() {
            match &config.source {
                Some(source) => {
                    ui.say(&format!("Copying {} to {}", source.display(), config.target.display()))
                        .await
                }
                None => ui.say(&format!("Writing {}", config.target.display())).await,
            }
        }

        match Self::write(&config).await {
            Ok(()) => {
                self.written = Some(config.target);
                StepAction::Continue
            }
            Err(e) => {
                state.set_error(e);
                StepAction::Halt
            }
        }
    }

    async fn cleanup(&mut self, state: &mut StateBag) {
        let failed = state.error().is_some() || state.is_cancelled() || state.is_halted();
        let Some(path) = self.written.take() else {
            return;
        };
        if !failed {
            return;
        }
        debug!("Removing {} after failed build", path.display());
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
