//! Runs shell commands on the machine Packer runs on, streaming their
//! output to the Ui.

use async_trait::async_trait;
use packer_core::{decode_config, CancellationToken, Communicator, PluginError, Provisioner, Result, Ui};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

const STEP: &str = "shell-local";

#[derive(Debug, Clone, Deserialize)]
pub struct ShellLocalConfig {
    /// Commands run one after another through the local shell.
    #[serde(default)]
    pub inline: Vec<String>,
    /// `KEY=value` pairs added to every command's environment.
    #[serde(default)]
    pub environment_vars: Vec<String>,
    #[serde(default = "default_valid_exit_codes")]
    pub valid_exit_codes: Vec<i32>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(rename = "packer_build_name", default)]
    pub build_name: String,
    #[serde(rename = "packer_builder_type", default)]
    pub builder_type: String,
}

fn default_valid_exit_codes() -> Vec<i32> {
    vec![0]
}

impl ShellLocalConfig {
    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.inline.is_empty() {
            errors.push("`inline` must contain at least one command".to_string());
        }
        for var in &self.environment_vars {
            match var.split_once('=') {
                Some((key, _)) if !key.is_empty() => {}
                _ => errors.push(format!("environment variable not in KEY=value format: {var:?}")),
            }
        }
        if self.valid_exit_codes.is_empty() {
            errors.push("`valid_exit_codes` must not be empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PluginError::Config {
                message: errors.join("; "),
            })
        }
    }

    /// Environment for every command: build info, generated data and the
    /// user's variables, later entries winning.
    fn environment(&self, generated: &Value) -> Vec<(String, String)> {
        let mut env = vec![
            ("PACKER_BUILD_NAME".to_string(), self.build_name.clone()),
            ("PACKER_BUILDER_TYPE".to_string(), self.builder_type.clone()),
            ("PACKER_GENERATED_DATA".to_string(), generated.to_string()),
        ];
        env.extend(self.environment_vars.iter().filter_map(|var| {
            var.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        }));
        env
    }
}

#[derive(Debug, Default)]
pub struct ShellLocalProvisioner {
    config: Mutex<Option<ShellLocalConfig>>,
}

#[async_trait]
impl Provisioner for ShellLocalProvisioner {
    async fn prepare(&self, raws: Vec<Value>) -> Result<()> {
        let config: ShellLocalConfig = decode_config(&raws)?;
        config.validate()?;
        *self.config.lock() = Some(config);
        Ok(())
    }

    async fn provision(
        &self,
        ui: Arc<dyn Ui>,
        _communicator: Arc<dyn Communicator>,
        generated: Value,
        cancel: CancellationToken,
    ) -> Result<()> {
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| PluginError::Other("shell-local provisioner was not prepared".into()))?;
        let env = config.environment(&generated);

        for command in &config.inline {
            cancel.check()?;
            ui.say(&format!("Running local shell command: {command}")).await;
            let code = run_command(command, &config, &env, ui.clone(), &cancel).await?;
            if !config.valid_exit_codes.contains(&code) {
                return Err(PluginError::Step {
                    step: STEP.to_string(),
                    message: format!("Erroneous exit code {code} while executing command: {command}"),
                });
            }
        }
        Ok(())
    }
}

fn shell(command: &str) -> Command {
    #[cfg(windows)]
    let cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };
    #[cfg(not(windows))]
    let cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    cmd
}

async fn run_command(
    command: &str,
    config: &ShellLocalConfig,
    env: &[(String, String)],
    ui: Arc<dyn Ui>,
    cancel: &CancellationToken,
) -> Result<i32> {
    let mut cmd = shell(command);
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| PluginError::Step {
        step: STEP.to_string(),
        message: format!("failed to start {command:?}: {e}"),
    })?;
    let stdout = tokio::spawn(forward_lines(child.stdout.take(), ui.clone(), false));
    let stderr = tokio::spawn(forward_lines(child.stderr.take(), ui, true));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {:?}: {}", command, e);
            }
            stdout.abort();
            stderr.abort();
            return Err(PluginError::Cancelled);
        }
    };

    // Drain what the command wrote before exiting.
    let _ = stdout.await;
    let _ = stderr.await;

    let code = status.code().unwrap_or(-1);
    debug!("{:?} exited with {}", command, code);
    Ok(code)
}

async fn forward_lines<R>(reader: Option<R>, ui: Arc<dyn Ui>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => ui.error(&line).await,
            Ok(Some(line)) => ui.message(&line).await,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read command output: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use packer_core::component::UiEvent;
    use packer_core::{LocalCommunicator, RecordingUi};
    use serde_json::json;
    use std::time::Duration;

    async fn prepared(config: Value) -> ShellLocalProvisioner {
        let provisioner = ShellLocalProvisioner::default();
        provisioner
            .prepare(vec![config, json!({ "packer_build_name": "demo", "packer_builder_type": "file" })])
            .await
            .unwrap();
        provisioner
    }

    #[tokio::test]
    async fn test_prepare_validates() {
        let provisioner = ShellLocalProvisioner::default();
        let err = provisioner
            .prepare(vec![json!({ "environment_vars": ["=oops"], "valid_exit_codes": [] })])
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("inline"));
        assert!(message.contains("=oops"));
        assert!(message.contains("valid_exit_codes"));
    }

    #[tokio::test]
    async fn test_streams_output_and_environment() {
        let provisioner = prepared(json!({
            "inline": ["echo $PACKER_BUILD_NAME $GREETING", "echo oops >&2"],
            "environment_vars": ["GREETING=hi"],
        }))
        .await;

        let ui = Arc::new(RecordingUi::new());
        provisioner
            .provision(
                ui.clone(),
                Arc::new(LocalCommunicator::new()),
                json!({ "Path": "/tmp/x" }),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let said = ui.said();
        assert!(said.contains(&"Running local shell command: echo $PACKER_BUILD_NAME $GREETING".to_string()));
        let events = ui.events();
        assert!(events.contains(&UiEvent::Message("demo hi".into())), "{events:?}");
        assert!(events.contains(&UiEvent::Error("oops".into())), "{events:?}");
    }

    #[tokio::test]
    async fn test_invalid_exit_code_fails() {
        let provisioner = prepared(json!({ "inline": ["exit 3", "echo unreachable"] })).await;
        let ui = Arc::new(RecordingUi::new());
        let err = provisioner
            .provision(ui.clone(), Arc::new(LocalCommunicator::new()), Value::Null, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Erroneous exit code 3"));
        assert!(!ui.events().contains(&UiEvent::Message("unreachable".into())));
    }

    #[tokio::test]
    async fn test_allowed_exit_codes() {
        let provisioner = prepared(json!({ "inline": ["exit 3"], "valid_exit_codes": [0, 3] })).await;
        provisioner
            .provision(
                Arc::new(RecordingUi::new()),
                Arc::new(LocalCommunicator::new()),
                Value::Null,
                CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_kills_command() {
        let provisioner = prepared(json!({ "inline": ["sleep 30"] })).await;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            provisioner.provision(
                Arc::new(RecordingUi::new()),
                Arc::new(LocalCommunicator::new()),
                Value::Null,
                cancel,
            ),
        )
        .await
        .expect("cancellation should stop the command");
        assert!(matches!(result, Err(PluginError::Cancelled)));
    }
}
