//! Communicator for the machine the core itself runs on.

use crate::component::{CmdOutput, Communicator, RemoteCmd};
use crate::{PluginError, Result};
use async_trait::async_trait;
use glob::Pattern;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Runs commands through the local shell and moves files with plain copies.
#[derive(Debug, Clone, Default)]
pub struct LocalCommunicator {
    working_dir: Option<PathBuf>,
}

impl LocalCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands in `dir` and resolve relative paths against it.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.working_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        }
    }

    fn shell(&self, command: &str) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    async fn start(&self, cmd: RemoteCmd) -> Result<CmdOutput> {
        debug!("Executing locally: {}", cmd.command);
        let mut child = self
            .shell(&cmd.command)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let feeder = match (cmd.stdin, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    warn!("Failed to write command stdin: {}", e);
                }
            })),
            _ => None,
        };

        let output = child.wait_with_output().await?;
        if let Some(feeder) = feeder {
            let _ = feeder.await;
        }

        // No exit code means the shell died from a signal.
        let exit_status = output.status.code().unwrap_or(-1);
        debug!("Local command exited with {}", exit_status);
        Ok(CmdOutput {
            exit_status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn upload(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PluginError::io_with_path(e, parent))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| PluginError::io_with_path(e, &path))
    }

    async fn upload_dir(&self, dst: &str, src: &str, exclude: &[String]) -> Result<()> {
        let (src, dst) = (PathBuf::from(src), self.resolve(dst));
        copy_tree_blocking(src, dst, exclude.to_vec()).await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(path);
        tokio::fs::read(&path)
            .await
            .map_err(|e| PluginError::io_with_path(e, &path))
    }

    async fn download_dir(&self, src: &str, dst: &str, exclude: &[String]) -> Result<()> {
        let (src, dst) = (self.resolve(src), PathBuf::from(dst));
        copy_tree_blocking(src, dst, exclude.to_vec()).await
    }
}

async fn copy_tree_blocking(src: PathBuf, dst: PathBuf, exclude: Vec<String>) -> Result<()> {
    let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dst, &exclude))
        .await
        .map_err(|e| PluginError::Other(format!("Directory copy task failed: {e}")))??;
    debug!("Copied {} files", copied);
    Ok(())
}

/// Copy the contents of `src` into `dst`, skipping entries whose file name
/// matches one of the `exclude` patterns (and everything below them).
fn copy_tree(src: &Path, dst: &Path, exclude: &[String]) -> Result<usize> {
    let exclude = exclude_patterns(exclude)?;
    let mut copied = 0;
    let walker = WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            entry.depth() == 0 || !exclude.iter().any(|pattern| pattern.matches(&name))
        });

    for entry in walker {
        let entry = entry.map_err(|e| PluginError::io_with_path(e.into(), src))?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| PluginError::io_with_path(e, &target))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| PluginError::io_with_path(e, parent))?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| PluginError::io_with_path(e, entry.path()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Compile shell-style exclude patterns (`*`, `?`, `[...]`).
fn exclude_patterns(exclude: &[String]) -> Result<Vec<Pattern>> {
    exclude
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|e| PluginError::Config {
                message: format!("invalid exclude pattern {pattern:?}: {e}"),
            })
        })
        .collect()
}
