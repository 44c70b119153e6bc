//! Writes a sha256 checksum file for the files of an artifact.

use async_trait::async_trait;
use packer_core::{
    decode_config, Artifact, BasicArtifact, CancellationToken, PluginError, PostProcessOutput,
    PostProcessor, Result, Ui,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

pub const BUILDER_ID: &str = "packer.post-processor.checksum";

const CHECKSUM_TYPE: &str = "sha256";
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChecksumConfig {
    /// Checksum file to write. `{{.BuildName}}` and `{{.ChecksumType}}` are
    /// replaced.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(rename = "packer_build_name", default)]
    pub build_name: String,
}

impl ChecksumConfig {
    fn output_path(&self) -> PathBuf {
        let template = self
            .output
            .as_deref()
            .unwrap_or("packer_{{.BuildName}}_{{.ChecksumType}}.checksum");
        PathBuf::from(
            template
                .replace("{{.BuildName}}", &self.build_name)
                .replace("{{.ChecksumType}}", CHECKSUM_TYPE),
        )
    }
}

#[derive(Debug, Default)]
pub struct ChecksumPostProcessor {
    config: Mutex<Option<ChecksumConfig>>,
}

async fn sha256_file(path: &Path, cancel: &CancellationToken) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| PluginError::io_with_path(e, path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        cancel.check()?;
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| PluginError::io_with_path(e, path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl PostProcessor for ChecksumPostProcessor {
    async fn configure(&self, raws: Vec<Value>) -> Result<()> {
        let config: ChecksumConfig = decode_config(&raws)?;
        *self.config.lock() = Some(config);
        Ok(())
    }

    async fn post_process(
        &self,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
        cancel: CancellationToken,
    ) -> Result<PostProcessOutput> {
        let config = self.config.lock().clone().ok_or_else(|| {
            PluginError::Other("checksum post-processor was not configured".into())
        })?;
        let output = config.output_path();

        let files = artifact.files().await?;
        if files.is_empty() {
            return Err(PluginError::Step {
                step: "checksum".into(),
                message: format!(
                    "artifact from {} has no files to checksum",
                    artifact.builder_id().await?
                ),
            });
        }

        let mut lines = String::new();
        for file in &files {
            let path = Path::new(file);
            ui.say(&format!("Calculating {CHECKSUM_TYPE} checksum of {file}")).await;
            let digest = sha256_file(path, &cancel).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.clone());
            debug!("{}  {}", digest, name);
            lines.push_str(&format!("{digest}\t{name}\n"));
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PluginError::io_with_path(e, parent))?;
        }
        tokio::fs::write(&output, lines)
            .await
            .map_err(|e| PluginError::io_with_path(e, &output))?;

        let output = output.to_string_lossy().into_owned();
        Ok(PostProcessOutput {
            artifact: Some(Arc::new(
                BasicArtifact::new(BUILDER_ID, output.clone())
                    .with_description(format!("Checksum file: {output}"))
                    .with_files([output])
                    .with_state("checksum_type", json!(CHECKSUM_TYPE)),
            )),
            keep: true,
            force_override: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packer_core::RecordingUi;

    #[test]
    fn test_output_template() {
        let config = ChecksumConfig {
            output: None,
            build_name: "web".into(),
        };
        assert_eq!(config.output_path(), PathBuf::from("packer_web_sha256.checksum"));

        let config = ChecksumConfig {
            output: Some("out/{{.BuildName}}.{{.ChecksumType}}".into()),
            build_name: "web".into(),
        };
        assert_eq!(config.output_path(), PathBuf::from("out/web.sha256"));
    }

    #[tokio::test]
    async fn test_checksums_artifact_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        std::fs::write(&file, "hello").unwrap();
        let output = dir.path().join("sums/{{.BuildName}}.sum");

        let pp = ChecksumPostProcessor::default();
        pp.configure(vec![json!({ "output": output, "packer_build_name": "demo" })])
            .await
            .unwrap();

        let input = Arc::new(BasicArtifact::new("packer.file", "x").with_files([file.to_string_lossy()]));
        let ui = Arc::new(RecordingUi::new());
        let result = pp
            .post_process(ui.clone(), input, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.keep);
        assert!(!result.force_override);

        let written = dir.path().join("sums/demo.sum");
        assert_eq!(
            std::fs::read_to_string(&written).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824\thello.txt\n"
        );
        let artifact = result.artifact.unwrap();
        assert_eq!(artifact.builder_id().await.unwrap(), BUILDER_ID);
        assert_eq!(artifact.files().await.unwrap(), vec![written.to_string_lossy().into_owned()]);
    }

    #[tokio::test]
    async fn test_artifact_without_files_fails() {
        let pp = ChecksumPostProcessor::default();
        pp.configure(vec![]).await.unwrap();
        let result = pp
            .post_process(
                Arc::new(RecordingUi::new()),
                Arc::new(BasicArtifact::new("packer.echo", "abc123")),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(PluginError::Step { .. })));
    }
}
