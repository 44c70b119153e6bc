use super::Artifact;
use crate::{PluginError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// An artifact made of local files.
///
/// `destroy` deletes the files; a missing file counts as already destroyed.
#[derive(Debug, Clone, Default)]
pub struct BasicArtifact {
    pub builder_id: String,
    pub id: String,
    pub description: String,
    pub files: Vec<String>,
    pub state: HashMap<String, Value>,
    destroyed: std::sync::Arc<Mutex<bool>>,
}

impl BasicArtifact {
    pub fn new(builder_id: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            builder_id: builder_id.into(),
            description: id.clone(),
            id,
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_state(mut self, name: impl Into<String>, value: Value) -> Self {
        self.state.insert(name.into(), value);
        self
    }

    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.lock()
    }
}

#[async_trait]
impl Artifact for BasicArtifact {
    async fn builder_id(&self) -> Result<String> {
        Ok(self.builder_id.clone())
    }

    async fn files(&self) -> Result<Vec<String>> {
        Ok(self.files.clone())
    }

    async fn id(&self) -> Result<String> {
        Ok(self.id.clone())
    }

    async fn description(&self) -> Result<String> {
        Ok(self.description.clone())
    }

    async fn state(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.state.get(name).cloned())
    }

    async fn destroy(&self) -> Result<()> {
        for file in &self.files {
            match tokio::fs::remove_file(file).await {
                Ok(()) => debug!("Removed artifact file {}", file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(PluginError::io_with_path(e, file)),
            }
        }
        *self.destroyed.lock() = true;
        Ok(())
    }
}
