//! Multi-component plugins: one binary, many named components.
//!
//! The binary answers `describe` with a JSON [`SetDescription`] and serves a
//! single component for `start <kind> <name>`.

use crate::component::{Builder, Datasource, PostProcessor, Provisioner};
use crate::config::HandshakeConfig;
use crate::server::{serve_component, Component};
use crate::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

type Factory<T> = Box<dyn Fn() -> Arc<T> + Send + Sync>;

/// The component kinds a plugin set can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    Builder,
    Provisioner,
    PostProcessor,
    Datasource,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Builder => "builder",
            ComponentKind::Provisioner => "provisioner",
            ComponentKind::PostProcessor => "post-processor",
            ComponentKind::Datasource => "datasource",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "builder" => Ok(ComponentKind::Builder),
            "provisioner" => Ok(ComponentKind::Provisioner),
            "post-processor" => Ok(ComponentKind::PostProcessor),
            "datasource" => Ok(ComponentKind::Datasource),
            other => Err(PluginError::UnknownComponent {
                kind: "component kind".to_string(),
                name: other.to_string(),
            }),
        }
    }
}

/// Output of `describe`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDescription {
    pub version: String,
    pub sdk_version: String,
    pub api_version: String,
    #[serde(default)]
    pub builders: Vec<String>,
    #[serde(default)]
    pub post_processors: Vec<String>,
    #[serde(default)]
    pub provisioners: Vec<String>,
    #[serde(default)]
    pub datasources: Vec<String>,
}

/// Named component factories of one plugin binary.
pub struct PluginSet {
    version: String,
    builders: BTreeMap<String, Factory<dyn Builder>>,
    provisioners: BTreeMap<String, Factory<dyn Provisioner>>,
    post_processors: BTreeMap<String, Factory<dyn PostProcessor>>,
    datasources: BTreeMap<String, Factory<dyn Datasource>>,
}

impl PluginSet {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            builders: BTreeMap::new(),
            provisioners: BTreeMap::new(),
            post_processors: BTreeMap::new(),
            datasources: BTreeMap::new(),
        }
    }

    pub fn register_builder<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Builder> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Box::new(factory));
    }

    pub fn register_provisioner<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Provisioner> + Send + Sync + 'static,
    {
        self.provisioners.insert(name.into(), Box::new(factory));
    }

    pub fn register_post_processor<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn PostProcessor> + Send + Sync + 'static,
    {
        self.post_processors.insert(name.into(), Box::new(factory));
    }

    pub fn register_datasource<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Datasource> + Send + Sync + 'static,
    {
        self.datasources.insert(name.into(), Box::new(factory));
    }

    pub fn describe(&self) -> SetDescription {
        SetDescription {
            version: self.version.clone(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: HandshakeConfig::API_VERSION.to_string(),
            builders: self.builders.keys().cloned().collect(),
            post_processors: self.post_processors.keys().cloned().collect(),
            provisioners: self.provisioners.keys().cloned().collect(),
            datasources: self.datasources.keys().cloned().collect(),
        }
    }

    /// Build a fresh instance of the named component.
    pub fn component(&self, kind: ComponentKind, name: &str) -> Result<Component> {
        let unknown = || PluginError::UnknownComponent {
            kind: kind.to_string(),
            name: name.to_string(),
        };
        let component = match kind {
            ComponentKind::Builder => Component::Builder((self.builders.get(name).ok_or_else(unknown)?)()),
            ComponentKind::Provisioner => {
                Component::Provisioner((self.provisioners.get(name).ok_or_else(unknown)?)())
            }
            ComponentKind::PostProcessor => {
                Component::PostProcessor((self.post_processors.get(name).ok_or_else(unknown)?)())
            }
            ComponentKind::Datasource => {
                Component::Datasource((self.datasources.get(name).ok_or_else(unknown)?)())
            }
        };
        Ok(component)
    }

    /// Serve the named component to the core.
    pub async fn start(&self, kind: ComponentKind, name: &str) -> Result<()> {
        let component = self.component(kind, name)?;
        info!("Starting {} {}", kind, name);
        serve_component(component).await
    }
}
