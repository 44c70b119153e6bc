//! Finding plugin binaries by naming convention.

use crate::config::{DiscoveryConfig, HandshakeConfig};
use crate::plugin_set::{ComponentKind, SetDescription};
use crate::process::ClientConfig;
use crate::server::magic_cookie_matches;
use crate::{PluginError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How to launch one discovered component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginLauncher {
    pub path: PathBuf,
    pub args: Vec<String>,
}

impl PluginLauncher {
    pub fn client_config(&self, min_port: u16, max_port: u16) -> ClientConfig {
        ClientConfig::new(&self.path)
            .with_args(self.args.clone())
            .with_port_range(min_port, max_port)
    }
}

/// Every component found, by name. Later search directories override
/// earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredPlugins {
    pub builders: BTreeMap<String, PluginLauncher>,
    pub provisioners: BTreeMap<String, PluginLauncher>,
    pub post_processors: BTreeMap<String, PluginLauncher>,
    pub datasources: BTreeMap<String, PluginLauncher>,
}

impl DiscoveredPlugins {
    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
            && self.provisioners.is_empty()
            && self.post_processors.is_empty()
            && self.datasources.is_empty()
    }

    fn map_mut(&mut self, kind: ComponentKind) -> &mut BTreeMap<String, PluginLauncher> {
        match kind {
            ComponentKind::Builder => &mut self.builders,
            ComponentKind::Provisioner => &mut self.provisioners,
            ComponentKind::PostProcessor => &mut self.post_processors,
            ComponentKind::Datasource => &mut self.datasources,
        }
    }
}

/// Where to look.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub exe_dir: Option<PathBuf>,
    pub plugins_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub plugin_path: Vec<PathBuf>,
    pub describe_timeout: Duration,
    /// Skip discovery altogether (set inside a plugin process).
    pub skip: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            exe_dir: None,
            plugins_dir: None,
            working_dir: None,
            plugin_path: Vec::new(),
            describe_timeout: DiscoveryConfig::DESCRIBE_TIMEOUT,
            skip: false,
        }
    }
}

impl DiscoveryOptions {
    /// The standard search locations of this process.
    pub fn from_env() -> Self {
        let exe_dir = match std::env::current_exe() {
            Ok(exe) => exe.parent().map(Path::to_path_buf),
            Err(e) => {
                warn!("Error loading exe directory: {}", e);
                None
            }
        };
        let plugins_dir = dirs::config_dir().map(|dir| {
            dir.join(DiscoveryConfig::CONFIG_DIR_NAME)
                .join(DiscoveryConfig::PLUGINS_DIR_NAME)
        });
        let plugin_path = std::env::var_os(DiscoveryConfig::PLUGIN_PATH_ENV)
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default();
        let cookie = std::env::var(HandshakeConfig::MAGIC_COOKIE_KEY).ok();

        Self {
            exe_dir,
            plugins_dir,
            working_dir: std::env::current_dir().ok(),
            plugin_path,
            describe_timeout: DiscoveryConfig::DESCRIBE_TIMEOUT,
            skip: magic_cookie_matches(cookie.as_deref()),
        }
    }

    pub fn with_plugins_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugins_dir = Some(dir.into());
        self
    }

    pub fn with_plugin_path(mut self, dirs: Vec<PathBuf>) -> Self {
        self.plugin_path = dirs;
        self
    }

    pub fn with_describe_timeout(mut self, timeout: Duration) -> Self {
        self.describe_timeout = timeout;
        self
    }

    /// Search directories in priority order, lowest first.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        dirs.extend(self.exe_dir.clone());
        dirs.extend(self.plugins_dir.clone());
        dirs.extend(self.working_dir.clone());
        dirs.extend(
            self.plugin_path
                .iter()
                .filter(|dir| !dir.as_os_str().is_empty())
                .cloned(),
        );
        dirs
    }
}

/// Discover every plugin in the configured locations.
pub async fn discover(options: &DiscoveryOptions) -> Result<DiscoveredPlugins> {
    let mut found = DiscoveredPlugins::default();
    if options.skip {
        debug!("Running inside a plugin process, skipping discovery");
        return Ok(found);
    }

    for dir in options.search_dirs() {
        discover_dir(&dir, options, &mut found).await?;
    }
    Ok(found)
}

/// Discover the plugins of one directory into `found`.
pub async fn discover_dir(dir: &Path, options: &DiscoveryOptions, found: &mut DiscoveredPlugins) -> Result<()> {
    let files = executables(dir).await?;

    let singles = [
        (DiscoveryConfig::BUILDER_PREFIX, ComponentKind::Builder),
        (DiscoveryConfig::POST_PROCESSOR_PREFIX, ComponentKind::PostProcessor),
        (DiscoveryConfig::PROVISIONER_PREFIX, ComponentKind::Provisioner),
    ];
    for (prefix, kind) in singles {
        let mut used = Vec::new();
        for (name, path) in matching(&files, prefix) {
            debug!("Discovered plugin: {} = {}", name, path.display());
            found.map_mut(kind).insert(
                name.clone(),
                PluginLauncher {
                    path,
                    args: Vec::new(),
                },
            );
            used.push(name);
        }
        if !used.is_empty() {
            info!("Using external {}s {:?}", kind, used);
        }
    }

    for (name, path) in matching(&files, DiscoveryConfig::MULTI_PLUGIN_PREFIX) {
        discover_multi(&name, &path, options.describe_timeout, found).await?;
    }
    Ok(())
}

/// Register every component a multi-component plugin describes as
/// `<plugin>-<component>`.
async fn discover_multi(
    plugin_name: &str,
    path: &Path,
    timeout: Duration,
    found: &mut DiscoveredPlugins,
) -> Result<()> {
    let description = describe(path, timeout).await?;
    let groups = [
        (ComponentKind::Builder, &description.builders),
        (ComponentKind::PostProcessor, &description.post_processors),
        (ComponentKind::Provisioner, &description.provisioners),
        (ComponentKind::Datasource, &description.datasources),
    ];
    for (kind, names) in groups {
        for component in names {
            found.map_mut(kind).insert(
                format!("{plugin_name}-{component}"),
                PluginLauncher {
                    path: path.to_path_buf(),
                    args: vec!["start".into(), kind.to_string(), component.clone()],
                },
            );
        }
        if !names.is_empty() {
            info!("Found external {:?} {}s from {} plugin", names, kind, plugin_name);
        }
    }
    Ok(())
}

/// Run `<path> describe` and parse its output.
pub async fn describe(path: &Path, timeout: Duration) -> Result<SetDescription> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(path)
            .arg("describe")
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| PluginError::Timeout(timeout))?
    .map_err(|e| PluginError::LaunchFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(PluginError::LaunchFailed {
            path: path.to_path_buf(),
            message: format!(
                "describe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

/// Regular files of `dir` with their plugin-visible names (`.exe` removed).
async fn executables(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let dir = match tokio::fs::canonicalize(dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PluginError::io_with_path(e, dir)),
    };

    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| PluginError::io_with_path(e, &dir))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(true) {
            continue;
        }
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let lowered = file_name.to_lowercase();
        if cfg!(windows) && !lowered.ends_with(".exe") {
            debug!("Ignoring plugin match {}, no exe extension", path.display());
            continue;
        }
        let name = match file_name.find(".exe") {
            Some(idx) => file_name[..idx].to_string(),
            None => file_name,
        };
        files.push((name, path));
    }
    files.sort();
    Ok(files)
}

fn matching(files: &[(String, PathBuf)], prefix: &str) -> Vec<(String, PathBuf)> {
    files
        .iter()
        .filter_map(|(name, path)| {
            name.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), path.clone()))
        })
        .collect()
}
