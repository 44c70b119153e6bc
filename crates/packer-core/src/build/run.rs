use crate::cancel::CancellationToken;
use crate::component::{Artifact, Build, PrefixedUi, Ui};
use crate::{PluginError, Result};
use std::sync::Arc;
use tracing::{error, info};

/// How one build of a [`run_builds`] call ended.
pub struct BuildOutcome {
    pub name: String,
    pub result: Result<Vec<Arc<dyn Artifact>>>,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run prepared builds concurrently, each with its own name-prefixed Ui.
///
/// A failing (or panicking) build does not stop the others. Outcomes come
/// back in the order of `builds`.
pub async fn run_builds(
    builds: Vec<Arc<dyn Build>>,
    ui: Arc<dyn Ui>,
    cancel: CancellationToken,
) -> Vec<BuildOutcome> {
    let mut handles = Vec::with_capacity(builds.len());
    for (index, build) in builds.into_iter().enumerate() {
        let name = match build.name().await {
            Ok(name) => name,
            Err(e) => {
                error!("Failed to get name of build {}: {}", index, e);
                format!("build-{index}")
            }
        };
        let build_ui: Arc<dyn Ui> = Arc::new(PrefixedUi::new(name.clone(), ui.clone()));
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move { build.run(build_ui, cancel).await });
        handles.push((name, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(PluginError::Other(format!("Build {name} panicked: {e}"))),
        };
        match &result {
            Ok(artifacts) => info!("Build {} finished with {} artifacts", name, artifacts.len()),
            Err(e) => error!("Build {} errored: {}", name, e),
        }
        outcomes.push(BuildOutcome { name, result });
    }
    outcomes
}
