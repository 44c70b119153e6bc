//! One configured build: a builder, its provisioners and its post-processor
//! sequences.

use super::provision::{HookedProvisioner, PausedProvisioner, ProvisionHook, RetriedProvisioner};
use super::DispatchHook;
use crate::cache::{CacheConfig, FileCache};
use crate::cancel::CancellationToken;
use crate::component::{
    Artifact, Build, BuildContext, Builder, Cache, Hook, OnError, PostProcessor, Provisioner, Ui,
};
use crate::config::BuildConfig;
use crate::{PluginError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Generated-data keys every builder may provide.
const BUILDER_DATA_COMMON_KEYS: &[&str] = &[
    "ID",
    "Host",
    "Port",
    "User",
    "Password",
    "ConnType",
    "PackerRunUUID",
    "PackerHTTPPort",
    "PackerHTTPIP",
    "PackerHTTPAddr",
    "SSHPublicKey",
    "SSHPrivateKey",
    "WinRMPassword",
];

/// Stand-in values for data only known once the builder runs, handed to
/// provisioners and post-processors at prepare time.
fn placeholder_data(generated_vars: &[String]) -> Value {
    let mut data = Map::new();
    let keys = BUILDER_DATA_COMMON_KEYS
        .iter()
        .copied()
        .chain(generated_vars.iter().map(String::as_str));
    for key in keys {
        data.insert(
            key.to_string(),
            Value::String(format!("Build_{key}. Generated at build time")),
        );
    }
    Value::Object(data)
}

/// Whether a post-processor's input artifact survives.
///
/// The user's `keep_input_artifact` wins unless the post-processor insists on
/// keeping its input with `force_override`.
fn resolve_keep(default_keep: bool, force_override: bool, user: Option<bool>) -> bool {
    match user {
        None => default_keep,
        Some(false) if default_keep && force_override => {
            debug!("Post-processor forces keeping its input artifact");
            true
        }
        Some(user) => user,
    }
}

pub struct CoreProvisioner {
    pub type_name: String,
    pub provisioner: Arc<dyn Provisioner>,
    pub config: Vec<Value>,
    pub pause_before: Option<Duration>,
    pub max_retries: u32,
}

impl CoreProvisioner {
    pub fn new(type_name: impl Into<String>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            type_name: type_name.into(),
            provisioner,
            config: Vec::new(),
            pause_before: None,
            max_retries: 0,
        }
    }

    pub fn with_config(mut self, config: Vec<Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_pause_before(mut self, pause: Duration) -> Self {
        self.pause_before = Some(pause);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    fn hooked(&self) -> HookedProvisioner {
        let mut provisioner = self.provisioner.clone();
        if self.max_retries > 0 {
            provisioner = Arc::new(RetriedProvisioner::new(self.max_retries, provisioner));
        }
        if let Some(pause) = self.pause_before {
            provisioner = Arc::new(PausedProvisioner::new(pause, provisioner));
        }
        HookedProvisioner::new(self.type_name.clone(), provisioner)
    }
}

pub struct CorePostProcessor {
    pub type_name: String,
    pub name: String,
    pub post_processor: Arc<dyn PostProcessor>,
    pub config: Vec<Value>,
    /// The user's `keep_input_artifact`, if set.
    pub keep_input_artifact: Option<bool>,
}

impl CorePostProcessor {
    pub fn new(type_name: impl Into<String>, post_processor: Arc<dyn PostProcessor>) -> Self {
        let type_name = type_name.into();
        Self {
            name: type_name.clone(),
            type_name,
            post_processor,
            config: Vec::new(),
            keep_input_artifact: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: Vec<Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_keep_input_artifact(mut self, keep: bool) -> Self {
        self.keep_input_artifact = Some(keep);
        self
    }
}

#[derive(Debug, Clone, Default)]
struct BuildSettings {
    debug: bool,
    force: bool,
    on_error: OnError,
    prepared: bool,
}

/// [`Build`] wiring in-process (or proxied) components together.
pub struct CoreBuild {
    name: String,
    builder_type: String,
    builder: Arc<dyn Builder>,
    builder_config: Vec<Value>,
    provisioners: Vec<CoreProvisioner>,
    post_processors: Vec<Vec<CorePostProcessor>>,
    hooks: Vec<(String, Arc<dyn Hook>)>,
    cache: Option<Arc<dyn Cache>>,
    settings: Mutex<BuildSettings>,
}

impl CoreBuild {
    pub fn new(name: impl Into<String>, builder_type: impl Into<String>, builder: Arc<dyn Builder>) -> Self {
        Self {
            name: name.into(),
            builder_type: builder_type.into(),
            builder,
            builder_config: Vec::new(),
            provisioners: Vec::new(),
            post_processors: Vec::new(),
            hooks: Vec::new(),
            cache: None,
            settings: Mutex::new(BuildSettings::default()),
        }
    }

    pub fn with_builder_config(mut self, config: Vec<Value>) -> Self {
        self.builder_config = config;
        self
    }

    pub fn with_provisioner(mut self, provisioner: CoreProvisioner) -> Self {
        self.provisioners.push(provisioner);
        self
    }

    /// Add a post-processor sequence; each step receives the previous step's
    /// artifact.
    pub fn with_post_processors(mut self, sequence: Vec<CorePostProcessor>) -> Self {
        if !sequence.is_empty() {
            self.post_processors.push(sequence);
        }
        self
    }

    /// Register an extra hook besides the provision hook.
    pub fn with_hook(mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push((name.into(), hook));
        self
    }

    /// Defaults to a [`FileCache`] at [`CacheConfig::from_env`].
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The `packer_*` settings appended to every component's configuration.
    fn packer_config(&self, settings: &BuildSettings) -> Value {
        let mut config = Map::new();
        config.insert(BuildConfig::BUILD_NAME_KEY.into(), Value::from(self.name.clone()));
        config.insert(
            BuildConfig::BUILDER_TYPE_KEY.into(),
            Value::from(self.builder_type.clone()),
        );
        config.insert(BuildConfig::DEBUG_KEY.into(), Value::from(settings.debug));
        config.insert(BuildConfig::FORCE_KEY.into(), Value::from(settings.force));
        config.insert(
            BuildConfig::ON_ERROR_KEY.into(),
            Value::from(settings.on_error.as_str()),
        );
        Value::Object(config)
    }

    fn cache(&self) -> Result<Arc<dyn Cache>> {
        match &self.cache {
            Some(cache) => Ok(cache.clone()),
            None => Ok(Arc::new(FileCache::from_config(&CacheConfig::from_env())?)),
        }
    }

    fn hook(&self, cancel: &CancellationToken) -> DispatchHook {
        let mut hook = DispatchHook::new().with_cancel(cancel.clone());
        for (name, extra) in &self.hooks {
            hook.add(name.clone(), extra.clone());
        }
        let provisioners = self.provisioners.iter().map(CoreProvisioner::hooked).collect();
        hook.add(
            BuildConfig::PROVISION_HOOK,
            Arc::new(ProvisionHook::new(provisioners, cancel.clone())),
        );
        hook
    }

    async fn post_process(
        &self,
        builder_artifact: Arc<dyn Artifact>,
        ui: Arc<dyn Ui>,
        cancel: CancellationToken,
        on_error: OnError,
    ) -> Result<Vec<Arc<dyn Artifact>>> {
        let mut artifacts: Vec<Arc<dyn Artifact>> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut keep_original = self.post_processors.is_empty();

        'sequences: for sequence in &self.post_processors {
            let mut prior = builder_artifact.clone();
            for (i, core_pp) in sequence.iter().enumerate() {
                if cancel.is_cancelled() {
                    errors.push("Post-processing cancelled".to_string());
                    break 'sequences;
                }

                ui.say(&format!("Running post-processor: {}", core_pp.name))
                    .await;
                let output = match core_pp
                    .post_processor
                    .post_process(ui.clone(), prior.clone(), cancel.clone())
                    .await
                {
                    Ok(output) => output,
                    Err(e) => {
                        errors.push(format!("Post-processor {} failed: {e}", core_pp.name));
                        continue 'sequences;
                    }
                };
                let Some(artifact) = output.artifact else {
                    debug!("Post-processor {} returned no artifact, ending its sequence", core_pp.name);
                    continue 'sequences;
                };

                let keep = resolve_keep(output.keep, output.force_override, core_pp.keep_input_artifact);
                if i == 0 {
                    // Other sequences may still need the builder's artifact.
                    keep_original |= keep;
                } else if keep {
                    artifacts.push(prior.clone());
                } else {
                    debug!("Deleting prior artifact from post-processor {}", core_pp.name);
                    if let Err(e) = prior.destroy().await {
                        errors.push(format!("Failed cleaning up prior artifact: {e}"));
                    }
                }
                prior = artifact;
            }
            artifacts.push(prior);
        }

        if !errors.is_empty() {
            artifacts.insert(0, builder_artifact);
            match on_error {
                OnError::Cleanup => {
                    for artifact in &artifacts {
                        if let Err(e) = artifact.destroy().await {
                            warn!("Failed to destroy artifact after error: {}", e);
                        }
                    }
                }
                OnError::Abort => {
                    warn!("Leaving {} artifacts in place for inspection", artifacts.len());
                }
            }
            return Err(PluginError::Step {
                step: "post-processing".to_string(),
                message: errors.join("\n"),
            });
        }

        if keep_original {
            artifacts.insert(0, builder_artifact);
        } else {
            debug!("Deleting original artifact for build {}", self.name);
            builder_artifact.destroy().await?;
        }
        Ok(artifacts)
    }
}

#[async_trait]
impl Build for CoreBuild {
    async fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn prepare(&self) -> Result<Vec<String>> {
        let settings = {
            let mut settings = self.settings.lock();
            if settings.prepared {
                return Err(PluginError::Other("Prepare already called".to_string()));
            }
            settings.prepared = true;
            settings.clone()
        };
        let packer_config = self.packer_config(&settings);

        let mut raws = self.builder_config.clone();
        raws.push(packer_config.clone());
        let output = self.builder.prepare(raws).await?;
        let placeholder = placeholder_data(&output.generated_vars);

        let mut errors = Vec::new();
        for core_prov in &self.provisioners {
            let mut raws = core_prov.config.clone();
            raws.push(packer_config.clone());
            raws.push(placeholder.clone());
            if let Err(e) = core_prov.provisioner.prepare(raws).await {
                errors.push(format!("provisioner {}: {e}", core_prov.type_name));
            }
        }
        for core_pp in self.post_processors.iter().flatten() {
            let mut raws = core_pp.config.clone();
            raws.push(packer_config.clone());
            raws.push(placeholder.clone());
            if let Err(e) = core_pp.post_processor.configure(raws).await {
                errors.push(format!("post-processor {}: {e}", core_pp.name));
            }
        }
        if !errors.is_empty() {
            return Err(PluginError::Config {
                message: errors.join("\n"),
            });
        }

        Ok(output.warnings)
    }

    async fn run(&self, ui: Arc<dyn Ui>, cancel: CancellationToken) -> Result<Vec<Arc<dyn Artifact>>> {
        let settings = self.settings.lock().clone();
        if !settings.prepared {
            return Err(PluginError::Other("Prepare must be called first".to_string()));
        }

        let ctx = BuildContext {
            ui: ui.clone(),
            hook: Arc::new(self.hook(&cancel)),
            cache: self.cache()?,
            cancel: cancel.clone(),
        };
        info!("Running builder {} for build {}", self.builder_type, self.name);
        let builder_artifact = self.builder.run(ctx).await?;

        if cancel.is_cancelled() {
            info!("Build {} cancelled", self.name);
            return Err(PluginError::Cancelled);
        }
        match builder_artifact {
            Some(artifact) => self.post_process(artifact, ui, cancel, settings.on_error).await,
            None => {
                debug!("Builder for {} produced no artifact", self.name);
                Ok(Vec::new())
            }
        }
    }

    async fn set_debug(&self, debug: bool) -> Result<()> {
        self.settings.lock().debug = debug;
        Ok(())
    }

    async fn set_force(&self, force: bool) -> Result<()> {
        self.settings.lock().force = force;
        Ok(())
    }

    async fn set_on_error(&self, on_error: OnError) -> Result<()> {
        self.settings.lock().on_error = on_error;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::LocalCommunicator;
    use crate::component::{BasicArtifact, Communicator, PostProcessOutput, PrepareOutput, RecordingUi};
    use serde_json::json;

    #[derive(Default)]
    struct MockBuilder {
        prepare_config: Mutex<Vec<Value>>,
        artifact: Mutex<Option<BasicArtifact>>,
        cancel_during_run: bool,
    }

    impl MockBuilder {
        fn artifact(&self) -> BasicArtifact {
            self.artifact.lock().clone().expect("builder ran")
        }
    }

    #[async_trait]
    impl Builder for MockBuilder {
        async fn prepare(&self, raws: Vec<Value>) -> Result<PrepareOutput> {
            *self.prepare_config.lock() = raws;
            Ok(PrepareOutput {
                generated_vars: vec!["SourceImage".into()],
                warnings: vec!["deprecated option".into()],
            })
        }

        async fn run(&self, ctx: BuildContext) -> Result<Option<Arc<dyn Artifact>>> {
            let communicator: Arc<dyn Communicator> = Arc::new(LocalCommunicator::new());
            ctx.hook
                .run(
                    BuildConfig::PROVISION_HOOK,
                    ctx.ui.clone(),
                    Some(communicator),
                    json!({"ID": "b"}),
                )
                .await?;
            if self.cancel_during_run {
                ctx.cancel.cancel();
            }
            let artifact = BasicArtifact::new("mock", "b");
            *self.artifact.lock() = Some(artifact.clone());
            Ok(Some(Arc::new(artifact)))
        }
    }

    #[derive(Default)]
    struct MockProvisioner {
        prepare_config: Mutex<Vec<Value>>,
        generated: Mutex<Option<Value>>,
    }

    #[async_trait]
    impl Provisioner for MockProvisioner {
        async fn prepare(&self, raws: Vec<Value>) -> Result<()> {
            *self.prepare_config.lock() = raws;
            Ok(())
        }

        async fn provision(
            &self,
            _ui: Arc<dyn Ui>,
            _communicator: Arc<dyn Communicator>,
            generated: Value,
            _cancel: CancellationToken,
        ) -> Result<()> {
            *self.generated.lock() = Some(generated);
            Ok(())
        }
    }

    struct MockPostProcessor {
        artifact_id: &'static str,
        keep: bool,
        force_override: bool,
        fail: bool,
        produced: Mutex<Option<BasicArtifact>>,
    }

    fn pp(artifact_id: &'static str) -> MockPostProcessor {
        MockPostProcessor {
            artifact_id,
            keep: false,
            force_override: false,
            fail: false,
            produced: Mutex::new(None),
        }
    }

    #[async_trait]
    impl PostProcessor for MockPostProcessor {
        async fn configure(&self, _raws: Vec<Value>) -> Result<()> {
            Ok(())
        }

        async fn post_process(
            &self,
            _ui: Arc<dyn Ui>,
            _artifact: Arc<dyn Artifact>,
            _cancel: CancellationToken,
        ) -> Result<PostProcessOutput> {
            if self.fail {
                return Err(PluginError::Remote {
                    message: "upload rejected".into(),
                });
            }
            let artifact = BasicArtifact::new("mock-pp", self.artifact_id);
            *self.produced.lock() = Some(artifact.clone());
            Ok(PostProcessOutput {
                artifact: Some(Arc::new(artifact)),
                keep: self.keep,
                force_override: self.force_override,
            })
        }
    }

    fn core_pp(pp: MockPostProcessor, keep: Option<bool>) -> CorePostProcessor {
        let core = CorePostProcessor::new("mock", Arc::new(pp));
        match keep {
            Some(keep) => core.with_keep_input_artifact(keep),
            None => core,
        }
    }

    fn build(builder: Arc<MockBuilder>, cache_dir: &std::path::Path) -> CoreBuild {
        CoreBuild::new("test", "mock", builder)
            .with_builder_config(vec![json!({"size": 42})])
            .with_cache(Arc::new(FileCache::new(cache_dir).unwrap()))
    }

    async fn ids(build: &CoreBuild) -> Result<Vec<String>> {
        build.prepare().await?;
        let artifacts = build
            .run(Arc::new(RecordingUi::new()), CancellationToken::new())
            .await?;
        let mut ids = Vec::new();
        for artifact in artifacts {
            ids.push(artifact.id().await?);
        }
        Ok(ids)
    }

    #[tokio::test]
    async fn test_prepare_passes_packer_config() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(MockBuilder::default());
        let provisioner = Arc::new(MockProvisioner::default());
        let build = build(builder.clone(), dir.path())
            .with_provisioner(CoreProvisioner::new("shell", provisioner.clone()).with_config(vec![json!({"inline": []})]));
        build.set_force(true).await.unwrap();

        let warnings = build.prepare().await.unwrap();
        assert_eq!(warnings, vec!["deprecated option".to_string()]);

        let packer_config = json!({
            "packer_build_name": "test",
            "packer_builder_type": "mock",
            "packer_debug": false,
            "packer_force": true,
            "packer_on_error": "cleanup",
        });
        assert_eq!(
            builder.prepare_config.lock().clone(),
            vec![json!({"size": 42}), packer_config.clone()]
        );

        let prov_config = provisioner.prepare_config.lock().clone();
        assert_eq!(prov_config.len(), 3);
        assert_eq!(prov_config[1], packer_config);
        assert!(prov_config[2]["SourceImage"].as_str().unwrap().starts_with("Build_SourceImage"));
        assert!(prov_config[2]["Host"].is_string());

        assert!(build.prepare().await.is_err());
    }

    #[tokio::test]
    async fn test_run_requires_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let build = build(Arc::new(MockBuilder::default()), dir.path());
        let result = build
            .run(Arc::new(RecordingUi::new()), CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_provisions_through_hook() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = Arc::new(MockProvisioner::default());
        let build = build(Arc::new(MockBuilder::default()), dir.path())
            .with_provisioner(CoreProvisioner::new("shell", provisioner.clone()));

        assert_eq!(ids(&build).await.unwrap(), vec!["b"]);
        assert_eq!(provisioner.generated.lock().clone(), Some(json!({"ID": "b"})));
    }

    #[tokio::test]
    async fn test_single_post_processor_replaces_original() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(MockBuilder::default());
        let build = build(builder.clone(), dir.path()).with_post_processors(vec![core_pp(pp("pp"), Some(false))]);

        assert_eq!(ids(&build).await.unwrap(), vec!["pp"]);
        assert!(builder.artifact().is_destroyed());
    }

    #[tokio::test]
    async fn test_any_sequence_keeping_original_keeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let build = build(Arc::new(MockBuilder::default()), dir.path())
            .with_post_processors(vec![core_pp(pp("pp1"), Some(false))])
            .with_post_processors(vec![core_pp(pp("pp2"), Some(true))]);

        assert_eq!(ids(&build).await.unwrap(), vec!["b", "pp1", "pp2"]);
    }

    #[tokio::test]
    async fn test_sequence_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        let pp2a = pp("pp2a");
        let build = build(Arc::new(MockBuilder::default()), dir.path())
            .with_post_processors(vec![core_pp(pp("pp1a"), Some(false)), core_pp(pp("pp1b"), Some(true))])
            .with_post_processors(vec![core_pp(pp2a, Some(false)), core_pp(pp("pp2b"), Some(false))]);

        assert_eq!(ids(&build).await.unwrap(), vec!["pp1a", "pp1b", "pp2b"]);
    }

    #[tokio::test]
    async fn test_force_override_and_user_preference() {
        let forcing = MockPostProcessor {
            keep: true,
            force_override: true,
            ..pp("pp")
        };
        let dir = tempfile::tempdir().unwrap();
        let build_a = build(Arc::new(MockBuilder::default()), dir.path())
            .with_post_processors(vec![core_pp(forcing, Some(false))]);
        assert_eq!(ids(&build_a).await.unwrap(), vec!["b", "pp"]);

        let polite = MockPostProcessor { keep: true, ..pp("pp") };
        let build_b = build(Arc::new(MockBuilder::default()), dir.path())
            .with_post_processors(vec![core_pp(polite, Some(false))]);
        assert_eq!(ids(&build_b).await.unwrap(), vec!["pp"]);

        let no_preference = MockPostProcessor { keep: true, ..pp("pp") };
        let build_c = build(Arc::new(MockBuilder::default()), dir.path())
            .with_post_processors(vec![core_pp(no_preference, None)]);
        assert_eq!(ids(&build_c).await.unwrap(), vec!["b", "pp"]);
    }

    #[tokio::test]
    async fn test_post_processor_failure_respects_on_error() {
        for (on_error, destroyed) in [(OnError::Cleanup, true), (OnError::Abort, false)] {
            let dir = tempfile::tempdir().unwrap();
            let builder = Arc::new(MockBuilder::default());
            let failing = MockPostProcessor { fail: true, ..pp("never") };
            let build = build(builder.clone(), dir.path())
                .with_post_processors(vec![core_pp(failing, None)]);
            build.set_on_error(on_error).await.unwrap();

            match ids(&build).await {
                Err(PluginError::Step { step, message }) => {
                    assert_eq!(step, "post-processing");
                    assert!(message.contains("upload rejected"));
                }
                other => panic!("unexpected result: {other:?}"),
            }
            assert_eq!(builder.artifact().is_destroyed(), destroyed, "{on_error:?}");
        }
    }

    #[tokio::test]
    async fn test_cancel_during_builder_run() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(MockBuilder {
            cancel_during_run: true,
            ..Default::default()
        });
        let build = build(builder, dir.path());
        assert!(matches!(ids(&build).await, Err(PluginError::Cancelled)));
    }

    #[test]
    fn test_resolve_keep() {
        assert!(resolve_keep(true, false, None));
        assert!(!resolve_keep(false, false, None));
        assert!(resolve_keep(false, false, Some(true)));
        assert!(!resolve_keep(true, false, Some(false)));
        assert!(resolve_keep(true, true, Some(false)));
    }
}
