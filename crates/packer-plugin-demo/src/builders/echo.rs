use async_trait::async_trait;
use packer_core::{Artifact, BasicArtifact, BuildContext, Builder, PrepareOutput, Result};
use serde_json::Value;
use std::sync::Arc;

pub const BUILDER_ID: &str = "packer.echo";

/// Says hello and hands back a fixed artifact. Useful for checking that a
/// plugin can be launched and talked to.
#[derive(Debug, Default)]
pub struct EchoBuilder;

#[async_trait]
impl Builder for EchoBuilder {
    async fn prepare(&self, _raws: Vec<Value>) -> Result<PrepareOutput> {
        Ok(PrepareOutput::default())
    }

    async fn run(&self, ctx: BuildContext) -> Result<Option<Arc<dyn Artifact>>> {
        ctx.cancel.check()?;
        ctx.ui.say("hello").await;
        Ok(Some(Arc::new(
            BasicArtifact::new(BUILDER_ID, "abc123").with_description("echo artifact"),
        )))
    }
}
