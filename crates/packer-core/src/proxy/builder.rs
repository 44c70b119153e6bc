use super::{
    endpoint, serve_single, ArtifactClient, ArtifactServer, CacheClient, CacheServer, HookClient,
    HookServer, RawsArgs, UiClient, UiServer,
};
use crate::component::{Artifact, BuildContext, Builder, PrepareOutput};
use crate::rpc::{
    decode, decode_all, encode, encode_all, unknown_method, watch_cancellation, CancelRelay,
    OpenChannel, Peer, RpcClient, RpcDispatch,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct BuilderRunArgs {
    ui: OpenChannel,
    hook: OpenChannel,
    cache: OpenChannel,
    cancel: OpenChannel,
}

pub struct BuilderServer {
    builder: Arc<dyn Builder>,
    peer: Peer,
}

impl BuilderServer {
    pub fn new(builder: Arc<dyn Builder>, peer: Peer) -> Self {
        Self { builder, peer }
    }

    pub fn open(peer: &Peer, builder: Arc<dyn Builder>) -> OpenChannel {
        serve_single(peer, endpoint::BUILDER, Arc::new(Self::new(builder, peer.clone())))
    }
}

#[async_trait]
impl RpcDispatch for BuilderServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Prepare" => {
                let args: RawsArgs = decode(body)?;
                encode(&self.builder.prepare(decode_all(&args.raws)?).await?)
            }
            "Run" => {
                let args: BuilderRunArgs = decode(body)?;
                let ctx = BuildContext {
                    ui: Arc::new(UiClient::connect(&self.peer, &args.ui).await?),
                    hook: Arc::new(HookClient::connect(&self.peer, &args.hook).await?),
                    cache: Arc::new(CacheClient::connect(&self.peer, &args.cache).await?),
                    cancel: watch_cancellation(&self.peer, &args.cancel).await?,
                };
                let artifact = self
                    .builder
                    .run(ctx)
                    .await?
                    .map(|artifact| ArtifactServer::open(&self.peer, artifact));
                encode(&artifact)
            }
            other => Err(unknown_method(endpoint::BUILDER, other)),
        }
    }
}

/// Builder running inside a plugin process.
pub struct BuilderClient {
    client: Arc<RpcClient>,
}

impl BuilderClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::BUILDER).await?))
    }
}

#[async_trait]
impl Builder for BuilderClient {
    async fn prepare(&self, raws: Vec<Value>) -> Result<PrepareOutput> {
        let args = RawsArgs {
            raws: encode_all(&raws)?,
        };
        self.client.call("Builder.Prepare", &args).await
    }

    async fn run(&self, ctx: BuildContext) -> Result<Option<Arc<dyn Artifact>>> {
        let peer = self.client.peer();
        let (cancel, _guard) = CancelRelay::serve(peer, &ctx.cancel);
        let args = BuilderRunArgs {
            ui: UiServer::open(peer, ctx.ui),
            hook: HookServer::open(peer, ctx.hook),
            cache: CacheServer::open(peer, ctx.cache),
            cancel,
        };

        let artifact: Option<OpenChannel> = self.client.call("Builder.Run", &args).await?;
        match artifact {
            Some(channel) => {
                debug!("Builder returned an artifact on channel {}", channel.id);
                Ok(Some(Arc::new(ArtifactClient::connect(peer, &channel).await?)))
            }
            None => Ok(None),
        }
    }
}
