use super::{endpoint, serve_single, ArtifactClient, ArtifactServer, RawsArgs, UiClient, UiServer};
use crate::cancel::CancellationToken;
use crate::component::{Artifact, PostProcessOutput, PostProcessor, Ui};
use crate::rpc::{
    decode, decode_all, encode, encode_all, unknown_method, watch_cancellation, CancelRelay,
    OpenChannel, Peer, RpcClient, RpcDispatch,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct PostProcessArgs {
    ui: OpenChannel,
    artifact: OpenChannel,
    cancel: OpenChannel,
}

#[derive(Debug, Serialize, Deserialize)]
struct PostProcessReply {
    artifact: Option<OpenChannel>,
    keep: bool,
    force_override: bool,
}

pub struct PostProcessorServer {
    post_processor: Arc<dyn PostProcessor>,
    peer: Peer,
}

impl PostProcessorServer {
    pub fn new(post_processor: Arc<dyn PostProcessor>, peer: Peer) -> Self {
        Self {
            post_processor,
            peer,
        }
    }

    pub fn open(peer: &Peer, post_processor: Arc<dyn PostProcessor>) -> OpenChannel {
        serve_single(
            peer,
            endpoint::POST_PROCESSOR,
            Arc::new(Self::new(post_processor, peer.clone())),
        )
    }
}

#[async_trait]
impl RpcDispatch for PostProcessorServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Configure" => {
                let args: RawsArgs = decode(body)?;
                self.post_processor
                    .configure(decode_all(&args.raws)?)
                    .await?;
                encode(&())
            }
            "PostProcess" => {
                let args: PostProcessArgs = decode(body)?;
                let ui = Arc::new(UiClient::connect(&self.peer, &args.ui).await?);
                let artifact = Arc::new(ArtifactClient::connect(&self.peer, &args.artifact).await?);
                let cancel = watch_cancellation(&self.peer, &args.cancel).await?;

                let output = self.post_processor.post_process(ui, artifact, cancel).await?;
                encode(&PostProcessReply {
                    artifact: output
                        .artifact
                        .map(|artifact| ArtifactServer::open(&self.peer, artifact)),
                    keep: output.keep,
                    force_override: output.force_override,
                })
            }
            other => Err(unknown_method(endpoint::POST_PROCESSOR, other)),
        }
    }
}

pub struct PostProcessorClient {
    client: Arc<RpcClient>,
}

impl PostProcessorClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::POST_PROCESSOR).await?))
    }
}

#[async_trait]
impl PostProcessor for PostProcessorClient {
    async fn configure(&self, raws: Vec<Value>) -> Result<()> {
        let args = RawsArgs {
            raws: encode_all(&raws)?,
        };
        self.client.call("PostProcessor.Configure", &args).await
    }

    async fn post_process(
        &self,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
        cancel: CancellationToken,
    ) -> Result<PostProcessOutput> {
        let peer = self.client.peer();
        let (cancel, _guard) = CancelRelay::serve(peer, &cancel);
        let args = PostProcessArgs {
            ui: UiServer::open(peer, ui),
            artifact: ArtifactServer::open(peer, artifact),
            cancel,
        };

        let reply: PostProcessReply = self.client.call("PostProcessor.PostProcess", &args).await?;
        let artifact: Option<Arc<dyn Artifact>> = match reply.artifact {
            Some(channel) => Some(Arc::new(ArtifactClient::connect(peer, &channel).await?)),
            None => None,
        };
        Ok(PostProcessOutput {
            artifact,
            keep: reply.keep,
            force_override: reply.force_override,
        })
    }
}
