use super::{endpoint, serve_single, ArtifactClient, ArtifactServer, UiClient, UiServer};
use crate::cancel::CancellationToken;
use crate::component::{Artifact, Build, OnError, Ui};
use crate::rpc::{
    decode, encode, unknown_method, watch_cancellation, CancelRelay, OpenChannel, Peer, RpcClient,
    RpcDispatch,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct BuildRunArgs {
    ui: OpenChannel,
    cancel: OpenChannel,
}

pub struct BuildServer {
    build: Arc<dyn Build>,
    peer: Peer,
}

impl BuildServer {
    pub fn new(build: Arc<dyn Build>, peer: Peer) -> Self {
        Self { build, peer }
    }

    pub fn open(peer: &Peer, build: Arc<dyn Build>) -> OpenChannel {
        serve_single(peer, endpoint::BUILD, Arc::new(Self::new(build, peer.clone())))
    }
}

#[async_trait]
impl RpcDispatch for BuildServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Name" => encode(&self.build.name().await?),
            "Prepare" => encode(&self.build.prepare().await?),
            "Run" => {
                let args: BuildRunArgs = decode(body)?;
                let ui = Arc::new(UiClient::connect(&self.peer, &args.ui).await?);
                let cancel = watch_cancellation(&self.peer, &args.cancel).await?;
                let artifacts: Vec<OpenChannel> = self
                    .build
                    .run(ui, cancel)
                    .await?
                    .into_iter()
                    .map(|artifact| ArtifactServer::open(&self.peer, artifact))
                    .collect();
                encode(&artifacts)
            }
            "SetDebug" => encode(&self.build.set_debug(decode(body)?).await?),
            "SetForce" => encode(&self.build.set_force(decode(body)?).await?),
            "SetOnError" => encode(&self.build.set_on_error(decode(body)?).await?),
            other => Err(unknown_method(endpoint::BUILD, other)),
        }
    }
}

pub struct BuildClient {
    client: Arc<RpcClient>,
}

impl BuildClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::BUILD).await?))
    }
}

#[async_trait]
impl Build for BuildClient {
    async fn name(&self) -> Result<String> {
        self.client.call("Build.Name", &()).await
    }

    async fn prepare(&self) -> Result<Vec<String>> {
        self.client.call("Build.Prepare", &()).await
    }

    async fn run(&self, ui: Arc<dyn Ui>, cancel: CancellationToken) -> Result<Vec<Arc<dyn Artifact>>> {
        let peer = self.client.peer();
        let (cancel, _guard) = CancelRelay::serve(peer, &cancel);
        let args = BuildRunArgs {
            ui: UiServer::open(peer, ui),
            cancel,
        };

        let channels: Vec<OpenChannel> = self.client.call("Build.Run", &args).await?;
        let mut artifacts: Vec<Arc<dyn Artifact>> = Vec::with_capacity(channels.len());
        for channel in &channels {
            artifacts.push(Arc::new(ArtifactClient::connect(peer, channel).await?));
        }
        Ok(artifacts)
    }

    async fn set_debug(&self, debug: bool) -> Result<()> {
        self.client.call("Build.SetDebug", &debug).await
    }

    async fn set_force(&self, force: bool) -> Result<()> {
        self.client.call("Build.SetForce", &force).await
    }

    async fn set_on_error(&self, on_error: OnError) -> Result<()> {
        self.client.call("Build.SetOnError", &on_error).await
    }
}
