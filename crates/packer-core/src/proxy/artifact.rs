use super::{endpoint, serve_single};
use crate::component::Artifact;
use crate::rpc::{decode, encode, unknown_method, OpenChannel, Payload, Peer, RpcClient, RpcDispatch};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct StateArgs {
    name: String,
}

pub struct ArtifactServer {
    artifact: Arc<dyn Artifact>,
}

impl ArtifactServer {
    pub fn new(artifact: Arc<dyn Artifact>) -> Self {
        Self { artifact }
    }

    pub fn open(peer: &Peer, artifact: Arc<dyn Artifact>) -> OpenChannel {
        serve_single(peer, endpoint::ARTIFACT, Arc::new(Self::new(artifact)))
    }
}

#[async_trait]
impl RpcDispatch for ArtifactServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "BuilderId" => encode(&self.artifact.builder_id().await?),
            "Files" => encode(&self.artifact.files().await?),
            "Id" => encode(&self.artifact.id().await?),
            "String" => encode(&self.artifact.description().await?),
            "State" => {
                let args: StateArgs = decode(body)?;
                let state = match self.artifact.state(&args.name).await? {
                    Some(value) => Some(Payload::encode(&value)?),
                    None => None,
                };
                encode(&state)
            }
            "Destroy" => {
                self.artifact.destroy().await?;
                encode(&())
            }
            other => Err(unknown_method(endpoint::ARTIFACT, other)),
        }
    }
}

/// Artifact held by the other side of the connection.
pub struct ArtifactClient {
    client: Arc<RpcClient>,
}

impl ArtifactClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::ARTIFACT).await?))
    }
}

#[async_trait]
impl Artifact for ArtifactClient {
    async fn builder_id(&self) -> Result<String> {
        self.client.call("Artifact.BuilderId", &()).await
    }

    async fn files(&self) -> Result<Vec<String>> {
        self.client.call("Artifact.Files", &()).await
    }

    async fn id(&self) -> Result<String> {
        self.client.call("Artifact.Id", &()).await
    }

    async fn description(&self) -> Result<String> {
        self.client.call("Artifact.String", &()).await
    }

    async fn state(&self, name: &str) -> Result<Option<Value>> {
        let state: Option<Payload> = self
            .client
            .call(
                "Artifact.State",
                &StateArgs {
                    name: name.to_string(),
                },
            )
            .await?;
        state.map(|payload| payload.decode()).transpose()
    }

    async fn destroy(&self) -> Result<()> {
        self.client.call("Artifact.Destroy", &()).await
    }
}
