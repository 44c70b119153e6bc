use super::{endpoint, serve_single, CommunicatorClient, CommunicatorServer, UiClient, UiServer};
use crate::component::{Communicator, Hook, Ui};
use crate::rpc::{decode, encode, unknown_method, OpenChannel, Payload, Peer, RpcClient, RpcDispatch};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct HookRunArgs {
    name: String,
    ui: OpenChannel,
    communicator: Option<OpenChannel>,
    data: Payload,
}

pub struct HookServer {
    hook: Arc<dyn Hook>,
    peer: Peer,
}

impl HookServer {
    pub fn new(hook: Arc<dyn Hook>, peer: Peer) -> Self {
        Self { hook, peer }
    }

    pub fn open(peer: &Peer, hook: Arc<dyn Hook>) -> OpenChannel {
        serve_single(peer, endpoint::HOOK, Arc::new(Self::new(hook, peer.clone())))
    }
}

#[async_trait]
impl RpcDispatch for HookServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Run" => {
                let args: HookRunArgs = decode(body)?;
                let ui: Arc<dyn Ui> = Arc::new(UiClient::connect(&self.peer, &args.ui).await?);
                let communicator: Option<Arc<dyn Communicator>> = match &args.communicator {
                    Some(channel) => Some(Arc::new(
                        CommunicatorClient::connect(&self.peer, channel).await?,
                    )),
                    None => None,
                };
                self.hook
                    .run(&args.name, ui, communicator, args.data.decode()?)
                    .await?;
                encode(&())
            }
            other => Err(unknown_method(endpoint::HOOK, other)),
        }
    }
}

/// Hook owned by the core, called from inside a builder.
pub struct HookClient {
    client: Arc<RpcClient>,
}

impl HookClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::HOOK).await?))
    }
}

#[async_trait]
impl Hook for HookClient {
    async fn run(
        &self,
        name: &str,
        ui: Arc<dyn Ui>,
        communicator: Option<Arc<dyn Communicator>>,
        data: Value,
    ) -> Result<()> {
        let peer = self.client.peer();
        let args = HookRunArgs {
            name: name.to_string(),
            ui: UiServer::open(peer, ui),
            communicator: communicator.map(|comm| CommunicatorServer::open(peer, comm)),
            data: Payload::encode(&data)?,
        };
        self.client.call("Hook.Run", &args).await
    }
}
