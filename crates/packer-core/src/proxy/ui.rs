use super::{endpoint, serve_single};
use crate::component::Ui;
use crate::rpc::{decode, encode, unknown_method, OpenChannel, Peer, RpcClient, RpcDispatch};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct MessageArgs {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MachineArgs {
    kind: String,
    args: Vec<String>,
}

pub struct UiServer {
    ui: Arc<dyn Ui>,
}

impl UiServer {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self { ui }
    }

    pub fn open(peer: &Peer, ui: Arc<dyn Ui>) -> OpenChannel {
        serve_single(peer, endpoint::UI, Arc::new(Self::new(ui)))
    }
}

#[async_trait]
impl RpcDispatch for UiServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Say" => {
                let args: MessageArgs = decode(body)?;
                self.ui.say(&args.message).await;
                encode(&())
            }
            "Message" => {
                let args: MessageArgs = decode(body)?;
                self.ui.message(&args.message).await;
                encode(&())
            }
            "Error" => {
                let args: MessageArgs = decode(body)?;
                self.ui.error(&args.message).await;
                encode(&())
            }
            "Machine" => {
                let args: MachineArgs = decode(body)?;
                self.ui.machine(&args.kind, &args.args).await;
                encode(&())
            }
            "Ask" => {
                let args: MessageArgs = decode(body)?;
                encode(&self.ui.ask(&args.message).await?)
            }
            other => Err(unknown_method(endpoint::UI, other)),
        }
    }
}

/// Ui living on the other side of the connection.
///
/// Output methods cannot fail from the caller's point of view; transport
/// errors are logged instead.
pub struct UiClient {
    client: Arc<RpcClient>,
}

impl UiClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::UI).await?))
    }

    async fn output(&self, method: &str, message: &str) {
        let args = MessageArgs {
            message: message.to_string(),
        };
        if let Err(e) = self.client.call::<_, ()>(method, &args).await {
            warn!("{} failed: {}", method, e);
        }
    }
}

#[async_trait]
impl Ui for UiClient {
    async fn say(&self, message: &str) {
        self.output("Ui.Say", message).await;
    }

    async fn message(&self, message: &str) {
        self.output("Ui.Message", message).await;
    }

    async fn error(&self, message: &str) {
        self.output("Ui.Error", message).await;
    }

    async fn machine(&self, kind: &str, args: &[String]) {
        let args = MachineArgs {
            kind: kind.to_string(),
            args: args.to_vec(),
        };
        if let Err(e) = self.client.call::<_, ()>("Ui.Machine", &args).await {
            warn!("Ui.Machine failed: {}", e);
        }
    }

    async fn ask(&self, query: &str) -> Result<String> {
        self.client
            .call(
                "Ui.Ask",
                &MessageArgs {
                    message: query.to_string(),
                },
            )
            .await
    }
}
