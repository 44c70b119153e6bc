use super::{endpoint, serve_single, RawsArgs, UiClient, UiServer};
use crate::component::{PreProcessor, Ui};
use crate::rpc::{
    decode, decode_all, encode, encode_all, unknown_method, OpenChannel, Payload, Peer, RpcClient,
    RpcDispatch,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct PreProcessArgs {
    ui: OpenChannel,
    input: Payload,
}

pub struct PreProcessorServer {
    pre_processor: Arc<dyn PreProcessor>,
    peer: Peer,
}

impl PreProcessorServer {
    pub fn new(pre_processor: Arc<dyn PreProcessor>, peer: Peer) -> Self {
        Self {
            pre_processor,
            peer,
        }
    }

    pub fn open(peer: &Peer, pre_processor: Arc<dyn PreProcessor>) -> OpenChannel {
        serve_single(
            peer,
            endpoint::PRE_PROCESSOR,
            Arc::new(Self::new(pre_processor, peer.clone())),
        )
    }
}

#[async_trait]
impl RpcDispatch for PreProcessorServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Configure" => {
                let args: RawsArgs = decode(body)?;
                self.pre_processor.configure(decode_all(&args.raws)?).await?;
                encode(&())
            }
            "PreProcess" => {
                let args: PreProcessArgs = decode(body)?;
                let ui = Arc::new(UiClient::connect(&self.peer, &args.ui).await?);
                let output = self.pre_processor.pre_process(ui, args.input.decode()?).await?;
                encode(&Payload::encode(&output)?)
            }
            other => Err(unknown_method(endpoint::PRE_PROCESSOR, other)),
        }
    }
}

pub struct PreProcessorClient {
    client: Arc<RpcClient>,
}

impl PreProcessorClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::PRE_PROCESSOR).await?))
    }
}

#[async_trait]
impl PreProcessor for PreProcessorClient {
    async fn configure(&self, raws: Vec<Value>) -> Result<()> {
        let args = RawsArgs {
            raws: encode_all(&raws)?,
        };
        self.client.call("PreProcessor.Configure", &args).await
    }

    async fn pre_process(&self, ui: Arc<dyn Ui>, input: Value) -> Result<Value> {
        let args = PreProcessArgs {
            ui: UiServer::open(self.client.peer(), ui),
            input: Payload::encode(&input)?,
        };
        let output: Payload = self.client.call("PreProcessor.PreProcess", &args).await?;
        output.decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::RecordingUi;
    use crate::proxy::testing::peers;
    use serde_json::json;

    struct TagPreProcessor;

    #[async_trait]
    impl PreProcessor for TagPreProcessor {
        async fn configure(&self, _raws: Vec<Value>) -> Result<()> {
            Ok(())
        }

        async fn pre_process(&self, ui: Arc<dyn Ui>, mut input: Value) -> Result<Value> {
            ui.message("tagging").await;
            input["tagged"] = json!(true);
            Ok(input)
        }
    }

    #[tokio::test]
    async fn test_pre_process_over_rpc() {
        let (core, plugin) = peers();
        let channel = PreProcessorServer::open(&plugin, Arc::new(TagPreProcessor));
        let remote = PreProcessorClient::connect(&core, &channel).await.unwrap();

        remote.configure(vec![json!({})]).await.unwrap();
        let output = remote
            .pre_process(Arc::new(RecordingUi::new()), json!({"name": "base"}))
            .await
            .unwrap();
        assert_eq!(output, json!({"name": "base", "tagged": true}));
    }
}
