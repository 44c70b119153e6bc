use super::{endpoint, serve_single, RawsArgs};
use crate::component::Datasource;
use crate::rpc::{
    decode, decode_all, encode, encode_all, unknown_method, OpenChannel, Payload, Peer, RpcClient,
    RpcDispatch,
};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct DatasourceServer {
    datasource: Arc<dyn Datasource>,
}

impl DatasourceServer {
    pub fn new(datasource: Arc<dyn Datasource>) -> Self {
        Self { datasource }
    }

    pub fn open(peer: &Peer, datasource: Arc<dyn Datasource>) -> OpenChannel {
        serve_single(peer, endpoint::DATASOURCE, Arc::new(Self::new(datasource)))
    }
}

#[async_trait]
impl RpcDispatch for DatasourceServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Configure" => {
                let args: RawsArgs = decode(body)?;
                self.datasource.configure(decode_all(&args.raws)?).await?;
                encode(&())
            }
            "OutputSpec" => encode(&self.datasource.output_spec().await?),
            "Execute" => encode(&Payload::encode(&self.datasource.execute().await?)?),
            other => Err(unknown_method(endpoint::DATASOURCE, other)),
        }
    }
}

pub struct DatasourceClient {
    client: Arc<RpcClient>,
}

impl DatasourceClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::DATASOURCE).await?))
    }
}

#[async_trait]
impl Datasource for DatasourceClient {
    async fn configure(&self, raws: Vec<Value>) -> Result<()> {
        let args = RawsArgs {
            raws: encode_all(&raws)?,
        };
        self.client.call("Datasource.Configure", &args).await
    }

    async fn output_spec(&self) -> Result<Vec<String>> {
        self.client.call("Datasource.OutputSpec", &()).await
    }

    async fn execute(&self) -> Result<Value> {
        let output: Payload = self.client.call("Datasource.Execute", &()).await?;
        output.decode()
    }
}
