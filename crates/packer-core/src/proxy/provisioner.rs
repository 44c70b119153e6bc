use super::{
    endpoint, serve_single, CommunicatorClient, CommunicatorServer, RawsArgs, UiClient, UiServer,
};
use crate::cancel::CancellationToken;
use crate::component::{Communicator, Provisioner, Ui};
use crate::rpc::{
    decode, decode_all, encode, encode_all, unknown_method, watch_cancellation, CancelRelay,
    OpenChannel, Payload, Peer, RpcClient, RpcDispatch,
};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct ProvisionArgs {
    ui: OpenChannel,
    communicator: OpenChannel,
    generated: Payload,
    cancel: OpenChannel,
}

pub struct ProvisionerServer {
    provisioner: Arc<dyn Provisioner>,
    peer: Peer,
}

impl ProvisionerServer {
    pub fn new(provisioner: Arc<dyn Provisioner>, peer: Peer) -> Self {
        Self { provisioner, peer }
    }

    pub fn open(peer: &Peer, provisioner: Arc<dyn Provisioner>) -> OpenChannel {
        serve_single(
            peer,
            endpoint::PROVISIONER,
            Arc::new(Self::new(provisioner, peer.clone())),
        )
    }
}

#[async_trait]
impl RpcDispatch for ProvisionerServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Prepare" => {
                let args: RawsArgs = decode(body)?;
                self.provisioner.prepare(decode_all(&args.raws)?).await?;
                encode(&())
            }
            "Provision" => {
                let args: ProvisionArgs = decode(body)?;
                let ui = Arc::new(UiClient::connect(&self.peer, &args.ui).await?);
                let communicator =
                    Arc::new(CommunicatorClient::connect(&self.peer, &args.communicator).await?);
                let cancel = watch_cancellation(&self.peer, &args.cancel).await?;
                self.provisioner
                    .provision(ui, communicator, args.generated.decode()?, cancel)
                    .await?;
                encode(&())
            }
            other => Err(unknown_method(endpoint::PROVISIONER, other)),
        }
    }
}

pub struct ProvisionerClient {
    client: Arc<RpcClient>,
}

impl ProvisionerClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::PROVISIONER).await?))
    }
}

#[async_trait]
impl Provisioner for ProvisionerClient {
    async fn prepare(&self, raws: Vec<Value>) -> Result<()> {
        let args = RawsArgs {
            raws: encode_all(&raws)?,
        };
        self.client.call("Provisioner.Prepare", &args).await
    }

    async fn provision(
        &self,
        ui: Arc<dyn Ui>,
        communicator: Arc<dyn Communicator>,
        generated: Value,
        cancel: CancellationToken,
    ) -> Result<()> {
        let peer = self.client.peer();
        let (cancel, _guard) = CancelRelay::serve(peer, &cancel);
        let args = ProvisionArgs {
            ui: UiServer::open(peer, ui),
            communicator: CommunicatorServer::open(peer, communicator),
            generated: Payload::encode(&generated)?,
            cancel,
        };
        self.client.call("Provisioner.Provision", &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{decode_config, RecordingUi, RemoteCmd};
    use crate::proxy::testing::peers;
    use crate::PluginError;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct WriteFileProvisioner {
        target: Mutex<Option<String>>,
    }

    #[derive(serde::Deserialize)]
    struct WriteConfig {
        target: String,
    }

    #[async_trait]
    impl Provisioner for WriteFileProvisioner {
        async fn prepare(&self, raws: Vec<Value>) -> Result<()> {
            let config: WriteConfig = decode_config(&raws)?;
            *self.target.lock() = Some(config.target);
            Ok(())
        }

        async fn provision(
            &self,
            ui: Arc<dyn Ui>,
            communicator: Arc<dyn Communicator>,
            generated: Value,
            cancel: CancellationToken,
        ) -> Result<()> {
            cancel.check()?;
            let target = self
                .target
                .lock()
                .clone()
                .ok_or_else(|| PluginError::Other("not prepared".into()))?;
            let host = generated["Host"].as_str().unwrap_or("unknown").to_string();
            ui.say(&format!("Provisioning {host}")).await;
            communicator.upload(&target, host.into_bytes()).await?;
            let output = communicator.start(RemoteCmd::new("exit 0")).await?;
            if !output.success() {
                return Err(PluginError::Other("command failed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_provision_over_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("host").to_string_lossy().into_owned();
        let (core, plugin) = peers();

        let channel = ProvisionerServer::open(&plugin, Arc::new(WriteFileProvisioner::default()));
        let remote = ProvisionerClient::connect(&core, &channel).await.unwrap();

        remote.prepare(vec![json!({"target": target})]).await.unwrap();

        let ui = Arc::new(RecordingUi::new());
        remote
            .provision(
                ui.clone(),
                Arc::new(crate::communicator::LocalCommunicator::new()),
                json!({"Host": "10.0.0.5"}),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(ui.said(), vec!["Provisioning 10.0.0.5".to_string()]);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "10.0.0.5");
    }

    #[tokio::test]
    async fn test_prepare_error_crosses_as_message() {
        let (core, plugin) = peers();
        let channel = ProvisionerServer::open(&plugin, Arc::new(WriteFileProvisioner::default()));
        let remote = ProvisionerClient::connect(&core, &channel).await.unwrap();

        match remote.prepare(vec![json!({"nope": 1})]).await {
            Err(PluginError::Remote { message }) => assert!(message.contains("target")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
