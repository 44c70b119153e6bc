use super::{endpoint, serve_single};
use crate::component::{CmdOutput, Communicator, RemoteCmd};
use crate::rpc::{
    decode, encode, unknown_method, ByteChannel, OpenChannel, Peer, RpcClient, RpcDispatch,
};
use crate::{PluginError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
struct TransferArgs {
    path: String,
    data: ByteChannel,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirArgs {
    src: String,
    dst: String,
    exclude: Vec<String>,
}

pub struct CommunicatorServer {
    communicator: Arc<dyn Communicator>,
    peer: Peer,
}

impl CommunicatorServer {
    pub fn new(communicator: Arc<dyn Communicator>, peer: Peer) -> Self {
        Self { communicator, peer }
    }

    pub fn open(peer: &Peer, communicator: Arc<dyn Communicator>) -> OpenChannel {
        serve_single(
            peer,
            endpoint::COMMUNICATOR,
            Arc::new(Self::new(communicator, peer.clone())),
        )
    }
}

#[async_trait]
impl RpcDispatch for CommunicatorServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Start" => {
                let cmd: RemoteCmd = decode(body)?;
                encode(&self.communicator.start(cmd).await?)
            }
            "Upload" => {
                let args: TransferArgs = decode(body)?;
                let data = args.data.read_all(&self.peer).await?;
                self.communicator.upload(&args.path, data).await?;
                encode(&())
            }
            "UploadDir" => {
                let args: DirArgs = decode(body)?;
                self.communicator
                    .upload_dir(&args.dst, &args.src, &args.exclude)
                    .await?;
                encode(&())
            }
            "Download" => {
                let args: TransferArgs = decode(body)?;
                // The caller is waiting on the byte channel either way, so
                // close it with no data before reporting a failure.
                match self.communicator.download(&args.path).await {
                    Ok(data) => {
                        args.data.write_all(&self.peer, &data).await?;
                        encode(&())
                    }
                    Err(e) => {
                        args.data.write_all(&self.peer, &[]).await?;
                        Err(e)
                    }
                }
            }
            "DownloadDir" => {
                let args: DirArgs = decode(body)?;
                self.communicator
                    .download_dir(&args.src, &args.dst, &args.exclude)
                    .await?;
                encode(&())
            }
            other => Err(unknown_method(endpoint::COMMUNICATOR, other)),
        }
    }
}

/// Communicator owned by the other side; file contents move over byte
/// channels rather than inside RPC messages.
pub struct CommunicatorClient {
    client: Arc<RpcClient>,
}

impl CommunicatorClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::COMMUNICATOR).await?))
    }
}

#[async_trait]
impl Communicator for CommunicatorClient {
    async fn start(&self, cmd: RemoteCmd) -> Result<CmdOutput> {
        self.client.call("Communicator.Start", &cmd).await
    }

    async fn upload(&self, path: &str, data: Vec<u8>) -> Result<()> {
        debug!("Uploading {} bytes to {}", data.len(), path);
        let channel = ByteChannel::send(self.client.peer(), data);
        self.client
            .call(
                "Communicator.Upload",
                &TransferArgs {
                    path: path.to_string(),
                    data: channel,
                },
            )
            .await
    }

    async fn upload_dir(&self, dst: &str, src: &str, exclude: &[String]) -> Result<()> {
        self.client
            .call(
                "Communicator.UploadDir",
                &DirArgs {
                    src: src.to_string(),
                    dst: dst.to_string(),
                    exclude: exclude.to_vec(),
                },
            )
            .await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let (channel, receiver) = ByteChannel::receive(self.client.peer());
        let result = self
            .client
            .call::<_, ()>(
                "Communicator.Download",
                &TransferArgs {
                    path: path.to_string(),
                    data: channel,
                },
            )
            .await;
        if let Err(e) = result {
            receiver.abort();
            return Err(e);
        }
        receiver
            .await
            .map_err(|e| PluginError::transport(format!("download of {path} was interrupted: {e}")))?
    }

    async fn download_dir(&self, src: &str, dst: &str, exclude: &[String]) -> Result<()> {
        self.client
            .call(
                "Communicator.DownloadDir",
                &DirArgs {
                    src: src.to_string(),
                    dst: dst.to_string(),
                    exclude: exclude.to_vec(),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::LocalCommunicator;
    use crate::proxy::testing::peers;

    #[tokio::test]
    async fn test_transfer_files_over_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let (core, plugin) = peers();

        let channel = CommunicatorServer::open(&plugin, Arc::new(LocalCommunicator::new()));
        let remote = CommunicatorClient::connect(&core, &channel).await.unwrap();

        let target = dir.path().join("nested").join("motd");
        let target = target.to_string_lossy().into_owned();
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();

        remote.upload(&target, content.clone()).await.unwrap();
        assert_eq!(remote.download(&target).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_download_failure_is_reported() {
        let (core, plugin) = peers();
        let channel = CommunicatorServer::open(&plugin, Arc::new(LocalCommunicator::new()));
        let remote = CommunicatorClient::connect(&core, &channel).await.unwrap();

        match remote.download("/nonexistent/packer/file").await {
            Err(PluginError::Remote { message }) => assert!(message.contains("/nonexistent")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_over_rpc() {
        let (core, plugin) = peers();
        let channel = CommunicatorServer::open(&plugin, Arc::new(LocalCommunicator::new()));
        let remote = CommunicatorClient::connect(&core, &channel).await.unwrap();

        let output = remote
            .start(RemoteCmd::new("echo provisioned; exit 4"))
            .await
            .unwrap();
        assert_eq!(output.exit_status, 4);
        assert_eq!(output.stdout, b"provisioned\n");
    }
}
