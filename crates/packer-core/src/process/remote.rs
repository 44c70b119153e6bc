//! The primary session with a connected plugin.

use super::exit::ExitFlag;
use crate::config::MuxConfig;
use crate::mux::MuxBroker;
use crate::proxy::{
    BuilderClient, DatasourceClient, HookClient, PostProcessorClient, PreProcessorClient,
    ProvisionerClient,
};
use crate::rpc::{Peer, RpcClient};
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// A plugin's component, reached over stream 0 of its connection.
///
/// The plugin serves exactly one component there, so only the accessor
/// matching what was started gives working calls; the others fail with
/// `UnknownMethod`.
#[derive(Debug)]
pub struct RemotePlugin {
    peer: Peer,
    client: Arc<RpcClient>,
}

impl RemotePlugin {
    /// Dial the primary stream on a client-role broker.
    pub async fn open(broker: MuxBroker, exit_flag: ExitFlag) -> Result<Self> {
        let peer = Peer::new(broker, exit_flag);
        let client = RpcClient::dial(&peer, MuxConfig::PRIMARY_STREAM_ID).await?;
        debug!("Primary plugin session established");
        Ok(Self {
            peer,
            client: Arc::new(client),
        })
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn builder(&self) -> BuilderClient {
        BuilderClient::new(self.client.clone())
    }

    pub fn provisioner(&self) -> ProvisionerClient {
        ProvisionerClient::new(self.client.clone())
    }

    pub fn post_processor(&self) -> PostProcessorClient {
        PostProcessorClient::new(self.client.clone())
    }

    pub fn pre_processor(&self) -> PreProcessorClient {
        PreProcessorClient::new(self.client.clone())
    }

    pub fn hook(&self) -> HookClient {
        HookClient::new(self.client.clone())
    }

    pub fn datasource(&self) -> DatasourceClient {
        DatasourceClient::new(self.client.clone())
    }

    /// Close the connection; outstanding calls fail.
    pub fn close(&self) {
        self.peer.broker().close();
    }
}
