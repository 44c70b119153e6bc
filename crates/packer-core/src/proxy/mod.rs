//! Server adapters and client proxies for every component interface.
//!
//! For each interface `X` there is an `XServer` that exposes an in-process
//! `Arc<dyn X>` as an [`RpcDispatch`](crate::rpc::RpcDispatch) endpoint and an
//! `XClient` that implements `X` by forwarding each method as one RPC call.
//!
//! Callback objects passed as arguments (a Ui, a Hook, a Communicator...) get
//! a channel of their own: the caller serves them with `XServer::open` and
//! sends the [`OpenChannel`](crate::rpc::OpenChannel); the callee builds an
//! `XClient::connect`. Sessions are strictly sequential, so sharing one
//! channel between callbacks would deadlock as soon as one callback calls
//! back through another (a hook's provisioner writing to the builder's Ui).

mod artifact;
mod build;
mod builder;
mod cache;
mod communicator;
mod datasource;
mod hook;
mod post_processor;
mod pre_processor;
mod provisioner;
mod ui;

pub use artifact::{ArtifactClient, ArtifactServer};
pub use build::{BuildClient, BuildServer};
pub use builder::{BuilderClient, BuilderServer};
pub use cache::{CacheClient, CacheServer};
pub use communicator::{CommunicatorClient, CommunicatorServer};
pub use datasource::{DatasourceClient, DatasourceServer};
pub use hook::{HookClient, HookServer};
pub use post_processor::{PostProcessorClient, PostProcessorServer};
pub use pre_processor::{PreProcessorClient, PreProcessorServer};
pub use provisioner::{ProvisionerClient, ProvisionerServer};
pub use ui::{UiClient, UiServer};

/// Names of the RPC endpoints.
pub mod endpoint {
    pub const ARTIFACT: &str = "Artifact";
    pub const BUILD: &str = "Build";
    pub const BUILDER: &str = "Builder";
    pub const CACHE: &str = "Cache";
    pub const COMMUNICATOR: &str = "Communicator";
    pub const DATASOURCE: &str = "Datasource";
    pub const HOOK: &str = "Hook";
    pub const POST_PROCESSOR: &str = "PostProcessor";
    pub const PRE_PROCESSOR: &str = "PreProcessor";
    pub const PROVISIONER: &str = "Provisioner";
    pub const UI: &str = "Ui";
}

use crate::rpc::{OpenChannel, Peer, RpcDispatch, RpcServer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Serve a single endpoint on a fresh channel.
pub(crate) fn serve_single(peer: &Peer, name: &str, dispatch: Arc<dyn RpcDispatch>) -> OpenChannel {
    OpenChannel::serve(peer, RpcServer::new().with_endpoint(name, dispatch))
}

/// Arguments of the `Configure`/`Prepare` methods.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawsArgs {
    pub raws: Vec<crate::rpc::Payload>,
}
