//! Request/response RPC over mux streams.
//!
//! One [`RpcServer`] or [`RpcClient`] owns one logical stream. Nested
//! sessions for callback objects are opened with [`OpenChannel`].

mod channel;
mod client;
mod protocol;
mod server;

pub use channel::{
    watch_cancellation, ByteChannel, CancelGuard, CancelRelay, OpenChannel, CANCELLATION_ENDPOINT,
};
pub use client::RpcClient;
pub use protocol::{
    decode, encode, read_message, write_message, FaultKind, Payload, RemoteFault, RpcRequest,
    RpcResponse,
};
pub(crate) use protocol::{decode_all, encode_all};
pub use server::{RpcDispatch, RpcServer};
pub(crate) use server::unknown_method;

use crate::mux::MuxBroker;
use crate::process::ExitFlag;
use crate::PluginError;

/// The connection to one peer: its broker plus the exit flag of the plugin
/// process at the far end (never set on the plugin side).
#[derive(Debug, Clone)]
pub struct Peer {
    broker: MuxBroker,
    exit_flag: ExitFlag,
}

impl Peer {
    pub fn new(broker: MuxBroker, exit_flag: ExitFlag) -> Self {
        Self { broker, exit_flag }
    }

    pub fn broker(&self) -> &MuxBroker {
        &self.broker
    }

    pub fn exit_flag(&self) -> &ExitFlag {
        &self.exit_flag
    }

    /// Map a failure on the wire to the error the caller should see: the
    /// `PeerExited` sentinel once the process is known to be gone, otherwise
    /// a transport error.
    pub fn classify(&self, err: PluginError) -> PluginError {
        if self.exit_flag.is_set() {
            return PluginError::PeerExited;
        }
        match err {
            PluginError::Io { message, .. } => PluginError::Transport { message },
            other => other,
        }
    }
}
