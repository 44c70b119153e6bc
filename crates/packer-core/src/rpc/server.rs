//! RPC server: serves named endpoints on one logical stream.

use super::protocol::{decode, encode, read_message, write_message, RemoteFault, RpcRequest, RpcResponse};
use crate::mux::MuxStream;
use crate::process::ExitFlag;
use crate::{PluginError, Result};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Trait for dispatching the methods of one endpoint.
///
/// `method` is the part after the dot (`"Say"` for `"Ui.Say"`); `body` is the
/// encoded argument struct. Implementations return the encoded reply.
#[async_trait::async_trait]
pub trait RpcDispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>>;
}

/// A set of endpoints served together on one stream.
///
/// Requests are processed strictly one at a time, in arrival order.
#[derive(Clone, Default)]
pub struct RpcServer {
    endpoints: BTreeMap<String, Arc<dyn RpcDispatch>>,
    exit_flag: Option<ExitFlag>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swallow dispatch panics once this flag reports the peer has exited.
    pub fn with_exit_flag(mut self, flag: ExitFlag) -> Self {
        self.exit_flag = Some(flag);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, dispatch: Arc<dyn RpcDispatch>) {
        self.endpoints.insert(name.into(), dispatch);
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, dispatch: Arc<dyn RpcDispatch>) -> Self {
        self.register(name, dispatch);
        self
    }

    /// Names of the registered endpoints, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    /// Serve requests until the peer closes the stream.
    pub async fn serve(&self, mut stream: MuxStream) -> Result<()> {
        let stream_id = stream.id();
        debug!(
            "Serving {:?} on mux stream {}",
            self.endpoints.keys().collect::<Vec<_>>(),
            stream_id
        );

        loop {
            let message = match read_message(&mut stream).await? {
                Some(message) => message,
                None => {
                    debug!("RPC session on stream {} ended", stream_id);
                    return Ok(());
                }
            };

            let response = match decode::<RpcRequest>(&message) {
                Ok(request) => match self.handle(&request).await {
                    Some(outcome) => RpcResponse {
                        seq: request.seq,
                        outcome,
                    },
                    None => return Ok(()),
                },
                Err(e) => {
                    warn!("Malformed RPC request on stream {}: {}", stream_id, e);
                    RpcResponse {
                        seq: 0,
                        outcome: Err(e.to_fault()),
                    }
                }
            };

            write_message(&mut stream, &encode(&response)?).await?;
        }
    }

    /// Run one request. `None` means a panic was swallowed and the session
    /// should end.
    async fn handle(&self, request: &RpcRequest) -> Option<std::result::Result<Vec<u8>, RemoteFault>> {
        let Some((endpoint, method)) = request.method.split_once('.') else {
            return Some(Err(RemoteFault::unknown_method(&request.method)));
        };
        let Some(dispatch) = self.endpoints.get(endpoint) else {
            return Some(Err(RemoteFault::unknown_method(&request.method)));
        };

        let result = AssertUnwindSafe(dispatch.dispatch(method, &request.body))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(reply)) => Some(Ok(reply)),
            Ok(Err(PluginError::UnknownMethod { .. })) => {
                Some(Err(RemoteFault::unknown_method(&request.method)))
            }
            Ok(Err(e)) => {
                debug!("{} returned error: {}", request.method, e);
                Some(Err(e.to_fault()))
            }
            Err(panic) => {
                if self.exit_flag.as_ref().is_some_and(ExitFlag::is_set) {
                    debug!(
                        "Ignoring panic in {} after the peer process exited",
                        request.method
                    );
                    None
                } else {
                    std::panic::resume_unwind(panic)
                }
            }
        }
    }
}

/// Reject a method an endpoint does not implement.
pub(crate) fn unknown_method(endpoint: &str, method: &str) -> PluginError {
    PluginError::UnknownMethod {
        method: format!("{endpoint}.{method}"),
    }
}
