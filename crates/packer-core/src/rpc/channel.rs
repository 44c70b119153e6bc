//! Nested sessions opened on fresh stream ids.
//!
//! Callback objects are never serialised. The side that owns them serves
//! their adapters on a new stream and sends an [`OpenChannel`] naming that
//! stream; the other side connects and builds client proxies. Raw bytes for
//! uploads and downloads move the same way over a [`ByteChannel`].

use super::client::RpcClient;
use super::server::{unknown_method, RpcDispatch, RpcServer};
use super::protocol::{decode, encode};
use super::Peer;
use crate::cancel::CancellationToken;
use crate::config::RpcConfig;
use crate::mux::{MuxBroker, MuxStream};
use crate::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Accept stream `id`, giving up if the peer never dials it.
async fn accept_announced(broker: &MuxBroker, id: u32) -> Result<MuxStream> {
    let wait = RpcConfig::CHANNEL_ACCEPT_TIMEOUT;
    tokio::time::timeout(wait, broker.accept(id))
        .await
        .map_err(|_| PluginError::Timeout(wait))?
}

/// Announcement of an RPC server listening on stream `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenChannel {
    pub id: u32,
    pub endpoints: Vec<String>,
}

impl OpenChannel {
    /// Allocate a stream id and serve `server` on it in a background task.
    pub fn serve(peer: &Peer, server: RpcServer) -> Self {
        let broker = peer.broker().clone();
        let id = broker.next_id();
        let endpoints = server.endpoints();
        let server = server.with_exit_flag(peer.exit_flag().clone());

        tokio::spawn(async move {
            match accept_announced(&broker, id).await {
                Ok(stream) => {
                    if let Err(e) = server.serve(stream).await {
                        debug!("Channel {} session ended: {}", id, e);
                    }
                }
                Err(e) => debug!("Channel {} was never opened: {}", id, e),
            }
        });

        Self { id, endpoints }
    }

    pub fn provides(&self, endpoint: &str) -> bool {
        self.endpoints.iter().any(|name| name == endpoint)
    }

    /// Dial the channel and start a client session on it.
    pub async fn connect(&self, peer: &Peer) -> Result<RpcClient> {
        RpcClient::dial(peer, self.id).await
    }

    /// Like [`connect`](Self::connect), but fail unless `endpoint` is served.
    pub async fn connect_to(&self, peer: &Peer, endpoint: &str) -> Result<Arc<RpcClient>> {
        if !self.provides(endpoint) {
            return Err(PluginError::transport(format!(
                "channel {} does not serve {}",
                self.id, endpoint
            )));
        }
        Ok(Arc::new(self.connect(peer).await?))
    }
}

/// A stream id carrying one raw byte transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteChannel {
    pub id: u32,
}

impl ByteChannel {
    /// Offer `data` to the peer, which reads it with [`read_all`](Self::read_all).
    pub fn send(peer: &Peer, data: Vec<u8>) -> Self {
        let broker = peer.broker().clone();
        let id = broker.next_id();
        tokio::spawn(async move {
            let result = async {
                let mut stream = accept_announced(&broker, id).await?;
                stream.write_all(&data).await?;
                stream.shutdown().await?;
                Ok::<_, PluginError>(())
            }
            .await;
            if let Err(e) = result {
                debug!("Byte channel {} send failed: {}", id, e);
            }
        });
        Self { id }
    }

    /// Wait for the peer to push bytes with [`write_all`](Self::write_all).
    pub fn receive(peer: &Peer) -> (Self, JoinHandle<Result<Vec<u8>>>) {
        let broker = peer.broker().clone();
        let id = broker.next_id();
        let handle = tokio::spawn(async move {
            let mut stream = accept_announced(&broker, id).await?;
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await?;
            Ok(data)
        });
        (Self { id }, handle)
    }

    pub async fn read_all(&self, peer: &Peer) -> Result<Vec<u8>> {
        let mut stream = peer.broker().dial(self.id).await.map_err(|e| peer.classify(e))?;
        let mut data = Vec::new();
        stream
            .read_to_end(&mut data)
            .await
            .map_err(|e| peer.classify(e.into()))?;
        Ok(data)
    }

    pub async fn write_all(&self, peer: &Peer, data: &[u8]) -> Result<()> {
        let mut stream = peer.broker().dial(self.id).await.map_err(|e| peer.classify(e))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| peer.classify(e.into()))?;
        stream.shutdown().await?;
        Ok(())
    }
}

pub const CANCELLATION_ENDPOINT: &str = "Cancellation";

/// Serves `Cancellation.Wait`: replies `true` once the caller's token fires,
/// or `false` when the guarded call completes first.
struct CancellationServer {
    token: CancellationToken,
    done: CancellationToken,
}

#[async_trait::async_trait]
impl RpcDispatch for CancellationServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            "Wait" => {
                let () = decode(body)?;
                let cancelled = tokio::select! {
                    _ = self.token.cancelled() => true,
                    _ = self.done.cancelled() => false,
                };
                encode(&cancelled)
            }
            other => Err(unknown_method(CANCELLATION_ENDPOINT, other)),
        }
    }
}

/// Ends the relay's pending `Wait` when dropped.
#[derive(Debug)]
pub struct CancelGuard {
    done: CancellationToken,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

/// Forwards a caller's cancellation token to the callee of a long call.
///
/// RPC sessions are not pipelined, so a cancel request cannot travel on the
/// session that is blocked in the call; it gets a channel of its own.
pub struct CancelRelay;

impl CancelRelay {
    /// Caller side: expose `token` for the duration of the returned guard.
    pub fn serve(peer: &Peer, token: &CancellationToken) -> (OpenChannel, CancelGuard) {
        let done = CancellationToken::new();
        let server = RpcServer::new().with_endpoint(
            CANCELLATION_ENDPOINT,
            Arc::new(CancellationServer {
                token: token.clone(),
                done: done.clone(),
            }),
        );
        (OpenChannel::serve(peer, server), CancelGuard { done })
    }
}

/// Callee side: a local token that fires when the caller's token does.
///
/// Losing the connection also cancels, since nobody is left to wait for the
/// result.
pub async fn watch_cancellation(peer: &Peer, channel: &OpenChannel) -> Result<CancellationToken> {
    let client = channel.connect_to(peer, CANCELLATION_ENDPOINT).await?;
    let token = CancellationToken::new();
    let local = token.clone();

    tokio::spawn(async move {
        match client.call::<_, bool>("Cancellation.Wait", &()).await {
            Ok(true) => {
                info!("Cancellation requested by the caller");
                local.cancel();
            }
            Ok(false) => {}
            Err(e) => {
                debug!("Cancellation channel lost: {}", e);
                local.cancel();
            }
        }
    });

    Ok(token)
}
