//! RPC client: one blocking round trip per call on one logical stream.

use super::protocol::{decode, encode, read_message, write_message, RpcRequest, RpcResponse};
use super::Peer;
use crate::mux::MuxStream;
use crate::{PluginError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Client half of an RPC session.
///
/// A tokio `Mutex` serialises access to the stream so concurrent callers take
/// turns; there is no pipelining. Each round trip runs in its own task, so a
/// caller that stops waiting (a timeout, a dropped future) never leaves a
/// half-written request or an unread reply on the stream.
#[derive(Debug)]
pub struct RpcClient {
    stream: Arc<Mutex<MuxStream>>,
    next_seq: AtomicU64,
    peer: Peer,
}

impl RpcClient {
    pub fn new(stream: MuxStream, peer: Peer) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
            next_seq: AtomicU64::new(1),
            peer,
        }
    }

    /// Dial stream `id` on the peer's broker and start a session on it.
    pub async fn dial(peer: &Peer, id: u32) -> Result<Self> {
        let stream = peer
            .broker()
            .dial(id)
            .await
            .map_err(|e| peer.classify(e))?;
        Ok(Self::new(stream, peer.clone()))
    }

    /// The connection this session runs on.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Call `"<Endpoint>.<Method>"` with `args` and decode the reply.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let request = encode(&RpcRequest {
            seq,
            method: method.to_string(),
            body: encode(args)?,
        })?;

        let round_trip = tokio::spawn(round_trip(
            self.stream.clone(),
            self.peer.clone(),
            method.to_string(),
            request,
        ));
        let reply = round_trip
            .await
            .map_err(|e| PluginError::transport(format!("{method} round trip failed: {e}")))??;

        let response: RpcResponse = decode(&reply)?;
        if response.seq != seq {
            return Err(PluginError::transport(format!(
                "response sequence {} does not match request {} for {}",
                response.seq, seq, method
            )));
        }

        match response.outcome {
            Ok(body) => decode(&body),
            Err(fault) => {
                debug!("{} failed remotely: {}", method, fault.message);
                Err(fault.into())
            }
        }
    }
}

async fn round_trip(
    stream: Arc<Mutex<MuxStream>>,
    peer: Peer,
    method: String,
    request: Vec<u8>,
) -> Result<Vec<u8>> {
    let mut stream = stream.lock_owned().await;
    write_message(&mut *stream, &request)
        .await
        .map_err(|e| peer.classify(e))?;
    read_message(&mut *stream)
        .await
        .map_err(|e| peer.classify(e))?
        .ok_or_else(|| peer.classify(PluginError::transport(format!("connection closed during {method}"))))
}
