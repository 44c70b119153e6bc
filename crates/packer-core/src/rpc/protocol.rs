//! RPC envelope types and session framing.
//!
//! Each logical stream carries one request/response session framed as
//! length-prefixed messages:
//!
//! ```text
//! [u32 BE: len][bincode bytes of len]
//! ```
//!
//! Envelopes, arguments and replies are `bincode`-encoded. Values that need a
//! self-describing encoding (configs, generated data, artifact state) travel
//! inside as a [`Payload`] of pre-serialised JSON.

use crate::config::RpcConfig;
use crate::{PluginError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One call on a session. `method` is `"<Endpoint>.<Method>"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub seq: u64,
    pub method: String,
    pub body: Vec<u8>,
}

/// Reply to the request with the same `seq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub seq: u64,
    pub outcome: std::result::Result<Vec<u8>, RemoteFault>,
}

/// Classification of a fault so the caller can rebuild a local error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FaultKind {
    /// The wrapped implementation returned an error.
    Domain,
    UnknownMethod,
    /// Arguments could not be decoded.
    Decode,
    Cancelled,
}

/// An error carried across the RPC boundary: message text only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RemoteFault {
    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::UnknownMethod,
            message: method.into(),
        }
    }
}

/// Opaque structured value, pre-serialised as JSON bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn encode(value: &serde_json::Value) -> Result<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Decode back into a JSON value. An empty payload is `null`.
    pub fn decode(&self) -> Result<serde_json::Value> {
        if self.0.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn decode_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

pub(crate) fn encode_all(values: &[serde_json::Value]) -> Result<Vec<Payload>> {
    values.iter().map(Payload::encode).collect()
}

pub(crate) fn decode_all(payloads: &[Payload]) -> Result<Vec<serde_json::Value>> {
    payloads.iter().map(Payload::decode).collect()
}

/// Encode a value with the session codec.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a value with the session codec.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Read a length-prefixed message. Returns `None` on clean EOF.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(PluginError::FrameTooLarge {
            size: len,
            max: RpcConfig::MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write a length-prefixed message.
pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
