use super::{endpoint, serve_single};
use crate::component::Cache;
use crate::rpc::{decode, encode, unknown_method, OpenChannel, Peer, RpcClient, RpcDispatch};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct KeyArgs {
    key: String,
}

pub struct CacheServer {
    cache: Arc<dyn Cache>,
}

impl CacheServer {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub fn open(peer: &Peer, cache: Arc<dyn Cache>) -> OpenChannel {
        serve_single(peer, endpoint::CACHE, Arc::new(Self::new(cache)))
    }
}

#[async_trait]
impl RpcDispatch for CacheServer {
    async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        let args: KeyArgs = decode(body)?;
        match method {
            "Lock" => encode(&self.cache.lock(&args.key).await?),
            "Unlock" => encode(&self.cache.unlock(&args.key).await?),
            "RLock" => encode(&self.cache.rlock(&args.key).await?),
            "RUnlock" => encode(&self.cache.runlock(&args.key).await?),
            other => Err(unknown_method(endpoint::CACHE, other)),
        }
    }
}

pub struct CacheClient {
    client: Arc<RpcClient>,
}

impl CacheClient {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub async fn connect(peer: &Peer, channel: &OpenChannel) -> Result<Self> {
        Ok(Self::new(channel.connect_to(peer, endpoint::CACHE).await?))
    }

    fn args(key: &str) -> KeyArgs {
        KeyArgs {
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl Cache for CacheClient {
    async fn lock(&self, key: &str) -> Result<PathBuf> {
        self.client.call("Cache.Lock", &Self::args(key)).await
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.client.call("Cache.Unlock", &Self::args(key)).await
    }

    async fn rlock(&self, key: &str) -> Result<(PathBuf, bool)> {
        self.client.call("Cache.RLock", &Self::args(key)).await
    }

    async fn runlock(&self, key: &str) -> Result<()> {
        self.client.call("Cache.RUnlock", &Self::args(key)).await
    }
}
