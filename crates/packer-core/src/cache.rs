//! File cache shared by builders that download large inputs.
//!
//! Keys (usually URLs) map to files named by the SHA-256 of the key. Each key
//! has its own reader/writer lock; the guards of acquired locks are parked in
//! a table until the matching release call, since acquire and release arrive
//! as separate RPC calls. A key's entry is dropped again once nothing holds
//! or waits for its lock.

use crate::component::Cache;
use crate::{PluginError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

/// Where the cache lives.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
}

impl CacheConfig {
    pub const DIR_ENV: &'static str = "PACKER_CACHE_DIR";
    pub const DEFAULT_DIR: &'static str = "packer_cache";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `PACKER_CACHE_DIR`, or `packer_cache` under the working directory.
    pub fn from_env() -> Self {
        match std::env::var_os(Self::DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIR)
    }
}

#[derive(Default)]
struct KeyLocks {
    lock: Arc<RwLock<()>>,
    writer: Option<OwnedRwLockWriteGuard<()>>,
    readers: Vec<OwnedRwLockReadGuard<()>>,
}

/// [`Cache`] backed by a local directory.
pub struct FileCache {
    dir: PathBuf,
    keys: Mutex<HashMap<String, KeyLocks>>,
}

impl FileCache {
    /// Open the cache at `dir`, creating the directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PluginError::io_with_path(e, &dir))?;
        Ok(Self {
            dir,
            keys: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(&config.dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file a key is stored in: the hex SHA-256 of the key plus the
    /// key's own extension.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        let name = match Path::new(key).extension() {
            Some(ext) => format!("{hash}.{}", ext.to_string_lossy()),
            None => hash,
        };
        self.dir.join(name)
    }

    fn key_lock(&self, key: &str) -> Arc<RwLock<()>> {
        self.keys.lock().entry(key.to_string()).or_default().lock.clone()
    }

    /// Forget `key` once its lock is neither held nor awaited. Waiters hold a
    /// clone of the lock, so a count of one means nobody is queued.
    fn prune(keys: &mut HashMap<String, KeyLocks>, key: &str) {
        let idle = keys.get(key).is_some_and(|entry| {
            entry.writer.is_none() && entry.readers.is_empty() && Arc::strong_count(&entry.lock) == 1
        });
        if idle {
            keys.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.keys.lock().len()
    }

    fn not_locked(key: &str) -> PluginError {
        PluginError::CacheNotLocked {
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn lock(&self, key: &str) -> Result<PathBuf> {
        let guard = self.key_lock(key).write_owned().await;
        self.keys.lock().entry(key.to_string()).or_default().writer = Some(guard);
        debug!("Cache write lock acquired: {}", key);
        Ok(self.path_for(key))
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        let mut keys = self.keys.lock();
        let guard = keys
            .get_mut(key)
            .and_then(|entry| entry.writer.take())
            .ok_or_else(|| Self::not_locked(key))?;
        drop(guard);
        Self::prune(&mut keys, key);
        debug!("Cache write lock released: {}", key);
        Ok(())
    }

    async fn rlock(&self, key: &str) -> Result<(PathBuf, bool)> {
        let guard = self.key_lock(key).read_owned().await;
        self.keys.lock().entry(key.to_string()).or_default().readers.push(guard);
        let path = self.path_for(key);
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        Ok((path, exists))
    }

    async fn runlock(&self, key: &str) -> Result<()> {
        let mut keys = self.keys.lock();
        let guard = keys
            .get_mut(key)
            .and_then(|entry| entry.readers.pop())
            .ok_or_else(|| Self::not_locked(key))?;
        drop(guard);
        Self::prune(&mut keys, key);
        Ok(())
    }
}
