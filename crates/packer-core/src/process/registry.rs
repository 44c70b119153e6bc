//! Tracking of managed plugin clients for shutdown.

use super::client::{ClientConfig, PluginClient};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Owns every managed [`PluginClient`] created for one run of the core.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<PluginClient>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client, tracking it when `config.managed` is set.
    pub fn client(&self, config: ClientConfig) -> Arc<PluginClient> {
        let managed = config.managed;
        let client = Arc::new(PluginClient::new(config));
        if managed {
            self.clients.lock().push(client.clone());
        }
        client
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Kill every managed client concurrently and wait for all of them.
    pub async fn cleanup(&self) {
        let clients: Vec<_> = std::mem::take(&mut *self.clients.lock());
        if clients.is_empty() {
            return;
        }
        info!("Stopping {} plugin processes", clients.len());
        join_all(clients.iter().map(|client| client.kill())).await;
    }
}
