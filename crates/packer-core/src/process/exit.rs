use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set once the plugin process at the far end of a connection has exited.
///
/// The watcher task of a [`PluginClient`](super::PluginClient) sets it as soon
/// as the OS reports the exit; RPC clients and servers consult it to tell an
/// expected disconnection from a genuine fault.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
