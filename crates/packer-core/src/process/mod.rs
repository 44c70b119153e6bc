//! Plugin process lifecycle: spawning, handshake, exit tracking, teardown.

mod client;
mod exit;
mod handshake;
mod registry;
mod remote;
mod terminate;

pub use client::{ClientConfig, PluginClient};
pub use exit::ExitFlag;
pub use handshake::{format_handshake, parse_handshake, PluginAddr};
pub use registry::ClientRegistry;
pub use remote::RemotePlugin;
