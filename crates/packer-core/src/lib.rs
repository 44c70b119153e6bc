//! Packer Core - plugin communication substrate and multistep build engine.
//!
//! The core launches plugin executables, talks to them over one multiplexed
//! connection per process and drives builds through them. Plugins use the
//! same crate to serve their components.
//!
//! # Example
//!
//! ```rust,ignore
//! use packer_core::{ClientConfig, PluginClient};
//!
//! #[tokio::main]
//! async fn main() -> packer_core::Result<()> {
//!     let client = PluginClient::new(
//!         ClientConfig::new("packer-plugin-demo").with_args(["start", "builder", "file"]),
//!     );
//!     let plugin = client.connect().await?;
//!     let warnings = plugin.builder().prepare(vec![]).await;
//!     println!("{warnings:?}");
//!     client.kill().await;
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod cache;
pub mod cancel;
pub mod communicator;
pub mod component;
pub mod config;
pub mod discovery;
pub mod error;
pub mod multistep;
pub mod mux;
pub mod plugin_set;
pub mod process;
pub mod proxy;
pub mod rpc;
pub mod server;

// Re-export commonly used types
pub use build::{run_builds, BuildOutcome, CoreBuild, CorePostProcessor, CoreProvisioner, DispatchHook};
pub use cache::{CacheConfig, FileCache};
pub use cancel::{CancellationToken, CancelledError};
pub use communicator::LocalCommunicator;
pub use component::{
    decode_config, Artifact, BasicArtifact, BasicUi, Build, BuildContext, Builder, Cache, CmdOutput,
    Communicator, Datasource, Hook, OnError, PostProcessOutput, PostProcessor, PreProcessor,
    PrepareOutput, PrefixedUi, Provisioner, RecordingUi, RemoteCmd, Ui,
};
pub use discovery::{discover, DiscoveredPlugins, DiscoveryOptions, PluginLauncher};
pub use error::{PluginError, Result};
pub use multistep::{new_runner, BasicRunner, Runner, StateBag, Step, StepAction};
pub use plugin_set::{ComponentKind, PluginSet, SetDescription};
pub use process::{ClientConfig, ClientRegistry, PluginClient, RemotePlugin};
pub use server::{serve_broker, serve_component, Component, ServeOptions};
