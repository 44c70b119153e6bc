//! Packer Plugin Demo - a multi-component plugin built on packer-core.
//!
//! The core runs `packer-plugin-demo describe` to learn what the binary
//! provides, then `packer-plugin-demo start <kind> <name>` once per component
//! it needs. Only the handshake line and the `describe` JSON go to stdout;
//! logs go to stderr.

mod builders;
mod post_processors;
mod provisioners;

use anyhow::Result;
use clap::{Parser, Subcommand};
use packer_core::{ComponentKind, PluginSet};
use std::sync::Arc;
use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "packer-plugin-demo")]
#[command(about = "Demo builders, provisioners and post-processors for Packer")]
#[command(version)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the components this plugin provides as JSON
    Describe,
    /// Serve one component to the core that launched this process
    Start {
        /// builder, provisioner, post-processor or datasource
        kind: ComponentKind,
        /// Component name as listed by `describe`
        name: String,
    },
}

fn plugin_set() -> PluginSet {
    let mut set = PluginSet::new(env!("CARGO_PKG_VERSION"));
    set.register_builder("echo", || Arc::new(builders::EchoBuilder));
    set.register_builder("file", || Arc::new(builders::FileBuilder::default()));
    set.register_builder("null", || Arc::new(builders::NullBuilder::default()));
    set.register_provisioner("shell-local", || {
        Arc::new(provisioners::ShellLocalProvisioner::default())
    });
    set.register_post_processor("checksum", || {
        Arc::new(post_processors::ChecksumPostProcessor::default())
    });
    set
}

/// Log to stderr; stdout carries the handshake.
fn init_logging(debug: bool) {
    let default_level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_env("PACKER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let set = plugin_set();
    match args.command {
        Command::Describe => {
            // Intentional stdout: the core parses this JSON
            println!("{}", serde_json::to_string(&set.describe())?);
        }
        Command::Start { kind, name } => {
            debug!("Starting {} {}", kind, name);
            set.start(kind, &name).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_lists_components() {
        let description = plugin_set().describe();
        assert_eq!(description.builders, vec!["echo", "file", "null"]);
        assert_eq!(description.provisioners, vec!["shell-local"]);
        assert_eq!(description.post_processors, vec!["checksum"]);
        assert!(description.datasources.is_empty());
        assert_eq!(description.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_args_parse_start() {
        let args = Args::try_parse_from(["packer-plugin-demo", "start", "post-processor", "checksum"]).unwrap();
        match args.command {
            Command::Start { kind, name } => {
                assert_eq!(kind, ComponentKind::PostProcessor);
                assert_eq!(name, "checksum");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Args::try_parse_from(["packer-plugin-demo", "start", "widget", "x"]).is_err());
    }

    #[test]
    fn test_unknown_component_is_refused() {
        assert!(plugin_set().component(ComponentKind::Builder, "amazon-ebs").is_err());
    }
}
