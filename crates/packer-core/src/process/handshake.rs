//! The single line a plugin prints to advertise where to connect.
//!
//! ```text
//! x5.0|tcp|127.0.0.1:10000
//! x5.0|unix|/tmp/packer-plugin1234/plugin.sock
//! :10000                          (legacy)
//! ```

use crate::config::HandshakeConfig;
use crate::{PluginError, Result};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Address a plugin server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl PluginAddr {
    pub fn network(&self) -> &'static str {
        match self {
            PluginAddr::Tcp(_) => "tcp",
            PluginAddr::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for PluginAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginAddr::Tcp(addr) => write!(f, "{addr}"),
            PluginAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Render the handshake line for `addr`, without the trailing newline.
pub fn format_handshake(addr: &PluginAddr) -> String {
    format!("{}|{}|{}", HandshakeConfig::API_VERSION, addr.network(), addr)
}

/// Parse a handshake line read from a plugin's stdout.
pub fn parse_handshake(line: &str) -> Result<PluginAddr> {
    let line = line.trim();
    let invalid = || PluginError::InvalidHandshake {
        line: line.to_string(),
    };

    if let Some(port) = line.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|_| invalid())?;
        return Ok(PluginAddr::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port))));
    }

    let mut parts = line.splitn(3, '|');
    let (Some(version), Some(network), Some(address)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    if version != HandshakeConfig::API_VERSION {
        return Err(PluginError::IncompatibleApiVersion {
            plugin: version.to_string(),
            ours: HandshakeConfig::API_VERSION.to_string(),
        });
    }

    match network {
        "tcp" => address
            .parse::<SocketAddr>()
            .map(PluginAddr::Tcp)
            .map_err(|_| invalid()),
        "unix" if !address.is_empty() => Ok(PluginAddr::Unix(PathBuf::from(address))),
        _ => Err(invalid()),
    }
}
