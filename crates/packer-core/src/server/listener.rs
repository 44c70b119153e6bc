//! The one listener a plugin server opens for its core.

use super::ServeOptions;
#[cfg(unix)]
use crate::config::HandshakeConfig;
use crate::mux::{BrokerRole, MuxBroker};
use crate::process::PluginAddr;
use crate::{PluginError, Result};
use tokio::net::TcpListener;
use tracing::debug;

pub(crate) enum PluginListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
        // Removed with the socket when the server finishes.
        _dir: tempfile::TempDir,
    },
}

impl PluginListener {
    pub(crate) async fn bind(options: &ServeOptions) -> Result<Self> {
        #[cfg(unix)]
        if options.unix_socket {
            return Self::bind_unix();
        }
        Self::bind_tcp(options.min_port, options.max_port).await
    }

    /// First free port in `[min, max]` on the loopback interface.
    async fn bind_tcp(min: u16, max: u16) -> Result<Self> {
        for port in min..=max {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    debug!("Plugin listening on 127.0.0.1:{}", port);
                    return Ok(PluginListener::Tcp(listener));
                }
                Err(_) => continue,
            }
        }
        Err(PluginError::NoFreePort { min, max })
    }

    #[cfg(unix)]
    fn bind_unix() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(HandshakeConfig::UNIX_SOCKET_PREFIX)
            .tempdir()?;
        let path = dir.path().join(HandshakeConfig::UNIX_SOCKET_NAME);
        let listener = tokio::net::UnixListener::bind(&path)
            .map_err(|e| PluginError::io_with_path(e, &path))?;
        debug!("Plugin listening on {}", path.display());
        Ok(PluginListener::Unix {
            listener,
            path,
            _dir: dir,
        })
    }

    pub(crate) fn addr(&self) -> Result<PluginAddr> {
        match self {
            PluginListener::Tcp(listener) => Ok(PluginAddr::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            PluginListener::Unix { path, .. } => Ok(PluginAddr::Unix(path.clone())),
        }
    }

    /// Accept exactly one connection and wrap it in a server-role broker.
    pub(crate) async fn accept(&self) -> Result<MuxBroker> {
        match self {
            PluginListener::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!("Core connected from {}", remote);
                Ok(MuxBroker::new(stream, BrokerRole::Server))
            }
            #[cfg(unix)]
            PluginListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                debug!("Core connected over unix socket");
                Ok(MuxBroker::new(stream, BrokerRole::Server))
            }
        }
    }
}
