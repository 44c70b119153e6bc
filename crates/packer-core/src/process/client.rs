//! Launching a plugin process and connecting to it.

use super::exit::ExitFlag;
use super::handshake::{parse_handshake, PluginAddr};
use super::remote::RemotePlugin;
use crate::config::HandshakeConfig;
use crate::mux::{BrokerRole, MuxBroker};
use crate::{PluginError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

/// Configuration for launching a plugin process.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the plugin executable.
    pub program: PathBuf,
    /// Arguments, e.g. `["start", "builder", "file"]` for multi-component plugins.
    pub args: Vec<String>,
    pub min_port: u16,
    pub max_port: u16,
    /// How long to wait for the handshake line.
    pub start_timeout: Duration,
    /// Grace period between the polite and the forced kill.
    pub kill_grace: Duration,
    /// Whether a [`ClientRegistry`](super::ClientRegistry) should kill the
    /// process during cleanup.
    pub managed: bool,
}

impl ClientConfig {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            min_port: HandshakeConfig::DEFAULT_MIN_PORT,
            max_port: HandshakeConfig::DEFAULT_MAX_PORT,
            start_timeout: HandshakeConfig::DEFAULT_START_TIMEOUT,
            kill_grace: HandshakeConfig::KILL_GRACE_PERIOD,
            managed: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.min_port = min;
        self.max_port = max;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_managed(mut self, managed: bool) -> Self {
        self.managed = managed;
        self
    }

    /// Prefix for forwarded log lines: the component name for
    /// multi-component plugins, otherwise the executable's file name.
    fn log_name(&self) -> String {
        if let Some(last) = self.args.last() {
            return last.clone();
        }
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Handle to one plugin process for its entire lifetime.
pub struct PluginClient {
    config: ClientConfig,
    exit_flag: ExitFlag,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    started: bool,
    address: Option<PluginAddr>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<watch::Receiver<bool>>,
    remote: Option<Arc<RemotePlugin>>,
}

impl PluginClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            exit_flag: ExitFlag::new(),
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether the process has exited (or never ran).
    pub fn exited(&self) -> bool {
        self.exit_flag.is_set()
    }

    pub fn exit_flag(&self) -> ExitFlag {
        self.exit_flag.clone()
    }

    /// Spawn the process and wait for its handshake.
    ///
    /// Returns the cached address when already started. On any failure the
    /// process is killed and `exited()` is true.
    pub async fn start(&self) -> Result<PluginAddr> {
        let mut state = self.state.lock().await;
        if let Some(addr) = &state.address {
            return Ok(addr.clone());
        }
        if state.started {
            return Err(PluginError::LaunchFailed {
                path: self.config.program.clone(),
                message: "plugin client was already started and stopped".to_string(),
            });
        }
        state.started = true;

        let path = self.config.program.clone();
        let name = self.config.log_name();

        let mut cmd = Command::new(&path);
        cmd.args(&self.config.args)
            .env(
                HandshakeConfig::MAGIC_COOKIE_KEY,
                HandshakeConfig::MAGIC_COOKIE_VALUE,
            )
            .env(HandshakeConfig::MIN_PORT_ENV, self.config.min_port.to_string())
            .env(HandshakeConfig::MAX_PORT_ENV, self.config.max_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Starting plugin: {} {:?}", path.display(), self.config.args);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.exit_flag.set();
                return Err(PluginError::LaunchFailed {
                    path,
                    message: e.to_string(),
                });
            }
        };

        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            let name = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("{} plugin: {}", name, line.trim_end());
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        tokio::spawn(watch_process(
            child,
            kill_rx,
            exit_tx,
            self.exit_flag.clone(),
            name.clone(),
            self.config.kill_grace,
        ));
        state.kill_tx = Some(kill_tx);
        state.exit_rx = Some(exit_rx);

        let result = match stdout {
            Some(stdout) => {
                let mut lines = BufReader::new(stdout).lines();
                let handshake =
                    tokio::time::timeout(self.config.start_timeout, lines.next_line()).await;
                let result = match handshake {
                    Err(_) => Err(PluginError::HandshakeTimeout {
                        path: path.clone(),
                        timeout: self.config.start_timeout,
                    }),
                    Ok(Err(e)) => Err(PluginError::LaunchFailed {
                        path: path.clone(),
                        message: format!("failed to read handshake: {e}"),
                    }),
                    Ok(Ok(None)) => Err(PluginError::ExitedBeforeHandshake { path: path.clone() }),
                    Ok(Ok(Some(line))) => parse_handshake(&line),
                };
                if result.is_ok() {
                    tokio::spawn(async move {
                        while let Ok(Some(line)) = lines.next_line().await {
                            debug!("{} plugin stdout: {}", name, line);
                        }
                    });
                }
                result
            }
            None => Err(PluginError::LaunchFailed {
                path: path.clone(),
                message: "stdout was not captured".to_string(),
            }),
        };

        match result {
            Ok(addr) => {
                debug!("Plugin {} listening on {} {}", path.display(), addr.network(), addr);
                state.address = Some(addr.clone());
                Ok(addr)
            }
            Err(e) => {
                warn!("Plugin {} failed to start: {}", path.display(), e);
                let kill_tx = state.kill_tx.take();
                let exit_rx = state.exit_rx.clone();
                drop(state);
                self.terminate(kill_tx, exit_rx).await;
                Err(e)
            }
        }
    }

    /// Start if needed, connect, and open the primary session.
    pub async fn connect(&self) -> Result<Arc<RemotePlugin>> {
        let addr = self.start().await?;

        let mut state = self.state.lock().await;
        if let Some(remote) = &state.remote {
            return Ok(remote.clone());
        }

        let broker = connect_broker(&addr).await.map_err(|e| {
            if self.exit_flag.is_set() {
                PluginError::PeerExited
            } else {
                e
            }
        })?;
        let remote = Arc::new(RemotePlugin::open(broker, self.exit_flag.clone()).await?);
        state.remote = Some(remote.clone());
        Ok(remote)
    }

    /// Stop the process and wait for it to exit. Always leaves `exited()`
    /// true; calling it again is a no-op.
    pub async fn kill(&self) {
        let (kill_tx, exit_rx, remote) = {
            let mut state = self.state.lock().await;
            state.started = true;
            (state.kill_tx.take(), state.exit_rx.clone(), state.remote.take())
        };

        // Flag first so calls failing during teardown report `PeerExited`.
        self.exit_flag.set();
        if let Some(remote) = remote {
            remote.close();
        }
        self.terminate(kill_tx, exit_rx).await;
    }

    async fn terminate(
        &self,
        kill_tx: Option<oneshot::Sender<()>>,
        exit_rx: Option<watch::Receiver<bool>>,
    ) {
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        if let Some(mut exit_rx) = exit_rx {
            let _ = exit_rx.wait_for(|exited| *exited).await;
        }
        self.exit_flag.set();
    }
}

async fn connect_broker(addr: &PluginAddr) -> Result<MuxBroker> {
    match addr {
        PluginAddr::Tcp(sock) => {
            let stream = tokio::net::TcpStream::connect(sock)
                .await
                .map_err(|e| PluginError::transport(format!("failed to connect to {sock}: {e}")))?;
            stream.set_nodelay(true)?;
            Ok(MuxBroker::new(stream, BrokerRole::Client))
        }
        #[cfg(unix)]
        PluginAddr::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                PluginError::transport(format!("failed to connect to {}: {e}", path.display()))
            })?;
            Ok(MuxBroker::new(stream, BrokerRole::Client))
        }
        #[cfg(not(unix))]
        PluginAddr::Unix(path) => Err(PluginError::transport(format!(
            "unix sockets are not supported on this platform: {}",
            path.display()
        ))),
    }
}

/// Own the child until it exits, then raise the exit flag.
async fn watch_process(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
    exit_flag: ExitFlag,
    name: String,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Also fires when the client is dropped.
        _ = kill_rx => super::terminate::terminate_child(&mut child, grace).await,
    };

    match status {
        Ok(status) => info!("{}: plugin process exited ({})", name, status),
        Err(e) => warn!("{}: failed to wait for plugin process: {}", name, e),
    }

    exit_flag.set();
    let _ = exit_tx.send(true);
}
