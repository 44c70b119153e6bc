//! Entry point of a plugin binary: serve one component to the core that
//! launched it.

mod listener;

use crate::component::{Builder, Datasource, Hook, PostProcessor, PreProcessor, Provisioner};
use crate::config::{HandshakeConfig, MuxConfig};
use crate::mux::MuxBroker;
use crate::process::{format_handshake, ExitFlag};
use crate::proxy::{
    endpoint, BuilderServer, DatasourceServer, HookServer, PostProcessorServer,
    PreProcessorServer, ProvisionerServer,
};
use crate::rpc::{Peer, RpcServer};
use crate::{PluginError, Result};
use listener::PluginListener;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The single component a plugin process serves.
#[derive(Clone)]
pub enum Component {
    Builder(Arc<dyn Builder>),
    Provisioner(Arc<dyn Provisioner>),
    PostProcessor(Arc<dyn PostProcessor>),
    PreProcessor(Arc<dyn PreProcessor>),
    Datasource(Arc<dyn Datasource>),
    Hook(Arc<dyn Hook>),
}

impl Component {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Component::Builder(_) => endpoint::BUILDER,
            Component::Provisioner(_) => endpoint::PROVISIONER,
            Component::PostProcessor(_) => endpoint::POST_PROCESSOR,
            Component::PreProcessor(_) => endpoint::PRE_PROCESSOR,
            Component::Datasource(_) => endpoint::DATASOURCE,
            Component::Hook(_) => endpoint::HOOK,
        }
    }

    /// Register this component's adapter on `server`.
    pub fn register(&self, server: &mut RpcServer, peer: &Peer) {
        let name = self.endpoint();
        match self {
            Component::Builder(b) => {
                server.register(name, Arc::new(BuilderServer::new(b.clone(), peer.clone())))
            }
            Component::Provisioner(p) => {
                server.register(name, Arc::new(ProvisionerServer::new(p.clone(), peer.clone())))
            }
            Component::PostProcessor(p) => server.register(
                name,
                Arc::new(PostProcessorServer::new(p.clone(), peer.clone())),
            ),
            Component::PreProcessor(p) => server.register(
                name,
                Arc::new(PreProcessorServer::new(p.clone(), peer.clone())),
            ),
            Component::Datasource(d) => {
                server.register(name, Arc::new(DatasourceServer::new(d.clone())))
            }
            Component::Hook(h) => {
                server.register(name, Arc::new(HookServer::new(h.clone(), peer.clone())))
            }
        }
    }
}

/// Listener settings for a plugin server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeOptions {
    pub min_port: u16,
    pub max_port: u16,
    /// Listen on a unix socket instead of TCP (unix only).
    pub unix_socket: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            min_port: HandshakeConfig::DEFAULT_MIN_PORT,
            max_port: HandshakeConfig::DEFAULT_MAX_PORT,
            unix_socket: cfg!(unix),
        }
    }
}

impl ServeOptions {
    /// Read the port range the core passed in the environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_port: env_port(HandshakeConfig::MIN_PORT_ENV).unwrap_or(defaults.min_port),
            max_port: env_port(HandshakeConfig::MAX_PORT_ENV).unwrap_or(defaults.max_port),
            ..defaults
        }
    }

    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.min_port = min;
        self.max_port = max;
        self
    }

    pub fn with_unix_socket(mut self, unix_socket: bool) -> Self {
        self.unix_socket = unix_socket && cfg!(unix);
        self
    }
}

fn env_port(key: &str) -> Option<u16> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, value);
            None
        }
    }
}

/// Whether `value` is the cookie the core sets for its plugins.
pub fn magic_cookie_matches(value: Option<&str>) -> bool {
    value == Some(HandshakeConfig::MAGIC_COOKIE_VALUE)
}

/// Refuse to run unless launched by the core.
pub fn check_magic_cookie() -> Result<()> {
    let value = std::env::var(HandshakeConfig::MAGIC_COOKIE_KEY).ok();
    if magic_cookie_matches(value.as_deref()) {
        Ok(())
    } else {
        Err(PluginError::MagicCookieMismatch)
    }
}

/// Serve `component` the way the core expects: check the cookie, listen,
/// print the handshake on stdout and serve until the core disconnects.
pub async fn serve_component(component: Component) -> Result<()> {
    check_magic_cookie()?;
    serve_with_options(component, ServeOptions::from_env(), print_handshake).await
}

fn print_handshake(line: String) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

/// Serve `component` on a fresh listener, announcing the address through
/// `handshake` before accepting the single core connection.
pub async fn serve_with_options<F>(component: Component, options: ServeOptions, handshake: F) -> Result<()>
where
    F: FnOnce(String) -> Result<()> + Send,
{
    let listener = PluginListener::bind(&options).await?;
    handshake(format_handshake(&listener.addr()?))?;

    // Lifecycle belongs to the core; interrupts meant for it are counted
    // and otherwise ignored.
    let interrupts = Arc::new(AtomicUsize::new(0));
    let absorber = {
        let interrupts = interrupts.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let count = interrupts.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Plugin received interrupt ({}), waiting for the core", count);
            }
        })
    };

    let result = serve_connection(&listener, &component).await;

    absorber.abort();
    debug!(
        "{} server finished after {} interrupts",
        component.endpoint(),
        interrupts.load(Ordering::SeqCst)
    );
    result
}

async fn serve_connection(listener: &PluginListener, component: &Component) -> Result<()> {
    let broker = listener.accept().await?;
    serve_broker(broker, component).await
}

/// Serve `component` on primary stream 0 of an already connected
/// server-role broker until the core disconnects, then close the broker.
pub async fn serve_broker(broker: MuxBroker, component: &Component) -> Result<()> {
    let peer = Peer::new(broker.clone(), ExitFlag::new());

    let mut server = RpcServer::new();
    component.register(&mut server, &peer);

    let result = match broker.accept(MuxConfig::PRIMARY_STREAM_ID).await {
        Ok(stream) => {
            info!("Serving {} to the core", component.endpoint());
            server.serve(stream).await
        }
        Err(e) => Err(e),
    };
    broker.close();
    result
}
