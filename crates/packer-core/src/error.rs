//! Error types for the plugin substrate.
//!
//! Errors are grouped the way callers need to react to them: launch and
//! handshake failures are fatal to one plugin invocation, transport failures
//! mean the peer is unreachable, and domain failures are ordinary errors that
//! a component returned on purpose and that crossed the RPC boundary as text.

use crate::rpc::{FaultKind, RemoteFault};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the plugin substrate.
#[derive(Debug, Error)]
pub enum PluginError {
    // Launch and handshake errors
    #[error("Failed to launch plugin {path:?}: {message}")]
    LaunchFailed { path: PathBuf, message: String },

    #[error("Timeout after {timeout:?} waiting for plugin {path:?} to start")]
    HandshakeTimeout { path: PathBuf, timeout: Duration },

    #[error("Plugin {path:?} exited before writing its handshake")]
    ExitedBeforeHandshake { path: PathBuf },

    #[error("Unrecognized remote plugin message: {line}")]
    InvalidHandshake { line: String },

    #[error("Incompatible API version with plugin. Plugin version: {plugin}, ours: {ours}")]
    IncompatibleApiVersion { plugin: String, ours: String },

    #[error("Please do not execute plugins directly. They are launched by the orchestrator.")]
    MagicCookieMismatch,

    #[error("Couldn't bind plugin TCP listener in port range {min}-{max}")]
    NoFreePort { min: u16, max: u16 },

    // Transport errors
    #[error("Plugin communication error: {message}")]
    Transport { message: String },

    #[error("Stream id {0} already exists")]
    StreamExists(u32),

    #[error("Mux broker is closed")]
    BrokerClosed,

    #[error("Plugin process exited")]
    PeerExited,

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Domain errors
    #[error("{message}")]
    Remote { message: String },

    #[error("Unknown RPC method: {method}")]
    UnknownMethod { method: String },

    #[error("Unknown {kind}: {name}")]
    UnknownComponent { kind: String, name: String },

    #[error("Step {step} failed: {message}")]
    Step { step: String, message: String },

    #[error("Build was cancelled")]
    Cancelled,

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited by {service}")]
    RateLimited { service: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("State bag entry {key}: {message}")]
    State { key: String, message: String },

    #[error("Cache key is not locked: {key}")]
    CacheNotLocked { key: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Codec error: {message}")]
    Codec { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        PluginError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<bincode::Error> for PluginError {
    fn from(err: bincode::Error) -> Self {
        PluginError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<RemoteFault> for PluginError {
    fn from(fault: RemoteFault) -> Self {
        match fault.kind {
            FaultKind::Domain => PluginError::Remote {
                message: fault.message,
            },
            FaultKind::UnknownMethod => PluginError::UnknownMethod {
                method: fault.message,
            },
            FaultKind::Decode => PluginError::Codec {
                message: fault.message,
            },
            FaultKind::Cancelled => PluginError::Cancelled,
        }
    }
}

impl PluginError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PluginError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a transport error with a formatted message.
    pub fn transport(message: impl Into<String>) -> Self {
        PluginError::Transport {
            message: message.into(),
        }
    }

    /// Convert to the message-only fault that crosses the RPC boundary.
    pub fn to_fault(&self) -> RemoteFault {
        let kind = match self {
            PluginError::Cancelled => FaultKind::Cancelled,
            PluginError::UnknownMethod { .. } => FaultKind::UnknownMethod,
            PluginError::Codec { .. } => FaultKind::Decode,
            _ => FaultKind::Domain,
        };
        let message = match self {
            PluginError::UnknownMethod { method } => method.clone(),
            PluginError::Codec { message } => message.clone(),
            other => other.to_string(),
        };
        RemoteFault { kind, message }
    }

    /// Whether the error means the peer could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PluginError::Transport { .. }
                | PluginError::BrokerClosed
                | PluginError::PeerExited
                | PluginError::FrameTooLarge { .. }
        )
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PluginError::Timeout(_) | PluginError::RateLimited { .. }
        )
    }
}
