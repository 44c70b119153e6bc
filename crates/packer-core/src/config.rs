//! Centralized configuration constants.
//!
//! Runtime-tunable values live on the config structs of the modules that use
//! them (`ClientConfig`, `RetryConfig`, `PollConfig`, ...); this module holds
//! the fixed protocol constants and their defaults.

use std::time::Duration;

/// Handshake between the core and a plugin process.
pub struct HandshakeConfig;

impl HandshakeConfig {
    /// Protocol version both sides must agree on.
    pub const API_VERSION: &'static str = "x5.0";

    pub const MAGIC_COOKIE_KEY: &'static str = "PACKER_PLUGIN_MAGIC_COOKIE";
    pub const MAGIC_COOKIE_VALUE: &'static str =
        "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

    pub const MIN_PORT_ENV: &'static str = "PACKER_PLUGIN_MIN_PORT";
    pub const MAX_PORT_ENV: &'static str = "PACKER_PLUGIN_MAX_PORT";
    pub const DEFAULT_MIN_PORT: u16 = 10_000;
    pub const DEFAULT_MAX_PORT: u16 = 25_000;

    pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);
    pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

    pub const UNIX_SOCKET_PREFIX: &'static str = "packer-plugin";
    pub const UNIX_SOCKET_NAME: &'static str = "plugin.sock";
}

/// Stream multiplexing.
pub struct MuxConfig;

impl MuxConfig {
    /// Stream reserved for the primary core-to-plugin session.
    pub const PRIMARY_STREAM_ID: u32 = 0;
    pub const FRAME_HEADER_LEN: usize = 9;
    pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
    /// Writes larger than this are split across several data frames.
    pub const MAX_DATA_CHUNK: usize = 32 * 1024;
    /// Bytes a stream may send before the peer's reader grants more.
    pub const STREAM_WINDOW: usize = 256 * 1024;
}

/// RPC sessions.
pub struct RpcConfig;

impl RpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
    /// How long an announced channel waits for the peer to connect.
    pub const CHANNEL_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Plugin discovery.
pub struct DiscoveryConfig;

impl DiscoveryConfig {
    pub const PLUGIN_PATH_ENV: &'static str = "PACKER_PLUGIN_PATH";
    pub const CONFIG_DIR_NAME: &'static str = "packer";
    pub const PLUGINS_DIR_NAME: &'static str = "plugins";

    pub const BUILDER_PREFIX: &'static str = "packer-builder-";
    pub const PROVISIONER_PREFIX: &'static str = "packer-provisioner-";
    pub const POST_PROCESSOR_PREFIX: &'static str = "packer-post-processor-";
    pub const MULTI_PLUGIN_PREFIX: &'static str = "packer-plugin-";

    pub const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Defaults for steps that talk to remote resources.
pub struct StepConfig;

impl StepConfig {
    pub const COMMUNICATOR_RETRY_ATTEMPTS: u32 = 20;
    pub const COMMUNICATOR_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const COMMUNICATOR_MAX_DELAY: Duration = Duration::from_secs(30);

    pub const THROTTLE_RETRY_ATTEMPTS: u32 = 11;
    pub const THROTTLE_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const THROTTLE_MAX_DELAY: Duration = Duration::from_secs(30);

    pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
    pub const POLL_TIMEOUT: Duration = Duration::from_secs(300);
}

/// Keys the core passes to every component's prepare/configure call.
pub struct BuildConfig;

impl BuildConfig {
    pub const BUILD_NAME_KEY: &'static str = "packer_build_name";
    pub const BUILDER_TYPE_KEY: &'static str = "packer_builder_type";
    pub const DEBUG_KEY: &'static str = "packer_debug";
    pub const FORCE_KEY: &'static str = "packer_force";
    pub const ON_ERROR_KEY: &'static str = "packer_on_error";
    pub const PROVISION_HOOK: &'static str = "packer_provision";
}
