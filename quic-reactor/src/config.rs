//! Server configuration.
//!
//! [`ServerConfig`] is fixed once the server is initialized. The engine sees a
//! derived [`EngineConfig`] with every default already resolved.

use std::time::Duration;

/// Smallest flow-control window the engine accepts.
///
/// A window left at this value is treated as "not set by the caller" and is
/// replaced with the server defaults at initialization.
pub const MINIMUM_FLOW_CONTROL_WINDOW: u32 = 16 * 1024;

/// Session flow-control window used when the caller did not set one (1 MiB).
pub const DEFAULT_SESSION_FLOW_CONTROL_WINDOW: u32 = 1024 * 1024;

/// Stream flow-control window used when the caller did not set one (64 KiB).
pub const DEFAULT_STREAM_FLOW_CONTROL_WINDOW: u32 = 64 * 1024;

/// Number of buffered handshake attempts processed per socket event.
pub const HANDSHAKES_PER_SOCKET_EVENT: usize = 16;

/// Connection ID length the dispatcher expects from clients by default.
pub const DEFAULT_CONNECTION_ID_LENGTH: u8 = 8;

/// Idle network timeout the engine uses when the server does not override it.
pub const DEFAULT_IDLE_NETWORK_TIMEOUT: Duration = Duration::from_secs(600);

/// Configuration for a [`QuicServer`](crate::QuicServer).
///
/// # Example
///
/// ```
/// use quic_reactor::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::builder()
///     .idle_timeout_secs(30)
///     .stream_window(128 * 1024)
///     .build();
/// assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    idle_timeout: Option<Duration>,
    session_window: u32,
    stream_window: u32,
    handshake_batch_size: usize,
    connection_id_length: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            session_window: MINIMUM_FLOW_CONTROL_WINDOW,
            stream_window: MINIMUM_FLOW_CONTROL_WINDOW,
            handshake_batch_size: HANDSHAKES_PER_SOCKET_EVENT,
            connection_id_length: DEFAULT_CONNECTION_ID_LENGTH,
        }
    }
}

impl ServerConfig {
    /// Create a builder starting from the defaults.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Idle timeout override, `None` when the engine default applies.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Initial session flow-control window to advertise.
    pub fn session_window(&self) -> u32 {
        self.session_window
    }

    /// Initial stream flow-control window to advertise.
    pub fn stream_window(&self) -> u32 {
        self.stream_window
    }

    /// Maximum handshake attempts processed per readiness event.
    pub fn handshake_batch_size(&self) -> usize {
        self.handshake_batch_size
    }

    /// Connection ID length expected from clients.
    pub fn connection_id_length(&self) -> u8 {
        self.connection_id_length
    }

    /// Replace windows still at the engine minimum with the server defaults.
    ///
    /// Explicit values pass through unchanged.
    pub(crate) fn apply_default_windows(&mut self) {
        if self.stream_window == MINIMUM_FLOW_CONTROL_WINDOW {
            self.stream_window = DEFAULT_STREAM_FLOW_CONTROL_WINDOW;
        }
        if self.session_window == MINIMUM_FLOW_CONTROL_WINDOW {
            self.session_window = DEFAULT_SESSION_FLOW_CONTROL_WINDOW;
        }
    }

    /// The view of this configuration handed to the engine.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            idle_network_timeout: self.idle_timeout.unwrap_or(DEFAULT_IDLE_NETWORK_TIMEOUT),
            initial_session_window: self.session_window,
            initial_stream_window: self.stream_window,
            connection_id_length: self.connection_id_length,
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Set the idle network timeout in seconds.
    ///
    /// `-1` (or any negative value) leaves the engine default in place.
    pub fn idle_timeout_secs(mut self, secs: i64) -> Self {
        self.config.idle_timeout = u64::try_from(secs).ok().map(Duration::from_secs);
        self
    }

    /// Set the idle network timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Set the initial session flow-control window in bytes.
    pub fn session_window(mut self, bytes: u32) -> Self {
        self.config.session_window = bytes;
        self
    }

    /// Set the initial stream flow-control window in bytes.
    pub fn stream_window(mut self, bytes: u32) -> Self {
        self.config.stream_window = bytes;
        self
    }

    /// Set the connection ID length expected from clients.
    pub fn connection_id_length(mut self, len: u8) -> Self {
        self.config.connection_id_length = len;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Engine-facing configuration with all defaults resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub idle_network_timeout: Duration,
    pub initial_session_window: u32,
    pub initial_stream_window: u32,
    pub connection_id_length: u8,
}
