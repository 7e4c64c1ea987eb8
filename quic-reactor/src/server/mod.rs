//! Server controller: wires the socket, the dispatcher, the writer and the
//! timer bridge together and reacts to the host reactor's readiness events.
//!
//! # Lifecycle
//!
//! ```text
//! Unconfigured -> Initialized -> Running -> ShuttingDown -> Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use quic_reactor::{IpFamily, QuicServer, ServerConfig, ShutdownMode, SystemSocket};
//! use std::rc::Rc;
//!
//! let socket = Rc::new(SystemSocket::bind("0.0.0.0:443".parse().unwrap())?);
//! let mut server = QuicServer::new(ServerConfig::builder().idle_timeout_secs(30).build());
//! server.initialize(socket, IpFamily::V4, reactor, |ctx| MyDispatcher::new(ctx))?;
//! server.start()?;
//!
//! // From the host reactor:
//! server.on_readable();
//! let keep_watching = server.on_writable();
//!
//! server.shutdown(ShutdownMode::Graceful)?;
//! ```

mod batch;
mod reader;

pub use batch::HandshakeBatcher;
pub use reader::{DropCounter, MAX_INCOMING_PACKET_SIZE, PacketReader};

use crate::alarm::AlarmFactory;
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, DispatcherContext, DispatcherFactory};
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::socket::{self, Capabilities, DatagramSocket, IpFamily};
use crate::writer::PacketWriter;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;

use tracing::{debug, error, info};

/// Exit status used by [`QuicServer::initialize_or_exit`].
///
/// Non-zero, so supervisors and init systems record the failed start and do
/// not treat it as a clean shutdown. Hosts that need a different status call
/// [`QuicServer::initialize`] and exit themselves.
pub const FATAL_EXIT_CODE: i32 = 1;

/// Lifecycle state of a [`QuicServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unconfigured,
    Initialized,
    Running,
    ShuttingDown,
    Closed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Unconfigured => "unconfigured",
            ServerState::Initialized => "initialized",
            ServerState::Running => "running",
            ServerState::ShuttingDown => "shutting down",
            ServerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How [`QuicServer::shutdown`] treats live sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Give every session a chance to tell its peer it is closing.
    Graceful,
    /// Release sessions without notifying peers, e.g. when the socket is gone.
    Silent,
}

/// Drives one engine dispatcher from one host reactor over one UDP socket.
///
/// Not `Send`: exactly one reactor thread owns the server.
pub struct QuicServer<D: Dispatcher> {
    config: ServerConfig,
    state: ServerState,
    clock: Rc<dyn Clock>,
    socket: Option<Rc<dyn DatagramSocket>>,
    local_addr: SocketAddr,
    capabilities: Capabilities,
    drops: DropCounter,
    batcher: HandshakeBatcher,
    reader: PacketReader,
    dispatcher: Option<D>,
    silent_close: bool,
}

impl<D: Dispatcher> QuicServer<D> {
    /// Create an unconfigured server using the system clock.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_clock(config, Rc::new(SystemClock))
    }

    /// Create an unconfigured server measuring time with `clock`.
    pub fn with_clock(config: ServerConfig, clock: Rc<dyn Clock>) -> Self {
        let batcher = HandshakeBatcher::new(config.handshake_batch_size());
        Self {
            config,
            state: ServerState::Unconfigured,
            reader: PacketReader::new(clock.clone()),
            clock,
            socket: None,
            local_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            capabilities: Capabilities::default(),
            drops: DropCounter::default(),
            batcher,
            dispatcher: None,
            silent_close: false,
        }
    }

    /// Configure the socket and build the dispatcher and its writer.
    ///
    /// Flow-control windows the caller left at the engine minimum are
    /// replaced with the server defaults first. Fails with
    /// [`Error::AddressInfoUnsupported`] when the socket cannot report
    /// datagram destinations; the server then stays unconfigured.
    pub fn initialize<F>(
        &mut self,
        socket: Rc<dyn DatagramSocket>,
        family: IpFamily,
        reactor: Rc<dyn Reactor>,
        factory: F,
    ) -> Result<()>
    where
        F: DispatcherFactory<Dispatcher = D>,
    {
        self.expect_state("initialize", ServerState::Unconfigured)?;

        self.config.apply_default_windows();
        let local_addr = socket.local_addr()?;
        let capabilities = socket::configure(&*socket, family)?;

        let ctx = DispatcherContext {
            config: self.config.engine_config(),
            alarm_factory: AlarmFactory::new(reactor.clone(), self.clock.clone()),
        };
        let mut dispatcher = factory.create(ctx);
        dispatcher.initialize_with_writer(PacketWriter::new(socket.clone(), reactor));

        info!(
            %local_addr,
            overflow_reporting = capabilities.overflow_reporting,
            rx_timestamping = capabilities.rx_timestamping,
            session_window = self.config.session_window(),
            stream_window = self.config.stream_window(),
            "QUIC server initialized"
        );

        self.local_addr = local_addr;
        self.capabilities = capabilities;
        self.socket = Some(socket);
        self.dispatcher = Some(dispatcher);
        self.state = ServerState::Initialized;
        Ok(())
    }

    /// [`initialize`](Self::initialize), terminating the process when the
    /// socket cannot report datagram destinations.
    ///
    /// Replies could not be routed in that case, so a host that cannot run
    /// degraded uses this instead of handling the error itself. The process
    /// exits with [`FATAL_EXIT_CODE`], which is deliberately a failure status
    /// rather than `0`. Any other error is returned.
    pub fn initialize_or_exit<F>(
        &mut self,
        socket: Rc<dyn DatagramSocket>,
        family: IpFamily,
        reactor: Rc<dyn Reactor>,
        factory: F,
    ) -> Result<()>
    where
        F: DispatcherFactory<Dispatcher = D>,
    {
        match self.initialize(socket, family, reactor, factory) {
            Err(e @ Error::AddressInfoUnsupported(_)) => {
                error!(error = %e, "cannot route replies; exiting");
                std::process::exit(FATAL_EXIT_CODE);
            }
            other => other,
        }
    }

    /// Start reacting to readiness events.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state("start", ServerState::Initialized)?;
        self.state = ServerState::Running;
        debug!(port = self.port(), "QUIC server running");
        Ok(())
    }

    /// The socket is readable: admit buffered handshakes, drain the socket,
    /// then admit what the drained datagrams queued.
    pub fn on_readable(&mut self) {
        if self.state != ServerState::Running {
            debug!(state = %self.state, "ignoring read event");
            return;
        }

        let QuicServer {
            socket,
            local_addr,
            capabilities,
            drops,
            batcher,
            reader,
            dispatcher,
            ..
        } = self;
        let (Some(socket), Some(dispatcher)) = (socket.as_ref(), dispatcher.as_mut()) else {
            return;
        };

        batcher.process_batch(dispatcher);

        loop {
            let counter = if capabilities.overflow_reporting {
                Some(&mut *drops)
            } else {
                None
            };
            if !reader.read_and_dispatch(&**socket, *local_addr, dispatcher, counter) {
                break;
            }
        }

        if batcher.has_backlog(dispatcher) {
            batcher.process_batch(dispatcher);
        }
    }

    /// The socket is writable. Returns whether the reactor should keep
    /// watching writability.
    pub fn on_writable(&mut self) -> bool {
        if self.state != ServerState::Running {
            debug!(state = %self.state, "ignoring write event");
            return false;
        }
        self.can_write()
    }

    /// Let the dispatcher resume writing, then flush the write cache.
    ///
    /// Returns `true` if sessions still have pending writes or the cache is
    /// still blocked, `false` when writability no longer needs watching.
    pub fn can_write(&mut self) -> bool {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return false;
        };
        dispatcher.on_can_write();
        if dispatcher.has_pending_writes() {
            return true;
        }
        self.flush_write_cache()
    }

    /// Send cached datagrams. Returns whether the socket is still blocked.
    pub fn flush_write_cache(&mut self) -> bool {
        match self.dispatcher.as_mut().and_then(|d| d.writer_mut()) {
            Some(writer) => writer.flush().is_blocked(),
            None => false,
        }
    }

    /// Close every session and release the dispatcher, its writer and all of
    /// its alarms.
    pub fn shutdown(&mut self, mode: ShutdownMode) -> Result<()> {
        match self.state {
            ServerState::Initialized | ServerState::Running => {}
            state => {
                return Err(Error::InvalidState {
                    op: "shutdown",
                    state,
                });
            }
        }

        self.state = ServerState::ShuttingDown;
        info!(?mode, port = self.port(), "QUIC server shutting down");
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown(mode == ShutdownMode::Graceful);
        }
        self.socket = None;
        self.state = ServerState::Closed;
        Ok(())
    }

    /// Shut down in the mode chosen by [`set_silent_close`](Self::set_silent_close).
    pub fn close(&mut self) -> Result<()> {
        let mode = if self.silent_close {
            ShutdownMode::Silent
        } else {
            ShutdownMode::Graceful
        };
        self.shutdown(mode)
    }

    pub fn set_silent_close(&mut self, silent: bool) {
        self.silent_close = silent;
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Port of the listening socket, 0 before initialization.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn overflow_supported(&self) -> bool {
        self.capabilities.overflow_reporting
    }

    /// Datagrams the kernel reported dropped on the listening socket.
    ///
    /// Keeps counting across wraps of the kernel's 32-bit counter. Stays at
    /// zero when overflow reporting is unsupported.
    pub fn packets_dropped(&self) -> u64 {
        self.drops.total()
    }

    pub fn dispatcher(&self) -> Option<&D> {
        self.dispatcher.as_ref()
    }

    pub fn dispatcher_mut(&mut self) -> Option<&mut D> {
        self.dispatcher.as_mut()
    }

    fn expect_state(&self, op: &'static str, expected: ServerState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ServerState::ShuttingDown.to_string(), "shutting down");
        assert_eq!(ServerState::Unconfigured.to_string(), "unconfigured");
    }
}
