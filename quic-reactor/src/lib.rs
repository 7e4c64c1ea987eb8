//! QUIC server bridge for a host event reactor.
//!
//! Connects an external QUIC protocol engine to a single-threaded,
//! edge-triggered event loop that owns the UDP socket, readiness
//! notification and timers:
//!
//! - [`QuicServer`] reacts to readable/writable events, drains the socket and
//!   admits buffered handshakes in bounded batches.
//! - [`PacketWriter`] sends replies and caches the datagram that hit a full
//!   send buffer until the socket is writable again.
//! - [`AlarmFactory`] maps engine alarms onto reactor timers.
//!
//! The engine plugs in through [`Dispatcher`]; the event loop through
//! [`Reactor`].

pub mod alarm;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod reactor;
pub mod server;
pub mod socket;
pub mod writer;

pub use alarm::{Alarm, AlarmDelegate, AlarmFactory};
pub use clock::{Clock, SystemClock};
pub use config::{EngineConfig, ServerConfig, ServerConfigBuilder};
pub use dispatcher::{Dispatcher, DispatcherContext, DispatcherFactory, ReceivedPacket};
pub use error::{Errno, Error, Result};
pub use reactor::{Reactor, TimerCallback, TimerToken};
pub use server::{QuicServer, ServerState, ShutdownMode};
pub use socket::{Capabilities, DatagramSocket, IpFamily, RecvMeta, SystemSocket};
pub use writer::{PacketWriter, WriteStatus};
