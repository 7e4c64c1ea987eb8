//! Protocol engine boundary.
//!
//! The engine (connection, handshake and stream state machines) lives outside
//! this crate. The server drives it through the [`Dispatcher`] trait and builds
//! it with a [`DispatcherFactory`] at initialization.

use crate::alarm::AlarmFactory;
use crate::config::EngineConfig;
use crate::writer::PacketWriter;

use std::net::SocketAddr;
use std::time::{Instant, SystemTime};

/// A datagram read from the socket, as handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedPacket<'a> {
    pub payload: &'a [u8],
    /// Monotonic receive time, corrected by the kernel timestamp when present.
    pub receipt_time: Instant,
    /// Kernel software receive timestamp, when the socket supports it.
    pub wall_time: Option<SystemTime>,
}

/// Everything the engine needs to build its dispatcher.
pub struct DispatcherContext {
    pub config: EngineConfig,
    /// Source of engine alarms, backed by the host reactor's timers.
    pub alarm_factory: AlarmFactory,
}

/// The engine's packet dispatcher.
pub trait Dispatcher {
    /// Take ownership of the socket's writer. Called once, right after creation.
    fn initialize_with_writer(&mut self, writer: PacketWriter);

    /// The writer handed over in [`initialize_with_writer`](Self::initialize_with_writer),
    /// `None` once the dispatcher released it.
    fn writer_mut(&mut self) -> Option<&mut PacketWriter>;

    /// Packet intake: one datagram received on `local` from `peer`.
    fn process_packet(&mut self, local: SocketAddr, peer: SocketAddr, packet: &ReceivedPacket<'_>);

    /// Admit at most `max_connections` buffered handshake attempts.
    fn process_buffered_handshakes(&mut self, max_connections: usize);

    /// Whether handshake attempts are still waiting for admission.
    fn has_buffered_handshakes(&self) -> bool;

    /// The socket is writable again.
    ///
    /// Implementations call [`PacketWriter::set_writable`] before resuming
    /// blocked sessions.
    fn on_can_write(&mut self);

    /// Whether any session still has data waiting for a writable socket.
    fn has_pending_writes(&self) -> bool;

    /// Close every session. With `notify_peers`, peers are told first.
    fn shutdown(&mut self, notify_peers: bool);
}

/// Builds the engine dispatcher during server initialization.
///
/// Implemented for any `FnOnce(DispatcherContext) -> D`.
pub trait DispatcherFactory {
    type Dispatcher: Dispatcher;

    fn create(self, ctx: DispatcherContext) -> Self::Dispatcher;
}

impl<F, D> DispatcherFactory for F
where
    F: FnOnce(DispatcherContext) -> D,
    D: Dispatcher,
{
    type Dispatcher = D;

    fn create(self, ctx: DispatcherContext) -> D {
        self(ctx)
    }
}
