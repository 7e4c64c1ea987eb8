//! Stand-in engine that records every call the server makes.
//!
//! Datagrams starting with [`HANDSHAKE_PREFIX`] are queued as handshake
//! attempts; anything else is echoed back through the writer. Echoes the
//! writer refuses are held back as pending writes and retried on
//! `on_can_write`, the way a write-blocked session would be.

use quic_reactor::{
    AlarmFactory, Dispatcher, DispatcherContext, EngineConfig, PacketWriter, ReceivedPacket,
    WriteStatus,
};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

/// Payload prefix that marks a handshake attempt.
pub const HANDSHAKE_PREFIX: &[u8] = b"CHLO";

/// A call the server made into the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Packet {
        local: SocketAddr,
        peer: SocketAddr,
        payload: Vec<u8>,
    },
    ProcessHandshakes {
        max: usize,
        admitted: usize,
    },
    CanWrite,
    Shutdown {
        notify_peers: bool,
    },
}

/// Everything the dispatcher saw. Shared with the test so it survives the
/// dispatcher being dropped at shutdown.
#[derive(Debug, Default)]
pub struct DispatcherLog {
    pub engine_config: Option<EngineConfig>,
    pub events: Vec<Event>,
    pub receipt_times: Vec<Instant>,
    pub write_results: Vec<WriteStatus>,
    pub handshake_backlog: usize,
    pub connections: usize,
    /// Overrides `has_pending_writes` when set.
    pub pending_writes_override: Option<bool>,
    /// Echo non-handshake datagrams.
    pub echo: bool,
}

impl DispatcherLog {
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            echo: true,
            ..Default::default()
        }))
    }

    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Packet { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// `max` argument of every `process_buffered_handshakes` call.
    pub fn handshake_calls(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::ProcessHandshakes { max, .. } => Some(*max),
                _ => None,
            })
            .collect()
    }
}

struct Unsent {
    payload: Vec<u8>,
    local: SocketAddr,
    peer: SocketAddr,
}

pub struct RecordingDispatcher {
    log: Rc<RefCell<DispatcherLog>>,
    alarm_factory: AlarmFactory,
    writer: Option<PacketWriter>,
    unsent: VecDeque<Unsent>,
}

impl RecordingDispatcher {
    pub fn new(ctx: DispatcherContext, log: Rc<RefCell<DispatcherLog>>) -> Self {
        log.borrow_mut().engine_config = Some(ctx.config);
        Self {
            log,
            alarm_factory: ctx.alarm_factory,
            writer: None,
            unsent: VecDeque::new(),
        }
    }

    /// The factory handed over at creation, for engine-style alarms.
    pub fn alarm_factory(&self) -> &AlarmFactory {
        &self.alarm_factory
    }

    pub fn writer(&self) -> Option<&PacketWriter> {
        self.writer.as_ref()
    }

    /// Echoes waiting for the writer to accept them.
    pub fn unsent(&self) -> usize {
        self.unsent.len()
    }

    /// Hand one echo to the writer. Returns `false` if the writer refused it.
    fn try_echo(&mut self, item: &Unsent) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            return true;
        };
        let status = writer.write_packet(&item.payload, Some(item.local.ip()), item.peer);
        self.log.borrow_mut().write_results.push(status);
        status != WriteStatus::Blocked
    }
}

impl Dispatcher for RecordingDispatcher {
    fn initialize_with_writer(&mut self, writer: PacketWriter) {
        self.writer = Some(writer);
    }

    fn writer_mut(&mut self) -> Option<&mut PacketWriter> {
        self.writer.as_mut()
    }

    fn process_packet(&mut self, local: SocketAddr, peer: SocketAddr, packet: &ReceivedPacket<'_>) {
        let echo = {
            let mut log = self.log.borrow_mut();
            log.events.push(Event::Packet {
                local,
                peer,
                payload: packet.payload.to_vec(),
            });
            log.receipt_times.push(packet.receipt_time);
            if packet.payload.starts_with(HANDSHAKE_PREFIX) {
                log.handshake_backlog += 1;
                false
            } else {
                log.echo
            }
        };

        if echo {
            let item = Unsent {
                payload: packet.payload.to_vec(),
                local,
                peer,
            };
            // Keep ordering behind earlier refused echoes.
            if !self.unsent.is_empty() || !self.try_echo(&item) {
                self.unsent.push_back(item);
            }
        }
    }

    fn process_buffered_handshakes(&mut self, max_connections: usize) {
        let mut log = self.log.borrow_mut();
        let admitted = log.handshake_backlog.min(max_connections);
        log.handshake_backlog -= admitted;
        log.connections += admitted;
        log.events.push(Event::ProcessHandshakes {
            max: max_connections,
            admitted,
        });
    }

    fn has_buffered_handshakes(&self) -> bool {
        self.log.borrow().handshake_backlog > 0
    }

    fn on_can_write(&mut self) {
        self.log.borrow_mut().events.push(Event::CanWrite);
        if let Some(writer) = self.writer.as_mut() {
            writer.set_writable();
        }
        while let Some(item) = self.unsent.pop_front() {
            if !self.try_echo(&item) {
                self.unsent.push_front(item);
                break;
            }
        }
    }

    fn has_pending_writes(&self) -> bool {
        match self.log.borrow().pending_writes_override {
            Some(pending) => pending,
            None => !self.unsent.is_empty(),
        }
    }

    fn shutdown(&mut self, notify_peers: bool) {
        self.log
            .borrow_mut()
            .events
            .push(Event::Shutdown { notify_peers });
        self.unsent.clear();
    }
}
