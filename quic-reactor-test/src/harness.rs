//! A started server over a scripted socket and a manual reactor.

use crate::manual_reactor::ManualReactor;
use crate::recording_dispatcher::{DispatcherLog, RecordingDispatcher};
use crate::scripted_socket::ScriptedSocket;

use quic_reactor::{IpFamily, QuicServer, Result, ServerConfig};

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

pub const SERVER_ADDR: &str = "192.0.2.1:4433";
pub const PEER_ADDR: &str = "198.51.100.7:50000";

pub fn server_addr() -> SocketAddr {
    SERVER_ADDR.parse().expect("valid server address")
}

pub fn peer_addr() -> SocketAddr {
    PEER_ADDR.parse().expect("valid peer address")
}

pub struct Harness {
    pub server: QuicServer<RecordingDispatcher>,
    pub socket: Rc<ScriptedSocket>,
    pub reactor: Rc<ManualReactor>,
    pub log: Rc<RefCell<DispatcherLog>>,
}

impl Harness {
    /// Unconfigured server; the socket can still be tweaked before
    /// [`initialize`](Self::initialize).
    pub fn unconfigured(config: ServerConfig) -> Self {
        crate::util::init_tracing();
        let reactor = ManualReactor::new();
        let server = QuicServer::with_clock(config, reactor.clock());
        Self {
            server,
            socket: Rc::new(ScriptedSocket::new(server_addr())),
            reactor,
            log: DispatcherLog::shared(),
        }
    }

    pub fn initialize(&mut self) -> Result<()> {
        let log = self.log.clone();
        self.server.initialize(
            self.socket.clone(),
            IpFamily::V4,
            self.reactor.clone(),
            move |ctx| RecordingDispatcher::new(ctx, log),
        )
    }

    /// Initialized and running.
    pub fn started(config: ServerConfig) -> Self {
        let mut harness = Self::unconfigured(config);
        harness.initialize().expect("initialize");
        harness.server.start().expect("start");
        harness
    }

    pub fn dispatcher(&self) -> &RecordingDispatcher {
        self.server.dispatcher().expect("dispatcher present")
    }
}
