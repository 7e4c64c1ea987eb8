//! In-memory [`DatagramSocket`] with scripted receive results, a send budget
//! and switchable kernel options.

use quic_reactor::{DatagramSocket, Errno, IpFamily, RecvMeta};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

/// One scripted datagram.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub payload: Vec<u8>,
    pub peer: SocketAddr,
    pub local_ip: Option<IpAddr>,
    pub timestamp: Option<SystemTime>,
    pub dropped: Option<u32>,
}

impl Inbound {
    pub fn new(payload: impl Into<Vec<u8>>, peer: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            peer,
            local_ip: None,
            timestamp: None,
            dropped: None,
        }
    }

    pub fn local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = Some(ip);
        self
    }

    pub fn timestamp(mut self, ts: SystemTime) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Cumulative kernel drop count carried by this datagram.
    pub fn dropped(mut self, count: u32) -> Self {
        self.dropped = Some(count);
        self
    }
}

/// A datagram handed to [`DatagramSocket::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub payload: Vec<u8>,
    pub local_ip: Option<IpAddr>,
    pub peer: SocketAddr,
}

/// Scripted socket. Receives come from a queue, an empty queue reads as
/// `EAGAIN`.
pub struct ScriptedSocket {
    local: SocketAddr,
    inbox: RefCell<VecDeque<Result<Inbound, Errno>>>,
    sent: RefCell<Vec<Sent>>,
    /// Sends left before `EAGAIN`, `None` for unlimited.
    send_budget: Cell<Option<usize>>,
    send_error: Cell<Option<Errno>>,
    overflow_error: Cell<Option<Errno>>,
    address_info_error: Cell<Option<Errno>>,
    timestamping_error: Cell<Option<Errno>>,
    recv_calls: Cell<usize>,
}

impl ScriptedSocket {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            inbox: RefCell::new(VecDeque::new()),
            sent: RefCell::new(Vec::new()),
            send_budget: Cell::new(None),
            send_error: Cell::new(None),
            overflow_error: Cell::new(None),
            address_info_error: Cell::new(None),
            timestamping_error: Cell::new(None),
            recv_calls: Cell::new(0),
        }
    }

    pub fn push(&self, inbound: Inbound) {
        self.inbox.borrow_mut().push_back(Ok(inbound));
    }

    pub fn push_datagram(&self, payload: impl Into<Vec<u8>>, peer: SocketAddr) {
        self.push(Inbound::new(payload, peer));
    }

    /// Make a later `recv` fail with `err`.
    pub fn push_error(&self, err: Errno) {
        self.inbox.borrow_mut().push_back(Err(err));
    }

    /// Datagrams and errors not yet read.
    pub fn pending(&self) -> usize {
        self.inbox.borrow().len()
    }

    pub fn recv_calls(&self) -> usize {
        self.recv_calls.get()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.borrow().clone()
    }

    pub fn set_send_budget(&self, budget: Option<usize>) {
        self.send_budget.set(budget);
    }

    pub fn fail_sends_with(&self, err: Option<Errno>) {
        self.send_error.set(err);
    }

    pub fn fail_overflow_reporting(&self, err: Errno) {
        self.overflow_error.set(Some(err));
    }

    pub fn fail_address_info(&self, err: Errno) {
        self.address_info_error.set(Some(err));
    }

    pub fn fail_rx_timestamping(&self, err: Errno) {
        self.timestamping_error.set(Some(err));
    }
}

fn option_result(err: Option<Errno>) -> Result<(), Errno> {
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl DatagramSocket for ScriptedSocket {
    fn local_addr(&self) -> Result<SocketAddr, Errno> {
        Ok(self.local)
    }

    fn enable_overflow_reporting(&self) -> Result<(), Errno> {
        option_result(self.overflow_error.get())
    }

    fn enable_address_info(&self, _family: IpFamily) -> Result<(), Errno> {
        option_result(self.address_info_error.get())
    }

    fn enable_rx_timestamping(&self) -> Result<(), Errno> {
        option_result(self.timestamping_error.get())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<RecvMeta, Errno> {
        self.recv_calls.set(self.recv_calls.get() + 1);
        let inbound = self.inbox.borrow_mut().pop_front().ok_or(Errno::EAGAIN)??;

        let len = inbound.payload.len().min(buf.len());
        buf[..len].copy_from_slice(&inbound.payload[..len]);
        Ok(RecvMeta {
            len,
            peer: inbound.peer,
            local_ip: inbound.local_ip,
            timestamp: inbound.timestamp,
            dropped: inbound.dropped,
            truncated: inbound.payload.len() > buf.len(),
        })
    }

    fn send(&self, buf: &[u8], local_ip: Option<IpAddr>, peer: SocketAddr) -> Result<usize, Errno> {
        if let Some(e) = self.send_error.get() {
            return Err(e);
        }
        match self.send_budget.get() {
            Some(0) => return Err(Errno::EAGAIN),
            Some(n) => self.send_budget.set(Some(n - 1)),
            None => {}
        }
        self.sent.borrow_mut().push(Sent {
            payload: buf.to_vec(),
            local_ip,
            peer,
        });
        Ok(buf.len())
    }
}
