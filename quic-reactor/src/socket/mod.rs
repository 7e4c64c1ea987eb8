//! UDP socket boundary and capability configuration.
//!
//! The server talks to its listening socket only through [`DatagramSocket`].
//! [`SystemSocket`] is the Linux implementation; tests substitute scripted
//! sockets. OS failures surface as [`Errno`] values so the decision logic in
//! [`configure`] and the packet pump never looks at raw return codes.

mod sys;

pub use sys::SystemSocket;

use crate::error::{Errno, Error, Result};

use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use tracing::{debug, error, warn};

/// Address family of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Family of a socket address.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => IpFamily::V4,
            SocketAddr::V6(_) => IpFamily::V6,
        }
    }
}

/// Optional kernel features the socket turned out to support.
///
/// Decided once by [`configure`] and never re-queried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The kernel reports receive-queue overflow drops (`SO_RXQ_OVFL`).
    pub overflow_reporting: bool,
    /// The kernel stamps datagrams with a software receive time.
    pub rx_timestamping: bool,
}

/// Metadata for one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMeta {
    /// Payload bytes written into the receive buffer.
    pub len: usize,
    pub peer: SocketAddr,
    /// Destination address of the datagram, when the kernel reported it.
    pub local_ip: Option<IpAddr>,
    /// Kernel software receive timestamp (wall clock).
    pub timestamp: Option<SystemTime>,
    /// Cumulative count of datagrams the kernel dropped on this socket.
    pub dropped: Option<u32>,
    /// The datagram did not fit the receive buffer.
    pub truncated: bool,
}

/// A non-blocking datagram socket as seen by the server.
///
/// Every method returns promptly; `Errno::EAGAIN` signals "would block".
pub trait DatagramSocket {
    fn local_addr(&self) -> std::result::Result<SocketAddr, Errno>;

    /// Ask the kernel to report receive-queue drops.
    fn enable_overflow_reporting(&self) -> std::result::Result<(), Errno>;

    /// Ask the kernel to report each datagram's destination address.
    fn enable_address_info(&self, family: IpFamily) -> std::result::Result<(), Errno>;

    /// Ask the kernel to stamp datagrams with a software receive time.
    fn enable_rx_timestamping(&self) -> std::result::Result<(), Errno>;

    /// Receive one datagram into `buf`.
    fn recv(&self, buf: &mut [u8]) -> std::result::Result<RecvMeta, Errno>;

    /// Send one datagram to `peer`, from `local_ip` when given.
    fn send(
        &self,
        buf: &[u8],
        local_ip: Option<IpAddr>,
        peer: SocketAddr,
    ) -> std::result::Result<usize, Errno>;
}

/// Tune the kernel options the server relies on and report what is supported.
///
/// Overflow reporting and receive timestamping are best-effort: when missing
/// they are logged and the matching capability stays off. Address-info
/// retrieval is required, and its absence is returned as
/// [`Error::AddressInfoUnsupported`].
pub fn configure(socket: &dyn DatagramSocket, family: IpFamily) -> Result<Capabilities> {
    let mut caps = Capabilities::default();

    match socket.enable_overflow_reporting() {
        Ok(()) => caps.overflow_reporting = true,
        Err(e) => warn!(error = %e, "Socket overflow detection not supported"),
    }

    if let Err(e) = socket.enable_address_info(family) {
        error!(error = %e, ?family, "IP detection not supported");
        return Err(Error::AddressInfoUnsupported(e));
    }

    match socket.enable_rx_timestamping() {
        Ok(()) => caps.rx_timestamping = true,
        Err(e) => warn!(error = %e, "SO_TIMESTAMPING not supported; using fallback"),
    }

    debug!(?caps, "socket configured");
    Ok(caps)
}
