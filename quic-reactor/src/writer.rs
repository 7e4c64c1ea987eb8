//! Non-blocking packet writer with a write cache.
//!
//! The dispatcher owns the one [`PacketWriter`] of a socket and sends every
//! reply through it. When the socket's send buffer is full the writer keeps a
//! copy of the datagram that hit `EAGAIN`, marks itself blocked and asks the
//! reactor to start watching writability. The server flushes that cache once
//! the reactor reports the socket writable again.

use crate::error::Errno;
use crate::reactor::Reactor;
use crate::socket::DatagramSocket;

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use tracing::{debug, trace, warn};

/// Outcome of a write or flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The datagram was handed to the kernel (bytes written).
    Ok(usize),
    /// The writer is blocked and did not take the datagram.
    Blocked,
    /// The socket would block; the datagram was copied into the write cache.
    BlockedDataBuffered,
    /// The kernel rejected the datagram.
    Error(Errno),
}

impl WriteStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, WriteStatus::Blocked | WriteStatus::BlockedDataBuffered)
    }
}

struct CachedPacket {
    data: Box<[u8]>,
    local_ip: Option<IpAddr>,
    peer: SocketAddr,
}

/// The write side of the listening socket.
pub struct PacketWriter {
    socket: Rc<dyn DatagramSocket>,
    reactor: Rc<dyn Reactor>,
    cache: VecDeque<CachedPacket>,
    write_blocked: bool,
}

impl PacketWriter {
    pub(crate) fn new(socket: Rc<dyn DatagramSocket>, reactor: Rc<dyn Reactor>) -> Self {
        Self {
            socket,
            reactor,
            cache: VecDeque::new(),
            write_blocked: false,
        }
    }

    /// Send `buf` to `peer`, using `local_ip` as the source address.
    ///
    /// Returns [`WriteStatus::Blocked`] without taking the datagram while the
    /// writer is blocked or earlier cached datagrams are still unsent.
    pub fn write_packet(
        &mut self,
        buf: &[u8],
        local_ip: Option<IpAddr>,
        peer: SocketAddr,
    ) -> WriteStatus {
        if self.write_blocked {
            return WriteStatus::Blocked;
        }
        if !self.cache.is_empty() && self.flush().is_blocked() {
            self.on_write_blocked();
            return WriteStatus::Blocked;
        }

        loop {
            match self.socket.send(buf, local_ip, peer) {
                Ok(n) => {
                    trace!(len = n, %peer, "packet written");
                    return WriteStatus::Ok(n);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    self.cache.push_back(CachedPacket {
                        data: buf.into(),
                        local_ip,
                        peer,
                    });
                    self.on_write_blocked();
                    return WriteStatus::BlockedDataBuffered;
                }
                Err(e) => {
                    debug!(error = %e, %peer, "packet write failed");
                    return WriteStatus::Error(e);
                }
            }
        }
    }

    /// Try to send the cached datagrams, oldest first.
    ///
    /// Returns [`WriteStatus::Blocked`] and marks the writer blocked while the
    /// socket still refuses data, otherwise `Ok` with the number of bytes
    /// flushed. The caller decides whether writability needs watching.
    pub fn flush(&mut self) -> WriteStatus {
        let mut flushed = 0;
        while let Some(packet) = self.cache.front() {
            match self.socket.send(&packet.data, packet.local_ip, packet.peer) {
                Ok(n) => {
                    flushed += n;
                    self.cache.pop_front();
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    self.write_blocked = true;
                    return WriteStatus::Blocked;
                }
                Err(e) => {
                    warn!(error = %e, peer = %packet.peer, "dropping cached packet");
                    self.cache.pop_front();
                }
            }
        }
        WriteStatus::Ok(flushed)
    }

    /// Whether the last write hit a full send buffer.
    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    /// Clear the blocked flag. The dispatcher calls this before resuming writes.
    pub fn set_writable(&mut self) {
        self.write_blocked = false;
    }

    /// Number of datagrams waiting in the write cache.
    pub fn cached_packets(&self) -> usize {
        self.cache.len()
    }

    /// Bytes waiting in the write cache.
    pub fn cached_bytes(&self) -> usize {
        self.cache.iter().map(|p| p.data.len()).sum()
    }

    fn on_write_blocked(&mut self) {
        self.write_blocked = true;
        self.reactor.watch_writable();
    }
}
