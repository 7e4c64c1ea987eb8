//! Packet pump: moves datagrams from the socket into the dispatcher.

use crate::clock::Clock;
use crate::dispatcher::{Dispatcher, ReceivedPacket};
use crate::error::Errno;
use crate::socket::DatagramSocket;

use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Instant, SystemTime};

use tracing::{debug, trace, warn};

/// Largest datagram the pump accepts. Anything bigger is truncated by the
/// kernel and dropped.
pub const MAX_INCOMING_PACKET_SIZE: usize = 1500;

/// Running total of kernel-reported drops.
///
/// The kernel reports a cumulative `u32` that wraps. Each reading is taken as
/// the serial-number distance from the last one, so the total keeps growing
/// across wraps. A reading behind the last one (by less than half the range)
/// is stale and ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounter {
    last: Option<u32>,
    total: u64,
}

impl DropCounter {
    /// Fold in one kernel reading. Returns the drops it added.
    pub fn observe(&mut self, reading: u32) -> u32 {
        let delta = match self.last {
            Some(last) => reading.wrapping_sub(last),
            None => reading,
        };
        if self.last.is_some() && (delta == 0 || delta > u32::MAX / 2) {
            return 0;
        }
        self.last = Some(reading);
        self.total += u64::from(delta);
        delta
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Reads datagrams one at a time and forwards them to the dispatcher.
///
/// Readiness is edge-triggered: the caller must keep calling
/// [`read_and_dispatch`](Self::read_and_dispatch) until it returns `false`,
/// or no further read notification arrives until new traffic shows up.
pub struct PacketReader {
    buf: Box<[u8]>,
    clock: Rc<dyn Clock>,
}

impl PacketReader {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            buf: vec![0u8; MAX_INCOMING_PACKET_SIZE].into_boxed_slice(),
            clock,
        }
    }

    /// Read at most one datagram and hand it to `dispatcher`.
    ///
    /// `local` is the socket's bound address, used when the kernel does not
    /// report a datagram's destination. `drops` is advanced from the kernel's
    /// cumulative drop count when given.
    ///
    /// Returns whether another read is likely to succeed right away.
    pub fn read_and_dispatch<D: Dispatcher>(
        &mut self,
        socket: &dyn DatagramSocket,
        local: SocketAddr,
        dispatcher: &mut D,
        drops: Option<&mut DropCounter>,
    ) -> bool {
        let meta = match socket.recv(&mut self.buf) {
            Ok(meta) => meta,
            Err(Errno::EAGAIN) => return false,
            Err(Errno::EINTR) => return true,
            Err(e) => {
                warn!(error = %e, "failed to read packet");
                return false;
            }
        };

        if let (Some(drops), Some(reading)) = (drops, meta.dropped) {
            let added = drops.observe(reading);
            if added > 0 {
                debug!(added, total = drops.total(), "kernel reported packet drops");
            }
        }

        if meta.truncated {
            debug!(peer = %meta.peer, "dropping truncated datagram");
            return true;
        }

        let local_ip: IpAddr = meta.local_ip.unwrap_or(local.ip());
        let packet = ReceivedPacket {
            payload: &self.buf[..meta.len],
            receipt_time: receipt_time(self.clock.now(), self.clock.wall_now(), meta.timestamp),
            wall_time: meta.timestamp,
        };
        trace!(len = meta.len, peer = %meta.peer, "dispatching packet");
        dispatcher.process_packet(SocketAddr::new(local_ip, local.port()), meta.peer, &packet);
        true
    }
}

/// Shift `now` back by the age of the kernel timestamp, if there is one.
/// `wall_now` is the wall-clock reading taken with `now`.
fn receipt_time(now: Instant, wall_now: SystemTime, stamped: Option<SystemTime>) -> Instant {
    let Some(stamped) = stamped else {
        return now;
    };
    let age = wall_now.duration_since(stamped).unwrap_or_default();
    now.checked_sub(age).unwrap_or(now)
}
