//! Linux UDP socket with per-datagram control messages.

use super::{DatagramSocket, IpFamily, RecvMeta};
use crate::error::{Errno, Error, Result};

use nix::libc;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, SockaddrStorage, TimestampingFlag,
    recvmsg, sendmsg, setsockopt, sockopt,
};
use nix::sys::time::TimeSpec;
use socket2::{Domain, Protocol, Socket, Type};

use std::cell::RefCell;
use std::io::{IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, SystemTime};

/// Room for a packet-info, an overflow counter and a timestamping message.
const CMSG_BUFFER_SIZE: usize = 256;

/// A non-blocking UDP socket that reports destination addresses, drop counts
/// and receive timestamps through control messages.
pub struct SystemSocket {
    socket: UdpSocket,
    /// Reused across `recvmsg` calls.
    cmsg_buf: RefCell<Vec<u8>>,
}

impl SystemSocket {
    /// Create a non-blocking socket bound to `addr`.
    ///
    /// IPv6 sockets accept IPv4 traffic as well.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(io_error)?;
        if addr.is_ipv6() {
            socket.set_only_v6(false).map_err(io_error)?;
        }
        socket.set_reuse_address(true).map_err(io_error)?;
        socket.set_nonblocking(true).map_err(io_error)?;
        socket.bind(&addr.into()).map_err(io_error)?;
        Ok(Self::new(socket.into()))
    }

    /// Wrap a socket the host already bound. It is switched to non-blocking.
    pub fn from_std(socket: UdpSocket) -> Result<Self> {
        socket.set_nonblocking(true).map_err(io_error)?;
        Ok(Self::new(socket))
    }

    fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            cmsg_buf: RefCell::new(vec![0u8; CMSG_BUFFER_SIZE]),
        }
    }

    pub fn as_std(&self) -> &UdpSocket {
        &self.socket
    }
}

impl AsRawFd for SystemSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl AsFd for SystemSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl DatagramSocket for SystemSocket {
    fn local_addr(&self) -> std::result::Result<SocketAddr, Errno> {
        self.socket.local_addr().map_err(errno_of)
    }

    fn enable_overflow_reporting(&self) -> std::result::Result<(), Errno> {
        setsockopt(&self.socket, sockopt::RxqOvfl, &1)
    }

    fn enable_address_info(&self, family: IpFamily) -> std::result::Result<(), Errno> {
        match family {
            IpFamily::V4 => setsockopt(&self.socket, sockopt::Ipv4PacketInfo, &true),
            IpFamily::V6 => {
                // Dual-stack sockets also see IPv4 datagrams; this one is optional.
                let _ = setsockopt(&self.socket, sockopt::Ipv4PacketInfo, &true);
                setsockopt(&self.socket, sockopt::Ipv6RecvPacketInfo, &true)
            }
        }
    }

    fn enable_rx_timestamping(&self) -> std::result::Result<(), Errno> {
        let flags =
            TimestampingFlag::SOF_TIMESTAMPING_RX_SOFTWARE | TimestampingFlag::SOF_TIMESTAMPING_SOFTWARE;
        setsockopt(&self.socket, sockopt::Timestamping, &flags)
    }

    fn recv(&self, buf: &mut [u8]) -> std::result::Result<RecvMeta, Errno> {
        let mut cmsg_buf = self.cmsg_buf.borrow_mut();
        let mut iov = [IoSliceMut::new(buf)];
        let msg = recvmsg::<SockaddrStorage>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut *cmsg_buf),
            MsgFlags::empty(),
        )?;

        let peer = msg
            .address
            .as_ref()
            .and_then(socket_addr_of)
            .ok_or(Errno::EAFNOSUPPORT)?;

        let mut meta = RecvMeta {
            len: msg.bytes,
            peer,
            local_ip: None,
            timestamp: None,
            dropped: None,
            truncated: msg.flags.contains(MsgFlags::MSG_TRUNC),
        };

        for cmsg in msg.cmsgs()? {
            match cmsg {
                ControlMessageOwned::Ipv4PacketInfo(info) => {
                    let ip = Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr));
                    meta.local_ip = Some(IpAddr::V4(ip));
                }
                ControlMessageOwned::Ipv6PacketInfo(info) => {
                    meta.local_ip = Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)));
                }
                ControlMessageOwned::ScmTimestampsns(ts) => {
                    meta.timestamp = wall_time_of(&ts.system);
                }
                ControlMessageOwned::RxqOvfl(dropped) => meta.dropped = Some(dropped),
                _ => {}
            }
        }

        Ok(meta)
    }

    fn send(
        &self,
        buf: &[u8],
        local_ip: Option<IpAddr>,
        peer: SocketAddr,
    ) -> std::result::Result<usize, Errno> {
        let fd = self.socket.as_raw_fd();
        let iov = [IoSlice::new(buf)];
        let dest = SockaddrStorage::from(peer);

        match source_for(local_ip, peer) {
            Some(IpAddr::V4(ip)) => {
                let info = libc::in_pktinfo {
                    ipi_ifindex: 0,
                    ipi_spec_dst: libc::in_addr {
                        s_addr: u32::from(ip).to_be(),
                    },
                    ipi_addr: libc::in_addr { s_addr: 0 },
                };
                let cmsgs = [ControlMessage::Ipv4PacketInfo(&info)];
                sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&dest))
            }
            Some(IpAddr::V6(ip)) => {
                let info = libc::in6_pktinfo {
                    ipi6_addr: libc::in6_addr {
                        s6_addr: ip.octets(),
                    },
                    ipi6_ifindex: 0,
                };
                let cmsgs = [ControlMessage::Ipv6PacketInfo(&info)];
                sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&dest))
            }
            None => sendmsg(fd, &iov, &[], MsgFlags::empty(), Some(&dest)),
        }
    }
}

/// Source address to pin on a reply to `peer`, in the peer's family.
///
/// Dual-stack sockets report IPv4 destinations next to IPv4-mapped peers, so
/// an IPv4 source is mapped for an IPv6 peer.
fn source_for(local_ip: Option<IpAddr>, peer: SocketAddr) -> Option<IpAddr> {
    let ip = local_ip.filter(|ip| !ip.is_unspecified())?;
    match (ip, peer) {
        (IpAddr::V4(_), SocketAddr::V4(_)) | (IpAddr::V6(_), SocketAddr::V6(_)) => Some(ip),
        (IpAddr::V4(v4), SocketAddr::V6(_)) => Some(IpAddr::V6(v4.to_ipv6_mapped())),
        (IpAddr::V6(v6), SocketAddr::V4(_)) => v6.to_ipv4_mapped().map(IpAddr::V4),
    }
}

fn socket_addr_of(addr: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::from(*v4)));
    }
    addr.as_sockaddr_in6()
        .map(|v6| SocketAddr::V6(SocketAddrV6::from(*v6)))
}

/// Kernel timestamps of zero mean "not stamped".
fn wall_time_of(ts: &TimeSpec) -> Option<SystemTime> {
    let secs = u64::try_from(ts.tv_sec()).ok()?;
    let nanos = u32::try_from(ts.tv_nsec()).ok()?;
    if secs == 0 && nanos == 0 {
        return None;
    }
    SystemTime::UNIX_EPOCH.checked_add(Duration::new(secs, nanos))
}

fn errno_of(e: std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

fn io_error(e: std::io::Error) -> Error {
    Error::Io(errno_of(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> (SystemSocket, UdpSocket) {
        let server = SystemSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        (server, client)
    }

    #[test]
    fn test_recv_would_block_when_empty() {
        let (server, _client) = loopback();
        let mut buf = [0u8; 64];
        assert_eq!(server.recv(&mut buf), Err(Errno::EAGAIN));
    }

    #[test]
    fn test_recv_reports_local_address() {
        let (server, client) = loopback();
        server.enable_address_info(IpFamily::V4).unwrap();
        let server_addr = server.local_addr().unwrap();

        client.send_to(b"ping", server_addr).unwrap();

        let mut buf = [0u8; 64];
        let meta = loop {
            match server.recv(&mut buf) {
                Err(Errno::EAGAIN) => std::thread::yield_now(),
                other => break other.unwrap(),
            }
        };
        assert_eq!(&buf[..meta.len], b"ping");
        assert_eq!(meta.peer, client.local_addr().unwrap());
        assert_eq!(meta.local_ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!meta.truncated);
    }

    #[test]
    fn test_send_with_source_address() {
        let (server, client) = loopback();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let peer = client.local_addr().unwrap();

        let sent = server
            .send(b"pong", Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), peer)
            .unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 64];
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, server.local_addr().unwrap());
    }

    #[test]
    fn test_source_follows_peer_family() {
        let v4_peer: SocketAddr = "198.51.100.7:5000".parse().unwrap();
        let mapped_peer: SocketAddr = "[::ffff:198.51.100.7]:5000".parse().unwrap();
        let v6_peer: SocketAddr = "[2001:db8::7]:5000".parse().unwrap();
        let local_v4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let local_v6: IpAddr = "2001:db8::1".parse().unwrap();

        assert_eq!(source_for(Some(local_v4), v4_peer), Some(local_v4));
        assert_eq!(
            source_for(Some(local_v4), mapped_peer),
            Some("::ffff:192.0.2.1".parse().unwrap())
        );
        assert_eq!(source_for(Some(local_v6), v6_peer), Some(local_v6));
        assert_eq!(
            source_for(Some("::ffff:192.0.2.1".parse().unwrap()), v4_peer),
            Some(local_v4)
        );
        assert_eq!(source_for(Some(local_v6), v4_peer), None);
        assert_eq!(source_for(Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), mapped_peer), None);
        assert_eq!(source_for(None, v6_peer), None);
    }

    #[test]
    fn test_wall_time_of_zero() {
        assert_eq!(wall_time_of(&TimeSpec::new(0, 0)), None);
        assert!(wall_time_of(&TimeSpec::new(1_700_000_000, 5)).is_some());
    }
}
