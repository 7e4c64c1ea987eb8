//! Write path: backpressure, the write cache and `can_write` decisions.

use quic_reactor::{Errno, ServerConfig, ShutdownMode, WriteStatus};
use quic_reactor_test::harness::{Harness, peer_addr, server_addr};
use quic_reactor_test::recording_dispatcher::Event;

fn echo_payloads(h: &Harness) -> Vec<Vec<u8>> {
    h.socket.sent().into_iter().map(|s| s.payload).collect()
}

#[test]
fn test_echo_uses_destination_as_source() {
    let mut h = Harness::started(ServerConfig::default());
    h.socket.push_datagram("ping", peer_addr());

    h.server.on_readable();

    let sent = h.socket.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, b"ping");
    assert_eq!(sent[0].peer, peer_addr());
    assert_eq!(sent[0].local_ip, Some(server_addr().ip()));
    assert_eq!(h.log.borrow().write_results, vec![WriteStatus::Ok(4)]);
}

#[test]
fn test_can_write_idle() {
    let mut h = Harness::started(ServerConfig::default());

    assert!(!h.server.can_write());
    assert!(h.log.borrow().events.contains(&Event::CanWrite));
}

#[test]
fn test_can_write_with_pending_session_writes() {
    let mut h = Harness::started(ServerConfig::default());
    h.socket.set_send_budget(Some(0));
    h.socket.push_datagram("one", peer_addr());
    h.server.on_readable();
    assert_eq!(
        h.dispatcher().writer().map(|w| w.cached_packets()),
        Some(1)
    );

    h.log.borrow_mut().pending_writes_override = Some(true);
    h.socket.set_send_budget(None);
    assert!(h.server.can_write());
    // The cache is left alone while sessions still want to write.
    assert_eq!(
        h.dispatcher().writer().map(|w| w.cached_packets()),
        Some(1)
    );
}

#[test]
fn test_can_write_reports_blocked_cache() {
    let mut h = Harness::started(ServerConfig::default());
    h.socket.set_send_budget(Some(0));
    h.socket.push_datagram("one", peer_addr());
    h.server.on_readable();

    assert!(h.server.can_write());

    h.socket.set_send_budget(None);
    assert!(!h.server.can_write());
    assert_eq!(echo_payloads(&h), vec![b"one".to_vec()]);
}

#[test]
fn test_backpressure_then_resume_in_order() {
    let mut h = Harness::started(ServerConfig::default());
    h.socket.set_send_budget(Some(0));
    for payload in ["one", "two", "three"] {
        h.socket.push_datagram(payload, peer_addr());
    }

    h.server.on_readable();

    // "one" is cached, "two" is refused, "three" queues behind it.
    assert_eq!(
        h.log.borrow().write_results,
        vec![WriteStatus::BlockedDataBuffered, WriteStatus::Blocked]
    );
    assert_eq!(h.reactor.writable_watches(), 1);
    assert_eq!(h.dispatcher().unsent(), 2);
    assert!(h.socket.sent().is_empty());

    // Still full: the reactor keeps watching.
    assert!(h.server.on_writable());
    assert!(h.socket.sent().is_empty());
    assert_eq!(h.log.borrow().write_results.last(), Some(&WriteStatus::Blocked));
    assert!(
        h.dispatcher()
            .writer()
            .is_some_and(|w| w.is_write_blocked())
    );
    assert_eq!(h.reactor.writable_watches(), 2);

    h.socket.set_send_budget(None);
    assert!(!h.server.on_writable());
    assert_eq!(
        echo_payloads(&h),
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
    assert_eq!(h.dispatcher().unsent(), 0);
    assert!(
        !h.dispatcher()
            .writer()
            .is_some_and(|w| w.is_write_blocked())
    );
}

#[test]
fn test_send_error_is_not_backpressure() {
    let mut h = Harness::started(ServerConfig::default());
    h.socket.fail_sends_with(Some(Errno::EMSGSIZE));
    h.socket.push_datagram("big", peer_addr());

    h.server.on_readable();

    assert_eq!(
        h.log.borrow().write_results,
        vec![WriteStatus::Error(Errno::EMSGSIZE)]
    );
    assert_eq!(h.reactor.writable_watches(), 0);
    assert!(!h.server.can_write());
}

#[test]
fn test_writable_after_shutdown() {
    let mut h = Harness::started(ServerConfig::default());
    h.socket.set_send_budget(Some(0));
    h.socket.push_datagram("one", peer_addr());
    h.server.on_readable();

    h.server.shutdown(ShutdownMode::Silent).unwrap();

    assert!(!h.server.on_writable());
    assert!(!h.server.can_write());
    assert!(!h.server.flush_write_cache());
}

#[test]
fn test_writable_ignored_before_start() {
    let mut h = Harness::unconfigured(ServerConfig::default());
    h.initialize().unwrap();

    assert!(!h.server.on_writable());
    assert!(!h.log.borrow().events.contains(&Event::CanWrite));
}
