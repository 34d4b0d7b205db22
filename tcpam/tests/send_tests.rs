//! Short and buffered-copy send paths against a scripted socket.

mod common;

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tcpam::{ConnState, Endpoint, EpId, Events, IfaceConfig, TcpAmError};

use common::{connected_ep, frame, harness, harness_with, peer, short_frame};

#[test]
fn short_sends_buffer_remainder_and_flush_in_order() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));
    sock.set_write_limit(Some(4000));

    let small = vec![0x11u8; 10];
    let large = vec![0x22u8; 4000];
    let tail = vec![0x33u8; 50];
    {
        let mut ep = h.iface.ep(id).unwrap();
        ep.am_short(1, 0xa, &small).unwrap();
        ep.am_short(1, 0xb, &large).unwrap();

        let err = ep.am_short(1, 0xc, &tail).unwrap_err();
        assert!(err.is_no_resource());
        let retry = tail.clone();
        ep.pending_add(Box::new(move |ep: &mut dyn Endpoint| {
            ep.am_short(1, 0xc, &retry)
        }))
        .unwrap();
    }

    assert!(h.events.interest(sock.fd()).contains(Events::WRITE));
    assert_eq!(sock.written().len(), short_frame(1, 0xa, &small).len() + 4000);
    // the 4013-byte frame left 13 bytes behind
    assert_eq!(h.iface.outstanding(), 13);
    assert_eq!(h.iface.ep_ref(id).unwrap().pending_len(), 1);

    assert_eq!(h.iface.dispatch(id, Events::WRITE), 2);

    let mut expected = short_frame(1, 0xa, &small);
    expected.extend(short_frame(1, 0xb, &large));
    expected.extend(short_frame(1, 0xc, &tail));
    assert_eq!(sock.written(), expected);
    assert_eq!(h.iface.outstanding(), 0);
    assert_eq!(h.iface.ep_ref(id).unwrap().pending_len(), 0);
    assert!(!h.events.interest(sock.fd()).contains(Events::WRITE));
    assert!(h.events.interest(sock.fd()).contains(Events::READ));
    assert_eq!(h.iface.resources().tx_buffers_in_use(), 0);
}

#[test]
fn short_copy_path_partial_write() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));
    sock.push_write_budget(7);
    sock.push_write_budget(0);

    h.iface.ep(id).unwrap().am_short(3, 42, b"hello").unwrap();
    let expected = short_frame(3, 42, b"hello");
    assert_eq!(sock.written(), &expected[..7]);
    assert_eq!(h.iface.outstanding(), expected.len() - 7);
    assert!(h.iface.ep_ref(id).unwrap().tx_in_progress());

    h.iface.dispatch(id, Events::WRITE);
    assert_eq!(sock.written(), expected);
    assert_eq!(h.iface.outstanding(), 0);
    assert!(h.iface.ep(id).unwrap().flush().is_ok());
}

#[test]
fn short_sendv_path_header_partially_written() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));
    sock.push_write_budget(3);

    let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    h.iface.ep(id).unwrap().am_short(2, u64::MAX - 1, &payload).unwrap();
    assert_eq!(sock.written().len(), 3);

    h.iface.dispatch(id, Events::WRITE);
    assert_eq!(sock.written(), short_frame(2, u64::MAX - 1, &payload));
}

#[test]
fn write_progress_drains_until_would_block() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));
    sock.set_blocked(true);

    let payload = vec![0x44u8; 1000];
    h.iface.ep(id).unwrap().am_short(5, 0, &payload).unwrap();
    let expected = short_frame(5, 0, &payload);

    sock.set_blocked(false);
    for _ in 0..3 {
        sock.push_write_budget(100);
    }
    sock.push_write_budget(0);
    assert_eq!(h.iface.dispatch(id, Events::WRITE), 1);
    assert_eq!(sock.written(), &expected[..300]);
    assert_eq!(h.iface.outstanding(), expected.len() - 300);
    assert!(h.events.interest(sock.fd()).contains(Events::WRITE));

    sock.set_write_limit(Some(64));
    h.iface.dispatch(id, Events::WRITE);
    assert_eq!(sock.written(), expected);
    assert_eq!(h.iface.outstanding(), 0);
    assert!(!h.events.interest(sock.fd()).contains(Events::WRITE));
}

#[test]
fn short_rejects_oversized_and_bad_id() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));
    let limits = h.iface.resources().limits();

    let mut ep = h.iface.ep(id).unwrap();
    let too_big = vec![0u8; limits.short_max];
    assert!(matches!(
        ep.am_short(0, 0, &too_big),
        Err(TcpAmError::PayloadTooLarge { .. })
    ));
    assert!(matches!(ep.am_short(32, 0, b"x"), Err(TcpAmError::InvalidAmId(32))));
    assert!(sock.written().is_empty());
}

#[test]
fn bcopy_packs_into_transmit_buffer() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));

    let packed = h
        .iface
        .ep(id)
        .unwrap()
        .am_bcopy(7, &mut |buf: &mut [u8]| {
            buf[..4].copy_from_slice(b"abcd");
            4
        })
        .unwrap();
    assert_eq!(packed, 4);
    assert_eq!(sock.written(), frame(7, b"abcd"));
}

#[test]
fn bcopy_overflow_releases_buffer() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));
    let max = h.iface.resources().limits().bcopy_max;

    let err = h
        .iface
        .ep(id)
        .unwrap()
        .am_bcopy(7, &mut |_buf: &mut [u8]| max + 1)
        .unwrap_err();
    assert!(matches!(err, TcpAmError::PayloadTooLarge { .. }));
    assert_eq!(h.iface.resources().tx_buffers_in_use(), 0);
    assert!(sock.written().is_empty());

    // endpoint still usable
    h.iface
        .ep(id)
        .unwrap()
        .am_bcopy(7, &mut |_buf: &mut [u8]| 0)
        .unwrap();
    assert_eq!(sock.written(), frame(7, b""));
}

#[test]
fn admission_follows_connection_state() {
    let mut h = harness();
    let id = h.iface.ep_create(peer(6000)).unwrap();
    let sock = h.connector.last().unwrap();

    // still connecting
    let err = h.iface.ep(id).unwrap().am_short(0, 0, b"x").unwrap_err();
    assert!(err.is_no_resource());
    assert!(h.events.interest(sock.fd()).contains(Events::WRITE));

    h.iface.set_conn_state(id, ConnState::Closed).unwrap();
    let err = h.iface.ep(id).unwrap().am_short(0, 0, b"x").unwrap_err();
    assert!(matches!(err, TcpAmError::Unreachable));
    assert!(sock.written().is_empty());
    assert_eq!(h.events.registered(), 0);
}

#[test]
fn blocked_socket_keeps_frame_buffered() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));
    sock.set_blocked(true);

    h.iface.ep(id).unwrap().am_short(0, 1, b"queued").unwrap();
    let len = short_frame(0, 1, b"queued").len();
    assert_eq!(h.iface.outstanding(), len);
    assert!(h.iface.ep(id).unwrap().flush().unwrap_err().is_no_resource());
    assert!(h.events.interest(sock.fd()).contains(Events::WRITE));

    // spurious writable event
    assert_eq!(h.iface.dispatch(id, Events::WRITE), 0);
    assert_eq!(h.iface.outstanding(), len);

    sock.set_blocked(false);
    h.iface.dispatch(id, Events::WRITE);
    assert_eq!(sock.written(), short_frame(0, 1, b"queued"));
    assert!(h.iface.ep(id).unwrap().flush().is_ok());
}

#[test]
fn hard_write_error_fails_endpoint_on_progress() {
    let mut h = harness();
    let (id, sock) = connected_ep(&mut h, peer(6000));
    let failed: Arc<Mutex<Vec<EpId>>> = Arc::default();
    let sink = Arc::clone(&failed);
    h.iface.set_err_handler(move |ep, err| {
        assert!(matches!(err, TcpAmError::Unreachable));
        sink.lock().push(ep);
    });

    sock.fail_writes(io::ErrorKind::BrokenPipe);
    let err = h.iface.ep(id).unwrap().am_short(0, 0, b"lost").unwrap_err();
    assert!(matches!(err, TcpAmError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    assert_eq!(h.iface.outstanding(), 0);
    assert_eq!(h.iface.resources().tx_buffers_in_use(), 0);

    // nothing happens inline
    assert!(failed.lock().is_empty());
    assert_eq!(h.iface.ep_ref(id).unwrap().conn_state(), ConnState::Connected);

    assert_eq!(h.iface.progress(), 1);
    assert_eq!(*failed.lock(), vec![id]);
    let ep = h.iface.ep_ref(id).unwrap();
    assert!(ep.is_failed());
    assert_eq!(ep.conn_state(), ConnState::Closed);
    assert!(!ep.has_socket());
    assert_eq!(h.events.interest(sock.fd()), Events::NONE);

    // a second report of the same failure is ignored
    h.iface.set_failed(id);
    assert_eq!(h.iface.progress(), 0);
}

#[test]
fn transmit_pool_exhaustion_is_no_resource() {
    let config = IfaceConfig {
        tx_pool_size: 1,
        ..Default::default()
    };
    let mut h = harness_with(config);
    let (a, sock_a) = connected_ep(&mut h, peer(6000));
    let (b, sock_b) = connected_ep(&mut h, peer(6001));
    sock_a.set_blocked(true);

    h.iface.ep(a).unwrap().am_short(0, 0, b"a").unwrap();
    let err = h.iface.ep(b).unwrap().am_short(0, 0, b"b").unwrap_err();
    assert!(err.is_no_resource());
    assert!(h.events.interest(sock_b.fd()).contains(Events::WRITE));

    sock_a.set_blocked(false);
    h.iface.dispatch(a, Events::WRITE);
    h.iface.ep(b).unwrap().am_short(0, 0, b"b").unwrap();
    assert_eq!(sock_b.written(), short_frame(0, 0, b"b"));
}
