//! End-to-end tunnel scenarios over loopback.

use std::net::UdpSocket;
use std::time::Duration;

use braid_crypto::{AeadKey, Suite};
use braid_integration_tests::{drain, Pair};
use braid_tunnel::wire::{self, Ctrl};
use braid_tunnel::TunnelConfig;

#[test]
fn peer_setup() {
    let pair = Pair::new();
    assert_eq!(pair.a.paths().len(), 1);
    let path = &pair.a.paths()[0];
    assert!(path.active);
    assert!(!path.bak.local);
    // The responder has not heard anything yet.
    assert!(pair.b.paths().is_empty());
}

#[test]
fn psk_symmetry_delivers_payloads_both_ways() {
    let mut pair = Pair::new();
    let mut got_hello = false;
    for _ in 0..50 {
        pair.a.send(b"hello", 0).expect("send");
        let (_, to_b) = pair.round();
        if to_b.iter().any(|m| m == b"hello") {
            got_hello = true;
            break;
        }
    }
    assert!(got_hello, "payload never reached the responder");

    // The responder now owns an ingest-learned path and can answer.
    assert_eq!(pair.b.paths().len(), 1);
    assert!(!pair.b.paths()[0].active);
    let mut got_world = false;
    for _ in 0..50 {
        pair.b.send(b"world", 0).expect("send");
        let (to_a, _) = pair.round();
        if to_a.iter().any(|m| m == b"world") {
            got_world = true;
            break;
        }
    }
    assert!(got_world, "payload never reached the initiator");
}

#[test]
fn stale_control_packet_creates_no_path() {
    let mut pair = Pair::new();
    let b_addr = pair.b.local_addr().expect("addr");
    let raw = UdpSocket::bind("127.0.0.1:0").expect("bind");

    // A correctly keyed ping, timestamped 11 minutes in the past.
    let key = AeadKey::new(Suite::ChaCha20Poly1305, &pair.b.key());
    let stale = braid_core::now().wrapping_sub(11 * 60 * 1_000_000);
    let mut packet = [0u8; wire::PACKET_MAX];
    let len = wire::seal_ctrl(Ctrl::Ping, stale, &[], &key, &mut packet).expect("seal");
    raw.send_to(&packet[..len], ("127.0.0.1", b_addr.port())).expect("send");
    std::thread::sleep(Duration::from_millis(2));
    drain(&mut pair.b);
    assert!(pair.b.paths().is_empty(), "stale packet created a path");
    assert!(pair.b.stats().clock_drops >= 1);

    // The same ping with a fresh timestamp is accepted and creates a path.
    let len = wire::seal_ctrl(Ctrl::Ping, braid_core::now(), &[], &key, &mut packet).expect("seal");
    raw.send_to(&packet[..len], ("127.0.0.1", b_addr.port())).expect("send");
    std::thread::sleep(Duration::from_millis(2));
    drain(&mut pair.b);
    assert_eq!(pair.b.paths().len(), 1);
}

#[test]
fn key_exchange_rotates_both_ends() {
    let mut pair = Pair::new();
    let converged = pair.settle(100, |p| p.a.key_epoch() >= 1 && p.b.key_epoch() >= 1);
    // Rotation needs data flowing in both directions; push some through.
    if !converged {
        for _ in 0..100 {
            pair.a.send(b"ping-data", 0).expect("send");
            pair.b.send(b"pong-data", 0).expect("send");
            pair.round();
            if pair.a.key_epoch() >= 1 && pair.b.key_epoch() >= 1 {
                break;
            }
        }
    }
    assert!(pair.a.key_epoch() >= 1, "initiator never rotated");
    assert!(pair.b.key_epoch() >= 1, "responder never rotated");

    // Traffic still flows after rotation.
    let mut delivered = false;
    for _ in 0..50 {
        pair.a.send(b"after-rotation", 0).expect("send");
        let (_, to_b) = pair.round();
        if to_b.iter().any(|m| m == b"after-rotation") {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "traffic stalled after rotation");
}

#[test]
fn simultaneous_initiation_converges() {
    let mut pair = Pair::new();
    let a_port = pair.a_port();
    // Configure the reverse path so both ends initiate key exchanges.
    pair.b.add_peer("127.0.0.1", "127.0.0.1", a_port, false).expect("peer");
    for _ in 0..200 {
        pair.a.send(b"from-a", 0).expect("send");
        pair.b.send(b"from-b", 0).expect("send");
        pair.round();
        if pair.a.key_epoch() >= 1 && pair.b.key_epoch() >= 1 {
            break;
        }
    }
    assert!(pair.a.key_epoch() >= 1 && pair.b.key_epoch() >= 1);
}

#[test]
fn mtu_negotiation_converges_to_smaller_end() {
    let mut pair = Pair::with_config(
        TunnelConfig {
            mtu: 1200,
            ..TunnelConfig::default()
        },
        TunnelConfig::default(),
    );
    assert_eq!(pair.a.mtu(), 1200);
    assert_eq!(pair.b.mtu(), 1450);
    let converged = pair.settle(100, |p| p.a.mtu() == 1200 && p.b.mtu() == 1200);
    assert!(converged, "mtu never converged: a={} b={}", pair.a.mtu(), pair.b.mtu());
}

#[test]
fn backup_advertisement_demotes_discovered_path() {
    let mut a = braid_tunnel::Tunnel::new(TunnelConfig::default()).expect("engine a");
    let mut b = braid_tunnel::Tunnel::new(TunnelConfig::default()).expect("engine b");
    b.set_key(&a.key()).expect("psk");
    let b_port = b.local_addr().expect("addr").port();
    a.add_peer("127.0.0.1", "127.0.0.1", b_port, true).expect("peer");
    a.set_send_timeout(Duration::from_millis(20)).expect("timeout");
    b.set_send_timeout(Duration::from_millis(20)).expect("timeout");

    let mut pair = Pair { a, b };
    let settled = pair.settle(100, |p| {
        p.b.paths().first().is_some_and(|path| path.bak.remote && path.bak.local)
    });
    assert!(settled, "backup advertisement never landed");
    // The demoted path is the only one, so data still flows over it.
    let mut delivered = false;
    for _ in 0..50 {
        pair.a.send(b"over-backup", 0).expect("send");
        let (_, to_b) = pair.round();
        if to_b.iter().any(|m| m == b"over-backup") {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "backup path carried nothing");
}

#[test]
fn bad_key_triggers_exchange_storm() {
    let mut pair = Pair::new();
    // Establish the tunnel first so the responder owns a path.
    let mut established = false;
    for _ in 0..50 {
        pair.a.send(b"warmup", 0).expect("send");
        let (_, to_b) = pair.round();
        if to_b.iter().any(|m| m == b"warmup") {
            established = true;
            break;
        }
    }
    assert!(established);

    // Re-key the initiator alone: its data now fails every epoch on the
    // responder.
    let mut rogue = [0u8; braid_crypto::KEY_SIZE];
    rogue[0] = 0xA5;
    pair.a.set_key(&rogue).expect("rekey");
    for _ in 0..3 {
        pair.a.send(b"unreadable", 0).expect("send");
        std::thread::sleep(Duration::from_millis(2));
        let delivered = drain(&mut pair.b);
        assert!(delivered.is_empty(), "mismatched key still delivered data");
    }
    assert!(pair.b.stats().decrypt_errors >= 3);

    // The responder's next tick emits a key exchange on its discovered path;
    // the initiator can no longer authenticate it.
    std::thread::sleep(Duration::from_millis(25));
    pair.b.send(&[], 0).expect("tick");
    std::thread::sleep(Duration::from_millis(2));
    let before = pair.a.stats().ctrl_auth_errors;
    drain(&mut pair.a);
    assert!(pair.a.stats().ctrl_auth_errors > before, "no key exchange arrived");
}
