//! Handshake and state machine scenarios

use std::time::{Duration, Instant};

use rust_tunnel::error::TunnelError;
use rust_tunnel::faketcp::{
    build_segment, Endpoint, State, HANDSHAKE_TIMEOUT, RESET_COOLDOWN,
};
use rust_tunnel::packet::parse_datagram;

use super::{established_pair, to_meta, CLIENT_ADDR, SERVER_ADDR};

#[test]
fn test_simultaneous_start_converges() {
    // Both processes come up together; the handshake settles well inside the
    // per-leg timeout because each response is generated immediately.
    let (client, server) = established_pair();
    assert_eq!(client.state(), State::Established);
    assert_eq!(server.state(), State::Established);
}

#[test]
fn test_first_segments_have_zero_counters() {
    let now = Instant::now();
    let mut client = Endpoint::client(CLIENT_ADDR, SERVER_ADDR);
    let mut server = Endpoint::server(SERVER_ADDR, CLIENT_ADDR);

    let syn = client.connect(now).expect("SYN builds");
    let syn_packet = parse_datagram(&syn).expect("SYN parses");
    assert_eq!(syn_packet.ipv4.identification, 0);
    assert_eq!(to_meta(&syn).seq, 0);

    let synack = server
        .handle_segment(&to_meta(&syn), now)
        .expect("SYN handled")
        .emit
        .remove(0);
    let synack_packet = parse_datagram(&synack).expect("SYN+ACK parses");
    assert_eq!(synack_packet.ipv4.identification, 0);
    assert_eq!(to_meta(&synack).seq, 0);
}

#[test]
fn test_first_data_sequence_is_zero_on_both_sides() {
    let (mut client, mut server) = established_pair();
    let down = client.send(b"client data").expect("segments");
    let up = server.send(b"server data").expect("segments");
    assert_eq!(to_meta(&down[0]).seq, 0);
    assert_eq!(to_meta(&up[0]).seq, 0);
}

#[test]
fn test_client_handshake_times_out_without_answer() {
    let now = Instant::now();
    let mut client = Endpoint::client(CLIENT_ADDR, SERVER_ADDR);
    client.connect(now).expect("SYN builds");

    assert!(client
        .check_handshake_timeout(now + Duration::from_secs(4))
        .is_ok());
    assert!(client
        .check_handshake_timeout(now + HANDSHAKE_TIMEOUT)
        .is_err());
    assert_eq!(client.state(), State::Closed);
}

#[test]
fn test_desync_reset_and_rehandshake() {
    let (_client, mut server) = established_pair();
    let now = Instant::now();

    // A fresh SYN over the established flow forces the reset.
    let syn = build_segment(CLIENT_ADDR, SERVER_ADDR, 0, 0, true, 0, &[]).expect("SYN builds");
    let err = server
        .handle_segment(&to_meta(&syn), now)
        .expect_err("desync detected");
    assert!(matches!(err, TunnelError::PeerDesync { .. }));
    assert_eq!(server.state(), State::Closed);

    // Cooldown quiets the port, then the handshake restarts from zero.
    let outcome = server
        .handle_segment(&to_meta(&syn), now + Duration::from_millis(500))
        .expect("SYN during cooldown is dropped");
    assert!(outcome.emit.is_empty());

    let outcome = server
        .handle_segment(&to_meta(&syn), now + RESET_COOLDOWN)
        .expect("SYN after cooldown accepted");
    assert_eq!(outcome.emit.len(), 1);
    let synack = to_meta(&outcome.emit[0]);
    assert!(synack.syn);
    assert_eq!(synack.seq, 0);
    assert_eq!(server.state(), State::SynReceived);
}

#[test]
fn test_client_reconnect_waits_for_cooldown() {
    let now = Instant::now();
    let mut client = Endpoint::client(CLIENT_ADDR, SERVER_ADDR);
    client.connect(now).expect("SYN builds");
    // Complete establishment, then reset as a desync would.
    let synack = build_segment(SERVER_ADDR, CLIENT_ADDR, 0, 0, true, 0, &[]).expect("builds");
    client
        .handle_segment(&to_meta(&synack), now)
        .expect("SYN+ACK handled");
    assert!(client.is_established());

    client.reset(now);
    assert!(!client.can_reconnect(now));
    assert!(client.can_reconnect(now + RESET_COOLDOWN));

    let syn = client
        .connect(now + RESET_COOLDOWN)
        .expect("reconnect SYN builds");
    assert_eq!(to_meta(&syn).seq, 0);
    let packet = parse_datagram(&syn).expect("parses");
    assert_eq!(packet.ipv4.identification, 0);
}
