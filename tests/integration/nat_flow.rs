//! NAT behavior under load

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use rust_tunnel::config::NatConfig;
use rust_tunnel::error::{NatError, TunnelError};
use rust_tunnel::nat::{NatProtocol, NatTable};
use rust_tunnel::packet::parse_datagram;

use super::{udp_datagram, CLIENT_ADDR, SERVER_ADDR};

fn small_pool(size: u16) -> NatConfig {
    NatConfig {
        port_min: 40000,
        port_max: 40000 + size - 1,
        ..NatConfig::default()
    }
}

#[test]
fn test_flood_of_distinct_tuples_is_injective() {
    let nat = NatTable::new(*SERVER_ADDR.ip(), &NatConfig::default());
    let mut mapped = HashSet::new();

    // A flood of distinct sources each gets its own port.
    for host in 1..=200u16 {
        let source = SocketAddrV4::new(
            Ipv4Addr::new(192, 168, (host >> 8) as u8, (host & 0xff) as u8),
            10000 + host,
        );
        let port = nat
            .map_outbound(source, NatProtocol::Udp, CLIENT_ADDR)
            .expect("pool has room");
        assert!(mapped.insert(port), "port {port} handed out twice");
    }
    assert_eq!(nat.len(), 200);
}

#[test]
fn test_pool_exhaustion_drops_new_tuples() {
    let nat = NatTable::new(*SERVER_ADDR.ip(), &small_pool(16));
    for host in 1..=16u8 {
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, host), 5000);
        nat.map_outbound(source, NatProtocol::Udp, CLIENT_ADDR)
            .expect("pool has room");
    }

    // Fresh bindings are too young to evict, so the next tuple drops.
    let overflow = SocketAddrV4::new(Ipv4Addr::new(192, 168, 2, 1), 5000);
    let err = nat
        .map_outbound(overflow, NatProtocol::Udp, CLIENT_ADDR)
        .expect_err("pool exhausted");
    assert!(matches!(err, NatError::Exhausted { protocol: "udp" }));

    // Existing flows keep their mappings through the exhaustion.
    let existing = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 5000);
    nat.map_outbound(existing, NatProtocol::Udp, CLIENT_ADDR)
        .expect("existing binding survives");
}

#[test]
fn test_exhaustion_via_datagram_path() {
    let nat = NatTable::new(*SERVER_ADDR.ip(), &small_pool(4));
    let destination = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);

    for host in 1..=4u8 {
        let source = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, host), 5000);
        nat.translate_outbound(&udp_datagram(source, destination, b"fits in pool"), CLIENT_ADDR)
            .expect("pool has room");
    }
    let overflow = SocketAddrV4::new(Ipv4Addr::new(192, 168, 9, 9), 5000);
    let err = nat
        .translate_outbound(&udp_datagram(overflow, destination, b"one too many"), CLIENT_ADDR)
        .expect_err("exhausted");
    assert!(matches!(err, TunnelError::Nat(NatError::Exhausted { .. })));
}

#[test]
fn test_per_protocol_pools_are_independent() {
    let nat = NatTable::new(*SERVER_ADDR.ip(), &small_pool(2));
    let a = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 5000);
    let b = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 5000);

    nat.map_outbound(a, NatProtocol::Udp, CLIENT_ADDR).expect("udp a");
    nat.map_outbound(b, NatProtocol::Udp, CLIENT_ADDR).expect("udp b");
    // UDP is full; TCP and ICMP still allocate.
    nat.map_outbound(a, NatProtocol::Tcp, CLIENT_ADDR).expect("tcp a");
    nat.map_outbound(a, NatProtocol::Icmp, CLIENT_ADDR).expect("icmp a");
}

#[test]
fn test_reply_routing_after_flood() {
    let nat = NatTable::new(*SERVER_ADDR.ip(), &NatConfig::default());
    let destination = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
    let peer_b = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 50001);

    // Two peers' sources interleave; replies come back to the right peer.
    let source_a = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 5000);
    let source_b = SocketAddrV4::new(Ipv4Addr::new(10, 9, 8, 7), 6000);
    let out_a = nat
        .translate_outbound(&udp_datagram(source_a, destination, b"from a"), CLIENT_ADDR)
        .expect("a maps");
    let out_b = nat
        .translate_outbound(&udp_datagram(source_b, destination, b"from b"), peer_b)
        .expect("b maps");

    let port_a = parse_datagram(&out_a).unwrap().transport.ports().unwrap().0;
    let port_b = parse_datagram(&out_b).unwrap().transport.ports().unwrap().0;
    assert_ne!(port_a, port_b);

    let reply_b = udp_datagram(
        destination,
        SocketAddrV4::new(*SERVER_ADDR.ip(), port_b),
        b"for b",
    );
    let (restored, peer) = nat
        .translate_inbound(&reply_b)
        .expect("translates")
        .expect("binding exists");
    assert_eq!(peer, peer_b);
    assert_eq!(
        parse_datagram(&restored).unwrap().dst_ip(),
        *source_b.ip()
    );
}
