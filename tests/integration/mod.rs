//! Integration test modules

mod handshake;
mod nat_flow;
mod pipeline;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use etherparse::{Icmpv4Header, Icmpv4Type, IpNumber, Ipv4Header, UdpHeader};
use rust_tunnel::faketcp::{parse_segment, Endpoint, SegmentMeta};
use rust_tunnel::packet::{finalize_datagram, parse_datagram, Transport};

pub const CLIENT_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 45123);
pub const SERVER_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 1), 19986);

/// Parse an emitted segment datagram back into metadata, as the peer's
/// tunnel pump would.
pub fn to_meta(datagram: &[u8]) -> SegmentMeta {
    let packet = parse_datagram(datagram).expect("segment parses");
    parse_segment(&packet).expect("segment is TCP")
}

/// Run the three-way handshake between a fresh endpoint pair.
pub fn established_pair() -> (Endpoint, Endpoint) {
    let now = Instant::now();
    let mut client = Endpoint::client(CLIENT_ADDR, SERVER_ADDR);
    let mut server = Endpoint::server(SERVER_ADDR, CLIENT_ADDR);

    let syn = client.connect(now).expect("SYN builds");
    let synack = server
        .handle_segment(&to_meta(&syn), now)
        .expect("SYN handled")
        .emit
        .remove(0);
    let ack = client
        .handle_segment(&to_meta(&synack), now)
        .expect("SYN+ACK handled")
        .emit
        .remove(0);
    server
        .handle_segment(&to_meta(&ack), now)
        .expect("ACK handled");

    assert!(client.is_established());
    assert!(server.is_established());
    (client, server)
}

/// Build a UDP datagram with computed checksums.
pub fn udp_datagram(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let ipv4 = Ipv4Header::new(
        (8 + payload.len()) as u16,
        64,
        IpNumber::UDP,
        src.ip().octets(),
        dst.ip().octets(),
    )
    .expect("payload fits");
    let udp = UdpHeader {
        source_port: src.port(),
        destination_port: dst.port(),
        length: (8 + payload.len()) as u16,
        checksum: 0,
    };
    finalize_datagram(&ipv4, &Transport::Udp(udp), payload).expect("datagram builds")
}

/// Build an ICMP echo request datagram.
pub fn echo_request(src: Ipv4Addr, dst: Ipv4Addr, id: u16, payload: &[u8]) -> Vec<u8> {
    let icmp = Icmpv4Header::with_checksum(
        Icmpv4Type::EchoRequest(etherparse::IcmpEchoHeader { id, seq: 1 }),
        payload,
    );
    let ipv4 = Ipv4Header::new(
        (icmp.header_len() + payload.len()) as u16,
        64,
        IpNumber::ICMP,
        src.octets(),
        dst.octets(),
    )
    .expect("payload fits");
    finalize_datagram(&ipv4, &Transport::Icmpv4(icmp), payload).expect("datagram builds")
}
