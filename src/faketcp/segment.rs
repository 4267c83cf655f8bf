//! FakeTCP segment codec
//!
//! On the wire every segment is exactly one IPv4 header (IHL 5, DF set,
//! TTL 64) and one TCP header. The flags are ACK, plus SYN on the handshake
//! legs; FIN never appears. The window is pinned at 65535 and checksums are
//! computed so middleboxes see a well-formed flow.

use std::net::SocketAddrV4;

use etherparse::{IpNumber, Ipv4Header, TcpHeader};

use crate::error::PacketError;
use crate::packet::{CapturedPacket, Transport};

/// Fixed advertised window
pub const TUNNEL_WINDOW: u16 = 65535;

/// TTL of emitted segments
pub const TUNNEL_TTL: u8 = 64;

/// A parsed inbound tunnel segment
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// Build one segment as a raw IPv4 datagram.
///
/// # Errors
///
/// Returns `PacketError::Build` when the payload exceeds IPv4 limits.
pub fn build_segment(
    local: SocketAddrV4,
    peer: SocketAddrV4,
    seq: u32,
    ack: u32,
    syn: bool,
    ipid: u16,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let mut tcp = TcpHeader::new(local.port(), peer.port(), seq, TUNNEL_WINDOW);
    tcp.acknowledgment_number = ack;
    tcp.ack = true;
    tcp.syn = syn;

    let ip_payload_len = tcp.header_len() as usize + payload.len();
    let ip_payload_len = u16::try_from(ip_payload_len)
        .map_err(|_| PacketError::Oversize { len: ip_payload_len })?;
    let mut ip = Ipv4Header::new(
        ip_payload_len,
        TUNNEL_TTL,
        IpNumber::TCP,
        local.ip().octets(),
        peer.ip().octets(),
    )
    .map_err(|e| PacketError::Build(e.to_string()))?;
    ip.identification = ipid;
    ip.dont_fragment = true;
    ip.header_checksum = ip.calc_header_checksum();

    tcp.checksum = tcp
        .calc_checksum_ipv4(&ip, payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;

    let mut buf = Vec::with_capacity(ip.header_len() + ip_payload_len as usize);
    ip.write(&mut buf)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    tcp.write(&mut buf)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Extract segment metadata from a captured tunnel packet.
///
/// Returns `None` for packets that are not whole TCP datagrams; the tunnel
/// pump filter should not let any through, but third parties can inject.
#[must_use]
pub fn parse_segment(packet: &CapturedPacket) -> Option<SegmentMeta> {
    if packet.is_fragment() {
        return None;
    }
    let Transport::Tcp(ref tcp) = packet.transport else {
        return None;
    };
    let header_len = packet.ipv4.header_len() + tcp.header_len() as usize;
    let payload = packet.datagram.get(header_len..)?.to_vec();
    Some(SegmentMeta {
        src: SocketAddrV4::new(packet.src_ip(), tcp.source_port),
        dst: SocketAddrV4::new(packet.dst_ip(), tcp.destination_port),
        seq: tcp.sequence_number,
        ack: tcp.acknowledgment_number,
        syn: tcp.syn,
        rst: tcp.rst,
        payload,
    })
}
