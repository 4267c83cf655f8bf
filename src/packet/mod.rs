//! Parsed packet representation and frame codecs
//!
//! Captured frames are parsed into (link, IPv4, transport) layers with the
//! full IPv4 datagram retained as bytes for encapsulation. The build path
//! reverses this: finalize a datagram from mutated headers (recomputing
//! checksums) and wrap it in the link framing of the emitting device.
//!
//! Only IPv4 is handled. The transport layer is TCP, UDP or ICMPv4; non-first
//! fragments carry no transport header and parse with [`Transport::None`].

use std::net::Ipv4Addr;

use etherparse::{
    EtherType, Ethernet2Header, Icmpv4Header, Icmpv4Type, IpNumber, Ipv4Header, Ipv4HeaderSlice,
    TcpHeader, UdpHeader,
};

use crate::error::PacketError;

/// Loopback (DLT_NULL) link-layer family value for IPv4, host byte order
const LOOPBACK_FAMILY_INET: u32 = 2;

/// Length of the loopback pseudo link header
const LOOPBACK_HEADER_LEN: usize = 4;

/// Link framing kind of a capture handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Ethernet II framing
    Ethernet,
    /// Loopback/NULL framing (4-byte address-family header)
    Loopback,
}

/// Parsed link layer of a captured frame
#[derive(Debug, Clone)]
pub enum LinkLayer {
    /// Ethernet II with the captured addresses
    Ethernet {
        /// Source MAC of the captured frame
        src: [u8; 6],
        /// Destination MAC of the captured frame
        dst: [u8; 6],
    },
    /// Loopback framing carries no addressing
    Loopback,
}

/// Parsed transport layer
#[derive(Debug, Clone)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Icmpv4(Icmpv4Header),
    /// Non-first fragment: the transport header lives in another fragment
    None,
}

impl Transport {
    /// Source and destination "ports" of this transport layer.
    ///
    /// For ICMP echo the identifier plays the role of both ports; other ICMP
    /// types and fragments have no port concept.
    #[must_use]
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self {
            Self::Tcp(tcp) => Some((tcp.source_port, tcp.destination_port)),
            Self::Udp(udp) => Some((udp.source_port, udp.destination_port)),
            Self::Icmpv4(icmp) => match &icmp.icmp_type {
                Icmpv4Type::EchoRequest(echo) | Icmpv4Type::EchoReply(echo) => {
                    Some((echo.id, echo.id))
                }
                _ => None,
            },
            Self::None => None,
        }
    }
}

/// A captured packet parsed into layers.
///
/// `datagram` holds the full IPv4 datagram (header and payload) bounded by
/// the header's total length; the parsed headers are views for classification
/// and rewriting.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub link: LinkLayer,
    pub ipv4: Ipv4Header,
    pub transport: Transport,
    pub datagram: Vec<u8>,
}

impl CapturedPacket {
    /// Source IPv4 address
    #[must_use]
    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ipv4.source)
    }

    /// Destination IPv4 address
    #[must_use]
    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ipv4.destination)
    }

    /// The IPv4 payload bytes (everything after the IP header)
    #[must_use]
    pub fn ip_payload(&self) -> &[u8] {
        &self.datagram[self.ipv4.header_len()..]
    }

    /// Whether this packet is a fragment (first or later)
    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.ipv4.is_fragmenting_payload()
    }
}

/// Parse a captured frame into layers.
///
/// # Errors
///
/// Returns `PacketError` when the frame is truncated, not IPv4, or carries a
/// transport protocol other than TCP/UDP/ICMPv4. Callers drop such packets
/// silently per the capture contract.
pub fn parse_frame(kind: LinkKind, data: &[u8]) -> Result<CapturedPacket, PacketError> {
    let (link, ip_bytes) = split_link(kind, data)?;
    parse_ip(link, ip_bytes)
}

/// Parse a bare IPv4 datagram (no link framing), as carried inside
/// encapsulation frames.
///
/// # Errors
///
/// Same contract as [`parse_frame`].
pub fn parse_datagram(bytes: &[u8]) -> Result<CapturedPacket, PacketError> {
    parse_ip(LinkLayer::Loopback, bytes)
}

fn split_link(kind: LinkKind, data: &[u8]) -> Result<(LinkLayer, &[u8]), PacketError> {
    Ok(match kind {
        LinkKind::Ethernet => {
            let (eth, rest) = Ethernet2Header::from_slice(data)
                .map_err(|_| PacketError::TruncatedFrame { len: data.len() })?;
            if eth.ether_type != EtherType::IPV4 {
                return Err(PacketError::NotIpv4);
            }
            (
                LinkLayer::Ethernet {
                    src: eth.source,
                    dst: eth.destination,
                },
                rest,
            )
        }
        LinkKind::Loopback => {
            if data.len() < LOOPBACK_HEADER_LEN {
                return Err(PacketError::TruncatedFrame { len: data.len() });
            }
            let family = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
            if family != LOOPBACK_FAMILY_INET {
                return Err(PacketError::NotIpv4);
            }
            (LinkLayer::Loopback, &data[LOOPBACK_HEADER_LEN..])
        }
    })
}

fn parse_ip(link: LinkLayer, ip_bytes: &[u8]) -> Result<CapturedPacket, PacketError> {
    // Bound the datagram by the header's total length; Ethernet frames are
    // commonly padded past it.
    let ip_slice = Ipv4HeaderSlice::from_slice(ip_bytes)
        .map_err(|e| PacketError::Malformed(e.to_string()))?;
    let total_len = ip_slice.total_len() as usize;
    let header_len = ip_slice.slice().len();
    if total_len < header_len || total_len > ip_bytes.len() {
        return Err(PacketError::Malformed(format!(
            "total length {total_len} outside captured bounds"
        )));
    }
    let datagram = ip_bytes[..total_len].to_vec();

    let (ipv4, _) =
        Ipv4Header::from_slice(&datagram).map_err(|e| PacketError::Malformed(e.to_string()))?;
    let payload = &datagram[header_len..];

    let later_fragment = ipv4.is_fragmenting_payload() && ipv4.fragment_offset.value() != 0;
    let transport = if later_fragment {
        Transport::None
    } else {
        match ipv4.protocol {
            IpNumber::TCP => {
                let (tcp, _) = TcpHeader::from_slice(payload)
                    .map_err(|e| PacketError::Malformed(e.to_string()))?;
                Transport::Tcp(tcp)
            }
            IpNumber::UDP => {
                let (udp, _) = UdpHeader::from_slice(payload)
                    .map_err(|e| PacketError::Malformed(e.to_string()))?;
                Transport::Udp(udp)
            }
            IpNumber::ICMP => {
                let (icmp, _) = Icmpv4Header::from_slice(payload)
                    .map_err(|e| PacketError::Malformed(e.to_string()))?;
                Transport::Icmpv4(icmp)
            }
            other => {
                return Err(PacketError::Malformed(format!(
                    "unsupported protocol {other:?}"
                )))
            }
        }
    };

    Ok(CapturedPacket {
        link,
        ipv4,
        transport,
        datagram,
    })
}

/// Rebuild a datagram from (possibly rewritten) headers, recomputing the IPv4
/// header checksum and the transport checksum.
///
/// `payload` is the transport payload (or the raw IP payload when `transport`
/// is [`Transport::None`], as for non-first fragments).
///
/// # Errors
///
/// Returns `PacketError::Build` when the resulting lengths exceed protocol
/// limits.
pub fn finalize_datagram(
    ipv4: &Ipv4Header,
    transport: &Transport,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let transport_len = match transport {
        Transport::Tcp(tcp) => tcp.header_len() as usize,
        Transport::Udp(_) => 8,
        Transport::Icmpv4(icmp) => icmp.header_len(),
        Transport::None => 0,
    };
    let ip_payload_len = transport_len + payload.len();
    let ip_payload_len_u16 =
        u16::try_from(ip_payload_len).map_err(|_| PacketError::Oversize { len: ip_payload_len })?;

    let mut out_ip = Ipv4Header::new(
        ip_payload_len_u16,
        ipv4.time_to_live,
        ipv4.protocol,
        ipv4.source,
        ipv4.destination,
    )
    .map_err(|e| PacketError::Build(e.to_string()))?;
    out_ip.identification = ipv4.identification;
    out_ip.dont_fragment = ipv4.dont_fragment;
    out_ip.more_fragments = ipv4.more_fragments;
    out_ip.fragment_offset = ipv4.fragment_offset;
    out_ip.header_checksum = out_ip.calc_header_checksum();

    let mut buf = Vec::with_capacity(out_ip.header_len() + ip_payload_len);
    out_ip
        .write(&mut buf)
        .map_err(|e| PacketError::Build(e.to_string()))?;

    match transport {
        Transport::Tcp(tcp) => {
            let mut tcp = tcp.clone();
            tcp.checksum = tcp
                .calc_checksum_ipv4(&out_ip, payload)
                .map_err(|e| PacketError::Build(e.to_string()))?;
            tcp.write(&mut buf)
                .map_err(|e| PacketError::Build(e.to_string()))?;
        }
        Transport::Udp(udp) => {
            let mut udp = udp.clone();
            udp.length = ip_payload_len_u16;
            udp.checksum = udp
                .calc_checksum_ipv4(&out_ip, payload)
                .map_err(|e| PacketError::Build(e.to_string()))?;
            udp.write(&mut buf)
                .map_err(|e| PacketError::Build(e.to_string()))?;
        }
        Transport::Icmpv4(icmp) => {
            let icmp = Icmpv4Header::with_checksum(icmp.icmp_type.clone(), payload);
            icmp.write(&mut buf)
                .map_err(|e| PacketError::Build(e.to_string()))?;
        }
        Transport::None => {}
    }

    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Wrap an IPv4 datagram in the link framing for an emitting device.
///
/// # Errors
///
/// Returns `PacketError::Build` if header serialization fails.
pub fn build_frame(link: &LinkLayer, datagram: &[u8]) -> Result<Vec<u8>, PacketError> {
    match link {
        LinkLayer::Ethernet { src, dst } => {
            let eth = Ethernet2Header {
                source: *src,
                destination: *dst,
                ether_type: EtherType::IPV4,
            };
            let mut buf = Vec::with_capacity(14 + datagram.len());
            eth.write(&mut buf)
                .map_err(|e| PacketError::Build(e.to_string()))?;
            buf.extend_from_slice(datagram);
            Ok(buf)
        }
        LinkLayer::Loopback => {
            let mut buf = Vec::with_capacity(LOOPBACK_HEADER_LEN + datagram.len());
            buf.extend_from_slice(&LOOPBACK_FAMILY_INET.to_ne_bytes());
            buf.extend_from_slice(datagram);
            Ok(buf)
        }
    }
}
