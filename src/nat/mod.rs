//! Server-side NAT table
//!
//! Maps `(original source, protocol)` to a port allocated from the server's
//! ephemeral pool, so replies captured on the upstream device can be routed
//! back to the owning FakeTCP peer and restored to the original source.
//! ICMP uses the echo identifier as its "port".
//!
//! The mapping is injective per protocol: the inbound map is keyed by
//! `(protocol, mapped port)` and a port is never handed out twice while a
//! binding holds it. On exhaustion the least-recently-used binding idle
//! longer than [`EVICTION_MIN_IDLE`] is evicted; if none qualifies the
//! packet drops with a rate-limited log.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use etherparse::{Icmpv4Type, IpNumber};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::NatConfig;
use crate::error::{NatError, PacketError, TunnelError};
use crate::packet::{finalize_datagram, parse_datagram, Transport};

/// A binding must be idle at least this long before eviction may reclaim it
pub const EVICTION_MIN_IDLE: Duration = Duration::from_secs(5);

/// Minimum spacing of exhaustion log lines
const EXHAUSTION_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Protocols the NAT translates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl NatProtocol {
    /// Classify an IP protocol number
    #[must_use]
    pub fn from_ip_number(protocol: IpNumber) -> Option<Self> {
        match protocol {
            IpNumber::TCP => Some(Self::Tcp),
            IpNumber::UDP => Some(Self::Udp),
            IpNumber::ICMP => Some(Self::Icmp),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Tcp => 0,
            Self::Udp => 1,
            Self::Icmp => 2,
        }
    }
}

/// Key of the outbound direction: the original source endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NatKey {
    original: SocketAddrV4,
    protocol: NatProtocol,
}

/// One live translation
#[derive(Debug, Clone)]
pub struct NatBinding {
    pub original: SocketAddrV4,
    pub protocol: NatProtocol,
    pub mapped_port: u16,
    /// FakeTCP peer that owns this source, for reply routing
    pub peer: SocketAddrV4,
    last_seen: Instant,
    tcp_closing: bool,
}

/// Concurrent NAT table with per-protocol port pools
pub struct NatTable {
    server_ip: Ipv4Addr,
    outbound: DashMap<NatKey, u16>,
    inbound: DashMap<(NatProtocol, u16), NatBinding>,
    /// Next allocation cursor per protocol
    cursors: Mutex<[u16; 3]>,
    port_min: u16,
    port_max: u16,
    idle_timeout: Duration,
    tcp_established_timeout: Duration,
    last_exhausted_log: Mutex<Option<Instant>>,
}

impl NatTable {
    #[must_use]
    pub fn new(server_ip: Ipv4Addr, config: &NatConfig) -> Self {
        Self {
            server_ip,
            outbound: DashMap::new(),
            inbound: DashMap::new(),
            cursors: Mutex::new([config.port_min; 3]),
            port_min: config.port_min,
            port_max: config.port_max,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            tcp_established_timeout: Duration::from_secs(config.tcp_established_timeout_secs),
            last_exhausted_log: Mutex::new(None),
        }
    }

    /// Number of live bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.inbound.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }

    /// Translate a decapsulated outbound datagram: rewrite its source to the
    /// server's address and a mapped port, recomputing checksums.
    ///
    /// # Errors
    ///
    /// Per-packet errors only: untranslatable packets (`PacketError`) and
    /// pool exhaustion (`NatError::Exhausted`).
    pub fn translate_outbound(
        &self,
        datagram: &[u8],
        peer: SocketAddrV4,
    ) -> Result<Vec<u8>, TunnelError> {
        let packet = parse_datagram(datagram)?;
        let protocol = NatProtocol::from_ip_number(packet.ipv4.protocol)
            .ok_or_else(|| PacketError::Malformed("protocol not translatable".into()))?;
        let Some((src_port, _)) = packet.transport.ports() else {
            // Non-echo ICMP and the like: nothing to key a mapping on.
            debug!(
                "Dropping untranslatable {} packet from {}",
                protocol.as_str(),
                packet.src_ip()
            );
            return Err(NatError::Untranslatable {
                protocol: protocol.as_str(),
            }
            .into());
        };

        let original = SocketAddrV4::new(packet.src_ip(), src_port);
        let mapped_port = self.map_outbound(original, protocol, peer)?;

        let mut ipv4 = packet.ipv4.clone();
        ipv4.source = self.server_ip.octets();
        let mut transport = packet.transport.clone();
        rewrite_source(&mut transport, mapped_port);
        if let Transport::Tcp(ref tcp) = transport {
            if tcp.fin || tcp.rst {
                self.observe_tcp_close(mapped_port);
            }
        }

        let payload = transport_payload(&packet.datagram, packet.ipv4.header_len(), &transport);
        trace!(
            "NAT out {}/{} -> {}:{}",
            original,
            protocol.as_str(),
            self.server_ip,
            mapped_port
        );
        Ok(finalize_datagram(&ipv4, &transport, payload)?)
    }

    /// Translate a reply captured on the upstream device back to its original
    /// source. Returns the rewritten datagram and the owning FakeTCP peer,
    /// or `None` when no binding matches (not tunnel traffic).
    ///
    /// # Errors
    ///
    /// Per-packet `PacketError` on malformed datagrams.
    pub fn translate_inbound(
        &self,
        datagram: &[u8],
    ) -> Result<Option<(Vec<u8>, SocketAddrV4)>, TunnelError> {
        let packet = parse_datagram(datagram)?;
        let Some(protocol) = NatProtocol::from_ip_number(packet.ipv4.protocol) else {
            return Ok(None);
        };
        let Some((_, dst_port)) = packet.transport.ports() else {
            return Ok(None);
        };

        let Some(binding) = self.lookup_inbound(protocol, dst_port) else {
            trace!(
                "No NAT binding for {}/{} port {}",
                packet.dst_ip(),
                protocol.as_str(),
                dst_port
            );
            return Ok(None);
        };

        let mut ipv4 = packet.ipv4.clone();
        ipv4.destination = binding.original.ip().octets();
        let mut transport = packet.transport.clone();
        rewrite_destination(&mut transport, binding.original.port());
        if let Transport::Tcp(ref tcp) = transport {
            if tcp.fin || tcp.rst {
                self.observe_tcp_close(binding.mapped_port);
            }
        }

        let payload = transport_payload(&packet.datagram, packet.ipv4.header_len(), &transport);
        let rewritten = finalize_datagram(&ipv4, &transport, payload)?;
        Ok(Some((rewritten, binding.peer)))
    }

    /// Look up or allocate the mapped port for an original source.
    ///
    /// # Errors
    ///
    /// Returns `NatError::Exhausted` when the pool is full and nothing is
    /// evictable.
    pub fn map_outbound(
        &self,
        original: SocketAddrV4,
        protocol: NatProtocol,
        peer: SocketAddrV4,
    ) -> Result<u16, NatError> {
        let key = NatKey { original, protocol };
        if let Some(port) = self.outbound.get(&key).map(|entry| *entry) {
            if let Some(mut binding) = self.inbound.get_mut(&(protocol, port)) {
                binding.last_seen = Instant::now();
                binding.peer = peer;
            }
            return Ok(port);
        }

        let port = match self.allocate_port(protocol) {
            Some(port) => port,
            None => self.evict_lru(protocol).ok_or_else(|| {
                self.log_exhausted(protocol);
                NatError::Exhausted {
                    protocol: protocol.as_str(),
                }
            })?,
        };

        self.outbound.insert(key, port);
        self.inbound.insert(
            (protocol, port),
            NatBinding {
                original,
                protocol,
                mapped_port: port,
                peer,
                last_seen: Instant::now(),
                tcp_closing: false,
            },
        );
        debug!(
            "NAT binding {}/{} -> port {} ({} live)",
            original,
            protocol.as_str(),
            port,
            self.inbound.len()
        );
        Ok(port)
    }

    /// Find the binding behind a mapped port, refreshing its idle timer
    #[must_use]
    pub fn lookup_inbound(&self, protocol: NatProtocol, mapped_port: u16) -> Option<NatBinding> {
        let mut binding = self.inbound.get_mut(&(protocol, mapped_port))?;
        binding.last_seen = Instant::now();
        Some(binding.clone())
    }

    /// A FIN or RST was seen: fall back to the short idle timeout
    pub fn observe_tcp_close(&self, mapped_port: u16) {
        if let Some(mut binding) = self.inbound.get_mut(&(NatProtocol::Tcp, mapped_port)) {
            binding.tcp_closing = true;
        }
    }

    /// Drop bindings past their idle timeout. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<NatBinding> = self
            .inbound
            .iter()
            .filter(|entry| {
                let binding = entry.value();
                binding.last_seen.elapsed() >= self.timeout_for(binding)
            })
            .map(|entry| entry.value().clone())
            .collect();

        for binding in &expired {
            self.remove_binding(binding);
            debug!(
                "NAT binding {}/{} port {} expired",
                binding.original,
                binding.protocol.as_str(),
                binding.mapped_port
            );
        }
        expired.len()
    }

    fn timeout_for(&self, binding: &NatBinding) -> Duration {
        match binding.protocol {
            NatProtocol::Tcp if !binding.tcp_closing => self.tcp_established_timeout,
            _ => self.idle_timeout,
        }
    }

    fn remove_binding(&self, binding: &NatBinding) {
        self.inbound
            .remove(&(binding.protocol, binding.mapped_port));
        self.outbound.remove(&NatKey {
            original: binding.original,
            protocol: binding.protocol,
        });
    }

    /// Cycle the per-protocol cursor looking for a free port
    fn allocate_port(&self, protocol: NatProtocol) -> Option<u16> {
        let range = usize::from(self.port_max - self.port_min) + 1;
        let mut cursors = self.cursors.lock();
        let cursor = &mut cursors[protocol.index()];
        for _ in 0..range {
            let candidate = *cursor;
            *cursor = if candidate >= self.port_max {
                self.port_min
            } else {
                candidate + 1
            };
            if !self.inbound.contains_key(&(protocol, candidate)) {
                return Some(candidate);
            }
        }
        None
    }

    /// Reclaim the least-recently-used binding idle past the eviction floor
    fn evict_lru(&self, protocol: NatProtocol) -> Option<u16> {
        let candidate = self
            .inbound
            .iter()
            .filter(|entry| entry.key().0 == protocol)
            .filter(|entry| entry.value().last_seen.elapsed() >= EVICTION_MIN_IDLE)
            .min_by_key(|entry| entry.value().last_seen)
            .map(|entry| entry.value().clone())?;

        self.remove_binding(&candidate);
        info!(
            "NAT evicted idle binding {}/{} port {}",
            candidate.original,
            candidate.protocol.as_str(),
            candidate.mapped_port
        );
        Some(candidate.mapped_port)
    }

    fn log_exhausted(&self, protocol: NatProtocol) {
        let mut last = self.last_exhausted_log.lock();
        let due = last.is_none_or(|at| at.elapsed() >= EXHAUSTION_LOG_INTERVAL);
        if due {
            info!("NAT port pool exhausted for {}", protocol.as_str());
            *last = Some(Instant::now());
        }
    }

    /// Backdate a binding's idle timer; test hook for eviction and expiry.
    #[cfg(test)]
    fn age_binding(&self, protocol: NatProtocol, mapped_port: u16, age: Duration) {
        if let Some(mut binding) = self.inbound.get_mut(&(protocol, mapped_port)) {
            binding.last_seen = Instant::now() - age;
        }
    }
}

/// Rewrite the transport-layer source (port or echo identifier)
fn rewrite_source(transport: &mut Transport, mapped_port: u16) {
    match transport {
        Transport::Tcp(tcp) => tcp.source_port = mapped_port,
        Transport::Udp(udp) => udp.source_port = mapped_port,
        Transport::Icmpv4(icmp) => rewrite_echo_id(icmp, mapped_port),
        Transport::None => {}
    }
}

/// Rewrite the transport-layer destination (port or echo identifier)
fn rewrite_destination(transport: &mut Transport, original_port: u16) {
    match transport {
        Transport::Tcp(tcp) => tcp.destination_port = original_port,
        Transport::Udp(udp) => udp.destination_port = original_port,
        Transport::Icmpv4(icmp) => rewrite_echo_id(icmp, original_port),
        Transport::None => {}
    }
}

fn rewrite_echo_id(icmp: &mut etherparse::Icmpv4Header, id: u16) {
    match &mut icmp.icmp_type {
        Icmpv4Type::EchoRequest(echo) | Icmpv4Type::EchoReply(echo) => echo.id = id,
        _ => {}
    }
}

/// The transport payload slice of a parsed datagram
fn transport_payload<'a>(datagram: &'a [u8], ip_header_len: usize, transport: &Transport) -> &'a [u8] {
    let transport_len = match transport {
        Transport::Tcp(tcp) => tcp.header_len() as usize,
        Transport::Udp(_) => 8,
        Transport::Icmpv4(icmp) => icmp.header_len(),
        Transport::None => 0,
    };
    &datagram[ip_header_len + transport_len..]
}
