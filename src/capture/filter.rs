//! BPF filter builders
//!
//! Each pump role gets a filter scoped to exactly the traffic it owns. The
//! fragment clause `ip[6:2] & 0x1fff != 0` matches non-first fragments,
//! which carry no transport header and would otherwise escape the
//! protocol predicates.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Protocols the tunnel intercepts, plus non-first fragments
const INTERCEPT_BASE: &str = "ip and (tcp or udp or icmp or (ip[6:2] & 0x1fff != 0))";

/// Client-side listen filter: traffic from the configured sources, excluding
/// anything whose peer is the server itself.
#[must_use]
pub fn sources_filter(sources: &[Ipv4Net], server_ip: Ipv4Addr) -> String {
    let nets: Vec<String> = sources
        .iter()
        .map(|net| format!("src net {}", net.trunc()))
        .collect();
    format!(
        "{INTERCEPT_BASE} and ({}) and not host {server_ip}",
        nets.join(" or ")
    )
}

/// Server-side upstream filter: replies addressed to the server, excluding
/// the tunnel flow itself.
#[must_use]
pub fn destinations_filter(server_ip: Ipv4Addr, tunnel_port: u16) -> String {
    format!("{INTERCEPT_BASE} and dst host {server_ip} and not tcp port {tunnel_port}")
}

/// Client-side FakeTCP pump filter: only the tunnel flow from the server
#[must_use]
pub fn tunnel_filter_client(peer_ip: Ipv4Addr, local_port: u16) -> String {
    format!("tcp and src host {peer_ip} and dst port {local_port}")
}

/// Server-side FakeTCP pump filter: peers are unknown until their SYN, so
/// only the local port scopes the capture.
#[must_use]
pub fn tunnel_filter_server(local_port: u16) -> String {
    format!("tcp and dst port {local_port}")
}
