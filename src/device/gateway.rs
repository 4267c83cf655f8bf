//! Gateway discovery via self-probe
//!
//! Sending one UDP datagram to the gateway and sniffing the transmitted
//! Ethernet frame on the wire reveals the gateway's MAC without raw ARP:
//! the kernel resolves the next hop and addresses the frame for us. The
//! probe lands on a port nothing listens on; any response is ignored.

use std::net::{Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

use etherparse::Ethernet2Header;
use tracing::{debug, warn};

use super::Device;
use crate::error::{CaptureError, DeviceError, TunnelError};

/// How long to wait for the reflected probe frame
pub const GATEWAY_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Destination port of the discovery probe; chosen to hit nothing
const PROBE_PORT: u16 = 65535;

/// A discovered gateway: the next hop for the upstream device
#[derive(Debug, Clone, Copy)]
pub struct Gateway {
    pub ip: Ipv4Addr,
    pub hardware_addr: [u8; 6],
}

/// Discover the gateway's MAC address through `device`.
///
/// When `gateway_ip` is absent, the first host of the device's IPv4 subnet is
/// assumed; multi-homed or unusual networks should configure it explicitly.
///
/// # Errors
///
/// Fails when the gateway lies outside the device's subnets, the capture
/// cannot be opened, or no frame is seen within
/// [`GATEWAY_DISCOVERY_TIMEOUT`].
pub fn discover_gateway(
    device: &Device,
    gateway_ip: Option<Ipv4Addr>,
) -> Result<Gateway, TunnelError> {
    let net = device.ipv4_net().ok_or(DeviceError::NoIpv4 {
        device: device.name.clone(),
    })?;

    let gateway_ip = match gateway_ip {
        Some(ip) => ip,
        None => {
            let assumed = net.nth(1).ok_or(DeviceError::NoUpstream {
                gateway: net.network(),
            })?;
            debug!(
                "No gateway configured, assuming first host {} of {}",
                assumed, net
            );
            assumed
        }
    };

    if !device.contains(gateway_ip.into()) {
        return Err(DeviceError::GatewaySubnet {
            device: device.name.clone(),
            gateway: gateway_ip,
        }
        .into());
    }

    let mut cap = pcap::Capture::from_device(device.name.as_str())
        .and_then(|cap| cap.promisc(true).snaplen(1600).timeout(100).open())
        .map_err(|e| CaptureError::Open {
            device: device.name.clone(),
            reason: e.to_string(),
        })?;
    cap.filter(
        &format!("udp and dst host {gateway_ip} and dst port {PROBE_PORT}"),
        true,
    )
    .map_err(|e| CaptureError::Filter {
        device: device.name.clone(),
        reason: e.to_string(),
    })?;

    // The bind to the device's own address forces egress on this interface.
    let socket = UdpSocket::bind((net.ip(), 0))?;
    socket.send_to(b"0", (gateway_ip, PROBE_PORT))?;

    let deadline = Instant::now() + GATEWAY_DISCOVERY_TIMEOUT;
    loop {
        match cap.next_packet() {
            Ok(packet) => {
                let Ok((eth, _)) = Ethernet2Header::from_slice(packet.data) else {
                    continue;
                };
                debug!(
                    "Gateway {} resolved on {} via probe",
                    gateway_ip, device.name
                );
                return Ok(Gateway {
                    ip: gateway_ip,
                    hardware_addr: eth.destination,
                });
            }
            Err(pcap::Error::TimeoutExpired) => {
                if Instant::now() >= deadline {
                    warn!(
                        "Gateway discovery on {} timed out after {:?}",
                        device.name, GATEWAY_DISCOVERY_TIMEOUT
                    );
                    return Err(DeviceError::GatewayTimeout {
                        device: device.name.clone(),
                    }
                    .into());
                }
            }
            Err(e) => {
                return Err(CaptureError::Read {
                    device: device.name.clone(),
                    reason: e.to_string(),
                }
                .into());
            }
        }
    }
}
