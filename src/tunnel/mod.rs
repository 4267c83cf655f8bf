//! Tunnel orchestration
//!
//! Wires the capture pumps, the FakeTCP endpoints, reassembly, NAT and the
//! AEAD wrapper into the client and server data planes. Each role runs one
//! dispatcher thread that owns every endpoint, receiver threads per capture
//! handle, sender threads per injection handle, and housekeeping folded into
//! the dispatcher's receive timeout.

pub mod client;
pub mod server;

pub use client::ClientTunnel;
pub use server::ServerTunnel;

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::crypto::Cipher;
use crate::device::{discover_gateway, Device, Gateway};
use crate::encap::{self, EncapFrame};
use crate::error::{DeviceError, PacketError, TunnelError};
use crate::packet::LinkLayer;

/// Dispatcher receive timeout; also paces housekeeping
const EVENT_POLL: Duration = Duration::from_millis(250);

/// How often expiry and timeout checks run
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Bound of the dispatcher event queue and per-device outbound queues
const QUEUE_DEPTH: usize = 1024;

/// Wrap one encapsulation frame for the wire.
///
/// Plain mode sends the frame as-is (its own length prefix already delimits
/// it). Encrypted mode seals the whole frame and wraps the result in an
/// outer 2-byte length so frames may still share a segment.
///
/// # Errors
///
/// Returns `PacketError::Oversize` when the sealed frame no longer fits the
/// outer length prefix.
pub fn wrap_frame(cipher: &Cipher, frame: Vec<u8>) -> Result<Vec<u8>, TunnelError> {
    if cipher.is_plain() {
        return Ok(frame);
    }
    let sealed = cipher.seal(&frame)?;
    if sealed.len() > encap::MAX_BODY {
        return Err(PacketError::Oversize { len: sealed.len() }.into());
    }
    let mut out = Vec::with_capacity(encap::LENGTH_PREFIX + sealed.len());
    out.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverse of [`wrap_frame`] for one frame body off the stream reader.
///
/// # Errors
///
/// Per-frame errors: `CryptoError` on tag mismatch, `PacketError::BadFrame`
/// on framing damage. Callers drop the frame and keep the flow.
pub fn unwrap_frame(cipher: &Cipher, body: &[u8]) -> Result<EncapFrame, TunnelError> {
    if cipher.is_plain() {
        return Ok(encap::decode(body)?);
    }
    let plain = cipher.open(body)?;
    if plain.len() < encap::LENGTH_PREFIX {
        return Err(PacketError::BadFrame("decrypted frame too short".into()).into());
    }
    let inner_len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
    if inner_len != plain.len() - encap::LENGTH_PREFIX {
        return Err(PacketError::BadFrame("inner length mismatch".into()).into());
    }
    Ok(encap::decode(&plain[encap::LENGTH_PREFIX..])?)
}

/// Resolve the gateway for a device; loopback devices have none.
pub(crate) fn resolve_gateway(
    device: &Device,
    configured: Option<Ipv4Addr>,
) -> Result<Option<Gateway>, TunnelError> {
    if device.is_loopback {
        return Ok(None);
    }
    discover_gateway(device, configured).map(Some)
}

/// The link framing for frames injected on `device` toward its gateway.
pub(crate) fn gateway_link(
    device: &Device,
    gateway: Option<&Gateway>,
) -> Result<LinkLayer, TunnelError> {
    if device.is_loopback {
        return Ok(LinkLayer::Loopback);
    }
    let src = device.hardware_addr.ok_or_else(|| {
        DeviceError::Enumerate(format!("device {} has no hardware address", device.name))
    })?;
    let gateway = gateway.ok_or(DeviceError::NoUpstream {
        gateway: Ipv4Addr::UNSPECIFIED,
    })?;
    Ok(LinkLayer::Ethernet {
        src,
        dst: gateway.hardware_addr,
    })
}
