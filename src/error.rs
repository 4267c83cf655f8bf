//! Error types for rust-tunnel
//!
//! This module defines a comprehensive error hierarchy for the FakeTCP tunnel.
//! All errors are categorized by subsystem and include recovery hints.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Top-level error type for rust-tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Device enumeration, pairing and gateway discovery errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Capture open/filter/read and injection errors
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Malformed captured packets and frame build failures
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Fragment reassembly errors
    #[error("Reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// AEAD wrapper errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// FakeTCP handshake errors
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// NAT table errors
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    /// FakeTCP state invariant violated (e.g. unexpected SYN on Established)
    #[error("Peer desync with {peer}: {reason}")]
    PeerDesync { peer: Ipv4Addr, reason: String },

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is per-packet (drop and continue) rather than fatal
    /// for its device or peer session.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Device(_) | Self::Handshake(_) => false,
            Self::Capture(e) => e.is_recoverable(),
            Self::Packet(_) | Self::Reassembly(_) | Self::Crypto(_) | Self::Nat(_) => true,
            // A desync resets the endpoint pair but the tunnel recovers on its own.
            Self::PeerDesync { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Device enumeration and pairing errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// OS interface or pcap device enumeration failed
    #[error("Failed to enumerate devices: {0}")]
    Enumerate(String),

    /// No usable device survived pairing
    #[error("No usable capture device found")]
    NoneFound,

    /// A device was requested by name but is not in the paired set
    #[error("Unknown device: {name}")]
    Unknown { name: String },

    /// No upstream device could be selected
    #[error("No upstream device reaches the gateway {gateway}")]
    NoUpstream { gateway: Ipv4Addr },

    /// The gateway is not inside any subnet bound to the upstream device
    #[error("Gateway {gateway} is outside the subnets of device {device}")]
    GatewaySubnet { device: String, gateway: Ipv4Addr },

    /// The gateway did not reflect the discovery probe in time
    #[error("Gateway discovery timed out on device {device}")]
    GatewayTimeout { device: String },

    /// The device has no usable IPv4 address
    #[error("Device {device} has no IPv4 address")]
    NoIpv4 { device: String },
}

/// Capture and injection errors.
///
/// `Open`, `Filter` and `Read` correspond to the capture side; `Inject` to
/// the raw write side. Any of these marks the device offline.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Failed to open a capture handle on a device
    #[error("Failed to open capture on {device}: {reason}")]
    Open { device: String, reason: String },

    /// Failed to compile or install a BPF program
    #[error("Failed to set filter on {device}: {reason}")]
    Filter { device: String, reason: String },

    /// Read failure on the capture socket
    #[error("Read error on {device}: {reason}")]
    Read { device: String, reason: String },

    /// Raw frame injection failed
    #[error("Inject error on {device}: {reason}")]
    Inject { device: String, reason: String },
}

impl CaptureError {
    /// Capture errors tear down the device's pumps; none are retried in place
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Malformed captured packets and frame build failures.
///
/// Always per-packet: the offender is dropped and processing continues.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The frame is shorter than its link-layer header
    #[error("Truncated link-layer frame ({len} bytes)")]
    TruncatedFrame { len: usize },

    /// The frame does not carry IPv4
    #[error("Not an IPv4 packet")]
    NotIpv4,

    /// Header parsing failed
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Header serialization or checksum computation failed
    #[error("Failed to build packet: {0}")]
    Build(String),

    /// An encapsulated frame would exceed the 2-byte length prefix
    #[error("Frame too large for length prefix ({len} bytes)")]
    Oversize { len: usize },

    /// An encapsulation frame failed to decode
    #[error("Malformed encapsulation frame: {0}")]
    BadFrame(String),
}

/// Fragment reassembly errors
#[derive(Debug, Error)]
pub enum ReassemblyError {
    /// Fragments of a group stopped arriving before completion
    #[error("Fragment group {src} -> {dst} id {id} expired")]
    Expired { src: Ipv4Addr, dst: Ipv4Addr, id: u16 },

    /// Fragment offsets do not tile the datagram
    #[error("Inconsistent fragments: {0}")]
    Inconsistent(String),

    /// Too many fragments to fingerprint (more than 255)
    #[error("Fragment group has too many fragments ({count})")]
    TooManyFragments { count: usize },
}

/// AEAD wrapper errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The configured method name is not recognized
    #[error("Unknown encryption method: {0}")]
    UnknownMethod(String),

    /// A non-plain method was configured without a password
    #[error("Encryption method {0} requires a password")]
    MissingPassword(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Encryption failed
    #[error("Encryption failed")]
    Seal,

    /// Authentication tag mismatch or corrupt frame
    #[error("Decryption failed (tag mismatch)")]
    Open,

    /// The frame is shorter than nonce + tag
    #[error("Encrypted frame too short ({len} bytes)")]
    ShortFrame { len: usize },
}

/// FakeTCP handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// A handshake leg was not answered within the per-leg timeout
    #[error("Handshake with {peer} timed out in state {state}")]
    Timeout { peer: Ipv4Addr, state: &'static str },
}

/// NAT table errors
#[derive(Debug, Error)]
pub enum NatError {
    /// The per-protocol port pool is exhausted and nothing is evictable
    #[error("NAT port pool exhausted for {protocol}")]
    Exhausted { protocol: &'static str },

    /// The packet carries no port or identifier to map (e.g. non-echo ICMP)
    #[error("Untranslatable {protocol} packet")]
    Untranslatable { protocol: &'static str },
}
