//! Capture handles and pump threads
//!
//! A capture handle binds a [`Device`](crate::device::Device) to an open pcap
//! session with an installed BPF program. Reads and writes need separate
//! handles (pcap sessions are single-owner), so a device in use runs a
//! [`PacketSource`] on its receiver thread and a [`PacketSink`] on its sender
//! thread.

pub mod filter;
mod pump;

pub use pump::{spawn_receiver, spawn_sender, SHUTDOWN_DRAIN};

use pcap::{Active, Capture, Linktype};
use tracing::trace;

use crate::device::Device;
use crate::error::CaptureError;
use crate::packet::{parse_frame, CapturedPacket, LinkKind};

/// Snap length: enough for a full-MTU frame plus link header
pub const SNAPLEN: i32 = 1600;

/// Capture read timeout so receiver threads can observe shutdown
const READ_TIMEOUT_MS: i32 = 100;

fn open_handle(device: &Device) -> Result<(Capture<Active>, LinkKind), CaptureError> {
    let cap = Capture::from_device(device.name.as_str())
        .and_then(|cap| {
            cap.promisc(true)
                .snaplen(SNAPLEN)
                .timeout(READ_TIMEOUT_MS)
                .immediate_mode(true)
                .open()
        })
        .map_err(|e| CaptureError::Open {
            device: device.name.clone(),
            reason: e.to_string(),
        })?;

    let kind = match cap.get_datalink() {
        Linktype::ETHERNET => LinkKind::Ethernet,
        Linktype::NULL | Linktype::LOOP => LinkKind::Loopback,
        other => {
            return Err(CaptureError::Open {
                device: device.name.clone(),
                reason: format!("unsupported link type {other:?}"),
            })
        }
    };

    Ok((cap, kind))
}

/// Read side of a device: parsed packets off an installed BPF program
pub struct PacketSource {
    pub device: Device,
    kind: LinkKind,
    cap: Capture<Active>,
}

impl PacketSource {
    /// Open a capture on `device` and install `bpf`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError` if the open or the filter install fails.
    pub fn open(device: &Device, bpf: &str) -> Result<Self, CaptureError> {
        let (mut cap, kind) = open_handle(device)?;
        cap.filter(bpf, true).map_err(|e| CaptureError::Filter {
            device: device.name.clone(),
            reason: e.to_string(),
        })?;
        trace!("Opened {} with filter `{}`", device.name, bpf);
        Ok(Self {
            device: device.clone(),
            kind,
            cap,
        })
    }

    /// Link framing of this handle
    #[must_use]
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// Block for the next parseable packet, up to the read timeout.
    ///
    /// Returns `Ok(None)` on timeout or when the captured frame is not a
    /// usable IPv4 packet (those drop silently per the capture contract).
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Read` on a capture failure; the device is then
    /// considered offline.
    pub fn next(&mut self) -> Result<Option<CapturedPacket>, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => match parse_frame(self.kind, packet.data) {
                Ok(parsed) => Ok(Some(parsed)),
                Err(e) => {
                    trace!("Dropping unparseable frame on {}: {}", self.device.name, e);
                    Ok(None)
                }
            },
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(CaptureError::Read {
                device: self.device.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Write side of a device: raw frame injection
pub struct PacketSink {
    pub device: Device,
    kind: LinkKind,
    cap: Capture<Active>,
}

impl PacketSink {
    /// Open an injection handle on `device`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Open` if the open fails.
    pub fn open(device: &Device) -> Result<Self, CaptureError> {
        let (cap, kind) = open_handle(device)?;
        Ok(Self {
            device: device.clone(),
            kind,
            cap,
        })
    }

    /// Link framing of this handle
    #[must_use]
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// Inject one raw frame.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::Inject` on write failure; the device is then
    /// considered offline.
    pub fn inject(&mut self, frame: &[u8]) -> Result<(), CaptureError> {
        self.cap
            .sendpacket(frame)
            .map_err(|e| CaptureError::Inject {
                device: self.device.name.clone(),
                reason: e.to_string(),
            })
    }
}
