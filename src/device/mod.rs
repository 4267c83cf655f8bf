//! Device enumeration and pairing
//!
//! A [`Device`] knows both its OS interface identity (addresses, MAC,
//! loopback flag) and its capture-library name, so the rest of the tunnel
//! never branches on OS vs capture identity.
//!
//! Pairing walks the OS interface table and the pcap device table and joins
//! them by shared address (loopback pcap device to the single loopback
//! interface). Ambiguous pairs — two pcap devices claiming one interface, or
//! two loopback pcap devices — are excluded via a blacklist that is part of
//! the enumeration result, not process-wide state.

mod gateway;

pub use gateway::{discover_gateway, Gateway, GATEWAY_DISCOVERY_TIMEOUT};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use pnet::datalink;
use pnet::ipnetwork::{IpNetwork, Ipv4Network};
use tracing::{debug, info};

use crate::error::DeviceError;

/// A usable capture device paired with its OS interface identity.
///
/// Immutable after enumeration.
#[derive(Debug, Clone)]
pub struct Device {
    /// Capture-library device name (what pcap opens)
    pub name: String,
    /// OS interface name
    pub alias: String,
    /// Bound addresses with their networks, in enumeration order
    pub ip_addrs: Vec<IpNetwork>,
    /// Link-layer address; absent on loopback
    pub hardware_addr: Option<[u8; 6]>,
    /// Whether this is the loopback device
    pub is_loopback: bool,
}

impl Device {
    /// First bound IPv4 address
    #[must_use]
    pub fn ipv4_addr(&self) -> Option<Ipv4Addr> {
        self.ip_addrs.iter().find_map(|net| match net {
            IpNetwork::V4(v4) => Some(v4.ip()),
            IpNetwork::V6(_) => None,
        })
    }

    /// First bound IPv4 network
    #[must_use]
    pub fn ipv4_net(&self) -> Option<Ipv4Network> {
        self.ip_addrs.iter().find_map(|net| match net {
            IpNetwork::V4(v4) => Some(*v4),
            IpNetwork::V6(_) => None,
        })
    }

    /// Whether any bound network contains `ip`
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ip_addrs.iter().any(|net| net.contains(ip))
    }

    /// Whether `ip` is bound to this device
    #[must_use]
    pub fn has_addr(&self, ip: IpAddr) -> bool {
        self.ip_addrs.iter().any(|net| net.ip() == ip)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(mac) = self.hardware_addr {
            write!(
                f,
                " [{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}]",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            )?;
        }
        write!(f, ": ")?;
        for (i, addr) in self.ip_addrs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", addr.ip())?;
        }
        if self.is_loopback {
            write!(f, " (Loopback)")?;
        }
        Ok(())
    }
}

/// Result of device enumeration: the usable set plus the names excluded by
/// pairing collisions.
#[derive(Debug, Clone)]
pub struct DeviceSet {
    pub devices: Vec<Device>,
    pub blacklist: Vec<String>,
}

impl DeviceSet {
    /// Look up a device by capture name or OS alias
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.name == name || d.alias == name)
    }

    /// The loopback device, if paired
    #[must_use]
    pub fn loopback(&self) -> Option<&Device> {
        self.devices.iter().find(|d| d.is_loopback)
    }

    /// Devices to capture intercepted traffic on: all paired devices when
    /// `names` is empty, otherwise the named subset.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Unknown` if a requested name is not in the set.
    pub fn listen_devices(&self, names: &[String]) -> Result<Vec<Device>, DeviceError> {
        if names.is_empty() {
            if self.devices.is_empty() {
                return Err(DeviceError::NoneFound);
            }
            return Ok(self.devices.clone());
        }
        names
            .iter()
            .map(|name| {
                self.find(name)
                    .cloned()
                    .ok_or_else(|| DeviceError::Unknown { name: name.clone() })
            })
            .collect()
    }

    /// The upstream device: the named one, or the first non-loopback device
    /// whose subnet contains `gateway`, falling back to enumeration order
    /// when no gateway is configured or none contains it.
    ///
    /// The gateway-subnet preference is what breaks the tie on multi-homed
    /// hosts; naming the device explicitly always wins.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if the name is unknown or nothing qualifies.
    pub fn upstream_device(
        &self,
        name: Option<&str>,
        gateway: Option<Ipv4Addr>,
    ) -> Result<&Device, DeviceError> {
        if let Some(name) = name {
            return self
                .find(name)
                .ok_or_else(|| DeviceError::Unknown { name: name.into() });
        }
        if let Some(gateway) = gateway {
            if let Some(device) = self
                .devices
                .iter()
                .find(|d| !d.is_loopback && d.ipv4_addr().is_some() && d.contains(gateway.into()))
            {
                return Ok(device);
            }
            debug!(
                "No device subnet contains gateway {}, falling back to enumeration order",
                gateway
            );
        }
        self.devices
            .iter()
            .find(|d| !d.is_loopback && d.ipv4_addr().is_some())
            .ok_or(DeviceError::NoneFound)
    }
}

/// An OS interface record, as gathered from the platform
#[derive(Debug, Clone)]
struct OsInterface {
    alias: String,
    ips: Vec<IpNetwork>,
    mac: Option<[u8; 6]>,
    is_loopback: bool,
}

/// A capture-library device record
#[derive(Debug, Clone)]
struct CaptureDevice {
    name: String,
    addrs: Vec<IpAddr>,
    is_loopback: bool,
}

/// Enumerate and pair all usable devices.
///
/// # Errors
///
/// Returns `DeviceError::Enumerate` if either enumeration fails.
pub fn find_all_devices() -> Result<DeviceSet, DeviceError> {
    let interfaces: Vec<OsInterface> = datalink::interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() || iface.is_loopback())
        .map(|iface| OsInterface {
            alias: iface.name.clone(),
            ips: iface.ips.clone(),
            mac: iface.mac.map(|m| m.octets()),
            is_loopback: iface.is_loopback(),
        })
        .collect();

    let captures: Vec<CaptureDevice> = pcap::Device::list()
        .map_err(|e| DeviceError::Enumerate(format!("pcap device list: {e}")))?
        .into_iter()
        .map(|dev| CaptureDevice {
            is_loopback: dev.flags.is_loopback(),
            addrs: dev.addresses.iter().map(|a| a.addr).collect(),
            name: dev.name,
        })
        .collect();

    let set = pair_devices(&interfaces, &captures);
    for dev in &set.devices {
        debug!("Paired device {}", dev);
    }
    Ok(set)
}

/// Join OS interfaces and capture devices into [`Device`] records.
///
/// Collisions blacklist every involved capture name; the blacklist travels
/// with the result.
fn pair_devices(interfaces: &[OsInterface], captures: &[CaptureDevice]) -> DeviceSet {
    let mut blacklist: HashSet<String> = HashSet::new();
    // interface index -> capture name already assigned to it
    let mut assigned: HashMap<usize, String> = HashMap::new();
    let mut paired: Vec<(usize, Device)> = Vec::new();

    for cap in captures {
        if blacklist.contains(&cap.name) {
            continue;
        }

        let iface_idx = if cap.is_loopback {
            interfaces.iter().position(|i| i.is_loopback)
        } else if cap.addrs.is_empty() {
            None
        } else {
            cap.addrs.iter().find_map(|addr| {
                interfaces
                    .iter()
                    .position(|i| i.ips.iter().any(|net| net.ip() == *addr))
            })
        };

        let Some(idx) = iface_idx else {
            continue;
        };

        if let Some(previous) = assigned.get(&idx) {
            info!(
                "Device {} pairs to the same interface as {}, these devices will not be used",
                cap.name, previous
            );
            blacklist.insert(cap.name.clone());
            blacklist.insert(previous.clone());
            continue;
        }

        let iface = &interfaces[idx];
        assigned.insert(idx, cap.name.clone());
        paired.push((
            idx,
            Device {
                name: cap.name.clone(),
                alias: iface.alias.clone(),
                ip_addrs: iface.ips.clone(),
                hardware_addr: iface.mac,
                is_loopback: iface.is_loopback,
            },
        ));
    }

    let devices = paired
        .into_iter()
        .filter(|(_, d)| !blacklist.contains(&d.name))
        .map(|(_, d)| d)
        .collect();

    DeviceSet {
        devices,
        blacklist: blacklist.into_iter().collect(),
    }
}
