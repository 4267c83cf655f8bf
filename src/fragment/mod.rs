//! IPv4 reassembly and refragmentation
//!
//! Fragments group by (src, dst, protocol, ID) in a sharded concurrent map.
//! Reassembly follows RFC 791; overlapping bytes go to the later-arriving
//! fragment, matching common kernel behavior. Incomplete groups expire after
//! [`REASSEMBLY_TIMEOUT`].
//!
//! Every reassembled datagram carries a [`FragmentFingerprint`] recording the
//! original ID and fragment boundaries, so the peer's emit side can
//! [`refragment`] into exactly the slices the source produced. MTU artifacts
//! therefore never leak through the tunnel: the destination sees the same
//! IDs and offsets the source sent.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use etherparse::{IpFragOffset, Ipv4Header};
use tracing::{debug, warn};

use crate::error::PacketError;
use crate::packet::{finalize_datagram, CapturedPacket, Transport};

/// How long an incomplete fragment group may live
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Fingerprints encode the fragment count in one byte
pub const MAX_FRAGMENTS: usize = 255;

/// Metadata restoring a datagram's original on-wire fragmentation.
///
/// `offsets` lists the original fragment offsets in 8-byte units, ascending;
/// an empty list means the datagram was never fragmented. `last_mf` records
/// the more-fragments bit observed on the final fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentFingerprint {
    pub id: u16,
    pub dont_fragment: bool,
    pub last_mf: bool,
    pub offsets: Vec<u16>,
}

impl FragmentFingerprint {
    /// Fingerprint of a datagram that arrived whole
    #[must_use]
    pub fn unfragmented(id: u16, dont_fragment: bool) -> Self {
        Self {
            id,
            dont_fragment,
            last_mf: false,
            offsets: Vec::new(),
        }
    }

    /// Whether the original datagram arrived in fragments
    #[must_use]
    pub fn is_fragmented(&self) -> bool {
        !self.offsets.is_empty()
    }
}

/// Reassembly group key per RFC 791
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub id: u16,
}

#[derive(Debug)]
struct Fragment {
    offset_units: u16,
    more_fragments: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct FragmentGroup {
    // Arrival order; later fragments win overlaps
    fragments: Vec<Fragment>,
    dont_fragment: bool,
    created: Instant,
}

/// Concurrent reassembly queue
pub struct FragmentQueue {
    groups: DashMap<FragmentKey, FragmentGroup>,
    timeout: Duration,
}

impl FragmentQueue {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            timeout,
        }
    }

    /// Number of live (incomplete) groups
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Feed one captured packet through reassembly.
    ///
    /// Unfragmented packets pass straight through with an unfragmented
    /// fingerprint. Fragments accumulate until their group completes, at
    /// which point the rebuilt datagram and its fingerprint are returned and
    /// the group is destroyed.
    pub fn process(&self, packet: &CapturedPacket) -> Option<(Vec<u8>, FragmentFingerprint)> {
        if !packet.is_fragment() {
            let fp = FragmentFingerprint::unfragmented(
                packet.ipv4.identification,
                packet.ipv4.dont_fragment,
            );
            return Some((packet.datagram.clone(), fp));
        }

        let key = FragmentKey {
            src: packet.src_ip(),
            dst: packet.dst_ip(),
            protocol: packet.ipv4.protocol.0,
            id: packet.ipv4.identification,
        };

        {
            let mut group = self.groups.entry(key).or_insert_with(|| FragmentGroup {
                fragments: Vec::new(),
                dont_fragment: packet.ipv4.dont_fragment,
                created: Instant::now(),
            });
            if group.fragments.len() >= MAX_FRAGMENTS {
                drop(group);
                warn!(
                    "Fragment group {} -> {} id {} exceeds {} fragments, dropping",
                    key.src, key.dst, key.id, MAX_FRAGMENTS
                );
                self.groups.remove(&key);
                return None;
            }
            group.fragments.push(Fragment {
                offset_units: packet.ipv4.fragment_offset.value(),
                more_fragments: packet.ipv4.more_fragments,
                data: packet.ip_payload().to_vec(),
            });

            let Some((payload, offsets, last_mf)) = try_reassemble(&group.fragments) else {
                return None;
            };
            let dont_fragment = group.dont_fragment;
            drop(group);
            self.groups.remove(&key);

            let fp = FragmentFingerprint {
                id: key.id,
                dont_fragment,
                last_mf,
                offsets,
            };

            // Rebuild the whole datagram with the original ID kept; a fresh
            // header starts with clear fragment fields.
            let mut ipv4 = Ipv4Header::new(
                0,
                packet.ipv4.time_to_live,
                packet.ipv4.protocol,
                packet.ipv4.source,
                packet.ipv4.destination,
            )
            .ok()?;
            ipv4.identification = key.id;
            ipv4.dont_fragment = dont_fragment;
            match finalize_datagram(&ipv4, &Transport::None, &payload) {
                Ok(datagram) => {
                    debug!(
                        "Reassembled {} -> {} id {} from {} fragments ({} bytes)",
                        key.src,
                        key.dst,
                        key.id,
                        fp.offsets.len(),
                        payload.len()
                    );
                    Some((datagram, fp))
                }
                Err(e) => {
                    warn!(
                        "Reassembled datagram {} -> {} id {} unusable: {}",
                        key.src, key.dst, key.id, e
                    );
                    None
                }
            }
        }
    }

    /// Drop groups older than the reassembly timeout. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let timeout = self.timeout;
        let before = self.groups.len();
        self.groups.retain(|key, group| {
            let keep = group.created.elapsed() < timeout;
            if !keep {
                warn!(
                    "Fragment group {} -> {} id {} expired with {} fragments",
                    key.src,
                    key.dst,
                    key.id,
                    group.fragments.len()
                );
            }
            keep
        });
        before - self.groups.len()
    }
}

/// Attempt reassembly over the fragments seen so far.
///
/// Returns the reassembled IP payload, the contributing offsets (ascending,
/// deduplicated) and the final fragment's MF bit.
fn try_reassemble(fragments: &[Fragment]) -> Option<(Vec<u8>, Vec<u16>, bool)> {
    // The terminal fragment is the latest-arriving one without MF.
    let last = fragments.iter().rev().find(|f| !f.more_fragments)?;
    let total = last.offset_units as usize * 8 + last.data.len();

    // Coverage check: merged intervals must tile [0, total).
    let mut intervals: Vec<(usize, usize)> = fragments
        .iter()
        .map(|f| {
            let start = f.offset_units as usize * 8;
            (start, (start + f.data.len()).min(total))
        })
        .filter(|(start, end)| start < end)
        .collect();
    intervals.sort_unstable();
    let mut covered = 0usize;
    for (start, end) in &intervals {
        if *start > covered {
            return None;
        }
        covered = covered.max(*end);
    }
    if covered < total {
        return None;
    }

    let mut payload = vec![0u8; total];
    let mut offsets: Vec<u16> = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let start = fragment.offset_units as usize * 8;
        if start >= total {
            continue;
        }
        let end = (start + fragment.data.len()).min(total);
        payload[start..end].copy_from_slice(&fragment.data[..end - start]);
        offsets.push(fragment.offset_units);
    }
    offsets.sort_unstable();
    offsets.dedup();

    Some((payload, offsets, last.more_fragments))
}

/// Slice a datagram back into its original fragments.
///
/// The datagram's (possibly rewritten) header fields are kept except for the
/// identification and fragment fields, which restore from the fingerprint.
/// Unfragmented fingerprints yield a single datagram with ID and DF restored.
///
/// # Errors
///
/// Returns `PacketError` when the fingerprint's offsets do not fit the
/// datagram.
pub fn refragment(datagram: &[u8], fp: &FragmentFingerprint) -> Result<Vec<Vec<u8>>, PacketError> {
    let (header, _) =
        Ipv4Header::from_slice(datagram).map_err(|e| PacketError::Malformed(e.to_string()))?;
    let payload = &datagram[header.header_len()..];

    if !fp.is_fragmented() {
        let mut out = rebuild_header(&header, payload.len(), fp.id, fp.dont_fragment, false, 0)?;
        out.extend_from_slice(payload);
        return Ok(vec![out]);
    }

    let mut out = Vec::with_capacity(fp.offsets.len());
    for (i, &offset_units) in fp.offsets.iter().enumerate() {
        let start = offset_units as usize * 8;
        let end = match fp.offsets.get(i + 1) {
            Some(&next) => next as usize * 8,
            None => payload.len(),
        };
        if start >= end || end > payload.len() {
            return Err(PacketError::BadFrame(format!(
                "fragment offset {offset_units} outside datagram of {} bytes",
                payload.len()
            )));
        }
        let more_fragments = i + 1 < fp.offsets.len() || fp.last_mf;
        let slice = &payload[start..end];
        let mut fragment = rebuild_header(
            &header,
            slice.len(),
            fp.id,
            fp.dont_fragment,
            more_fragments,
            offset_units,
        )?;
        fragment.extend_from_slice(slice);
        out.push(fragment);
    }
    Ok(out)
}

fn rebuild_header(
    template: &Ipv4Header,
    payload_len: usize,
    id: u16,
    dont_fragment: bool,
    more_fragments: bool,
    offset_units: u16,
) -> Result<Vec<u8>, PacketError> {
    let payload_len =
        u16::try_from(payload_len).map_err(|_| PacketError::Oversize { len: payload_len })?;
    let mut header = Ipv4Header::new(
        payload_len,
        template.time_to_live,
        template.protocol,
        template.source,
        template.destination,
    )
    .map_err(|e| PacketError::Build(e.to_string()))?;
    header.identification = id;
    header.dont_fragment = dont_fragment;
    header.more_fragments = more_fragments;
    header.fragment_offset =
        IpFragOffset::try_new(offset_units).map_err(|e| PacketError::Build(e.to_string()))?;
    header.header_checksum = header.calc_header_checksum();

    let mut buf = Vec::with_capacity(header.header_len() + payload_len as usize);
    header
        .write(&mut buf)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    Ok(buf)
}
