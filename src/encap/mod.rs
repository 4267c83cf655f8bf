//! Encapsulation frame codec
//!
//! Each intercepted IP datagram travels the tunnel as one frame:
//!
//! ```text
//! +--------+--------+-------+-------+----------------+-----------------+
//! | len:2  | id:2   | flags | count | offsets: 2 * N | original datagram |
//! +--------+--------+-------+-------+----------------+-----------------+
//! ```
//!
//! `len` (big-endian) counts everything after itself, so frames are
//! self-delimiting in the FakeTCP byte stream and several may share one
//! segment. The fingerprint fields let the peer restore the original IPv4 ID
//! and fragment boundaries. In encrypted mode this whole frame (including
//! its length) is the AEAD plaintext and an outer 2-byte length wraps the
//! `nonce ‖ ciphertext ‖ tag` instead.

use crate::error::PacketError;
use crate::fragment::FragmentFingerprint;

/// Bytes of the length prefix
pub const LENGTH_PREFIX: usize = 2;

/// Largest body a frame can carry
pub const MAX_BODY: usize = u16::MAX as usize;

/// Fixed fingerprint header bytes after the length prefix
const FINGERPRINT_HEADER: usize = 4;

/// Shortest possible IPv4 datagram
const MIN_DATAGRAM: usize = 20;

const FLAG_DONT_FRAGMENT: u8 = 0b0000_0001;
const FLAG_LAST_MF: u8 = 0b0000_0010;
const FLAG_FRAGMENTED: u8 = 0b0000_0100;

/// A decoded encapsulation frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapFrame {
    pub fingerprint: FragmentFingerprint,
    pub datagram: Vec<u8>,
}

/// Encode a datagram and its fingerprint into a full frame, length prefix
/// included.
///
/// # Errors
///
/// Returns `PacketError::Oversize` when the body does not fit the 2-byte
/// length, and `PacketError::Build` on a fingerprint with more offsets than
/// the count byte can carry.
pub fn encode(fp: &FragmentFingerprint, datagram: &[u8]) -> Result<Vec<u8>, PacketError> {
    let count = fp.offsets.len();
    if count > u8::MAX as usize {
        return Err(PacketError::Build(format!(
            "fingerprint carries {count} offsets"
        )));
    }
    let body_len = FINGERPRINT_HEADER + 2 * count + datagram.len();
    if body_len > MAX_BODY {
        return Err(PacketError::Oversize { len: body_len });
    }

    let mut flags = 0u8;
    if fp.dont_fragment {
        flags |= FLAG_DONT_FRAGMENT;
    }
    if fp.last_mf {
        flags |= FLAG_LAST_MF;
    }
    if fp.is_fragmented() {
        flags |= FLAG_FRAGMENTED;
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX + body_len);
    buf.extend_from_slice(&(body_len as u16).to_be_bytes());
    buf.extend_from_slice(&fp.id.to_be_bytes());
    buf.push(flags);
    buf.push(count as u8);
    for offset in &fp.offsets {
        buf.extend_from_slice(&offset.to_be_bytes());
    }
    buf.extend_from_slice(datagram);
    Ok(buf)
}

/// Decode a frame body (the bytes after the length prefix).
///
/// # Errors
///
/// Returns `PacketError::BadFrame` on truncation or inconsistent fields.
pub fn decode(body: &[u8]) -> Result<EncapFrame, PacketError> {
    if body.len() < FINGERPRINT_HEADER {
        return Err(PacketError::BadFrame(format!(
            "body of {} bytes is shorter than the fingerprint header",
            body.len()
        )));
    }
    let id = u16::from_be_bytes([body[0], body[1]]);
    let flags = body[2];
    let count = body[3] as usize;

    let offsets_end = FINGERPRINT_HEADER + 2 * count;
    if body.len() < offsets_end {
        return Err(PacketError::BadFrame(format!(
            "{count} offsets do not fit in {} bytes",
            body.len()
        )));
    }
    let fragmented = flags & FLAG_FRAGMENTED != 0;
    if fragmented == (count == 0) {
        return Err(PacketError::BadFrame(
            "fragment flag disagrees with offset count".into(),
        ));
    }

    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        let at = FINGERPRINT_HEADER + 2 * i;
        offsets.push(u16::from_be_bytes([body[at], body[at + 1]]));
    }

    let datagram = &body[offsets_end..];
    if datagram.len() < MIN_DATAGRAM {
        return Err(PacketError::BadFrame(format!(
            "datagram of {} bytes is shorter than an IPv4 header",
            datagram.len()
        )));
    }

    Ok(EncapFrame {
        fingerprint: FragmentFingerprint {
            id,
            dont_fragment: flags & FLAG_DONT_FRAGMENT != 0,
            last_mf: flags & FLAG_LAST_MF != 0,
            offsets,
        },
        datagram: datagram.to_vec(),
    })
}

/// Reassembles frames from the ordered tunnel byte stream.
///
/// Frames may split across FakeTCP segments or share one; the reader buffers
/// bytes until a whole body is available.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append ordered stream bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame body, if one is buffered
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < LENGTH_PREFIX {
            return None;
        }
        let body_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < LENGTH_PREFIX + body_len {
            return None;
        }
        let body = self.buf[LENGTH_PREFIX..LENGTH_PREFIX + body_len].to_vec();
        self.buf.drain(..LENGTH_PREFIX + body_len);
        Some(body)
    }

    /// Bytes waiting for a complete frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_datagram() -> Vec<u8> {
        let mut datagram = vec![0x45u8; MIN_DATAGRAM];
        datagram.extend_from_slice(b"payload bytes");
        datagram
    }

    #[test]
    fn test_round_trip_unfragmented() {
        let fp = FragmentFingerprint::unfragmented(0x1234, true);
        let datagram = sample_datagram();
        let frame = encode(&fp, &datagram).unwrap();

        assert_eq!(
            u16::from_be_bytes([frame[0], frame[1]]) as usize,
            frame.len() - LENGTH_PREFIX
        );

        let decoded = decode(&frame[LENGTH_PREFIX..]).unwrap();
        assert_eq!(decoded.fingerprint, fp);
        assert_eq!(decoded.datagram, datagram);
    }

    #[test]
    fn test_round_trip_fragmented() {
        let fp = FragmentFingerprint {
            id: 0xbeef,
            dont_fragment: false,
            last_mf: false,
            offsets: vec![0, 185],
        };
        let datagram = sample_datagram();
        let frame = encode(&fp, &datagram).unwrap();
        let decoded = decode(&frame[LENGTH_PREFIX..]).unwrap();
        assert_eq!(decoded.fingerprint, fp);
        assert_eq!(decoded.datagram, datagram);
    }

    #[test]
    fn test_oversize_rejected() {
        let fp = FragmentFingerprint::unfragmented(1, false);
        let datagram = vec![0u8; MAX_BODY];
        assert!(matches!(
            encode(&fp, &datagram),
            Err(PacketError::Oversize { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_offsets() {
        let fp = FragmentFingerprint {
            id: 5,
            dont_fragment: false,
            last_mf: false,
            offsets: vec![0, 64],
        };
        let frame = encode(&fp, &sample_datagram()).unwrap();
        // Clip inside the offset list
        assert!(decode(&frame[LENGTH_PREFIX..LENGTH_PREFIX + 6]).is_err());
    }

    #[test]
    fn test_decode_rejects_flag_mismatch() {
        let fp = FragmentFingerprint::unfragmented(5, false);
        let mut frame = encode(&fp, &sample_datagram()).unwrap();
        // Claim fragmented with zero offsets
        frame[4] |= FLAG_FRAGMENTED;
        assert!(decode(&frame[LENGTH_PREFIX..]).is_err());
    }

    #[test]
    fn test_reader_reassembles_split_frames() {
        let fp = FragmentFingerprint::unfragmented(9, false);
        let frame = encode(&fp, &sample_datagram()).unwrap();

        let mut reader = FrameReader::new();
        reader.push(&frame[..5]);
        assert!(reader.next_frame().is_none());
        reader.push(&frame[5..]);
        let body = reader.next_frame().unwrap();
        assert_eq!(decode(&body).unwrap().fingerprint, fp);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_splits_shared_segment() {
        let fp1 = FragmentFingerprint::unfragmented(1, false);
        let fp2 = FragmentFingerprint::unfragmented(2, true);
        let mut stream = encode(&fp1, &sample_datagram()).unwrap();
        stream.extend_from_slice(&encode(&fp2, &sample_datagram()).unwrap());

        let mut reader = FrameReader::new();
        reader.push(&stream);
        let first = decode(&reader.next_frame().unwrap()).unwrap();
        let second = decode(&reader.next_frame().unwrap()).unwrap();
        assert!(reader.next_frame().is_none());
        assert_eq!(first.fingerprint.id, 1);
        assert_eq!(second.fingerprint.id, 2);
        assert!(second.fingerprint.dont_fragment);
    }
}
