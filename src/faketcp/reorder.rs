//! Out-of-order segment buffering
//!
//! The tunnel never retransmits, so ordering is local bookkeeping only:
//! segments ahead of the contiguous stream wait in a bounded buffer and
//! flush as the gap fills. Stale and duplicate bytes drop. Positions are
//! tracked as an unwrapped 64-bit stream offset so 32-bit sequence
//! wraparound needs no special cases.

use std::collections::BTreeMap;

use tracing::{trace, warn};

/// Upper bound on buffered out-of-order bytes
pub const REORDER_LIMIT: usize = 2 * 1024 * 1024;

/// Reassembles the peer's byte stream from arbitrarily ordered segments
#[derive(Debug)]
pub struct ReorderBuffer {
    /// Segments ahead of the stream, keyed by unwrapped position
    pending: BTreeMap<u64, Vec<u8>>,
    /// Unwrapped position of the next in-order byte
    next_pos: u64,
    /// Bytes currently buffered in `pending`
    buffered: usize,
    limit: usize,
}

impl ReorderBuffer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            next_pos: 0,
            buffered: 0,
            limit,
        }
    }

    /// The sequence number the peer should send next; used as our outbound
    /// acknowledgment value.
    #[must_use]
    pub fn next_seq(&self) -> u32 {
        self.next_pos as u32
    }

    /// Total contiguous bytes delivered so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.next_pos
    }

    /// Bytes waiting for a gap to fill
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Offer a received segment. Returns the bytes that became contiguous,
    /// which may be empty (buffered ahead, duplicate, or overflow drop).
    pub fn offer(&mut self, seq: u32, data: Vec<u8>) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }

        let expected = self.next_pos as u32;
        let offset = seq.wrapping_sub(expected);

        // Behind the stream: a duplicate, possibly with a fresh tail.
        if offset >= 0x8000_0000 {
            let behind = expected.wrapping_sub(seq) as usize;
            if behind >= data.len() {
                trace!("Dropping stale segment at seq {}", seq);
                return Vec::new();
            }
            let fresh = data[behind..].to_vec();
            return self.offer(expected, fresh);
        }

        let offset = offset as usize;
        if offset > self.limit {
            warn!(
                "Dropping segment {} bytes ahead of the {} byte reorder window",
                offset, self.limit
            );
            return Vec::new();
        }
        if offset > 0 && self.buffered + data.len() > self.limit {
            warn!(
                "Reorder buffer full ({} bytes), dropping segment at seq {}",
                self.buffered, seq
            );
            return Vec::new();
        }

        let pos = self.next_pos + offset as u64;
        let len = data.len();
        if let Some(old) = self.pending.insert(pos, data) {
            self.buffered -= old.len();
        }
        self.buffered += len;

        self.drain()
    }

    /// Pull every byte that is now contiguous out of the pending map
    fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            if *entry.key() > self.next_pos {
                break;
            }
            let (pos, data) = entry.remove_entry();
            self.buffered -= data.len();
            let skip = (self.next_pos - pos) as usize;
            if skip >= data.len() {
                continue;
            }
            out.extend_from_slice(&data[skip..]);
            self.next_pos += (data.len() - skip) as u64;
        }
        out
    }

    /// Forget everything; used when the endpoint resets
    pub fn reset(&mut self) {
        self.pending.clear();
        self.next_pos = 0;
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery() {
        let mut buf = ReorderBuffer::new(REORDER_LIMIT);
        assert_eq!(buf.offer(0, b"abc".to_vec()), b"abc");
        assert_eq!(buf.offer(3, b"def".to_vec()), b"def");
        assert_eq!(buf.next_seq(), 6);
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_out_of_order_flushes_when_gap_fills() {
        let mut buf = ReorderBuffer::new(REORDER_LIMIT);
        assert!(buf.offer(3, b"def".to_vec()).is_empty());
        assert_eq!(buf.buffered(), 3);
        assert_eq!(buf.offer(0, b"abc".to_vec()), b"abcdef");
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut buf = ReorderBuffer::new(REORDER_LIMIT);
        assert_eq!(buf.offer(0, b"abc".to_vec()), b"abc");
        assert!(buf.offer(0, b"abc".to_vec()).is_empty());
        assert_eq!(buf.next_seq(), 3);
    }

    #[test]
    fn test_partial_duplicate_delivers_tail() {
        let mut buf = ReorderBuffer::new(REORDER_LIMIT);
        assert_eq!(buf.offer(0, b"abc".to_vec()), b"abc");
        // Overlapping retransmit-style segment: old "bc" plus new "de"
        assert_eq!(buf.offer(1, b"bcde".to_vec()), b"de");
        assert_eq!(buf.next_seq(), 5);
    }

    #[test]
    fn test_window_overflow_dropped() {
        let mut buf = ReorderBuffer::new(16);
        assert!(buf.offer(64, b"far ahead".to_vec()).is_empty());
        assert_eq!(buf.buffered(), 0);
        assert!(buf.offer(4, vec![0u8; 16]).is_empty());
        assert_eq!(buf.buffered(), 16);
        // Full: further out-of-order data drops
        assert!(buf.offer(30, b"x".to_vec()).is_empty());
        assert_eq!(buf.buffered(), 16);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut buf = ReorderBuffer::new(REORDER_LIMIT);
        // Force next_pos near the 32-bit boundary
        buf.next_pos = u64::from(u32::MAX) - 1;
        let start = buf.next_seq();
        assert_eq!(buf.offer(start, b"ab".to_vec()), b"ab");
        // Sequence wrapped past zero
        assert_eq!(buf.next_seq(), 0);
        assert_eq!(buf.offer(0, b"cd".to_vec()), b"cd");
        assert_eq!(buf.next_seq(), 2);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut buf = ReorderBuffer::new(REORDER_LIMIT);
        buf.offer(5, b"ahead".to_vec());
        buf.reset();
        assert_eq!(buf.buffered(), 0);
        assert_eq!(buf.next_seq(), 0);
        assert_eq!(buf.offer(0, b"go".to_vec()), b"go");
    }
}
