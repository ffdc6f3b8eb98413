//! Out-of-order STREAM-frame reassembly.
//!
//! Buffered indexed by offset, delivering the contiguous prefix beginning
//! at the next-unread offset, exactly as the Data Model's Reassembly
//! section describes. Grounded on [`crate::range_set::RangeSet`] for gap
//! tracking (the same structure ACK ranges use) plus a small byte buffer,
//! rather than inventing a second interval structure.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::range_set::RangeSet;
use crate::TransportError;

/// Reassembles a single stream's byte sequence (or a CRYPTO level's, which
/// uses the identical reliable-ordered-not-flow-controlled shape).
pub struct Assembler {
    /// Bytes already delivered to the reader.
    read_offset: u64,
    /// Chunks received out of order, keyed by start offset, not yet
    /// contiguous with `read_offset`.
    pending: BTreeMap<u64, Bytes>,
    /// Which byte ranges (relative to the stream, not `pending`) have been
    /// received at all, so duplicate-with-different-content can be
    /// detected and so the contiguous prefix can be located without
    /// rescanning `pending` from the start every time.
    received: RangeSet,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            read_offset: 0,
            pending: BTreeMap::new(),
            received: RangeSet::new(),
        }
    }

    /// Insert a chunk at `offset`. Returns `Err` if bytes already received
    /// at an overlapping position differ from what's now arriving
    /// (`PROTOCOL_VIOLATION` per the Data Model's Reassembly section).
    pub fn insert(&mut self, offset: u64, data: Bytes) -> Result<(), TransportError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        if end <= self.read_offset {
            // Entirely already delivered; nothing to check or store.
            return Ok(());
        }
        let (offset, data) = if offset < self.read_offset {
            let skip = (self.read_offset - offset) as usize;
            (self.read_offset, data.slice_from(skip))
        } else {
            (offset, data)
        };

        for (&existing_off, existing) in self.pending.range(..end) {
            let existing_end = existing_off + existing.len() as u64;
            if existing_end <= offset {
                continue;
            }
            let overlap_start = offset.max(existing_off);
            let overlap_end = end.min(existing_end);
            let a = &data[(overlap_start - offset) as usize..(overlap_end - offset) as usize];
            let b = &existing[(overlap_start - existing_off) as usize
                ..(overlap_end - existing_off) as usize];
            if a != b {
                return Err(TransportError::PROTOCOL_VIOLATION);
            }
        }

        self.received.insert(offset..end);
        self.pending.insert(offset, data);
        Ok(())
    }

    /// Pull out the contiguous prefix available starting at the current
    /// read offset, advancing it.
    pub fn read(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        loop {
            let next = match self.pending.keys().next().cloned() {
                Some(k) if k <= self.read_offset => k,
                _ => break,
            };
            let chunk = self.pending.remove(&next).unwrap();
            let chunk_end = next + chunk.len() as u64;
            if chunk_end <= self.read_offset {
                continue;
            }
            let skip = (self.read_offset - next) as usize;
            out.extend_from_slice(&chunk[skip..]);
            self.read_offset = chunk_end;
        }
        out
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Highest offset referenced by anything buffered or delivered so far,
    /// used for the 4096-byte CRYPTO buffering bound and for per-stream
    /// flow-control accounting of buffered-but-unread bytes.
    pub fn buffered_bytes(&self) -> u64 {
        self.pending.values().map(|b| b.len() as u64).sum()
    }

    /// Highest byte offset ever received (delivered or still buffered),
    /// i.e. the high-water mark flow control should be credited against.
    /// Unlike `buffered_bytes`, this never shrinks as data is read out.
    pub fn highest_received_offset(&self) -> u64 {
        self.received.max().unwrap_or(self.read_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_contiguous_prefix_after_out_of_order_insert() {
        let mut a = Assembler::new();
        a.insert(5, Bytes::from_static(b"world")).unwrap();
        assert_eq!(a.read(), BytesMut::new());
        a.insert(0, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(&a.read()[..], b"helloworld");
        assert_eq!(a.read_offset(), 10);
    }

    #[test]
    fn duplicate_identical_bytes_are_accepted() {
        let mut a = Assembler::new();
        a.insert(0, Bytes::from_static(b"hello")).unwrap();
        assert!(a.insert(2, Bytes::from_static(b"llo")).is_ok());
    }

    #[test]
    fn duplicate_conflicting_bytes_are_rejected() {
        let mut a = Assembler::new();
        a.insert(0, Bytes::from_static(b"hello")).unwrap();
        assert!(a.insert(2, Bytes::from_static(b"LLO")).is_err());
    }

    #[test]
    fn bytes_already_read_are_ignored_on_reinsert() {
        let mut a = Assembler::new();
        a.insert(0, Bytes::from_static(b"hi")).unwrap();
        assert_eq!(&a.read()[..], b"hi");
        assert!(a.insert(0, Bytes::from_static(b"hi")).is_ok());
        assert_eq!(a.read().len(), 0);
    }
}
