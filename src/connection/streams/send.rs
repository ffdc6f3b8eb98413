//! Send-side stream data queuing: buffers caller-written bytes until the
//! frame engine can fit them (and their retransmissions) into a packet,
//! respecting the peer-advertised per-stream flow-control limit.

use std::collections::VecDeque;

use bytes::Bytes;

/// One contiguous unacknowledged range of written-but-maybe-lost bytes,
/// queued for the frame engine to (re)send. `offset` is absolute within
/// the stream.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub offset: u64,
    pub data: Bytes,
}

/// Outgoing byte queue for one stream's send half. Acts purely as a
/// buffer between `write()` and the frame engine; `SendState` in
/// [`super::state`] tracks the stream's lifecycle, this only tracks bytes.
pub struct SendBuffer {
    queue: VecDeque<PendingChunk>,
    /// Offset of the first byte still in `queue` (bytes before this have
    /// been acknowledged and dropped).
    unacked_offset: u64,
    /// Offset one past the last byte ever written.
    write_offset: u64,
}

impl SendBuffer {
    pub fn new() -> Self {
        SendBuffer {
            queue: VecDeque::new(),
            unacked_offset: 0,
            write_offset: 0,
        }
    }

    pub fn write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let offset = self.write_offset;
        self.write_offset += data.len() as u64;
        self.queue.push_back(PendingChunk { offset, data });
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn unacked_offset(&self) -> u64 {
        self.unacked_offset
    }

    /// Bytes written but not yet acknowledged, the quantity flow control
    /// (and MAX_DATA/MAX_STREAM_DATA bookkeeping) tracks against the
    /// peer's advertised limit.
    pub fn unacked_len(&self) -> u64 {
        self.write_offset - self.unacked_offset
    }

    /// Take up to `max_len` bytes starting at the current front of the
    /// queue, for encoding into a STREAM frame. Does not remove them from
    /// the queue: removal only happens on acknowledgement, since the data
    /// must remain available for retransmission on loss.
    pub fn peek(&self, max_len: usize) -> Option<PendingChunk> {
        let chunk = self.queue.front()?;
        if chunk.data.len() <= max_len {
            Some(chunk.clone())
        } else {
            Some(PendingChunk {
                offset: chunk.offset,
                data: chunk.data.slice_to(max_len),
            })
        }
    }

    /// Acknowledge bytes `[unacked_offset, up_to)`; `up_to` must not
    /// exceed anything actually written.
    pub fn ack(&mut self, up_to: u64) {
        if up_to <= self.unacked_offset {
            return;
        }
        self.unacked_offset = up_to.min(self.write_offset);
        while let Some(front) = self.queue.front() {
            let front_end = front.offset + front.data.len() as u64;
            if front_end <= self.unacked_offset {
                self.queue.pop_front();
            } else if front.offset < self.unacked_offset {
                let skip = (self.unacked_offset - front.offset) as usize;
                let offset = self.unacked_offset;
                let data = front.data.slice_from(skip);
                self.queue.pop_front();
                self.queue.push_front(PendingChunk { offset, data });
                break;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_drops_fully_covered_chunks() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(b"hello"));
        buf.write(Bytes::from_static(b"world"));
        buf.ack(5);
        assert_eq!(buf.unacked_offset(), 5);
        let chunk = buf.peek(100).unwrap();
        assert_eq!(chunk.offset, 5);
        assert_eq!(&chunk.data[..], b"world");
    }

    #[test]
    fn ack_partially_covering_a_chunk_trims_it() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(b"hello"));
        buf.ack(2);
        let chunk = buf.peek(100).unwrap();
        assert_eq!(chunk.offset, 2);
        assert_eq!(&chunk.data[..], b"llo");
    }
}
