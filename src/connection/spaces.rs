//! Per-packet-number-space state: the Initial/Handshake/Application triple
//! the Data Model's "Packet Number Space" entry describes, each independent
//! for packet numbering, the sent-packet table, ECN counts, and ACK
//! generation.
//!
//! Grounded on the teacher's flat `Connection` fields (`sent_packets`,
//! `largest_acked_packet`, `handshake_pending`) split out one copy per
//! space, since the teacher's single-space draft predates coalesced
//! Initial/Handshake/1-RTT packet spaces.

use std::collections::BTreeMap;

use crate::frame::EcnCounts;
use crate::range_set::RangeSet;
use crate::recovery::{LossDetector, SentPacket};

/// Which of the three independent packet-number spaces a packet belongs
/// to; 0-RTT and 1-RTT share `Application`, per the Data Model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceId {
    Initial,
    Handshake,
    Application,
}

impl SpaceId {
    pub fn iter() -> impl Iterator<Item = SpaceId> {
        [SpaceId::Initial, SpaceId::Handshake, SpaceId::Application]
            .iter()
            .cloned()
    }
}

/// Everything this connection tracks for one packet-number space, where
/// `T` is the caller's retransmission-token type for sent packets (see
/// [`crate::recovery::SentPacket`]).
pub struct PacketSpace<T> {
    pub next_packet_number: u64,
    pub largest_received: Option<u64>,
    pub sent_packets: BTreeMap<u64, SentPacket<T>>,
    pub loss: LossDetector,
    pub ecn: EcnCounts,

    /// Packet numbers received but not yet acknowledged, for ACK frame
    /// generation.
    pub pending_acks: RangeSet,
    /// Number of ack-eliciting packets received since the last ACK was
    /// sent, for the "every second packet" immediate-ack heuristic.
    pub ack_eliciting_since_last_ack: u32,
    /// Set when an out-of-order or ECN-CE-marked packet arrives: forces an
    /// immediate ACK regardless of the every-second-packet counter.
    pub ack_immediately: bool,
    /// Deadline (µs) by which a pending ACK must be sent even if neither
    /// immediate condition has fired, bounded by `max_ack_delay`.
    pub ack_deadline: Option<u64>,

    /// Count of ack-eliciting packets sent in this space while ECN
    /// marking was believed active, i.e. assumed ECT(0)-marked by the
    /// caller's socket. Used to validate the peer's reported ECN counts
    /// on ACK per §4.6 ECN validation.
    pub ect0_sent: u64,
    /// Most recent ECN counts the peer has reported seeing from us in an
    /// ACK frame, for detecting demotion/under-reporting on the next one.
    pub peer_ecn_counts: Option<EcnCounts>,
}

impl<T> PacketSpace<T> {
    pub fn new() -> Self {
        PacketSpace {
            next_packet_number: 0,
            largest_received: None,
            sent_packets: BTreeMap::new(),
            loss: LossDetector::new(),
            ecn: EcnCounts::default(),
            pending_acks: RangeSet::new(),
            ack_eliciting_since_last_ack: 0,
            ack_immediately: false,
            ack_deadline: None,
            ect0_sent: 0,
            peer_ecn_counts: None,
        }
    }

    pub fn alloc_packet_number(&mut self) -> u64 {
        let n = self.next_packet_number;
        self.next_packet_number += 1;
        n
    }

    /// Record receipt of packet `pn`, returning whether an ACK should be
    /// sent immediately (per the resolved ACK-frequency heuristic: every
    /// second ack-eliciting packet, or immediately on out-of-order/CE
    /// receipt).
    pub fn on_packet_received(
        &mut self,
        pn: u64,
        now: u64,
        ack_eliciting: bool,
        max_ack_delay: u64,
    ) -> bool {
        let out_of_order = match self.largest_received {
            Some(largest) => pn < largest,
            None => false,
        };
        self.largest_received = Some(match self.largest_received {
            Some(largest) => largest.max(pn),
            None => pn,
        });
        self.pending_acks.insert(pn..pn + 1);

        if !ack_eliciting {
            return false;
        }
        if out_of_order {
            self.ack_immediately = true;
        }
        self.ack_eliciting_since_last_ack += 1;
        if self.ack_eliciting_since_last_ack >= 2 {
            self.ack_immediately = true;
        }
        if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + max_ack_delay);
        }
        self.ack_immediately
    }

    pub fn on_ecn_ce_received(&mut self) {
        self.ack_immediately = true;
    }

    /// Called once an ACK frame covering `pending_acks` has actually been
    /// sent.
    pub fn on_ack_sent(&mut self) {
        self.ack_eliciting_since_last_ack = 0;
        self.ack_immediately = false;
        self.ack_deadline = None;
    }

    pub fn ack_pending(&self, now: u64) -> bool {
        self.ack_immediately
            || self.ack_deadline.map_or(false, |deadline| now >= deadline)
    }
}

impl<T> Default for PacketSpace<T> {
    fn default() -> Self {
        PacketSpace::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_ack_eliciting_packet_forces_immediate_ack() {
        let mut space: PacketSpace<()> = PacketSpace::new();
        assert!(!space.on_packet_received(0, 0, true, 25_000));
        assert!(space.on_packet_received(1, 0, true, 25_000));
    }

    #[test]
    fn out_of_order_packet_forces_immediate_ack() {
        let mut space: PacketSpace<()> = PacketSpace::new();
        space.on_packet_received(5, 0, true, 25_000);
        assert!(space.on_packet_received(2, 0, true, 25_000));
    }

    #[test]
    fn ack_sent_resets_pending_state() {
        let mut space: PacketSpace<()> = PacketSpace::new();
        space.on_packet_received(1, 0, true, 25_000);
        space.on_packet_received(2, 0, true, 25_000);
        assert!(space.ack_pending(0));
        space.on_ack_sent();
        assert!(!space.ack_pending(0));
    }
}
