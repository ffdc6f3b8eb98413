//! C6 Recovery: RTT estimation, packet/time-threshold loss detection, probe
//! timeouts, and persistent-congestion detection, per §4.6. The sent-packet
//! table itself is owned by the caller (a connection's per-space state, see
//! `connection::spaces`) since its records are retransmission tokens the
//! frame engine owns; this module only implements the algorithms that walk
//! that table.
//!
//! Grounded on the teacher's `Connection` RTT/loss-detection fields and
//! methods (`update_rtt`, `detect_lost_packets`, `set_loss_detection_alarm`),
//! generalized from its TLP/RTO retransmission scheme to the probe-timeout
//! model this protocol's recovery section specifies.

pub mod congestion;
pub mod pacing;

use std::cmp;
use std::collections::BTreeMap;

use crate::config::TransportConfig;

/// An outstanding, not-yet-acknowledged packet. `T` is whatever
/// retransmission token the caller needs to recover frames from on loss
/// (e.g. a list of frames, or references into connection-level state).
#[derive(Debug, Clone)]
pub struct SentPacket<T> {
    pub time_sent: u64,
    pub size: u64,
    pub ack_eliciting: bool,
    /// Counts toward bytes-in-flight; false for packets containing only
    /// ACK/PADDING that nonetheless need a record (e.g. none currently).
    pub in_flight: bool,
    pub data: T,
}

impl<T> SentPacket<T> {
    pub fn new(time_sent: u64, size: u64, ack_eliciting: bool, data: T) -> Self {
        SentPacket {
            time_sent,
            size,
            ack_eliciting,
            in_flight: ack_eliciting,
            data,
        }
    }
}

/// Initial RTT estimate before any sample exists, per §4.6: 333ms, yielding
/// a 1s initial PTO.
pub const INITIAL_RTT_MICROS: u64 = 333_000;

/// Smoothed/variance RTT estimator, updated per ACK per the RFC6298-style
/// formulas the spec's RTT-estimation section specifies.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest_rtt: u64,
    min_rtt: u64,
    smoothed_rtt: u64,
    rttvar: u64,
    first_sample_taken: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            latest_rtt: INITIAL_RTT_MICROS,
            min_rtt: u64::max_value(),
            smoothed_rtt: INITIAL_RTT_MICROS,
            rttvar: INITIAL_RTT_MICROS / 2,
            first_sample_taken: false,
        }
    }

    /// `ack_delay` is the peer-reported delay, already bounded by the
    /// peer's `max_ack_delay` (0 for Initial/Handshake spaces) by the
    /// caller before this is invoked.
    pub fn update(&mut self, ack_delay: u64, rtt_sample: u64) {
        self.latest_rtt = rtt_sample;
        self.min_rtt = cmp::min(self.min_rtt, rtt_sample);
        let adjusted = if rtt_sample > self.min_rtt + ack_delay {
            rtt_sample - ack_delay
        } else {
            rtt_sample
        };
        if !self.first_sample_taken {
            self.first_sample_taken = true;
            self.smoothed_rtt = adjusted;
            self.rttvar = adjusted / 2;
        } else {
            let var_sample = (self.smoothed_rtt as i64 - adjusted as i64).abs() as u64;
            self.rttvar = (3 * self.rttvar + var_sample) / 4;
            self.smoothed_rtt = (7 * self.smoothed_rtt + adjusted) / 8;
        }
    }

    pub fn latest(&self) -> u64 {
        self.latest_rtt
    }
    pub fn min(&self) -> u64 {
        self.min_rtt
    }
    pub fn smoothed(&self) -> u64 {
        self.smoothed_rtt
    }
    pub fn var(&self) -> u64 {
        self.rttvar
    }

    /// PTO duration for a space, `max_ack_delay` is 0 for Initial/Handshake.
    pub fn pto_base(&self, max_ack_delay: u64) -> u64 {
        self.smoothed_rtt + cmp::max(4 * self.rttvar, 1_000) + max_ack_delay
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator::new()
    }
}

/// Per-space loss-detection state: the PTO backoff counter and the
/// outstanding time-threshold loss timer, plus bookkeeping needed to arm
/// the combined loss-detection timer across every space (the caller picks
/// the minimum across spaces before arming an actual timer).
pub struct LossDetector {
    pub pto_count: u32,
    pub loss_time: Option<u64>,
    pub time_of_last_ack_eliciting: Option<u64>,
}

impl LossDetector {
    pub fn new() -> Self {
        LossDetector {
            pto_count: 0,
            loss_time: None,
            time_of_last_ack_eliciting: None,
        }
    }

    pub fn on_ack_eliciting_sent(&mut self, now: u64) {
        self.time_of_last_ack_eliciting = Some(now);
    }

    /// Packet/time threshold loss detection over `sent`, per §4.6's
    /// time-threshold formula: a packet is lost once `now - send_time >=
    /// (9/8) * max(smoothed_rtt, latest_rtt)` (floored at 1ms), or once it
    /// trails the largest acknowledged packet by the reordering threshold
    /// (fixed at the RFC9002 default of 3 packets; this protocol does not
    /// expose it as configurable).
    pub fn detect_and_remove_lost<T>(
        &mut self,
        sent: &mut BTreeMap<u64, SentPacket<T>>,
        rtt: &RttEstimator,
        now: u64,
        largest_acked: u64,
    ) -> Vec<(u64, SentPacket<T>)> {
        const PACKET_THRESHOLD: u64 = 3;

        self.loss_time = None;
        let base_rtt = cmp::max(rtt.latest(), rtt.smoothed());
        let loss_delay = cmp::max((base_rtt * 9) / 8, 1_000);

        let mut lost = Vec::new();
        let candidates: Vec<u64> = sent
            .range(..=largest_acked)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in candidates {
            if pn == largest_acked {
                continue;
            }
            let info = &sent[&pn];
            let time_since_sent = now.saturating_sub(info.time_sent);
            let packet_gap = largest_acked - pn;
            if time_since_sent >= loss_delay || packet_gap >= PACKET_THRESHOLD {
                let info = sent.remove(&pn).unwrap();
                lost.push((pn, info));
            } else {
                let candidate_loss_time = info.time_sent + loss_delay;
                self.loss_time = Some(match self.loss_time {
                    Some(t) => cmp::min(t, candidate_loss_time),
                    None => candidate_loss_time,
                });
            }
        }
        lost
    }

    /// Whether the in-flight packets sent since `window_start` span a
    /// persistent-congestion period: the whole window is declared lost
    /// with no intervening non-lost packet, per §4.6's persistent-
    /// congestion rule (window = `(smoothed_rtt + 4*rttvar + max_ack_delay)
    /// * 3`, equivalently "PTO fires three times without progress").
    pub fn is_persistent_congestion(
        rtt: &RttEstimator,
        max_ack_delay: u64,
        lost_packets_send_times: &[u64],
    ) -> bool {
        if lost_packets_send_times.len() < 2 {
            return false;
        }
        let window = (rtt.smoothed() + 4 * rtt.var() + max_ack_delay) * 3;
        let first = *lost_packets_send_times.iter().min().unwrap();
        let last = *lost_packets_send_times.iter().max().unwrap();
        last.saturating_sub(first) >= window
    }

    /// PTO duration for this space, doubled per consecutive expiry.
    pub fn pto_duration(&self, rtt: &RttEstimator, max_ack_delay: u64) -> u64 {
        rtt.pto_base(max_ack_delay) * 2u64.pow(self.pto_count)
    }

    /// Absolute deadline the loss-detection timer for this space should
    /// fire at, given the time the most recent ack-eliciting packet in it
    /// was sent. `None` if nothing is outstanding.
    pub fn next_timeout(&self, rtt: &RttEstimator, max_ack_delay: u64) -> Option<u64> {
        if let Some(loss_time) = self.loss_time {
            return Some(loss_time);
        }
        self.time_of_last_ack_eliciting
            .map(|sent| sent + self.pto_duration(rtt, max_ack_delay))
    }

    pub fn on_pto_expired(&mut self) {
        self.pto_count += 1;
    }

    /// An ACK advanced recovery state; reset backoff, per §4.6 ("reset
    /// backoff on an ACK that advances recovery state").
    pub fn reset_backoff(&mut self) {
        self.pto_count = 0;
    }
}

impl Default for LossDetector {
    fn default() -> Self {
        LossDetector::new()
    }
}

/// Idle timeout: the minimum of both endpoints' advertised
/// `max_idle_timeout` and `3 * PTO`, per §4.5.
pub fn idle_timeout(
    local_max_idle: u64,
    peer_max_idle: u64,
    rtt: &RttEstimator,
    max_ack_delay: u64,
    pto_count_for_floor: u32,
) -> u64 {
    let advertised = match (local_max_idle, peer_max_idle) {
        (0, 0) => u64::max_value(),
        (0, p) => p,
        (l, 0) => l,
        (l, p) => cmp::min(l, p),
    };
    let pto_floor = rtt.pto_base(max_ack_delay) * 2u64.pow(pto_count_for_floor) * 3;
    cmp::min(advertised, pto_floor)
}

pub fn mtu_floor(config: &TransportConfig) -> u16 {
    config.initial_mtu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_first_sample_sets_smoothed_and_half_var() {
        let mut rtt = RttEstimator::new();
        rtt.update(0, 100_000);
        assert_eq!(rtt.smoothed(), 100_000);
        assert_eq!(rtt.var(), 50_000);
        assert_eq!(rtt.min(), 100_000);
    }

    #[test]
    fn rtt_subsequent_sample_applies_ewma() {
        let mut rtt = RttEstimator::new();
        rtt.update(0, 100_000);
        rtt.update(0, 200_000);
        assert_eq!(rtt.smoothed(), (7 * 100_000 + 200_000) / 8);
    }

    #[test]
    fn packet_threshold_loss_detects_trailing_packets() {
        let mut sent = BTreeMap::new();
        for pn in 0..12u64 {
            sent.insert(pn, SentPacket::new(0, 100, true, ()));
        }
        let mut detector = LossDetector::new();
        let rtt = RttEstimator::new();
        let lost = detector.detect_and_remove_lost(&mut sent, &rtt, 1_000_000, 11);
        let lost_pns: Vec<u64> = lost.iter().map(|(pn, _)| *pn).collect();
        assert!(lost_pns.contains(&8));
        assert!(!sent.contains_key(&8));
    }

    #[test]
    fn pto_doubles_on_each_expiry() {
        let mut detector = LossDetector::new();
        let rtt = RttEstimator::new();
        let first = detector.pto_duration(&rtt, 0);
        detector.on_pto_expired();
        let second = detector.pto_duration(&rtt, 0);
        assert_eq!(second, first * 2);
        detector.reset_backoff();
        assert_eq!(detector.pto_duration(&rtt, 0), first);
    }
}
