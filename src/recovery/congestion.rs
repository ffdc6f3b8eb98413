//! NewReno-equivalent congestion controller, per §4.6 "Congestion control".
//!
//! Grounded on the teacher's congestion-window bookkeeping in
//! `Connection::on_packet_acked`/`detect_lost_packets` (slow start growth,
//! `loss_reduction_factor`/`minimum_window` from `Config`), generalized from
//! its fixed-point `>> 16` scaling to the plain `cwnd/2` halving this
//! protocol's recovery section specifies, and extended with the recovery
//! period and ECN-CE response the teacher's draft predates.

use crate::config::TransportConfig;

/// Default minimum congestion window, 2 maximum datagrams, per §4.6.
pub fn minimum_window(max_datagram_size: u64) -> u64 {
    2 * max_datagram_size
}

pub struct NewReno {
    pub congestion_window: u64,
    pub ssthresh: u64,
    pub bytes_in_flight: u64,
    /// Set on entering a recovery period to the largest packet number sent
    /// so far; recovery ends once a packet sent after this is acknowledged.
    recovery_start: Option<u64>,
    minimum_window: u64,
    max_datagram_size: u64,
}

impl NewReno {
    pub fn new(config: &TransportConfig) -> Self {
        NewReno {
            congestion_window: config.initial_window(),
            ssthresh: u64::max_value(),
            bytes_in_flight: 0,
            recovery_start: None,
            minimum_window: config.minimum_window,
            max_datagram_size: config.initial_mtu as u64,
        }
    }

    pub fn is_slow_start(&self) -> bool {
        self.congestion_window < self.ssthresh
    }

    pub fn in_recovery(&self, packet: u64) -> bool {
        self.recovery_start.map_or(false, |start| packet <= start)
    }

    pub fn window_remaining(&self) -> u64 {
        self.congestion_window.saturating_sub(self.bytes_in_flight)
    }

    pub fn on_sent(&mut self, bytes: u64) {
        self.bytes_in_flight += bytes;
    }

    /// A previously in-flight packet was acknowledged. `largest_sent_at_ack`
    /// is the highest packet number sent as of the moment this ack arrived,
    /// used to decide whether we're still inside the current recovery
    /// period's "one packet may exceed cwnd" grace.
    pub fn on_ack(&mut self, packet: u64, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        if self.in_recovery(packet) {
            return;
        }
        if self.is_slow_start() {
            self.congestion_window += bytes;
        } else {
            self.congestion_window += self.max_datagram_size * bytes / self.congestion_window;
        }
    }

    /// One or more packets were declared lost; `largest_lost` is the
    /// highest packet number among them and `largest_sent` the highest
    /// packet number sent so far (used to open the new recovery period).
    pub fn on_packets_lost(&mut self, largest_lost: u64, largest_sent: u64) {
        if self.in_recovery(largest_lost) {
            return;
        }
        self.recovery_start = Some(largest_sent);
        self.congestion_window = (self.congestion_window / 2).max(self.minimum_window);
        self.ssthresh = self.congestion_window;
    }

    /// Persistent congestion collapses the window to the minimum outright,
    /// bypassing the halving rule, per §4.6.
    pub fn on_persistent_congestion(&mut self) {
        self.congestion_window = self.minimum_window;
    }

    /// An ECN-CE mark was newly reported; treated equivalently to a loss
    /// signal per §4.6 ("CE increments signal congestion equivalently to
    /// loss").
    pub fn on_congestion_event(&mut self, largest_sent: u64) {
        self.on_packets_lost(largest_sent, largest_sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        TransportConfig::default()
    }

    #[test]
    fn slow_start_grows_by_bytes_acked() {
        let cfg = config();
        let mut cc = NewReno::new(&cfg);
        cc.on_sent(1000);
        let before = cc.congestion_window;
        cc.on_ack(0, 1000);
        assert_eq!(cc.congestion_window, before + 1000);
    }

    #[test]
    fn loss_halves_window_and_opens_recovery() {
        let cfg = config();
        let mut cc = NewReno::new(&cfg);
        let before = cc.congestion_window;
        cc.on_packets_lost(5, 5);
        assert_eq!(cc.congestion_window, (before / 2).max(cc.minimum_window));
        assert_eq!(cc.ssthresh, cc.congestion_window);
        assert!(cc.in_recovery(5));
        assert!(cc.in_recovery(3));
        assert!(!cc.in_recovery(6));
    }

    #[test]
    fn repeated_loss_within_recovery_period_does_not_halve_again() {
        let cfg = config();
        let mut cc = NewReno::new(&cfg);
        cc.on_packets_lost(5, 5);
        let after_first = cc.congestion_window;
        cc.on_packets_lost(4, 5);
        assert_eq!(cc.congestion_window, after_first);
    }
}
