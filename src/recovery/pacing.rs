//! Pacer: smooths transmission of a burst of packets across a round trip
//! instead of releasing the whole congestion window at once, per §4.6
//! "Pacing": rate = N * cwnd / smoothed_rtt with N slightly above 1.
//!
//! The teacher's draft predates pacing (it releases the full window
//! immediately); this is new, grounded in the spec's pacing formula and in
//! the token-bucket shape `other_examples/`'s newer QUIC stacks use for the
//! same purpose.

/// N in the pacing rate formula: packets are released `N` times faster than
/// strictly spreading `cwnd` bytes over `smoothed_rtt` would allow, so a
/// connection's transmission keeps pace with a congestion window that is
/// growing (slow start) rather than perpetually trailing it.
const PACING_MULTIPLIER_NUM: u64 = 5;
const PACING_MULTIPLIER_DEN: u64 = 4;

pub struct Pacer {
    /// Fractional byte budget available to send right now, in units of
    /// 1/256th of a byte to keep the accumulator precise across small
    /// per-tick increments.
    budget_256ths: u64,
    last_update: u64,
    burst_cap: u64,
}

impl Pacer {
    pub fn new(now: u64, initial_window: u64) -> Self {
        Pacer {
            budget_256ths: initial_window * 256,
            last_update: now,
            burst_cap: initial_window,
        }
    }

    /// Replenish the budget for elapsed time at the current `cwnd`/`srtt`
    /// rate, then report whether `size` bytes may be sent now. Pure-ACK
    /// packets bypass the pacer entirely (callers simply don't call this
    /// for them), per §4.6.
    pub fn allow(&mut self, now: u64, cwnd: u64, smoothed_rtt: u64, size: u64) -> bool {
        self.replenish(now, cwnd, smoothed_rtt);
        self.budget_256ths >= size * 256
    }

    pub fn spend(&mut self, size: u64) {
        self.budget_256ths = self.budget_256ths.saturating_sub(size * 256);
    }

    fn replenish(&mut self, now: u64, cwnd: u64, smoothed_rtt: u64) {
        if now <= self.last_update || smoothed_rtt == 0 {
            self.last_update = now;
            return;
        }
        let elapsed = now - self.last_update;
        self.last_update = now;
        // rate (bytes/us, *256) = N * cwnd * 256 / srtt
        let rate_256ths = (cwnd * 256 * PACING_MULTIPLIER_NUM) / (smoothed_rtt * PACING_MULTIPLIER_DEN);
        let earned = rate_256ths.saturating_mul(elapsed);
        let cap = self.burst_cap.max(cwnd) * 256;
        self.budget_256ths = (self.budget_256ths + earned).min(cap);
    }

    /// Raise the burst cap to at least `cwnd`, e.g. on entering a new path
    /// or after the initial window is known.
    pub fn set_burst_cap(&mut self, cwnd: u64) {
        self.burst_cap = cwnd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_grows_with_elapsed_time() {
        let mut pacer = Pacer::new(0, 12_000);
        pacer.spend(12_000);
        assert!(!pacer.allow(0, 12_000, 100_000, 1200));
        assert!(pacer.allow(50_000, 12_000, 100_000, 1200));
    }

    #[test]
    fn budget_never_exceeds_burst_cap() {
        let mut pacer = Pacer::new(0, 12_000);
        assert!(pacer.allow(10_000_000, 12_000, 100_000, 12_000));
        assert!(!pacer.allow(10_000_000, 12_000, 100_000, 12_001));
    }
}
