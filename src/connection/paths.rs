//! Path Manager: per-path validation state, anti-amplification, and
//! migration, per the Data Model's `Path` entry and the Component
//! Design's "Path Manager" sub-module.

use crate::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Unvalidated,
    Validating,
    Validated,
    Failed,
}

/// One candidate (local, peer) address pair and everything needed to
/// validate it and gate how much this endpoint may send to it before
/// validation completes.
pub struct Path {
    pub remote: Address,
    pub state: PathState,
    pub challenge: Option<[u8; 8]>,
    /// Microsecond timestamp the validation timer expires at, if a
    /// challenge is outstanding.
    pub validation_deadline: Option<u64>,
    /// Bytes received from this path before it was validated, bounding
    /// how much this endpoint may send back (anti-amplification: at most
    /// 3x, per the Testable Properties' anti-amplification entry — this
    /// crate tracks the received side; the 3x multiplier is applied by
    /// the caller at the point it checks `may_send`).
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Round-trip and congestion state are deliberately not reset here
    /// when the rebinding heuristic matches (same IP, different port);
    /// the caller decides whether to carry over `recovery::RttEstimator`
    /// state rather than this module owning that decision.
    pub is_rebinding_of_known_path: bool,
}

/// Anti-amplification multiplier: an unvalidated path may be sent at most
/// this many bytes for every byte received on it.
pub const AMPLIFICATION_FACTOR: u64 = 3;

impl Path {
    pub fn new(remote: Address) -> Self {
        Path {
            remote,
            state: PathState::Unvalidated,
            challenge: None,
            validation_deadline: None,
            bytes_received: 0,
            bytes_sent: 0,
            is_rebinding_of_known_path: false,
        }
    }

    /// Begin validating this path: generate a fresh challenge payload and
    /// arm the validation timer for `max(3*pto, 6*initial_rtt)`.
    pub fn begin_validation(&mut self, now: u64, challenge: [u8; 8], pto: u64, initial_rtt: u64) {
        self.state = PathState::Validating;
        self.challenge = Some(challenge);
        let timeout = (3 * pto).max(6 * initial_rtt);
        self.validation_deadline = Some(now + timeout);
    }

    /// A matching PATH_RESPONSE arrived.
    pub fn on_path_response(&mut self, token: [u8; 8]) -> bool {
        if self.challenge == Some(token) {
            self.state = PathState::Validated;
            self.challenge = None;
            self.validation_deadline = None;
            true
        } else {
            false
        }
    }

    pub fn on_validation_timeout(&mut self, now: u64) {
        if let Some(deadline) = self.validation_deadline {
            if now >= deadline && self.state == PathState::Validating {
                self.state = PathState::Failed;
            }
        }
    }

    pub fn record_received(&mut self, len: u64) {
        self.bytes_received += len;
    }

    /// Whether `len` more bytes may be sent on this path without
    /// exceeding the anti-amplification budget. Always `true` once
    /// validated.
    pub fn may_send(&self, len: u64) -> bool {
        self.state == PathState::Validated
            || self.bytes_sent + len <= self.bytes_received * AMPLIFICATION_FACTOR
    }

    pub fn record_sent(&mut self, len: u64) {
        self.bytes_sent += len;
    }
}

/// Tracks the connection's current path plus, during a migration attempt,
/// the previous one (kept reachable until the new path validates or
/// fails, since address-validation rules forbid committing to an
/// unvalidated path's congestion/RTT state).
pub struct PathManager {
    pub active: Path,
    pub previous: Option<Path>,
}

impl PathManager {
    pub fn new(remote: Address) -> Self {
        let mut active = Path::new(remote);
        active.state = PathState::Validated;
        PathManager {
            active,
            previous: None,
        }
    }

    /// An incoming packet arrived from `from`, different from the active
    /// path's remote address. Start (or continue) migrating to it.
    pub fn on_address_change(&mut self, from: Address) -> &mut Path {
        if self.active.remote != from {
            let old = std::mem::replace(&mut self.active, Path::new(from));
            self.active.is_rebinding_of_known_path = same_ip_different_port(&old.remote, &from);
            self.previous = Some(old);
        }
        &mut self.active
    }
}

fn same_ip_different_port(a: &Address, b: &Address) -> bool {
    a.ip() == b.ip() && a.port() != b.port()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> Address {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn unvalidated_path_is_amplification_limited() {
        let mut path = Path::new(addr(1234));
        path.record_received(100);
        assert!(path.may_send(300));
        assert!(!path.may_send(301));
    }

    #[test]
    fn matching_path_response_validates() {
        let mut path = Path::new(addr(1234));
        path.begin_validation(0, [1; 8], 100, 100);
        assert!(!path.on_path_response([2; 8]));
        assert_eq!(path.state, PathState::Validating);
        assert!(path.on_path_response([1; 8]));
        assert_eq!(path.state, PathState::Validated);
    }

    #[test]
    fn rebinding_heuristic_detects_same_ip_new_port() {
        let mut mgr = PathManager::new(addr(1111));
        mgr.on_address_change(addr(2222));
        assert!(mgr.active.is_rebinding_of_known_path);
    }
}
