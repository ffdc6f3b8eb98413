//! CID Manager (Data Model §"Connection ID (CID)" and Component Design
//! §"CID Manager"): issued-to-peer CIDs with their reset tokens, and
//! peer-issued CIDs available for local use, each side's sequence numbers
//! monotonic and never reused.

use std::collections::VecDeque;

use rand::RngCore;

use crate::packet::ConnectionId;
use crate::{TransportError, RESET_TOKEN_SIZE};

struct IssuedCid {
    sequence: u64,
    id: ConnectionId,
    reset_token: [u8; RESET_TOKEN_SIZE],
    retired: bool,
}

/// CIDs this endpoint has handed to the peer (via the initial handshake
/// exchange or NEW_CONNECTION_ID), for the peer to address us by.
pub struct LocalCidSet {
    issued: Vec<IssuedCid>,
    next_sequence: u64,
    cid_len: usize,
}

impl LocalCidSet {
    pub fn new(cid_len: usize) -> Self {
        LocalCidSet {
            issued: Vec::new(),
            next_sequence: 0,
            cid_len,
        }
    }

    /// Issue a fresh CID with sequence number `next_sequence` (0 for the
    /// very first, per the Data Model invariant). Returns the CID, its
    /// sequence, and a reset token for the caller to carry in a
    /// NEW_CONNECTION_ID frame (or the initial transport parameters, for
    /// sequence 0).
    pub fn issue<R: RngCore>(
        &mut self,
        rng: &mut R,
        reset_token: [u8; RESET_TOKEN_SIZE],
    ) -> (ConnectionId, u64) {
        let id = ConnectionId::random(rng, self.cid_len);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.issued.push(IssuedCid {
            sequence,
            id,
            reset_token,
            retired: false,
        });
        (id, sequence)
    }

    /// Mark `sequence` retired on receipt of RETIRE_CONNECTION_ID.
    pub fn retire(&mut self, sequence: u64) {
        if let Some(entry) = self.issued.iter_mut().find(|e| e.sequence == sequence) {
            entry.retired = true;
        }
        self.issued.retain(|e| !e.retired || e.sequence == sequence);
    }

    pub fn active_count(&self) -> usize {
        self.issued.iter().filter(|e| !e.retired).count()
    }

    pub fn reset_token_for(&self, id: &ConnectionId) -> Option<[u8; RESET_TOKEN_SIZE]> {
        self.issued
            .iter()
            .find(|e| &e.id == id)
            .map(|e| e.reset_token)
    }
}

struct PeerCid {
    sequence: u64,
    id: ConnectionId,
    reset_token: [u8; RESET_TOKEN_SIZE],
}

/// CIDs the peer has issued to us, for us to address them by (one per
/// local address we use simultaneously, per the Data Model's "each local
/// address MUST use a distinct CID" invariant).
pub struct RemoteCidSet {
    available: VecDeque<PeerCid>,
    active: Option<PeerCid>,
    retire_prior_to: u64,
    limit: u64,
}

impl RemoteCidSet {
    pub fn new(initial: ConnectionId, limit: u64) -> Self {
        RemoteCidSet {
            available: VecDeque::new(),
            active: Some(PeerCid {
                sequence: 0,
                id: initial,
                reset_token: [0; RESET_TOKEN_SIZE],
            }),
            retire_prior_to: 0,
            limit,
        }
    }

    pub fn current(&self) -> Option<ConnectionId> {
        self.active.as_ref().map(|p| p.id)
    }

    /// Handle an incoming NEW_CONNECTION_ID. `retire_prior_to` greater
    /// than sequence numbers already adopted schedules every earlier CID
    /// for retirement before this one is adopted, per the CID Manager's
    /// documented `retire_prior_to` semantics; the caller is responsible
    /// for actually emitting the resulting RETIRE_CONNECTION_ID frames.
    pub fn receive_new_cid(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        id: ConnectionId,
        reset_token: [u8; RESET_TOKEN_SIZE],
    ) -> Result<Vec<u64>, TransportError> {
        if self.available.len() as u64 + 1 >= self.limit {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR);
        }
        self.available.push_back(PeerCid {
            sequence,
            id,
            reset_token,
        });
        let mut to_retire = Vec::new();
        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            if let Some(active) = &self.active {
                if active.sequence < retire_prior_to {
                    to_retire.push(active.sequence);
                    self.active = None;
                }
            }
            while let Some(front) = self.available.front() {
                if front.sequence < retire_prior_to {
                    to_retire.push(front.sequence);
                    self.available.pop_front();
                } else {
                    break;
                }
            }
            if self.active.is_none() {
                self.active = self.available.pop_front();
            }
        }
        Ok(to_retire)
    }

    pub fn reset_token(&self) -> Option<[u8; RESET_TOKEN_SIZE]> {
        self.active.as_ref().map(|p| p.reset_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn local_cid_issue_has_increasing_sequence_numbers() {
        let mut set = LocalCidSet::new(8);
        let mut rng = OsRng::new().unwrap();
        let (_, seq0) = set.issue(&mut rng, [0; RESET_TOKEN_SIZE]);
        let (_, seq1) = set.issue(&mut rng, [0; RESET_TOKEN_SIZE]);
        assert_eq!(seq0, 0);
        assert_eq!(seq1, 1);
        assert_eq!(set.active_count(), 2);
        set.retire(0);
        assert_eq!(set.active_count(), 1);
    }

    #[test]
    fn retire_prior_to_schedules_earlier_cids() {
        let initial = ConnectionId::new(&[1, 2, 3, 4]);
        let mut set = RemoteCidSet::new(initial, 4);
        let retired = set
            .receive_new_cid(1, 1, ConnectionId::new(&[5, 6, 7, 8]), [0; RESET_TOKEN_SIZE])
            .unwrap();
        assert_eq!(retired, vec![0]);
        assert_eq!(set.current(), Some(ConnectionId::new(&[5, 6, 7, 8])));
    }

    #[test]
    fn connection_id_limit_is_enforced() {
        let initial = ConnectionId::new(&[1]);
        let mut set = RemoteCidSet::new(initial, 2);
        set.receive_new_cid(1, 0, ConnectionId::new(&[2]), [0; RESET_TOKEN_SIZE])
            .unwrap();
        assert!(set
            .receive_new_cid(2, 0, ConnectionId::new(&[3]), [0; RESET_TOKEN_SIZE])
            .is_err());
    }
}
