//! Address-Validation Manager support: Retry token and NEW_TOKEN token
//! encode/verify.
//!
//! Both token kinds are HMAC-authenticated opaque blobs the client echoes
//! back verbatim; this crate never needs to decrypt anything inside the
//! handshake engine to validate one, matching the reset-token idiom in
//! [`crate::crypto::reset_token_for`] (an HMAC keyed by a long-lived
//! per-endpoint secret, compared in constant time).

use std::net::IpAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use constant_time_eq::constant_time_eq;
use ring::{digest, hmac};

use crate::coding::{BufExt, BufMutExt};
use crate::packet::ConnectionId;

const MAC_LEN: usize = 16;

/// The secret backing both token kinds. One key serves both purposes: the
/// two are namespaced by a leading tag byte rather than by distinct keys.
pub struct TokenKey {
    key: hmac::SigningKey,
}

impl TokenKey {
    pub fn new(secret: &[u8; 64]) -> Self {
        TokenKey {
            key: hmac::SigningKey::new(&digest::SHA512_256, secret),
        }
    }

    fn mac(&self, data: &[u8]) -> [u8; MAC_LEN] {
        let tag = hmac::sign(&self.key, data);
        let mut mac = [0; MAC_LEN];
        mac.copy_from_slice(&tag.as_ref()[..MAC_LEN]);
        mac
    }
}

/// A Retry token: binds the client's original destination CID and address
/// so a later Initial can be matched back to the Retry that produced it,
/// with an issue time so stale tokens can be rejected without per-token
/// server-side state.
pub struct RetryToken {
    pub orig_dst_cid: ConnectionId,
    pub issued: u64,
}

impl RetryToken {
    pub fn encode(&self, key: &TokenKey, addr: IpAddr) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(0); // tag: retry
        buf.write_varint_field(self.issued);
        buf.put_u8(self.orig_dst_cid.len() as u8);
        buf.extend_from_slice(&self.orig_dst_cid);
        let mac_input = mac_input(&buf, addr);
        buf.extend_from_slice(&key.mac(&mac_input));
        buf
    }

    pub fn decode(key: &TokenKey, addr: IpAddr, raw: &[u8]) -> Option<Self> {
        if raw.len() < 1 + MAC_LEN || raw[0] != 0 {
            return None;
        }
        let (body, mac) = raw.split_at(raw.len() - MAC_LEN);
        let expected = key.mac(&mac_input(body, addr));
        if !constant_time_eq(&expected, mac) {
            return None;
        }
        let mut cursor = std::io::Cursor::new(&body[1..]);
        let issued = cursor.get_varint().ok()?.into_inner();
        let cid_len = cursor.get::<u8>().ok()? as usize;
        if cursor.remaining() < cid_len {
            return None;
        }
        let orig_dst_cid = ConnectionId::new(&cursor.bytes()[..cid_len]);
        Some(RetryToken {
            orig_dst_cid,
            issued,
        })
    }

    /// Retry tokens are meant to be consumed within one round trip; reject
    /// anything older than this no matter how the clock is read.
    pub fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.issued) <= MAX_RETRY_AGE_MICROS
    }
}

/// A NEW_TOKEN token: no bound connection ID (it's issued outside any
/// specific Retry exchange, for use on a future connection attempt), but
/// still scoped to the issuing address and stamped with an issue time so
/// the single-use pool in [`NewTokenPool`] can expire entries deterministically.
pub struct AddressValidationToken {
    pub issued: u64,
}

impl AddressValidationToken {
    pub fn encode(&self, key: &TokenKey, addr: IpAddr) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(1); // tag: new_token
        buf.write_varint_field(self.issued);
        let mac_input = mac_input(&buf, addr);
        buf.extend_from_slice(&key.mac(&mac_input));
        buf
    }

    pub fn decode(key: &TokenKey, addr: IpAddr, raw: &[u8]) -> Option<Self> {
        if raw.len() < 1 + MAC_LEN || raw[0] != 1 {
            return None;
        }
        let (body, mac) = raw.split_at(raw.len() - MAC_LEN);
        let expected = key.mac(&mac_input(body, addr));
        if !constant_time_eq(&expected, mac) {
            return None;
        }
        let mut cursor = std::io::Cursor::new(&body[1..]);
        let issued = cursor.get_varint().ok()?.into_inner();
        Some(AddressValidationToken { issued })
    }
}

const MAX_RETRY_AGE_MICROS: u64 = Duration::from_secs(30).as_micros() as u64;
const MAX_NEW_TOKEN_AGE_MICROS: u64 = Duration::from_secs(7 * 24 * 3600).as_micros() as u64;
/// Bound on the server-side pool tracking which NEW_TOKEN tokens have
/// already been redeemed. This is a best-effort single-use guard, not a
/// durable replay cache: an attacker who waits for the pool to wrap can
/// replay an evicted token, trading a bounded amount of memory for that
/// residual risk (see the Open Questions record in `DESIGN.md`).
const NEW_TOKEN_POOL_CAPACITY: usize = 16_384;

/// Tracks which previously issued NEW_TOKEN tokens have already been
/// redeemed, so a client cannot establish more than one connection's worth
/// of address-validation credit from a single issued token.
pub struct NewTokenPool {
    seen: std::collections::VecDeque<[u8; MAC_LEN]>,
    index: fnv::FnvHashSet<[u8; MAC_LEN]>,
}

impl NewTokenPool {
    pub fn new() -> Self {
        NewTokenPool {
            seen: std::collections::VecDeque::with_capacity(NEW_TOKEN_POOL_CAPACITY),
            index: fnv::FnvHashSet::default(),
        }
    }

    /// Returns `true` the first time this exact token's MAC is observed
    /// (and records it); `false` on every subsequent replay while it
    /// remains in the pool's FIFO window.
    pub fn try_consume(&mut self, raw: &[u8]) -> bool {
        if raw.len() < MAC_LEN {
            return false;
        }
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&raw[raw.len() - MAC_LEN..]);
        if !self.index.insert(mac) {
            return false;
        }
        self.seen.push_back(mac);
        if self.seen.len() > NEW_TOKEN_POOL_CAPACITY {
            if let Some(evicted) = self.seen.pop_front() {
                self.index.remove(&evicted);
            }
        }
        true
    }
}

fn mac_input(body: &[u8], addr: IpAddr) -> Vec<u8> {
    let mut input = body.to_vec();
    match addr {
        IpAddr::V4(v4) => input.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => input.extend_from_slice(&v6.octets()),
    }
    input
}

trait WriteVarintField {
    fn write_varint_field(&mut self, x: u64);
}

impl<T: BufMut> WriteVarintField for T {
    fn write_varint_field(&mut self, x: u64) {
        crate::varint::write(x, self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> TokenKey {
        TokenKey::new(&[9u8; 64])
    }

    #[test]
    fn retry_token_round_trips() {
        let k = key();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let token = RetryToken {
            orig_dst_cid: cid,
            issued: 42,
        };
        let encoded = token.encode(&k, addr);
        let decoded = RetryToken::decode(&k, addr, &encoded).expect("valid token");
        assert_eq!(decoded.orig_dst_cid, cid);
        assert_eq!(decoded.issued, 42);
    }

    #[test]
    fn retry_token_rejects_wrong_address() {
        let k = key();
        let cid = ConnectionId::new(&[1, 2, 3, 4]);
        let token = RetryToken {
            orig_dst_cid: cid,
            issued: 0,
        };
        let encoded = token.encode(&k, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(RetryToken::decode(&k, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 5)), &encoded).is_none());
    }

    #[test]
    fn new_token_pool_rejects_replay() {
        let mut pool = NewTokenPool::new();
        let raw = [0u8; MAC_LEN + 1];
        assert!(pool.try_consume(&raw));
        assert!(!pool.try_consume(&raw));
    }

    #[test]
    fn new_token_age_bound_is_a_week() {
        assert_eq!(MAX_NEW_TOKEN_AGE_MICROS, 7 * 24 * 3600 * 1_000_000);
    }
}
