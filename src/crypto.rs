//! C2 PacketProtection: the seam this crate needs from an external
//! handshake/AEAD engine.
//!
//! This crate performs no cryptography itself beyond deriving the Initial
//! secrets (the only secret whose derivation is a wire-format concern fixed
//! by the protocol version rather than negotiated by the handshake) and the
//! stateless-reset token function. Every other key — handshake, 1-RTT,
//! 0-RTT, and their updates — is produced by whatever handshake engine the
//! caller plugs in, exposed to us only through the [`PacketKey`]/
//! [`HeaderKey`]/[`Keys`] traits below, mirroring how the teacher's
//! `crypto.rs` wraps its TLS session behind a small trait seam rather than
//! calling into TLS directly from `connection.rs`.

use ring::{aead, digest, hmac};

use crate::packet::ConnectionId;

/// Initial salt from the transport specification's Initial-secret derivation
/// (fixed per protocol version, analogous to RFC 9001's `initial_salt`).
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

const CLIENT_LABEL: &[u8] = b"client in";
const SERVER_LABEL: &[u8] = b"server in";
const KEY_LABEL: &[u8] = b"quic key";
const IV_LABEL: &[u8] = b"quic iv";
const HP_LABEL: &[u8] = b"quic hp";

/// An AEAD seal/open seam for one direction (encrypt-local / decrypt-remote)
/// of one packet-number space's keys.
pub trait PacketKey: Send {
    /// Additional authenticated data is the packet's header bytes
    /// (including the decoded packet number), exactly as `packet::Packet`
    /// produces. `payload` must already have `tag_len()` bytes of trailing
    /// space reserved for `seal`; `open` returns the plaintext length.
    fn seal(&self, pn: u64, header: &[u8], payload: &mut [u8]) -> Result<(), CryptoError>;
    fn open(&self, pn: u64, header: &[u8], payload: &mut [u8]) -> Result<usize, CryptoError>;
    fn tag_len(&self) -> usize;
}

/// The header-protection seam `packet::PartialDecode::finish` and the
/// packet encoder call to mask/unmask the first byte's low bits and the
/// packet-number field.
pub trait HeaderKey: Send {
    fn sample_size(&self) -> usize;
    /// Masking is its own inverse: the caller supplies the already-masked
    /// bytes on decrypt and the cleartext ones on encrypt.
    fn decrypt(&self, sample: &[u8], first: &mut u8, pn_bytes: &mut [u8]);
    fn encrypt(&self, sample: &[u8], first: &mut u8, pn_bytes: &mut [u8]);
}

/// One packet-number space's full key material: a packet key and a header
/// key for each of the two directions in play at that encryption level.
pub struct Keys {
    pub local_packet: Box<dyn PacketKey>,
    pub local_header: Box<dyn HeaderKey>,
    pub remote_packet: Box<dyn PacketKey>,
    pub remote_header: Box<dyn HeaderKey>,
}

#[derive(Debug, Fail)]
pub enum CryptoError {
    #[fail(display = "AEAD authentication failed")]
    AuthenticationFailed,
    #[fail(display = "payload too short for AEAD tag")]
    TooShort,
}

/// HMAC-based HKDF-Extract, following the construction TLS 1.3 key schedule
/// (and this protocol's Initial-secret derivation) builds on.
fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> hmac::SigningKey {
    let key = hmac::SigningKey::new(&digest::SHA256, salt);
    let prk = hmac::sign(&key, ikm);
    hmac::SigningKey::new(&digest::SHA256, prk.as_ref())
}

/// HKDF-Expand-Label, abbreviated to the fixed output lengths this crate
/// ever requests: the 32-byte "client in"/"server in" secrets and the
/// 16-byte key/header-protection-key/12-byte-IV triple derived from them.
/// A single HMAC application suffices because every output this crate needs
/// fits in one SHA-256 block.
fn hkdf_expand(prk: &hmac::SigningKey, label: &[u8], len: usize) -> Vec<u8> {
    let mut info = Vec::with_capacity(label.len() + 1);
    info.extend_from_slice(label);
    info.push(0x01);
    let block = hmac::sign(prk, &info);
    let mut out = block.as_ref().to_vec();
    out.truncate(len);
    out
}

/// Derive the Initial packet-protection keys for `dst_cid`, the destination
/// connection ID of the first Initial packet sent on a connection. Both
/// sides derive the same secret from the same salt and CID; `side` only
/// picks which of the two derived secrets ("client in" / "server in") feeds
/// the local versus remote direction.
pub fn initial_keys(dst_cid: &ConnectionId, side: crate::Side) -> Keys {
    let initial_secret = hkdf_extract(&INITIAL_SALT, dst_cid);

    let client_secret = hkdf_expand(&initial_secret, CLIENT_LABEL, 32);
    let server_secret = hkdf_expand(&initial_secret, SERVER_LABEL, 32);

    let (local_secret, remote_secret) = match side {
        crate::Side::Client => (client_secret, server_secret),
        crate::Side::Server => (server_secret, client_secret),
    };

    Keys {
        local_packet: Box::new(AeadPacketKey::new(&local_secret)),
        local_header: Box::new(HmacHeaderKey::new(&local_secret)),
        remote_packet: Box::new(AeadPacketKey::new(&remote_secret)),
        remote_header: Box::new(HmacHeaderKey::new(&remote_secret)),
    }
}

struct AeadPacketKey {
    sealing: aead::SealingKey,
    opening: aead::OpeningKey,
    iv: [u8; 12],
}

impl AeadPacketKey {
    fn new(secret: &[u8]) -> Self {
        let prk = hmac::SigningKey::new(&digest::SHA256, secret);
        let key_bytes = hkdf_expand(&prk, KEY_LABEL, 16);
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&hkdf_expand(&prk, IV_LABEL, 12));

        let sealing =
            aead::SealingKey::new(&aead::AES_128_GCM, &key_bytes).expect("16-byte AES-128 key");
        let opening =
            aead::OpeningKey::new(&aead::AES_128_GCM, &key_bytes).expect("16-byte AES-128 key");

        AeadPacketKey {
            sealing,
            opening,
            iv,
        }
    }

    fn nonce(&self, pn: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        let pn_bytes = pn.to_be_bytes();
        for (n, p) in nonce[4..].iter_mut().zip(pn_bytes.iter()) {
            *n ^= p;
        }
        nonce
    }
}

impl PacketKey for AeadPacketKey {
    fn seal(&self, pn: u64, header: &[u8], payload: &mut [u8]) -> Result<(), CryptoError> {
        let nonce = self.nonce(pn);
        aead::seal_in_place(
            &self.sealing,
            &nonce,
            header,
            payload,
            self.tag_len(),
        )
        .map(|_| ())
        .map_err(|_| CryptoError::AuthenticationFailed)
    }

    fn open(&self, pn: u64, header: &[u8], payload: &mut [u8]) -> Result<usize, CryptoError> {
        if payload.len() < self.tag_len() {
            return Err(CryptoError::TooShort);
        }
        let nonce = self.nonce(pn);
        let plain = aead::open_in_place(&self.opening, &nonce, header, 0, payload)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        Ok(plain.len())
    }

    fn tag_len(&self) -> usize {
        aead::AES_128_GCM.tag_len()
    }
}

struct HmacHeaderKey {
    key: hmac::SigningKey,
}

impl HmacHeaderKey {
    fn new(secret: &[u8]) -> Self {
        let prk = hmac::SigningKey::new(&digest::SHA256, secret);
        let key_bytes = hkdf_expand(&prk, HP_LABEL, 16);
        HmacHeaderKey {
            key: hmac::SigningKey::new(&digest::SHA256, &key_bytes),
        }
    }

    fn mask(&self, sample: &[u8]) -> [u8; 5] {
        let tag = hmac::sign(&self.key, sample);
        let mut mask = [0u8; 5];
        mask.copy_from_slice(&tag.as_ref()[..5]);
        mask
    }
}

impl HeaderKey for HmacHeaderKey {
    fn sample_size(&self) -> usize {
        16
    }

    fn decrypt(&self, sample: &[u8], first: &mut u8, pn_bytes: &mut [u8]) {
        apply_mask(&self.mask(sample), first, pn_bytes)
    }

    fn encrypt(&self, sample: &[u8], first: &mut u8, pn_bytes: &mut [u8]) {
        apply_mask(&self.mask(sample), first, pn_bytes)
    }
}

fn apply_mask(mask: &[u8; 5], first: &mut u8, pn_bytes: &mut [u8]) {
    let long = *first & 0x80 != 0;
    *first ^= mask[0] & if long { 0x0f } else { 0x1f };
    for (b, m) in pn_bytes.iter_mut().zip(mask[1..].iter()) {
        *b ^= m;
    }
}

/// Key-phase update bookkeeping for the 1-RTT space: the current phase's
/// keys plus the previous phase's, kept around until the loss-detection
/// timer clears so a reordered packet from the old phase can still be
/// opened.
pub struct KeyUpdate {
    pub phase: bool,
    pub current: Keys,
    pub previous: Option<Keys>,
}

/// Derive the token carried in a stateless-reset packet for `cid`, keyed by
/// the endpoint's long-lived [`ListenKeys`](crate::endpoint::ListenKeys)
/// reset key. A peer that recognizes this token (and this token alone, on
/// a packet it cannot otherwise decrypt) treats the datagram as proof the
/// sender no longer holds connection state for that CID.
pub fn reset_token_for(key: &hmac::SigningKey, cid: &ConnectionId) -> [u8; crate::RESET_TOKEN_SIZE] {
    let signature = hmac::sign(key, cid);
    let mut token = [0; crate::RESET_TOKEN_SIZE];
    token.copy_from_slice(&signature.as_ref()[..crate::RESET_TOKEN_SIZE]);
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_keys_are_symmetric_across_sides() {
        let cid = ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]);
        let client = initial_keys(&cid, crate::Side::Client);
        let server = initial_keys(&cid, crate::Side::Server);
        // The client's local secret is the server's remote secret and vice
        // versa, so a header-protection mask computed on one side's local
        // key must match the other side's remote key for the same sample.
        let sample = [0u8; 16];
        let mut a_first = 0xC3u8;
        let mut a_pn = [0u8; 4];
        client.local_header.decrypt(&sample, &mut a_first, &mut a_pn);

        let mut b_first = 0xC3u8;
        let mut b_pn = [0u8; 4];
        server.remote_header.decrypt(&sample, &mut b_first, &mut b_pn);

        assert_eq!(a_first, b_first);
        assert_eq!(a_pn, b_pn);
    }

    #[test]
    fn reset_token_is_deterministic_per_cid() {
        let key = hmac::SigningKey::new(&digest::SHA512_256, &[7u8; 64]);
        let cid = ConnectionId::new(&[1, 2, 3, 4]);
        let a = reset_token_for(&key, &cid);
        let b = reset_token_for(&key, &cid);
        assert_eq!(a, b);
    }
}
