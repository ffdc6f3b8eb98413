//! Long/short packet headers, connection IDs, and packet-number
//! truncation/expansion (C1 Codec).
//!
//! Header *protection removal* and AEAD decryption are not performed here;
//! see [`crate::crypto`] for that seam. This module only knows how to turn
//! bytes into a [`Header`] plus an opaque payload slice, and back.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::coding::{BufExt, BufMutExt};
use crate::varint;
use crate::{MAX_CID_SIZE, VERSION};

/// An opaque routing identifier of 0..20 bytes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// The four long-header packet types, distinguished by the two type bits
/// following the form/fixed bits in the first byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn bits(self) -> u8 {
        match self {
            LongType::Initial => 0b00,
            LongType::ZeroRtt => 0b01,
            LongType::Handshake => 0b10,
            LongType::Retry => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => LongType::Initial,
            0b01 => LongType::ZeroRtt,
            0b10 => LongType::Handshake,
            0b11 => LongType::Retry,
            _ => unreachable!(),
        }
    }
}

/// A packet number truncated to the shortest width that keeps it
/// unambiguous relative to the largest packet number received so far.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Choose the shortest encoding that is unambiguous given the largest
    /// acknowledged packet number in the same space, per the reference
    /// algorithm in the source specification's Appendix A.
    pub fn new(number: u64, largest_acked: Option<u64>) -> Self {
        let num_unacked = match largest_acked {
            Some(largest_acked) => number.saturating_sub(largest_acked),
            None => number + 1,
        };
        // `num_unacked` contiguous values must be representable; the
        // encoded width in bits must exceed log2(num_unacked).
        if num_unacked <= 0x80 {
            PacketNumber::U8(number as u8)
        } else if num_unacked <= 0x8000 {
            PacketNumber::U16(number as u16)
        } else if num_unacked <= 0x80_0000 {
            PacketNumber::U24(number as u32 & 0x00FF_FFFF)
        } else if num_unacked <= 0x8000_0000 {
            PacketNumber::U32(number as u32)
        } else {
            panic!("packet number gap too large to encode in 4 bytes")
        }
    }

    pub fn len(self) -> usize {
        match self {
            PacketNumber::U8(_) => 1,
            PacketNumber::U16(_) => 2,
            PacketNumber::U24(_) => 3,
            PacketNumber::U32(_) => 4,
        }
    }

    pub fn encode<W: BufMut>(self, w: &mut W) {
        match self {
            PacketNumber::U8(x) => w.put_u8(x),
            PacketNumber::U16(x) => w.put_u16_be(x),
            PacketNumber::U24(x) => w.put_slice(&x.to_be_bytes()[1..]),
            PacketNumber::U32(x) => w.put_u32_be(x),
        }
    }

    pub fn decode(len: usize, buf: &mut Bytes) -> Option<Self> {
        if buf.len() < len {
            return None;
        }
        Some(match len {
            1 => PacketNumber::U8(buf.get_u8()),
            2 => PacketNumber::U16(buf.get_u16_be()),
            3 => {
                let mut tmp = [0u8; 4];
                tmp[1..].copy_from_slice(&buf.split_to(3));
                PacketNumber::U24(u32::from_be_bytes(tmp))
            }
            4 => PacketNumber::U32(buf.get_u32_be()),
            _ => return None,
        })
    }

    /// Reconstruct the full 62-bit packet number nearest `expected = largest
    /// received + 1` consistent with these low-order bits.
    pub fn expand(self, largest_received: u64) -> u64 {
        let (truncated, bits) = match self {
            PacketNumber::U8(x) => (u64::from(x), 8),
            PacketNumber::U16(x) => (u64::from(x), 16),
            PacketNumber::U24(x) => (u64::from(x), 24),
            PacketNumber::U32(x) => (u64::from(x), 32),
        };
        let expected = largest_received + 1;
        let win = 1u64 << bits;
        let hwin = win / 2;
        let mask = win - 1;
        let candidate = (expected & !mask) | truncated;
        if candidate + hwin <= expected && candidate < (1 << 62) - win {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// A parsed packet header. Header protection has already been removed and
/// the packet number decoded by the time this is produced by
/// [`PartialDecode::finish`].
#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
        spin: bool,
    },
    VersionNegotiate {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    pub fn is_long(&self) -> bool {
        !matches!(self, Header::Short { .. })
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, Header::Initial { .. })
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        match self {
            Header::Initial { dst_cid, .. } => dst_cid,
            Header::Long { dst_cid, .. } => dst_cid,
            Header::Retry { dst_cid, .. } => dst_cid,
            Header::Short { dst_cid, .. } => dst_cid,
            Header::VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    /// Encode everything up to (but not including) the packet-number field
    /// protection; returns the offset at which the packet number begins
    /// and, for long headers, a placeholder to patch the length field.
    pub fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        let start = w.len();
        match *self {
            Header::Initial {
                ref src_cid,
                ref dst_cid,
                ref token,
                number,
            } => {
                w.put_u8(0b1100_0000 | LongType::Initial.bits() << 4 | (number.len() as u8 - 1));
                w.put_u32_be(VERSION);
                encode_cid_pair(w, dst_cid, src_cid);
                w.write_varint(varint_of(token.len() as u64));
                w.put_slice(token);
                let len_offset = w.len();
                // Reserve the 2-byte varint form (prefix 0b01) regardless of
                // the placeholder value, so `PartialEncode::finish`'s 2-byte
                // patch lines up with what was actually reserved here.
                w.put_u16_be(0x4000);
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    pn_offset,
                    pn_len: number.len(),
                    len_offset: Some(len_offset),
                }
            }
            Header::Long {
                ty,
                ref src_cid,
                ref dst_cid,
                number,
            } => {
                w.put_u8(0b1100_0000 | ty.bits() << 4 | (number.len() as u8 - 1));
                w.put_u32_be(VERSION);
                encode_cid_pair(w, dst_cid, src_cid);
                let len_offset = w.len();
                w.put_u16_be(0x4000);
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    pn_offset,
                    pn_len: number.len(),
                    len_offset: Some(len_offset),
                }
            }
            Header::Retry {
                ref src_cid,
                ref dst_cid,
                ref token,
            } => {
                w.put_u8(0b1100_0000 | LongType::Retry.bits() << 4);
                w.put_u32_be(VERSION);
                encode_cid_pair(w, dst_cid, src_cid);
                w.put_slice(token);
                PartialEncode {
                    start,
                    pn_offset: w.len(),
                    pn_len: 0,
                    len_offset: None,
                }
            }
            Header::Short {
                ref dst_cid,
                number,
                key_phase,
                spin,
            } => {
                w.put_u8(
                    0b0100_0000
                        | (spin as u8) << 5
                        | (key_phase as u8) << 2
                        | (number.len() as u8 - 1),
                );
                w.put_slice(dst_cid);
                let pn_offset = w.len();
                number.encode(w);
                PartialEncode {
                    start,
                    pn_offset,
                    pn_len: number.len(),
                    len_offset: None,
                }
            }
            Header::VersionNegotiate {
                ref src_cid,
                ref dst_cid,
            } => {
                w.put_u8(0x80);
                w.put_u32_be(0);
                encode_cid_pair(w, dst_cid, src_cid);
                PartialEncode {
                    start,
                    pn_offset: w.len(),
                    pn_len: 0,
                    len_offset: None,
                }
            }
        }
    }
}

fn varint_of(x: u64) -> crate::VarInt {
    crate::VarInt::from_u64(x).expect("length fits in a varint")
}

fn encode_cid_pair(w: &mut Vec<u8>, dst: &ConnectionId, src: &ConnectionId) {
    w.put_u8(dst.len() as u8);
    w.put_slice(dst);
    w.put_u8(src.len() as u8);
    w.put_slice(src);
}

/// Bookkeeping returned by `Header::encode` so the caller can apply header
/// protection and, for long headers, patch in the true payload length once
/// the AEAD tag length is known.
pub struct PartialEncode {
    pub start: usize,
    pub pn_offset: usize,
    pub pn_len: usize,
    len_offset: Option<usize>,
}

impl PartialEncode {
    /// Patch the Length field of a long header now that the total encrypted
    /// payload size (packet number + ciphertext + tag) is known.
    pub fn finish(&self, buf: &mut [u8], payload_len: usize) {
        if let Some(len_offset) = self.len_offset {
            // Always patch as the 2-byte varint form (prefix 0b01), matching
            // the 2-byte placeholder `Header::encode` reserved.
            let val = payload_len as u64;
            debug_assert!(val < 1 << 14, "payload too large for 2-byte length varint");
            let out = &mut buf[len_offset..len_offset + 2];
            out[0] = 0b0100_0000 | (val >> 8) as u8;
            out[1] = (val & 0xff) as u8;
        }
    }
}

#[derive(Debug, Fail)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version {}", version)]
    UnsupportedVersion {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        version: u32,
    },
    #[fail(display = "invalid header: {}", reason)]
    InvalidHeader { reason: &'static str },
}

/// The result of parsing just enough of a packet to route it: the
/// destination CID and, for long headers, the version and type. Header
/// protection has not yet been removed.
pub struct PartialDecode {
    buf: BytesMut,
    is_long: bool,
    version: u32,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    token: Bytes,
    long_ty: Option<LongType>,
    /// Offset of the (still-protected) packet-number field.
    pn_offset: usize,
    /// For long headers, the size of the PN+payload region as declared by
    /// the Length field — this packet ends at `pn_offset + len`, and
    /// anything past that is a coalesced packet.
    len: Option<u64>,
}

impl PartialDecode {
    /// Parse the version-invariant prefix of one packet out of `data`,
    /// which may contain multiple coalesced packets.
    pub fn new(data: BytesMut, local_cid_len: usize) -> Result<Self, PacketDecodeError> {
        let mut buf = data;
        if buf.is_empty() {
            return Err(PacketDecodeError::InvalidHeader {
                reason: "empty datagram",
            });
        }
        let first_byte = buf[0];
        if first_byte & 0x80 != 0 {
            // Long header.
            if buf.len() < 5 {
                return Err(PacketDecodeError::InvalidHeader {
                    reason: "truncated long header",
                });
            }
            let version = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
            let mut cursor = std::io::Cursor::new(&buf[5..]);
            let dcil = cursor.get::<u8>().map_err(|_| PacketDecodeError::InvalidHeader {
                reason: "truncated CID length",
            })? as usize;
            if cursor.remaining() < dcil {
                return Err(PacketDecodeError::InvalidHeader {
                    reason: "truncated destination CID",
                });
            }
            let dst_cid = ConnectionId::new(&cursor.bytes()[..dcil]);
            cursor.advance(dcil);
            let scil = cursor
                .get::<u8>()
                .map_err(|_| PacketDecodeError::InvalidHeader {
                    reason: "truncated CID length",
                })? as usize;
            if cursor.remaining() < scil {
                return Err(PacketDecodeError::InvalidHeader {
                    reason: "truncated source CID",
                });
            }
            let src_cid = ConnectionId::new(&cursor.bytes()[..scil]);
            cursor.advance(scil);

            if version == 0 {
                // Version negotiation: no further invariant structure, and
                // it is never coalesced with anything else.
                let pn_offset = buf.len() - cursor.remaining();
                return Ok(Self {
                    buf,
                    is_long: true,
                    version: 0,
                    dst_cid,
                    src_cid,
                    token: Bytes::new(),
                    long_ty: None,
                    pn_offset,
                    len: None,
                });
            }
            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    src_cid,
                    dst_cid,
                    version,
                });
            }

            let long_ty = LongType::from_bits(first_byte >> 4);
            let mut token = Bytes::new();
            if long_ty == LongType::Initial {
                let token_len = cursor
                    .get_varint()
                    .map_err(|_| PacketDecodeError::InvalidHeader {
                        reason: "truncated token length",
                    })?
                    .into_inner() as usize;
                if cursor.remaining() < token_len {
                    return Err(PacketDecodeError::InvalidHeader {
                        reason: "truncated token",
                    });
                }
                token = Bytes::from(&cursor.bytes()[..token_len]);
                cursor.advance(token_len);
            }
            if long_ty == LongType::Retry {
                // Retry has no Length field and no packet number; its body
                // runs to the end of the datagram, and it is never
                // coalesced with anything else.
                let pn_offset = buf.len() - cursor.remaining();
                return Ok(Self {
                    buf,
                    is_long: true,
                    version,
                    dst_cid,
                    src_cid,
                    token: Bytes::new(),
                    long_ty: Some(long_ty),
                    pn_offset,
                    len: None,
                });
            }

            // Initial, 0-RTT, and Handshake all carry an explicit Length
            // covering the packet number and the payload that follows it.
            let len = cursor
                .get_varint()
                .map_err(|_| PacketDecodeError::InvalidHeader {
                    reason: "truncated length",
                })?
                .into_inner();
            let pn_offset = buf.len() - cursor.remaining();
            if (cursor.remaining() as u64) < len {
                return Err(PacketDecodeError::InvalidHeader {
                    reason: "length exceeds datagram",
                });
            }
            Ok(Self {
                buf,
                is_long: true,
                version,
                dst_cid,
                src_cid,
                token,
                long_ty: Some(long_ty),
                pn_offset,
                len: Some(len),
            })
        } else {
            // Short header: no length field, no explicit SCID; DCID length
            // is implicit (negotiated out of band). Never coalesced: it
            // always runs to the end of the datagram.
            if buf.len() < 1 + local_cid_len {
                return Err(PacketDecodeError::InvalidHeader {
                    reason: "truncated short header",
                });
            }
            let dst_cid = ConnectionId::new(&buf[1..1 + local_cid_len]);
            Ok(Self {
                buf,
                is_long: false,
                version: VERSION,
                dst_cid,
                src_cid: ConnectionId::new(&[]),
                token: Bytes::new(),
                long_ty: None,
                pn_offset: 1 + local_cid_len,
                len: None,
            })
        }
    }

    pub fn has_long_header(&self) -> bool {
        self.is_long
    }

    pub fn is_initial(&self) -> bool {
        self.long_ty == Some(LongType::Initial)
    }

    pub fn is_handshake(&self) -> bool {
        self.long_ty == Some(LongType::Handshake)
    }

    pub fn dst_cid(&self) -> ConnectionId {
        self.dst_cid
    }

    pub fn src_cid(&self) -> ConnectionId {
        self.src_cid
    }

    /// Total length of the datagram region this (possibly coalesced)
    /// packet occupies, including anything following it.
    pub fn remaining_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Remove header protection using `hp_key` and finish decoding: decode
    /// the packet number, split off this packet's bytes from any trailing
    /// coalesced packets, and return both.
    pub fn finish(
        self,
        hp_key: Option<&dyn crate::crypto::HeaderKey>,
    ) -> Result<(Packet, Option<BytesMut>), PacketDecodeError> {
        if self.long_ty == Some(LongType::Retry) {
            let mut buf = self.buf;
            let header_data = buf.split_to(self.pn_offset).freeze();
            let payload = buf;
            return Ok((
                Packet {
                    header: Header::Retry {
                        src_cid: self.src_cid,
                        dst_cid: self.dst_cid,
                    },
                    header_data,
                    payload,
                },
                None,
            ));
        }
        if self.version == 0 {
            let mut buf = self.buf;
            let payload = buf.split_off(0);
            return Ok((
                Packet {
                    header: Header::VersionNegotiate {
                        src_cid: self.src_cid,
                        dst_cid: self.dst_cid,
                    },
                    header_data: Bytes::new(),
                    payload,
                },
                None,
            ));
        }

        let mut buf = self.buf;

        if let Some(hp_key) = hp_key {
            let sample_offset = self.pn_offset + 4;
            if buf.len() < sample_offset + hp_key.sample_size() {
                return Err(PacketDecodeError::InvalidHeader {
                    reason: "packet too short for header-protection sample",
                });
            }
            let (header, sample) = buf.split_at_mut(sample_offset);
            let sample = &sample[..hp_key.sample_size()];
            let (first, rest) = header.split_at_mut(1);
            let pn_bytes = &mut rest[self.pn_offset - 1..];
            hp_key.decrypt(sample, &mut first[0], pn_bytes);
        }

        let pn_len = (buf[0] & 0x03) as usize + 1;
        let header_len = self.pn_offset + pn_len;
        let header_data = buf.split_to(header_len);
        let number = PacketNumber::decode(pn_len, &mut buf).ok_or(PacketDecodeError::InvalidHeader {
            reason: "truncated packet number",
        })?;

        // For long headers with an explicit Length, split off anything past
        // this packet's payload as a trailing coalesced packet.
        let rest = if self.is_long {
            let len = self.len.ok_or(PacketDecodeError::InvalidHeader {
                reason: "long header missing length",
            })?;
            let payload_len = (len as usize)
                .checked_sub(pn_len)
                .ok_or(PacketDecodeError::InvalidHeader {
                    reason: "length field shorter than packet number",
                })?;
            if payload_len > buf.len() {
                return Err(PacketDecodeError::InvalidHeader {
                    reason: "length field exceeds datagram",
                });
            }
            if payload_len < buf.len() {
                Some(buf.split_off(payload_len))
            } else {
                None
            }
        } else {
            None
        };

        let header = if self.is_long {
            match self.long_ty.unwrap() {
                LongType::Initial => Header::Initial {
                    src_cid: self.src_cid,
                    dst_cid: self.dst_cid,
                    token: self.token,
                    number,
                },
                ty => Header::Long {
                    ty,
                    src_cid: self.src_cid,
                    dst_cid: self.dst_cid,
                    number,
                },
            }
        } else {
            Header::Short {
                dst_cid: self.dst_cid,
                number,
                key_phase: header_data[0] & 0b0000_0100 != 0,
                spin: header_data[0] & 0b0010_0000 != 0,
            }
        };

        Ok((
            Packet {
                header,
                header_data: header_data.freeze(),
                payload: buf,
            },
            rest,
        ))
    }
}

/// A fully decoded packet: header, the exact header bytes (AEAD associated
/// data), and the still-encrypted payload.
pub struct Packet {
    pub header: Header,
    pub header_data: Bytes,
    pub payload: BytesMut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_number_width_selection() {
        // Scenario B from the spec: largest_acked = 0xABE8BC, next packet
        // 0xAC5C02 must encode with >= 2 bytes.
        let pn = PacketNumber::new(0x00AC_5C02, Some(0x00AB_E8BC));
        assert!(pn.len() >= 2);
        if let PacketNumber::U16(x) = pn {
            assert_eq!(x, 0x5C02);
        } else if let PacketNumber::U24(_) | PacketNumber::U32(_) = pn {
            // also acceptable, just not as tight
        } else {
            panic!("expected at least 2 bytes");
        }
    }

    #[test]
    fn packet_number_expansion() {
        // Scenario B, second half: largest_acked = 0xA82F30EA, truncated
        // 16-bit value 0x9B32 must decode to 0xA82F9B32.
        let expanded = PacketNumber::U16(0x9B32).expand(0xA82F_30EA);
        assert_eq!(expanded, 0xA82F_9B32);
    }

    #[test]
    fn truncation_round_trips_within_window() {
        for largest in [0u64, 100, 1 << 20, 1 << 40].iter().cloned() {
            for delta in 0u64..5 {
                let pn = largest + delta;
                let truncated = PacketNumber::new(pn, Some(largest));
                assert_eq!(truncated.expand(largest), pn);
            }
        }
    }

    #[test]
    fn connection_id_display_is_hex() {
        let cid = ConnectionId::new(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(format!("{}", cid), "deadbeef");
    }
}
