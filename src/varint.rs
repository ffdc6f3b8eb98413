//! Variable-length integer encoding (C1 Codec).
//!
//! Values in `0..2^62` are encoded in 1, 2, 4, or 8 bytes. The two most
//! significant bits of the first byte encode `log2(length)`; the remaining
//! bits, together with any following bytes, hold the value in network byte
//! order. Every value has a unique shortest encoding; decoders accept only
//! that encoding (a longer-than-necessary packet-number or frame-type
//! encoding is a protocol violation in their respective callers).

use bytes::{Buf, BufMut};
use failure::Fail;
use std::fmt;

/// An integer in `0..2^62`, the domain of the wire varint encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    pub const MAX: VarInt = VarInt((1 << 62) - 1);

    /// Construct a `VarInt` without checking that it fits the 62-bit domain.
    ///
    /// Only safe to use on values already known to be in range, e.g.
    /// constants or values read back from a `VarInt`.
    pub fn from_u64(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        if x <= Self::MAX.0 {
            Ok(VarInt(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }

    /// Number of bytes the shortest encoding of `self` occupies.
    pub fn size(self) -> usize {
        match self.0 {
            x if x < 2u64.pow(6) => 1,
            x if x < 2u64.pow(14) => 2,
            x if x < 2u64.pow(30) => 4,
            x if x < 2u64.pow(62) => 8,
            _ => unreachable!("value out of varint range"),
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        read(buf).map(VarInt)
    }

    /// `read()` already masks to 62 bits, so wrapping its result back into a
    /// `VarInt` can skip the bounds check.
    pub(crate) fn from_u64_unchecked(x: u64) -> Self {
        VarInt(x)
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> u64 {
        x.0
    }
}

impl std::convert::TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        VarInt::from_u64(x)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
#[fail(display = "value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
#[fail(display = "unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Write `x` using the shortest possible varint encoding.
pub fn write<B: BufMut>(x: u64, buf: &mut B) {
    if x < 2u64.pow(6) {
        buf.put_u8(x as u8);
    } else if x < 2u64.pow(14) {
        buf.put_u16_be(0b01 << 14 | x as u16);
    } else if x < 2u64.pow(30) {
        buf.put_u32_be(0b10 << 30 | x as u32);
    } else if x < 2u64.pow(62) {
        buf.put_u64_be(0b11 << 62 | x);
    } else {
        panic!("malformed varint {}", x);
    }
}

/// Read a varint, rejecting truncated buffers.
pub fn read<B: Buf>(buf: &mut B) -> Result<u64, UnexpectedEnd> {
    if !buf.has_remaining() {
        return Err(UnexpectedEnd);
    }
    let mut buf = buf;
    let first = buf.bytes()[0];
    let tag = first >> 6;
    Ok(match tag {
        0b00 => {
            if buf.remaining() < 1 {
                return Err(UnexpectedEnd);
            }
            u64::from(buf.get_u8() & 0b0011_1111)
        }
        0b01 => {
            if buf.remaining() < 2 {
                return Err(UnexpectedEnd);
            }
            u64::from(buf.get_u16_be() & 0b0011_1111_1111_1111)
        }
        0b10 => {
            if buf.remaining() < 4 {
                return Err(UnexpectedEnd);
            }
            u64::from(buf.get_u32_be() & 0b0011_1111_1111_1111_1111_1111_1111_1111)
        }
        0b11 => {
            if buf.remaining() < 8 {
                return Err(UnexpectedEnd);
            }
            buf.get_u64_be() & ((1 << 62) - 1)
        }
        _ => unreachable!(),
    })
}

/// Size in bytes of the shortest encoding of `x`.
pub fn size(x: u64) -> usize {
    match x {
        x if x < 2u64.pow(6) => 1,
        x if x < 2u64.pow(14) => 2,
        x if x < 2u64.pow(30) => 4,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries() {
        let cases: &[(u64, &[u8])] = &[
            (63, &[0x3F]),
            (64, &[0x40, 0x40]),
            (16383, &[0x7F, 0xFF]),
            (16384, &[0x80, 0x00, 0x40, 0x00]),
            ((1 << 30) - 1, &[0xBF, 0xFF, 0xFF, 0xFF]),
            (
                1 << 30,
                &[0xC0, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00],
            ),
        ];
        for &(value, encoded) in cases {
            let mut buf = Vec::new();
            write(value, &mut buf);
            assert_eq!(buf, encoded, "encoding of {}", value);
            let decoded = read(&mut std::io::Cursor::new(&buf[..])).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn round_trip_is_bijective() {
        let mut rng_state = 0x2545_F491_4F6C_DD1Du64;
        for _ in 0..10_000 {
            // xorshift, deterministic without pulling in a RNG dependency for tests
            rng_state ^= rng_state << 13;
            rng_state ^= rng_state >> 7;
            rng_state ^= rng_state << 17;
            let value = rng_state & ((1 << 62) - 1);
            let mut buf = Vec::new();
            write(value, &mut buf);
            assert_eq!(buf.len(), size(value));
            let decoded = read(&mut std::io::Cursor::new(&buf[..])).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let mut buf = Vec::new();
        write(16384, &mut buf);
        buf.truncate(2);
        assert!(read(&mut std::io::Cursor::new(&buf[..])).is_err());
    }
}
