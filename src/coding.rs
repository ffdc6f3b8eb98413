//! Small `bytes::Buf`/`BufMut` extensions used throughout the codec.

use bytes::{Buf, BufMut};

use crate::varint::{self, UnexpectedEnd, VarInt};

pub trait BufExt {
    fn get<T: Codec>(&mut self) -> Result<T, UnexpectedEnd>;
    fn get_varint(&mut self) -> Result<VarInt, UnexpectedEnd>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U, UnexpectedEnd> {
        U::decode(self)
    }

    fn get_varint(&mut self) -> Result<VarInt, UnexpectedEnd> {
        varint::read(self).map(VarInt::from_u64_unchecked)
    }
}

pub trait BufMutExt {
    fn write<T: Codec>(&mut self, x: T);
    fn write_varint(&mut self, x: VarInt);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }

    fn write_varint(&mut self, x: VarInt) {
        varint::write(x.into_inner(), self);
    }
}

/// A value with a fixed-width wire encoding, for the handful of integer
/// widths the packet/frame codecs need beyond the varint domain.
pub trait Codec: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd>;
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_be(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_be(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64_be())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_be(*self);
    }
}
