//! C3 FrameEngine: the frame type table and frame encode/decode.
//!
//! Retransmission policy and ACK generation live in `connection::spaces`,
//! which owns the per-packet-number-space sent-packet table this module's
//! [`Frame`] values get tucked into as retransmission tokens; this module
//! only knows the wire shape of each frame and the static
//! permission/ack-eliciting/retransmit classification that shape implies.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::coding::{BufExt, BufMutExt};
use crate::packet::ConnectionId;
use crate::range_set::RangeSet;
use crate::varint::VarInt;
use crate::{ApplicationErrorCode, StreamId, TransportError, RESET_TOKEN_SIZE};

macro_rules! frame_types {
    ($($name:ident = $val:expr,)*) => {
        $(pub const $name: u64 = $val;)*
    };
}

frame_types! {
    TYPE_PADDING = 0x00,
    TYPE_PING = 0x01,
    TYPE_ACK = 0x02,
    TYPE_ACK_ECN = 0x03,
    TYPE_RESET_STREAM = 0x04,
    TYPE_STOP_SENDING = 0x05,
    TYPE_CRYPTO = 0x06,
    TYPE_NEW_TOKEN = 0x07,
    // STREAM occupies 0x08..=0x0f; the low three bits are OFF/LEN/FIN.
    TYPE_STREAM = 0x08,
    TYPE_MAX_DATA = 0x10,
    TYPE_MAX_STREAM_DATA = 0x11,
    TYPE_MAX_STREAMS_BIDI = 0x12,
    TYPE_MAX_STREAMS_UNI = 0x13,
    TYPE_DATA_BLOCKED = 0x14,
    TYPE_STREAM_DATA_BLOCKED = 0x15,
    TYPE_STREAMS_BLOCKED_BIDI = 0x16,
    TYPE_STREAMS_BLOCKED_UNI = 0x17,
    TYPE_NEW_CONNECTION_ID = 0x18,
    TYPE_RETIRE_CONNECTION_ID = 0x19,
    TYPE_PATH_CHALLENGE = 0x1a,
    TYPE_PATH_RESPONSE = 0x1b,
    TYPE_CONNECTION_CLOSE = 0x1c,
    TYPE_CONNECTION_CLOSE_APP = 0x1d,
    TYPE_HANDSHAKE_DONE = 0x1e,
}

/// STREAM frame low bits: OFF present, LEN present, FIN set.
const STREAM_OFF_BIT: u64 = 0x04;
const STREAM_LEN_BIT: u64 = 0x02;
const STREAM_FIN_BIT: u64 = 0x01;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream {
        id: StreamId,
        error_code: ApplicationErrorCode,
        final_size: VarInt,
    },
    StopSending {
        id: StreamId,
        error_code: ApplicationErrorCode,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData {
        id: StreamId,
        max: VarInt,
    },
    MaxStreams {
        dir: crate::Dir,
        count: VarInt,
    },
    DataBlocked {
        offset: VarInt,
    },
    StreamDataBlocked {
        id: StreamId,
        offset: VarInt,
    },
    StreamsBlocked {
        dir: crate::Dir,
        limit: VarInt,
    },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        id: ConnectionId,
        reset_token: [u8; RESET_TOKEN_SIZE],
    },
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge {
        token: [u8; 8],
    },
    PathResponse {
        token: [u8; 8],
    },
    ConnectionClose(ConnectionClose),
    HandshakeDone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub largest: u64,
    pub delay: u64,
    /// Disjoint, increasing ranges of acknowledged packet numbers (as
    /// produced by [`RangeSet`]); the wire encoding visits these
    /// newest-first, which is why `encode`/`decode` walk this set in
    /// reverse.
    pub ranges: RangeSet,
    pub ecn: Option<EcnCounts>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionClose {
    Transport {
        error_code: TransportError,
        frame_type: Option<VarInt>,
        reason: Bytes,
    },
    Application {
        error_code: ApplicationErrorCode,
        reason: Bytes,
    },
}

#[derive(Debug, Fail)]
pub enum FrameDecodeError {
    #[fail(display = "unknown frame type {:#x}", ty)]
    UnknownType { ty: u64 },
    #[fail(display = "malformed frame body")]
    Malformed,
}

impl From<FrameDecodeError> for TransportError {
    fn from(e: FrameDecodeError) -> TransportError {
        match e {
            FrameDecodeError::UnknownType { .. } => TransportError::FRAME_ENCODING_ERROR,
            FrameDecodeError::Malformed => TransportError::FRAME_ENCODING_ERROR,
        }
    }
}

impl Frame {
    /// The numeric type this frame would encode as, for permission-matrix
    /// and retransmission-policy lookups that only need the type, not the
    /// decoded body (mirrors the teacher's `Frame::ty()`).
    pub fn ty(&self) -> u64 {
        match self {
            Frame::Padding => TYPE_PADDING,
            Frame::Ping => TYPE_PING,
            Frame::Ack(a) => {
                if a.ecn.is_some() {
                    TYPE_ACK_ECN
                } else {
                    TYPE_ACK
                }
            }
            Frame::ResetStream { .. } => TYPE_RESET_STREAM,
            Frame::StopSending { .. } => TYPE_STOP_SENDING,
            Frame::Crypto { .. } => TYPE_CRYPTO,
            Frame::NewToken { .. } => TYPE_NEW_TOKEN,
            Frame::Stream(s) => {
                TYPE_STREAM
                    | if s.offset != 0 { STREAM_OFF_BIT } else { 0 }
                    | STREAM_LEN_BIT
                    | if s.fin { STREAM_FIN_BIT } else { 0 }
            }
            Frame::MaxData(_) => TYPE_MAX_DATA,
            Frame::MaxStreamData { .. } => TYPE_MAX_STREAM_DATA,
            Frame::MaxStreams { dir, .. } => match dir {
                crate::Dir::Bi => TYPE_MAX_STREAMS_BIDI,
                crate::Dir::Uni => TYPE_MAX_STREAMS_UNI,
            },
            Frame::DataBlocked { .. } => TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked { dir, .. } => match dir {
                crate::Dir::Bi => TYPE_STREAMS_BLOCKED_BIDI,
                crate::Dir::Uni => TYPE_STREAMS_BLOCKED_UNI,
            },
            Frame::NewConnectionId { .. } => TYPE_NEW_CONNECTION_ID,
            Frame::RetireConnectionId { .. } => TYPE_RETIRE_CONNECTION_ID,
            Frame::PathChallenge { .. } => TYPE_PATH_CHALLENGE,
            Frame::PathResponse { .. } => TYPE_PATH_RESPONSE,
            Frame::ConnectionClose(ConnectionClose::Transport { .. }) => TYPE_CONNECTION_CLOSE,
            Frame::ConnectionClose(ConnectionClose::Application { .. }) => TYPE_CONNECTION_CLOSE_APP,
            Frame::HandshakeDone => TYPE_HANDSHAKE_DONE,
        }
    }

    /// A packet containing only these is not ack-eliciting (§2.2 of the
    /// protocol's ack-eliciting-packet rule, restated by the Glossary
    /// entry carried over verbatim).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_) | Frame::Padding | Frame::ConnectionClose(_)
        )
    }

    /// Whether this frame's information should be resent, verbatim, when
    /// the packet carrying it is declared lost. Frames whose retransmit
    /// policy instead resends a *current* value (flow-control credit) or
    /// is conditional on connection state (blocked/path-validation frames)
    /// are handled by the caller inspecting `self` directly; this only
    /// covers the frames with an unconditional resend-verbatim rule.
    pub fn resend_verbatim_on_loss(&self) -> bool {
        match self {
            Frame::Crypto { .. }
            | Frame::Stream(_)
            | Frame::ResetStream { .. }
            | Frame::StopSending { .. }
            | Frame::NewConnectionId { .. }
            | Frame::RetireConnectionId { .. }
            | Frame::NewToken { .. }
            | Frame::HandshakeDone => true,
            Frame::PathChallenge { .. }
            | Frame::PathResponse { .. }
            | Frame::Ping
            | Frame::Padding
            | Frame::ConnectionClose(_)
            | Frame::MaxData(_)
            | Frame::MaxStreamData { .. }
            | Frame::MaxStreams { .. }
            | Frame::DataBlocked { .. }
            | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlocked { .. }
            | Frame::Ack(_) => false,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Frame::Padding => buf.write_varint(VarInt::from_u64(TYPE_PADDING).unwrap()),
            Frame::Ping => buf.write_varint(VarInt::from_u64(TYPE_PING).unwrap()),
            Frame::Ack(ack) => encode_ack(ack, buf),
            Frame::ResetStream {
                id,
                error_code,
                final_size,
            } => {
                buf.write_varint(VarInt::from_u64(TYPE_RESET_STREAM).unwrap());
                buf.write_varint((*id).into());
                buf.write_varint(*error_code);
                buf.write_varint(*final_size);
            }
            Frame::StopSending { id, error_code } => {
                buf.write_varint(VarInt::from_u64(TYPE_STOP_SENDING).unwrap());
                buf.write_varint((*id).into());
                buf.write_varint(*error_code);
            }
            Frame::Crypto { offset, data } => {
                buf.write_varint(VarInt::from_u64(TYPE_CRYPTO).unwrap());
                buf.write_varint(VarInt::from_u64(*offset).unwrap());
                buf.write_varint(VarInt::from_u64(data.len() as u64).unwrap());
                buf.put_slice(data);
            }
            Frame::NewToken { token } => {
                buf.write_varint(VarInt::from_u64(TYPE_NEW_TOKEN).unwrap());
                buf.write_varint(VarInt::from_u64(token.len() as u64).unwrap());
                buf.put_slice(token);
            }
            Frame::Stream(s) => encode_stream(s, buf),
            Frame::MaxData(max) => {
                buf.write_varint(VarInt::from_u64(TYPE_MAX_DATA).unwrap());
                buf.write_varint(*max);
            }
            Frame::MaxStreamData { id, max } => {
                buf.write_varint(VarInt::from_u64(TYPE_MAX_STREAM_DATA).unwrap());
                buf.write_varint((*id).into());
                buf.write_varint(*max);
            }
            Frame::MaxStreams { dir, count } => {
                let ty = match dir {
                    crate::Dir::Bi => TYPE_MAX_STREAMS_BIDI,
                    crate::Dir::Uni => TYPE_MAX_STREAMS_UNI,
                };
                buf.write_varint(VarInt::from_u64(ty).unwrap());
                buf.write_varint(*count);
            }
            Frame::DataBlocked { offset } => {
                buf.write_varint(VarInt::from_u64(TYPE_DATA_BLOCKED).unwrap());
                buf.write_varint(*offset);
            }
            Frame::StreamDataBlocked { id, offset } => {
                buf.write_varint(VarInt::from_u64(TYPE_STREAM_DATA_BLOCKED).unwrap());
                buf.write_varint((*id).into());
                buf.write_varint(*offset);
            }
            Frame::StreamsBlocked { dir, limit } => {
                let ty = match dir {
                    crate::Dir::Bi => TYPE_STREAMS_BLOCKED_BIDI,
                    crate::Dir::Uni => TYPE_STREAMS_BLOCKED_UNI,
                };
                buf.write_varint(VarInt::from_u64(ty).unwrap());
                buf.write_varint(*limit);
            }
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                id,
                reset_token,
            } => {
                buf.write_varint(VarInt::from_u64(TYPE_NEW_CONNECTION_ID).unwrap());
                buf.write_varint(VarInt::from_u64(*sequence).unwrap());
                buf.write_varint(VarInt::from_u64(*retire_prior_to).unwrap());
                buf.put_u8(id.len() as u8);
                buf.put_slice(id);
                buf.put_slice(reset_token);
            }
            Frame::RetireConnectionId { sequence } => {
                buf.write_varint(VarInt::from_u64(TYPE_RETIRE_CONNECTION_ID).unwrap());
                buf.write_varint(VarInt::from_u64(*sequence).unwrap());
            }
            Frame::PathChallenge { token } => {
                buf.write_varint(VarInt::from_u64(TYPE_PATH_CHALLENGE).unwrap());
                buf.put_slice(token);
            }
            Frame::PathResponse { token } => {
                buf.write_varint(VarInt::from_u64(TYPE_PATH_RESPONSE).unwrap());
                buf.put_slice(token);
            }
            Frame::ConnectionClose(cc) => encode_connection_close(cc, buf),
            Frame::HandshakeDone => buf.write_varint(VarInt::from_u64(TYPE_HANDSHAKE_DONE).unwrap()),
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameDecodeError> {
        let ty = buf
            .get_varint()
            .map_err(|_| FrameDecodeError::Malformed)?
            .into_inner();
        if ty >= TYPE_STREAM && ty < TYPE_MAX_DATA {
            return decode_stream(ty, buf);
        }
        Ok(match ty {
            TYPE_PADDING => Frame::Padding,
            TYPE_PING => Frame::Ping,
            TYPE_ACK => decode_ack(buf, false)?,
            TYPE_ACK_ECN => decode_ack(buf, true)?,
            TYPE_RESET_STREAM => Frame::ResetStream {
                id: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into(),
                error_code: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
                final_size: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_STOP_SENDING => Frame::StopSending {
                id: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into(),
                error_code: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_CRYPTO => {
                let offset = buf
                    .get_varint()
                    .map_err(|_| FrameDecodeError::Malformed)?
                    .into_inner();
                let len = buf
                    .get_varint()
                    .map_err(|_| FrameDecodeError::Malformed)?
                    .into_inner() as usize;
                if buf.remaining() < len {
                    return Err(FrameDecodeError::Malformed);
                }
                let mut data = vec![0u8; len];
                buf.copy_to_slice(&mut data);
                Frame::Crypto {
                    offset,
                    data: Bytes::from(data),
                }
            }
            TYPE_NEW_TOKEN => {
                let len = buf
                    .get_varint()
                    .map_err(|_| FrameDecodeError::Malformed)?
                    .into_inner() as usize;
                if buf.remaining() < len {
                    return Err(FrameDecodeError::Malformed);
                }
                let mut token = vec![0u8; len];
                buf.copy_to_slice(&mut token);
                Frame::NewToken {
                    token: Bytes::from(token),
                }
            }
            TYPE_MAX_DATA => Frame::MaxData(buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?),
            TYPE_MAX_STREAM_DATA => Frame::MaxStreamData {
                id: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into(),
                max: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_MAX_STREAMS_BIDI => Frame::MaxStreams {
                dir: crate::Dir::Bi,
                count: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: crate::Dir::Uni,
                count: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_DATA_BLOCKED => Frame::DataBlocked {
                offset: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into(),
                offset: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                dir: crate::Dir::Bi,
                limit: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                dir: crate::Dir::Uni,
                limit: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?,
            },
            TYPE_NEW_CONNECTION_ID => {
                let sequence = buf
                    .get_varint()
                    .map_err(|_| FrameDecodeError::Malformed)?
                    .into_inner();
                let retire_prior_to = buf
                    .get_varint()
                    .map_err(|_| FrameDecodeError::Malformed)?
                    .into_inner();
                let len = buf.get::<u8>().map_err(|_| FrameDecodeError::Malformed)? as usize;
                if buf.remaining() < len + RESET_TOKEN_SIZE {
                    return Err(FrameDecodeError::Malformed);
                }
                let mut cid_bytes = vec![0u8; len];
                buf.copy_to_slice(&mut cid_bytes);
                let mut reset_token = [0u8; RESET_TOKEN_SIZE];
                buf.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId {
                    sequence,
                    retire_prior_to,
                    id: ConnectionId::new(&cid_bytes),
                    reset_token,
                }
            }
            TYPE_RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: buf
                    .get_varint()
                    .map_err(|_| FrameDecodeError::Malformed)?
                    .into_inner(),
            },
            TYPE_PATH_CHALLENGE => {
                let mut token = [0u8; 8];
                if buf.remaining() < 8 {
                    return Err(FrameDecodeError::Malformed);
                }
                buf.copy_to_slice(&mut token);
                Frame::PathChallenge { token }
            }
            TYPE_PATH_RESPONSE => {
                let mut token = [0u8; 8];
                if buf.remaining() < 8 {
                    return Err(FrameDecodeError::Malformed);
                }
                buf.copy_to_slice(&mut token);
                Frame::PathResponse { token }
            }
            TYPE_CONNECTION_CLOSE => {
                let error_code =
                    TransportError(buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into_inner());
                let frame_type = Some(buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?);
                let reason = read_reason(buf)?;
                Frame::ConnectionClose(ConnectionClose::Transport {
                    error_code,
                    frame_type,
                    reason,
                })
            }
            TYPE_CONNECTION_CLOSE_APP => {
                let error_code = buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?;
                let reason = read_reason(buf)?;
                Frame::ConnectionClose(ConnectionClose::Application { error_code, reason })
            }
            TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,
            ty => return Err(FrameDecodeError::UnknownType { ty }),
        })
    }
}

fn read_reason<B: Buf>(buf: &mut B) -> Result<Bytes, FrameDecodeError> {
    let len = buf
        .get_varint()
        .map_err(|_| FrameDecodeError::Malformed)?
        .into_inner() as usize;
    if buf.remaining() < len {
        return Err(FrameDecodeError::Malformed);
    }
    let mut reason = vec![0u8; len];
    buf.copy_to_slice(&mut reason);
    Ok(Bytes::from(reason))
}

fn encode_connection_close<B: BufMut>(cc: &ConnectionClose, buf: &mut B) {
    match cc {
        ConnectionClose::Transport {
            error_code,
            frame_type,
            reason,
        } => {
            buf.write_varint(VarInt::from_u64(TYPE_CONNECTION_CLOSE).unwrap());
            buf.write_varint(VarInt::from_u64(error_code.0).unwrap());
            buf.write_varint(frame_type.unwrap_or_else(|| VarInt::from_u64(0).unwrap()));
            buf.write_varint(VarInt::from_u64(reason.len() as u64).unwrap());
            buf.put_slice(reason);
        }
        ConnectionClose::Application { error_code, reason } => {
            buf.write_varint(VarInt::from_u64(TYPE_CONNECTION_CLOSE_APP).unwrap());
            buf.write_varint(*error_code);
            buf.write_varint(VarInt::from_u64(reason.len() as u64).unwrap());
            buf.put_slice(reason);
        }
    }
}

fn encode_stream<B: BufMut>(s: &Stream, buf: &mut B) {
    let mut ty = TYPE_STREAM | STREAM_LEN_BIT;
    if s.offset != 0 {
        ty |= STREAM_OFF_BIT;
    }
    if s.fin {
        ty |= STREAM_FIN_BIT;
    }
    buf.write_varint(VarInt::from_u64(ty).unwrap());
    buf.write_varint((s.id).into());
    if s.offset != 0 {
        buf.write_varint(VarInt::from_u64(s.offset).unwrap());
    }
    buf.write_varint(VarInt::from_u64(s.data.len() as u64).unwrap());
    buf.put_slice(&s.data);
}

fn decode_stream<B: Buf>(ty: u64, buf: &mut B) -> Result<Frame, FrameDecodeError> {
    let bits = ty - TYPE_STREAM;
    let off = bits & STREAM_OFF_BIT != 0;
    let len_present = bits & STREAM_LEN_BIT != 0;
    let fin = bits & STREAM_FIN_BIT != 0;

    let id: StreamId = buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into();
    let offset = if off {
        buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into_inner()
    } else {
        0
    };
    let len = if len_present {
        buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into_inner() as usize
    } else {
        buf.remaining()
    };
    if buf.remaining() < len {
        return Err(FrameDecodeError::Malformed);
    }
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(Frame::Stream(Stream {
        id,
        offset,
        fin,
        data: Bytes::from(data),
    }))
}

fn encode_ack<B: BufMut>(ack: &Ack, buf: &mut B) {
    let ty = if ack.ecn.is_some() { TYPE_ACK_ECN } else { TYPE_ACK };
    buf.write_varint(VarInt::from_u64(ty).unwrap());
    buf.write_varint(VarInt::from_u64(ack.largest).unwrap());
    buf.write_varint(VarInt::from_u64(ack.delay).unwrap());

    // Ranges are stored smallest-to-largest; the wire format visits them
    // newest (largest) first, each as a gap-from-the-previous-range plus a
    // range length, both relative and both one-less-than-the-true-count.
    let mut ranges: Vec<_> = ack.ranges.iter().collect();
    ranges.sort_by_key(|r| r.start);
    buf.write_varint(VarInt::from_u64((ranges.len() - 1) as u64).unwrap());

    let mut iter = ranges.iter().rev();
    let first = iter.next().expect("ack always has at least one range");
    buf.write_varint(VarInt::from_u64(first.end - 1 - first.start).unwrap());
    let mut prev_smallest = first.start;
    for range in iter {
        let gap = prev_smallest - range.end - 1;
        let len = range.end - 1 - range.start;
        buf.write_varint(VarInt::from_u64(gap).unwrap());
        buf.write_varint(VarInt::from_u64(len).unwrap());
        prev_smallest = range.start;
    }

    if let Some(ecn) = &ack.ecn {
        buf.write_varint(VarInt::from_u64(ecn.ect0).unwrap());
        buf.write_varint(VarInt::from_u64(ecn.ect1).unwrap());
        buf.write_varint(VarInt::from_u64(ecn.ce).unwrap());
    }
}

fn decode_ack<B: Buf>(buf: &mut B, ecn: bool) -> Result<Frame, FrameDecodeError> {
    let largest = buf
        .get_varint()
        .map_err(|_| FrameDecodeError::Malformed)?
        .into_inner();
    let delay = buf
        .get_varint()
        .map_err(|_| FrameDecodeError::Malformed)?
        .into_inner();
    let extra_count = buf
        .get_varint()
        .map_err(|_| FrameDecodeError::Malformed)?
        .into_inner();
    let first_len = buf
        .get_varint()
        .map_err(|_| FrameDecodeError::Malformed)?
        .into_inner();

    let mut ranges = RangeSet::new();
    if first_len > largest {
        return Err(FrameDecodeError::Malformed);
    }
    let mut smallest = largest - first_len;
    ranges.insert(smallest..largest + 1);

    for _ in 0..extra_count {
        let gap = buf
            .get_varint()
            .map_err(|_| FrameDecodeError::Malformed)?
            .into_inner();
        let len = buf
            .get_varint()
            .map_err(|_| FrameDecodeError::Malformed)?
            .into_inner();
        let range_end = smallest
            .checked_sub(gap + 2)
            .ok_or(FrameDecodeError::Malformed)?;
        if len > range_end {
            return Err(FrameDecodeError::Malformed);
        }
        smallest = range_end - len;
        ranges.insert(smallest..range_end + 1);
    }

    let ecn = if ecn {
        Some(EcnCounts {
            ect0: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into_inner(),
            ect1: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into_inner(),
            ce: buf.get_varint().map_err(|_| FrameDecodeError::Malformed)?.into_inner(),
        })
    } else {
        None
    };

    Ok(Frame::Ack(Ack {
        largest,
        delay,
        ranges,
        ecn,
    }))
}

/// The frame types a packet of the given long-header type (or `None` for a
/// short-header / 1-RTT packet) is permitted to carry.
pub fn is_permitted(long_ty: Option<crate::packet::LongType>, frame: &Frame) -> bool {
    use crate::packet::LongType;
    match long_ty {
        Some(LongType::Initial) | Some(LongType::Handshake) => matches!(
            frame,
            Frame::Padding
                | Frame::Ping
                | Frame::Ack(_)
                | Frame::Crypto { .. }
                | Frame::ConnectionClose(ConnectionClose::Transport { .. })
        ),
        Some(LongType::ZeroRtt) => !matches!(
            frame,
            Frame::Ack(_) | Frame::NewToken { .. } | Frame::HandshakeDone
        ),
        Some(LongType::Retry) => false,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let mut buf = BytesMut::new();
        Frame::Ping.encode(&mut buf);
        let decoded = Frame::decode(&mut std::io::Cursor::new(&buf[..])).unwrap();
        assert_eq!(decoded, Frame::Ping);
    }

    #[test]
    fn stream_frame_round_trips_with_offset_and_fin() {
        let s = Stream {
            id: StreamId::new(crate::Side::Client, crate::Dir::Bi, 3),
            offset: 17,
            fin: true,
            data: Bytes::from_static(b"hello"),
        };
        let mut buf = BytesMut::new();
        Frame::Stream(s.clone()).encode(&mut buf);
        let decoded = Frame::decode(&mut std::io::Cursor::new(&buf[..])).unwrap();
        assert_eq!(decoded, Frame::Stream(s));
    }

    #[test]
    fn ack_round_trips_with_multiple_ranges() {
        let mut ranges = RangeSet::new();
        ranges.insert(0..3);
        ranges.insert(5..9);
        ranges.insert(20..21);
        let ack = Ack {
            largest: 20,
            delay: 10,
            ranges,
            ecn: None,
        };
        let mut buf = BytesMut::new();
        Frame::Ack(ack.clone()).encode(&mut buf);
        let decoded = Frame::decode(&mut std::io::Cursor::new(&buf[..])).unwrap();
        if let Frame::Ack(decoded_ack) = decoded {
            assert_eq!(decoded_ack.largest, ack.largest);
            assert_eq!(decoded_ack.delay, ack.delay);
            assert_eq!(
                decoded_ack.ranges.iter().collect::<Vec<_>>(),
                ack.ranges.iter().collect::<Vec<_>>()
            );
        } else {
            panic!("expected Ack");
        }
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.write_varint(VarInt::from_u64(0x3f).unwrap());
        assert!(Frame::decode(&mut std::io::Cursor::new(&buf[..])).is_err());
    }

    #[test]
    fn initial_space_forbids_stream_frames() {
        let s = Frame::Stream(Stream {
            id: StreamId::new(crate::Side::Client, crate::Dir::Bi, 0),
            offset: 0,
            fin: false,
            data: Bytes::new(),
        });
        assert!(!is_permitted(Some(crate::packet::LongType::Initial), &s));
        assert!(is_permitted(None, &s));
    }

    #[test]
    fn ack_is_not_ack_eliciting_but_ping_is() {
        assert!(!Frame::Ack(Ack {
            largest: 0,
            delay: 0,
            ranges: { let mut r = RangeSet::new(); r.insert(0..1); r },
            ecn: None,
        })
        .is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
    }
}
