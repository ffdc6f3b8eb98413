//! Core state machine for a UDP-based, multiplexed, connection-oriented,
//! authenticated and encrypted transport protocol.
//!
//! This crate implements the packet-processing pipeline, connection state
//! machine, stream multiplexer, frame engine, and loss/congestion recovery
//! described in the protocol's transport specification. It performs no I/O:
//! callers feed datagrams and timer expirations in via [`Endpoint`], and
//! drain pending transmits, timer updates, and application events back out.
//!
//! The cryptographic handshake itself, the AEAD/header-protection
//! primitives, and the datagram socket are external collaborators; this
//! crate only defines the seams it needs from them (see the [`crypto`]
//! module).

#[macro_use]
extern crate slog;
#[macro_use]
extern crate failure;

use std::fmt;
use std::net::SocketAddr;

pub mod coding;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
pub mod packet;
pub mod range_set;
pub mod recovery;
pub mod token;
pub mod transport_parameters;
pub mod varint;

pub use crate::config::{ClientConfig, Config, ServerConfig, TransportConfig};
pub use crate::connection::{Connection, ConnectionError};
pub use crate::endpoint::{ConnectError, Endpoint, Event, Io, Timer};
pub use crate::packet::ConnectionId;
pub use crate::varint::VarInt;

/// Protocol version 1, the only version this crate negotiates.
pub const VERSION: u32 = 0x0000_0001;

/// Connection IDs are opaque byte strings of at most this many bytes.
pub const MAX_CID_SIZE: usize = 20;
/// Client-generated initial connection IDs must be at least this long.
pub const MIN_INITIAL_CID_SIZE: usize = 8;
/// Stateless reset tokens are always exactly this many bytes.
pub const RESET_TOKEN_SIZE: usize = 16;
/// Client Initial datagrams (and any datagram containing one) must be
/// padded to at least this size.
pub const MIN_INITIAL_SIZE: usize = 1200;
/// The smallest MTU every path is assumed to support before discovery.
pub const MIN_MTU: u16 = 1200;
/// A local address never needs more than this many active CIDs at once to
/// satisfy the invariants in the data model (migration, preferred address).
pub const DEFAULT_ACTIVE_CID_LIMIT: u64 = 2;

/// Which half of a connection an endpoint is: the one that sent the first
/// Initial packet, or the one that responded to it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl std::ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Directionality of a stream, the second-lowest bit of its ID.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Dir {
    Bi,
    Uni,
}

impl Dir {
    pub fn iter() -> impl Iterator<Item = Dir> {
        [Dir::Bi, Dir::Uni].iter().cloned()
    }
}

/// A 62-bit stream identifier.
///
/// Bit 0x1 carries the initiating side (0 = client, 1 = server); bit 0x2
/// carries directionality (0 = bidirectional, 1 = unidirectional).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        StreamId(
            index << 2
                | if initiator == Side::Server { 1 } else { 0 }
                | if dir == Dir::Uni { 2 } else { 0 },
        )
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Index among streams of the same initiator and directionality.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<VarInt> for StreamId {
    fn from(x: VarInt) -> Self {
        StreamId(x.into_inner())
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        VarInt::from_u64(x.0).expect("stream ids are always in the varint domain")
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Bi => "bidi",
            Dir::Uni => "uni",
        };
        write!(f, "{}({} {}#{})", self.0, initiator, dir, self.index())
    }
}

/// The opaque handle an [`Endpoint`] hands back for a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionHandle(pub(crate) usize);

impl slog::Value for ConnectionHandle {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_usize(key, self.0)
    }
}

/// A wire-visible transport-level error code, carried in a CONNECTION_CLOSE
/// frame and observed by the application as a terminal connection event.
///
/// The frame type that triggered a FRAME_ENCODING_ERROR and the reason
/// phrase are properties of the CONNECTION_CLOSE frame itself
/// ([`frame::ConnectionClose`]), not of the code.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportError(pub u64);

impl TransportError {
    pub const NO_ERROR: Self = TransportError(0x0);
    pub const INTERNAL_ERROR: Self = TransportError(0x1);
    pub const SERVER_BUSY: Self = TransportError(0x2);
    pub const FLOW_CONTROL_ERROR: Self = TransportError(0x3);
    pub const STREAM_LIMIT_ERROR: Self = TransportError(0x4);
    pub const STREAM_STATE_ERROR: Self = TransportError(0x5);
    pub const FINAL_SIZE_ERROR: Self = TransportError(0x6);
    pub const FRAME_ENCODING_ERROR: Self = TransportError(0x7);
    pub const TRANSPORT_PARAMETER_ERROR: Self = TransportError(0x8);
    pub const CONNECTION_ID_LIMIT_ERROR: Self = TransportError(0x9);
    pub const PROTOCOL_VIOLATION: Self = TransportError(0xA);
    pub const INVALID_TOKEN: Self = TransportError(0xB);
    pub const CRYPTO_BUFFER_EXCEEDED: Self = TransportError(0xD);
    pub const UNSOLICITED_PATH_RESPONSE: Self = TransportError(0xA);

    /// A handshake-engine alert mapped into the `0x100..0x200` crypto range.
    pub fn crypto(alert: u8) -> Self {
        TransportError(0x100 + u64::from(alert))
    }

    pub fn is_crypto_error(self) -> bool {
        (0x100..=0x1ff).contains(&self.0)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "INTERNAL_ERROR",
            0x2 => "SERVER_BUSY",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "STREAM_LIMIT_ERROR",
            0x5 => "STREAM_STATE_ERROR",
            0x6 => "FINAL_SIZE_ERROR",
            0x7 => "FRAME_ENCODING_ERROR",
            0x8 => "TRANSPORT_PARAMETER_ERROR",
            0x9 => "CONNECTION_ID_LIMIT_ERROR",
            0xA => "PROTOCOL_VIOLATION",
            0xB => "INVALID_TOKEN",
            0xD => "CRYPTO_BUFFER_EXCEEDED",
            x if self.is_crypto_error() => return write!(f, "CRYPTO_ERROR({:#x})", x - 0x100),
            _ => "UNKNOWN_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// An opaque, application-assigned error code carried in RESET_STREAM,
/// STOP_SENDING, and the application variant of CONNECTION_CLOSE.
pub type ApplicationErrorCode = VarInt;

/// Socket-level address a datagram was sent to or received from. The
/// transport itself is address-family agnostic; callers provide whichever
/// `SocketAddr` variant their I/O layer produces.
pub type Address = SocketAddr;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_bit_layout() {
        let id = StreamId::new(Side::Server, Dir::Uni, 5);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Uni);
        assert_eq!(id.index(), 5);

        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        assert_eq!(id.into_inner(), 0);
    }

    #[test]
    fn transport_error_display() {
        let e = TransportError::PROTOCOL_VIOLATION;
        assert_eq!(format!("{}", e), "PROTOCOL_VIOLATION");
    }
}
