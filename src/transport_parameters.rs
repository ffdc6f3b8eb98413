//! Wire encoding of the transport parameters exchanged via the handshake
//! engine's extension channel.
//!
//! Each parameter is a `(varint id, varint length, value)` tuple; unknown
//! IDs (including the reserved `31*N+27` grease values) are skipped rather
//! than rejected, the same forward-compatibility posture the teacher's own
//! `transport_parameters.rs` takes toward fields it doesn't recognize.

use bytes::{Buf, BufMut, BytesMut};

use crate::coding::{BufExt, BufMutExt};
use crate::packet::ConnectionId;
use crate::varint::VarInt;
use crate::{Address, RESET_TOKEN_SIZE};

macro_rules! param_ids {
    ($($name:ident = $val:expr,)*) => {
        $(const $name: u64 = $val;)*
    };
}

param_ids! {
    ID_ORIGINAL_CONNECTION_ID = 0x00,
    ID_MAX_IDLE_TIMEOUT = 0x01,
    ID_STATELESS_RESET_TOKEN = 0x02,
    ID_MAX_PACKET_SIZE = 0x03,
    ID_INITIAL_MAX_DATA = 0x04,
    ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL = 0x05,
    ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE = 0x06,
    ID_INITIAL_MAX_STREAM_DATA_UNI = 0x07,
    ID_INITIAL_MAX_STREAMS_BIDI = 0x08,
    ID_INITIAL_MAX_STREAMS_UNI = 0x09,
    ID_ACK_DELAY_EXPONENT = 0x0a,
    ID_MAX_ACK_DELAY = 0x0b,
    ID_DISABLE_ACTIVE_MIGRATION = 0x0c,
    ID_PREFERRED_ADDRESS = 0x0d,
    ID_ACTIVE_CONNECTION_ID_LIMIT = 0x0e,
}

/// A `preferred_address` transport parameter: an alternate address (and its
/// bound CID/reset token, sequence number 1 per the Data Model's CID
/// invariants) the server invites the client to migrate to once the
/// handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredAddress {
    pub address_v4: Option<Address>,
    pub address_v6: Option<Address>,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; RESET_TOKEN_SIZE],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub original_connection_id: Option<ConnectionId>,
    pub max_idle_timeout: u64,
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    pub max_packet_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub preferred_address: Option<PreferredAddress>,
    pub active_connection_id_limit: u64,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            original_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_packet_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            preferred_address: None,
            active_connection_id_limit: crate::DEFAULT_ACTIVE_CID_LIMIT,
        }
    }
}

#[derive(Debug, Fail)]
pub enum TransportParameterError {
    #[fail(display = "malformed transport parameter encoding")]
    Malformed,
    #[fail(display = "out-of-bounds transport parameter value")]
    IllegalValue,
}

impl TransportParameters {
    pub fn write(&self, buf: &mut BytesMut) {
        if let Some(cid) = &self.original_connection_id {
            write_param_bytes(buf, ID_ORIGINAL_CONNECTION_ID, cid);
        }
        write_param_varint(buf, ID_MAX_IDLE_TIMEOUT, self.max_idle_timeout);
        if let Some(token) = &self.stateless_reset_token {
            write_param_bytes(buf, ID_STATELESS_RESET_TOKEN, token);
        }
        write_param_varint(buf, ID_MAX_PACKET_SIZE, self.max_packet_size);
        write_param_varint(buf, ID_INITIAL_MAX_DATA, self.initial_max_data);
        write_param_varint(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        write_param_varint(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        write_param_varint(
            buf,
            ID_INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        write_param_varint(
            buf,
            ID_INITIAL_MAX_STREAMS_BIDI,
            self.initial_max_streams_bidi,
        );
        write_param_varint(
            buf,
            ID_INITIAL_MAX_STREAMS_UNI,
            self.initial_max_streams_uni,
        );
        write_param_varint(
            buf,
            ID_ACK_DELAY_EXPONENT,
            u64::from(self.ack_delay_exponent),
        );
        write_param_varint(buf, ID_MAX_ACK_DELAY, self.max_ack_delay);
        if self.disable_active_migration {
            buf.write_varint(VarInt::from_u64(ID_DISABLE_ACTIVE_MIGRATION).unwrap());
            buf.write_varint(VarInt::from_u64(0).unwrap());
        }
        if let Some(pa) = &self.preferred_address {
            let mut body = BytesMut::new();
            write_preferred_address(&mut body, pa);
            write_param_bytes(buf, ID_PREFERRED_ADDRESS, &body);
        }
        write_param_varint(
            buf,
            ID_ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
    }

    pub fn read<B: Buf>(buf: &mut B) -> Result<Self, TransportParameterError> {
        let mut params = TransportParameters::default();
        while buf.has_remaining() {
            let id = buf
                .get_varint()
                .map_err(|_| TransportParameterError::Malformed)?
                .into_inner();
            let len = buf
                .get_varint()
                .map_err(|_| TransportParameterError::Malformed)?
                .into_inner() as usize;
            if buf.remaining() < len {
                return Err(TransportParameterError::Malformed);
            }
            let mut body = vec![0u8; len];
            buf.copy_to_slice(&mut body);
            let mut body = std::io::Cursor::new(&body[..]);

            match id {
                ID_ORIGINAL_CONNECTION_ID => {
                    params.original_connection_id = Some(ConnectionId::new(body.bytes()));
                }
                ID_MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = read_varint(&mut body)?;
                }
                ID_STATELESS_RESET_TOKEN => {
                    if body.remaining() != RESET_TOKEN_SIZE {
                        return Err(TransportParameterError::Malformed);
                    }
                    let mut token = [0u8; RESET_TOKEN_SIZE];
                    token.copy_from_slice(body.bytes());
                    params.stateless_reset_token = Some(token);
                }
                ID_MAX_PACKET_SIZE => {
                    let v = read_varint(&mut body)?;
                    if v < 1200 {
                        return Err(TransportParameterError::IllegalValue);
                    }
                    params.max_packet_size = v;
                }
                ID_INITIAL_MAX_DATA => params.initial_max_data = read_varint(&mut body)?,
                ID_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = read_varint(&mut body)?
                }
                ID_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = read_varint(&mut body)?
                }
                ID_INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = read_varint(&mut body)?
                }
                ID_INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = read_varint(&mut body)?
                }
                ID_INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = read_varint(&mut body)?
                }
                ID_ACK_DELAY_EXPONENT => {
                    let v = read_varint(&mut body)?;
                    if v > 20 {
                        return Err(TransportParameterError::IllegalValue);
                    }
                    params.ack_delay_exponent = v as u8;
                }
                ID_MAX_ACK_DELAY => {
                    let v = read_varint(&mut body)?;
                    if v >= 1 << 14 {
                        return Err(TransportParameterError::IllegalValue);
                    }
                    params.max_ack_delay = v;
                }
                ID_DISABLE_ACTIVE_MIGRATION => params.disable_active_migration = true,
                ID_PREFERRED_ADDRESS => {
                    params.preferred_address = Some(read_preferred_address(&mut body)?);
                }
                ID_ACTIVE_CONNECTION_ID_LIMIT => {
                    let v = read_varint(&mut body)?;
                    if v < 2 {
                        return Err(TransportParameterError::IllegalValue);
                    }
                    params.active_connection_id_limit = v;
                }
                // Reserved grease IDs (31*N + 27) and anything else unknown
                // to this version are ignored, not rejected.
                _ => {}
            }
        }
        Ok(params)
    }
}

fn read_varint(buf: &mut std::io::Cursor<&[u8]>) -> Result<u64, TransportParameterError> {
    buf.get_varint()
        .map(VarInt::into_inner)
        .map_err(|_| TransportParameterError::Malformed)
}

fn write_param_varint(buf: &mut BytesMut, id: u64, value: u64) {
    let v = VarInt::from_u64(value).expect("transport parameter value exceeds varint domain");
    buf.write_varint(VarInt::from_u64(id).unwrap());
    buf.write_varint(VarInt::from_u64(v.size() as u64).unwrap());
    buf.write_varint(v);
}

fn write_param_bytes(buf: &mut BytesMut, id: u64, value: &[u8]) {
    buf.write_varint(VarInt::from_u64(id).unwrap());
    buf.write_varint(VarInt::from_u64(value.len() as u64).unwrap());
    buf.extend_from_slice(value);
}

fn write_preferred_address(buf: &mut BytesMut, pa: &PreferredAddress) {
    use std::net::SocketAddr;
    match pa.address_v4 {
        Some(SocketAddr::V4(addr)) => {
            buf.extend_from_slice(&addr.ip().octets());
            buf.put_u16_be(addr.port());
        }
        _ => {
            buf.extend_from_slice(&[0u8; 4]);
            buf.put_u16_be(0);
        }
    }
    match pa.address_v6 {
        Some(SocketAddr::V6(addr)) => {
            buf.extend_from_slice(&addr.ip().octets());
            buf.put_u16_be(addr.port());
        }
        _ => {
            buf.extend_from_slice(&[0u8; 16]);
            buf.put_u16_be(0);
        }
    }
    buf.put_u8(pa.connection_id.len() as u8);
    buf.extend_from_slice(&pa.connection_id);
    buf.extend_from_slice(&pa.stateless_reset_token);
}

fn read_preferred_address(
    buf: &mut std::io::Cursor<&[u8]>,
) -> Result<PreferredAddress, TransportParameterError> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

    if buf.remaining() < 4 + 2 + 16 + 2 + 1 {
        return Err(TransportParameterError::Malformed);
    }
    let mut v4 = [0u8; 4];
    buf.copy_to_slice(&mut v4);
    let v4_port = buf.get_u16_be();
    let address_v4 = if v4 == [0; 4] && v4_port == 0 {
        None
    } else {
        Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(v4), v4_port)))
    };

    let mut v6 = [0u8; 16];
    buf.copy_to_slice(&mut v6);
    let v6_port = buf.get_u16_be();
    let address_v6 = if v6 == [0; 16] && v6_port == 0 {
        None
    } else {
        Some(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::from(v6),
            v6_port,
            0,
            0,
        )))
    };

    let cid_len = buf.get_u8() as usize;
    if buf.remaining() < cid_len + RESET_TOKEN_SIZE {
        return Err(TransportParameterError::Malformed);
    }
    let connection_id = ConnectionId::new(&buf.bytes()[..cid_len]);
    buf.advance(cid_len);
    let mut stateless_reset_token = [0u8; RESET_TOKEN_SIZE];
    buf.copy_to_slice(&mut stateless_reset_token);

    Ok(PreferredAddress {
        address_v4,
        address_v6,
        connection_id,
        stateless_reset_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips() {
        let params = TransportParameters::default();
        let mut buf = BytesMut::new();
        params.write(&mut buf);
        let decoded = TransportParameters::read(&mut std::io::Cursor::new(&buf[..])).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn unknown_parameter_id_is_skipped() {
        let mut buf = BytesMut::new();
        // Grease parameter 31*5+27 = 182, zero-length.
        buf.write_varint(VarInt::from_u64(182).unwrap());
        buf.write_varint(VarInt::from_u64(0).unwrap());
        TransportParameters::read(&mut std::io::Cursor::new(&buf[..])).unwrap();
    }

    #[test]
    fn ack_delay_exponent_over_20_is_rejected() {
        let mut buf = BytesMut::new();
        write_param_varint(&mut buf, ID_ACK_DELAY_EXPONENT, 21);
        assert!(TransportParameters::read(&mut std::io::Cursor::new(&buf[..])).is_err());
    }

    #[test]
    fn active_connection_id_limit_below_two_is_rejected() {
        let mut buf = BytesMut::new();
        write_param_varint(&mut buf, ID_ACTIVE_CONNECTION_ID_LIMIT, 1);
        assert!(TransportParameters::read(&mut std::io::Cursor::new(&buf[..])).is_err());
    }
}
