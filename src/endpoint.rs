//! Demultiplexing, stateless reset, version negotiation, and the
//! connect/accept/listen surface a caller drives with its own UDP socket
//! and timer wheel.
//!
//! Grounded on the teacher's `Endpoint`/`Context`/`ListenKeys`
//! (`endpoint.rs`), generalized in one respect: this crate's `Connection`
//! is fully self-contained (it owns its own packet-number spaces, CID
//! sets, and outbound assembly), so `Endpoint` doesn't need the teacher's
//! shared `Context` struct threaded through every connection method — it
//! only needs the demultiplexing tables, the slab of connections, and the
//! I/O/event queues a caller drains.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::{digest, hmac};
use slab::Slab;
use slog::Logger;

use crate::coding::BufMutExt;
use crate::config::{ClientConfig, Config, ServerConfig};
pub use crate::connection::Event;
use crate::connection::Connection;
use crate::crypto;
use crate::packet::{ConnectionId, Header, PacketDecodeError, PartialDecode};
use crate::{
    Address, ConnectionHandle, Side, MAX_CID_SIZE, MIN_INITIAL_CID_SIZE, MIN_INITIAL_SIZE,
    RESET_TOKEN_SIZE, VERSION,
};

/// Information that should be preserved across restarts for server
/// endpoints, so a previous instance's stateless resets and address-
/// validation tokens remain honored.
pub struct ListenKeys {
    /// Secret backing this endpoint's NEW_TOKEN/Retry tokens (see
    /// [`crate::token::TokenKey`]).
    pub cookie: [u8; 64],
    /// Secret used to derive the per-CID stateless reset token a previous
    /// instance of this endpoint would have handed out.
    pub reset: hmac::SigningKey,
}

impl ListenKeys {
    /// Generate new keys. `rng` must be cryptographically secure.
    pub fn new<R: RngCore>(rng: &mut R) -> Self {
        let mut cookie = [0; 64];
        let mut reset_value = [0; 64];
        rng.fill_bytes(&mut cookie);
        rng.fill_bytes(&mut reset_value);
        let reset = hmac::SigningKey::new(&digest::SHA512_256, &reset_value);
        ListenKeys { cookie, reset }
    }
}

#[derive(Debug, Fail)]
pub enum ConnectError {
    #[fail(display = "no unused connection ID available")]
    CidsExhausted,
}

/// A timer this crate asks the caller to arm on its own clock and report
/// back via [`Endpoint::timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Local idle timeout, per §4.5.
    Idle,
    /// C6 Recovery's loss-detection/PTO timer.
    LossDetection,
    /// Path-validation timeout for an in-progress migration.
    PathValidation,
    /// Upper bound on how long the Closing state keeps resending
    /// CONNECTION_CLOSE before giving up and forgetting the connection.
    Close,
}

impl slog::Value for Timer {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_str(key, &format!("{:?}", self))
    }
}

/// One pending I/O operation for the caller to perform.
#[derive(Debug)]
pub enum Io {
    /// Send `packet` to `destination` on the caller's UDP socket.
    Transmit {
        destination: Address,
        packet: Box<[u8]>,
    },
    /// Arm `timer` for `connection` to fire at absolute time `time`
    /// (µs), replacing any previous arming of the same timer.
    TimerStart {
        connection: ConnectionHandle,
        timer: Timer,
        time: u64,
    },
    /// Disarm `timer` for `connection`.
    TimerStop {
        connection: ConnectionHandle,
        timer: Timer,
    },
}

/// The main entry point to the library.
///
/// This object performs no I/O whatsoever. Instead, it generates a stream
/// of I/O operations for a caller's socket/timer wheel to perform via
/// [`Endpoint::poll_io`], and consumes incoming datagrams and timer
/// expirations via [`Endpoint::handle`] and [`Endpoint::timeout`].
pub struct Endpoint {
    log: Logger,
    rng: OsRng,
    config: Arc<Config>,
    server_config: Option<Arc<ServerConfig>>,

    io: VecDeque<Io>,
    events: VecDeque<(ConnectionHandle, Event)>,
    incoming: VecDeque<ConnectionHandle>,
    dirty_conns: FnvHashSet<ConnectionHandle>,
    readable_conns: FnvHashSet<ConnectionHandle>,

    connection_ids_initial: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_ids: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_remotes: FnvHashMap<Address, ConnectionHandle>,
    connections: Slab<Connection>,
}

impl Endpoint {
    pub fn new(log: Logger, config: Config, server_config: Option<Arc<ServerConfig>>) -> Self {
        let local_cid_len = config.local_cid_len;
        assert!(
            local_cid_len == 0
                || (local_cid_len >= MIN_INITIAL_CID_SIZE && local_cid_len <= MAX_CID_SIZE)
        );
        Endpoint {
            log,
            rng: OsRng::new().expect("platform RNG available"),
            config: Arc::new(config),
            server_config,
            io: VecDeque::new(),
            events: VecDeque::new(),
            incoming: VecDeque::new(),
            dirty_conns: FnvHashSet::default(),
            readable_conns: FnvHashSet::default(),
            connection_ids_initial: FnvHashMap::default(),
            connection_ids: FnvHashMap::default(),
            connection_remotes: FnvHashMap::default(),
            connections: Slab::new(),
        }
    }

    fn listen(&self) -> bool {
        self.server_config.is_some()
    }

    /// Get an application-facing event.
    pub fn poll(&mut self) -> Option<(ConnectionHandle, Event)> {
        if let Some(x) = self.events.pop_front() {
            return Some(x);
        }
        loop {
            let &conn = self.readable_conns.iter().next()?;
            if let Some(x) = self.connections[conn.0].poll_event() {
                return Some((conn, x));
            }
            self.readable_conns.remove(&conn);
        }
    }

    /// Get a pending I/O operation.
    pub fn poll_io(&mut self, now: u64) -> Option<Io> {
        loop {
            if let Some(x) = self.io.pop_front() {
                return Some(x);
            }
            let &conn = self.dirty_conns.iter().next()?;
            // TODO: determine every pending operation for `conn` before
            // clearing it from the dirty set, rather than just one
            // `poll_transmit` worth; a connection with several packets'
            // worth of queued data currently needs several `poll_io`
            // round trips to fully drain.
            self.flush_pending(now, conn);
            self.dirty_conns.remove(&conn);
        }
    }

    fn flush_pending(&mut self, now: u64, conn: ConnectionHandle) {
        if let Some(packet) = self.connections[conn.0].poll_transmit(now) {
            let destination = self.connections[conn.0].remote_address();
            self.io.push_back(Io::Transmit {
                destination,
                packet: packet.into_boxed_slice(),
            });
            self.dirty_conns.insert(conn);
        }
        match self.connections[conn.0].loss_detection_deadline() {
            Some(time) => self.io.push_back(Io::TimerStart {
                connection: conn,
                timer: Timer::LossDetection,
                time,
            }),
            None => self.io.push_back(Io::TimerStop {
                connection: conn,
                timer: Timer::LossDetection,
            }),
        }
        match self.connections[conn.0].idle_timeout_deadline() {
            Some(time) => self.io.push_back(Io::TimerStart {
                connection: conn,
                timer: Timer::Idle,
                time,
            }),
            None => self.io.push_back(Io::TimerStop {
                connection: conn,
                timer: Timer::Idle,
            }),
        }
        if !self.connections[conn.0].is_drained() {
            self.readable_conns.insert(conn);
        }
    }

    /// Dequeue a freshly accepted incoming connection.
    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.incoming.pop_front()
    }

    /// Initiate a connection.
    pub fn connect(
        &mut self,
        now: u64,
        client_config: Arc<ClientConfig>,
        remote: Address,
    ) -> Result<ConnectionHandle, ConnectError> {
        let local_id = self.new_cid()?;
        let remote_id = ConnectionId::random(&mut self.rng, MAX_CID_SIZE);
        let _ = client_config;
        let conn = self.add_connection(Side::Client, remote_id, local_id, remote, now);
        self.dirty_conns.insert(conn);
        Ok(conn)
    }

    fn new_cid(&mut self) -> Result<ConnectionId, ConnectError> {
        if self.config.local_cid_len == 0 {
            return Ok(ConnectionId::new(&[]));
        }
        for _ in 0..16 {
            let cid = ConnectionId::random(&mut self.rng, self.config.local_cid_len);
            if !self.connection_ids.contains_key(&cid) {
                return Ok(cid);
            }
        }
        Err(ConnectError::CidsExhausted)
    }

    fn add_connection(
        &mut self,
        side: Side,
        init_cid: ConnectionId,
        local_cid: ConnectionId,
        remote: Address,
        now: u64,
    ) -> ConnectionHandle {
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        let conn = Connection::new(
            self.log.new(o!("connection" => handle)),
            side,
            VERSION,
            self.config.transport.clone(),
            init_cid,
            local_cid,
            remote,
            self.config.local_cid_len,
            now,
        );
        entry.insert(conn);
        if !local_cid.is_empty() {
            self.connection_ids.insert(local_cid, handle);
        }
        self.connection_ids_initial.insert(init_cid, handle);
        self.connection_remotes.insert(remote, handle);
        handle
    }

    /// Process an incoming UDP datagram, which may contain multiple
    /// coalesced packets.
    pub fn handle(&mut self, now: u64, remote: Address, mut data: BytesMut) {
        let datagram_len = data.len();
        while !data.is_empty() {
            match PartialDecode::new(data, self.config.local_cid_len) {
                Ok(partial_decode) => {
                    match self.handle_decode(now, remote, partial_decode, datagram_len) {
                        Some(rest) => data = rest,
                        None => return,
                    }
                }
                Err(PacketDecodeError::UnsupportedVersion { src_cid, dst_cid, .. }) => {
                    if !self.listen() {
                        debug!(self.log, "dropping packet with unsupported version");
                        return;
                    }
                    trace!(self.log, "sending version negotiation");
                    let mut buf = Vec::<u8>::new();
                    Header::VersionNegotiate {
                        src_cid: dst_cid,
                        dst_cid: src_cid,
                    }
                    .encode(&mut buf);
                    buf.write::<u32>(0x0a1a_2a3a);
                    buf.write::<u32>(VERSION);
                    self.io.push_back(Io::Transmit {
                        destination: remote,
                        packet: buf.into_boxed_slice(),
                    });
                    return;
                }
                Err(e) => {
                    trace!(self.log, "unable to decode invariant header"; "reason" => %e);
                    return;
                }
            }
        }
    }

    fn handle_decode(
        &mut self,
        now: u64,
        remote: Address,
        partial_decode: PartialDecode,
        datagram_len: usize,
    ) -> Option<BytesMut> {
        let dst_cid = partial_decode.dst_cid();
        let conn = {
            let by_cid = if self.config.local_cid_len > 0 {
                self.connection_ids.get(&dst_cid)
            } else {
                None
            };
            by_cid
                .or_else(|| self.connection_ids_initial.get(&dst_cid))
                .or_else(|| self.connection_remotes.get(&remote))
                .cloned()
        };

        if let Some(conn) = conn {
            let rest = self.deliver(now, conn, remote, partial_decode);
            self.dirty_conns.insert(conn);
            self.readable_conns.insert(conn);
            return rest;
        }

        if !self.listen() {
            debug!(self.log, "dropping packet on unrecognized connection"; "connection" => %dst_cid);
            return None;
        }

        if partial_decode.has_long_header() {
            if partial_decode.is_initial() {
                if datagram_len < MIN_INITIAL_SIZE {
                    debug!(self.log, "ignoring short initial"; "connection" => %dst_cid);
                    return None;
                }
                return self.handle_initial(now, remote, partial_decode);
            }
            debug!(self.log, "ignoring non-initial packet for unknown connection"; "connection" => %dst_cid);
            return None;
        }

        self.send_stateless_reset(remote, dst_cid, datagram_len);
        None
    }

    /// Feed one already-routed packet into `conn`'s ingestion pipeline,
    /// returning the remainder of the datagram (coalesced packets, if
    /// any) for the caller's decode loop to continue with.
    fn deliver(
        &mut self,
        now: u64,
        conn: ConnectionHandle,
        remote: Address,
        partial_decode: PartialDecode,
    ) -> Option<BytesMut> {
        let remaining = partial_decode.remaining_bytes();
        let space_id = space_of(&partial_decode);
        let (packet, rest) = {
            let hp_key = self.connections[conn.0].remote_header_key(space_id);
            match partial_decode.finish(hp_key) {
                Ok(x) => x,
                Err(e) => {
                    trace!(self.log, "unable to decode packet"; "reason" => %e);
                    return None;
                }
            }
        };
        let received = remaining - rest.as_ref().map_or(0, |r| r.len());
        self.connections[conn.0].on_datagram_from(remote, received as u64);
        if let Err(e) = self.connections[conn.0].handle_packet(now, space_id, packet) {
            warn!(self.log, "dropping connection after protocol violation"; "error" => %e);
            self.connections[conn.0].close(now, e, Bytes::new());
        }
        rest
    }

    fn handle_initial(
        &mut self,
        now: u64,
        remote: Address,
        partial_decode: PartialDecode,
    ) -> Option<BytesMut> {
        let dst_cid = partial_decode.dst_cid();
        let local_cid = match self.new_cid() {
            Ok(cid) => cid,
            Err(_) => return None,
        };
        let handle = self.add_connection(Side::Server, dst_cid, local_cid, remote, now);
        let rest = self.deliver(now, handle, remote, partial_decode);
        self.incoming.push_back(handle);
        self.dirty_conns.insert(handle);
        rest
    }

    fn send_stateless_reset(&mut self, remote: Address, dst_cid: ConnectionId, datagram_len: usize) {
        if dst_cid.is_empty() {
            trace!(self.log, "dropping unrecognized short packet without a CID");
            return;
        }
        let listen_keys = match &self.server_config {
            Some(sc) => &sc.listen_keys,
            None => return,
        };
        debug!(self.log, "sending stateless reset");
        let mut buf = Vec::<u8>::new();
        let header_len = 1 + MAX_CID_SIZE + 1;
        let max_padding = datagram_len.saturating_sub(header_len).max(RESET_TOKEN_SIZE + 8);
        let padding = self.rng.next_u32() as usize % (max_padding - RESET_TOKEN_SIZE + 1);
        buf.reserve_exact(header_len + padding + RESET_TOKEN_SIZE);
        let number = crate::packet::PacketNumber::new(self.rng.next_u32() as u64 & 0x3fff_ffff, None);
        Header::Short {
            dst_cid: ConnectionId::random(&mut self.rng, MAX_CID_SIZE),
            number,
            key_phase: false,
            spin: false,
        }
        .encode(&mut buf);
        let start = buf.len();
        buf.resize(start + padding, 0);
        self.rng.fill_bytes(&mut buf[start..start + padding]);
        buf.extend(&crypto::reset_token_for(&listen_keys.reset, &dst_cid));
        self.io.push_back(Io::Transmit {
            destination: remote,
            packet: buf.into_boxed_slice(),
        });
    }

    /// Notify the endpoint that `timer` fired for `conn`.
    pub fn timeout(&mut self, now: u64, conn: ConnectionHandle, timer: Timer) {
        if !self.connections.contains(conn.0) {
            return;
        }
        match timer {
            Timer::LossDetection => self.connections[conn.0].on_loss_detection_timeout(now),
            Timer::Idle => self.connections[conn.0].on_idle_timeout(now),
            Timer::PathValidation | Timer::Close => {}
        }
        self.dirty_conns.insert(conn);
    }
}

fn space_of(partial_decode: &PartialDecode) -> crate::connection::spaces::SpaceId {
    use crate::connection::spaces::SpaceId;
    if !partial_decode.has_long_header() {
        SpaceId::Application
    } else if partial_decode.is_initial() {
        SpaceId::Initial
    } else if partial_decode.is_handshake() {
        SpaceId::Handshake
    } else {
        SpaceId::Application
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use slog::Discard;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn addr(port: u16) -> Address {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn client_connect_queues_dirty_connection() {
        let mut endpoint = Endpoint::new(test_log(), Config::default(), None);
        let client_config = Arc::new(ClientConfig {
            transport: Arc::new(TransportConfig::default()),
            session_config: Arc::new(()),
        });
        let handle = endpoint.connect(0, client_config, addr(4433)).unwrap();
        assert_eq!(handle.0, 0);
        assert!(endpoint.poll_io(0).is_some());
    }

    #[test]
    fn non_listening_endpoint_drops_unknown_packet() {
        let mut endpoint = Endpoint::new(test_log(), Config::default(), None);
        endpoint.handle(0, addr(4433), BytesMut::from(&[0x40u8, 1, 2, 3][..]));
        assert!(endpoint.poll_io(0).is_none());
    }
}
