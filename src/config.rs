//! Ambient configuration surface: [`TransportConfig`] (the wire-visible
//! transport parameters this endpoint will advertise) plus the
//! [`ServerConfig`]/[`ClientConfig`]/[`Config`] split the teacher's
//! `endpoint::Config` collapsed into one struct, generalized here because a
//! server and a client configure genuinely different things (a server's
//! `ServerConfig` carries the handshake engine's server-side session state
//! and retry/token keys; a client's carries none of that).

use std::sync::Arc;

use crate::transport_parameters::TransportParameters;

/// Transport-layer tuning knobs, separated from protocol-mandated wire
/// parameters only in that these are local policy (how aggressively to
/// retransmit, how much to buffer) rather than values exchanged with the
/// peer — though many of them feed directly into the `TransportParameters`
/// this endpoint advertises.
pub struct TransportConfig {
    /// Maximum duration of inactivity to accept before timing out the
    /// connection (ms). 0 disables the local idle timeout; the connection
    /// still honors whatever the peer advertises.
    pub max_idle_timeout: u64,
    /// Initial connection-level send credit advertised to the peer.
    pub initial_max_data: u64,
    /// Initial per-stream send credit advertised to the peer, by
    /// stream-data direction.
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    /// Initial cumulative stream-count credit advertised to the peer.
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// `ack_delay_exponent`, `max_ack_delay`: see `transport_parameters`.
    pub ack_delay_exponent: u8,
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,

    /// Maximum number of tail probes (C6 Recovery's PTO count) before the
    /// connection is judged to have failed.
    pub max_pto_count: u32,
    /// Bytes of out-of-order CRYPTO data to buffer per encryption level
    /// before closing with CRYPTO_BUFFER_EXCEEDED (spec minimum is 4096).
    pub crypto_buffer_size: usize,
    /// Default RTT used before the first sample arrives (μs).
    pub default_initial_rtt: u64,
    /// Largest datagram payload this endpoint will send before path MTU
    /// discovery (if any) raises it.
    pub initial_mtu: u16,
    /// NewReno's loss-reduction factor, in 0.16 fixed point (½ = 0x8000).
    pub loss_reduction_factor: u16,
    /// Minimum congestion window, in bytes.
    pub minimum_window: u64,
    /// Initial congestion window, in bytes.
    pub initial_window: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT_MS: u64 = 100;
        const STREAM_BANDWIDTH_BYTES_PER_SEC: u64 = 12_500 * 1000;
        // Window sized to avoid pipeline stalls at the assumed bandwidth
        // and RTT, the same derivation the teacher's `Config::default`
        // uses for `stream_receive_window`.
        const STREAM_WINDOW: u64 = STREAM_BANDWIDTH_BYTES_PER_SEC / 1000 * EXPECTED_RTT_MS;

        TransportConfig {
            max_idle_timeout: 10_000,
            initial_max_data: 8 * STREAM_WINDOW,
            initial_max_stream_data_bidi_local: STREAM_WINDOW,
            initial_max_stream_data_bidi_remote: STREAM_WINDOW,
            initial_max_stream_data_uni: STREAM_WINDOW,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            active_connection_id_limit: crate::DEFAULT_ACTIVE_CID_LIMIT,

            max_pto_count: 8,
            crypto_buffer_size: 4096,
            default_initial_rtt: EXPECTED_RTT_MS * 1000,
            initial_mtu: crate::MIN_MTU,
            loss_reduction_factor: 0x8000,
            minimum_window: 2 * u64::from(crate::MIN_MTU),
            // min(10*mss, max(2*mss, 14720)), the RFC9002 default.
            initial_window: (10 * u64::from(crate::MIN_MTU))
                .min((2 * u64::from(crate::MIN_MTU)).max(14_720)),
        }
    }
}

impl TransportConfig {
    pub fn initial_window(&self) -> u64 {
        self.initial_window
    }

    pub fn local_transport_parameters(&self) -> TransportParameters {
        TransportParameters {
            max_idle_timeout: self.max_idle_timeout,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: self.initial_max_stream_data_uni,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            initial_max_streams_uni: self.initial_max_streams_uni,
            ack_delay_exponent: self.ack_delay_exponent,
            max_ack_delay: self.max_ack_delay,
            disable_active_migration: self.disable_active_migration,
            active_connection_id_limit: self.active_connection_id_limit,
            ..TransportParameters::default()
        }
    }
}

/// Per-endpoint configuration shared by both roles: transport tuning plus
/// the length of locally generated connection IDs.
pub struct Config {
    pub transport: Arc<TransportConfig>,
    /// Length of connection IDs issued by this endpoint. Must be 0 or in
    /// `MIN_INITIAL_CID_SIZE..=MAX_CID_SIZE`; constrains how many
    /// simultaneous connections the endpoint can address.
    pub local_cid_len: usize,
    /// Bound on buffered incoming connections awaiting `Endpoint::accept`.
    pub accept_buffer: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transport: Arc::new(TransportConfig::default()),
            local_cid_len: 8,
            accept_buffer: 1024,
        }
    }
}

/// Server-only configuration: the handshake engine's server session state
/// plus address-validation policy.
pub struct ServerConfig {
    pub transport: Arc<TransportConfig>,
    /// Stateless-reset and token-signing secret material, persisted across
    /// restarts so a previous instance's tokens and reset signaling remain
    /// valid (mirrors the teacher's `ListenKeys`).
    pub listen_keys: crate::endpoint::ListenKeys,
    /// Require a Retry round trip before allocating per-connection state,
    /// except when a valid NEW_TOKEN token is presented.
    pub require_address_validation: bool,
    /// Handshake engine's server-side session configuration. This crate
    /// never inspects it; it only threads it through to whatever adapter
    /// implements the handshake for the caller.
    pub session_config: Arc<dyn std::any::Any + Send + Sync>,
}

/// Client-only configuration: the handshake engine's client session state.
pub struct ClientConfig {
    pub transport: Arc<TransportConfig>,
    pub session_config: Arc<dyn std::any::Any + Send + Sync>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_config_meets_spec_minimums() {
        let cfg = TransportConfig::default();
        assert!(cfg.crypto_buffer_size >= 4096);
        assert_eq!(cfg.active_connection_id_limit, 2);
        assert!(cfg.initial_mtu >= crate::MIN_MTU);
    }

    #[test]
    fn local_transport_parameters_carries_config_values() {
        let cfg = TransportConfig::default();
        let params = cfg.local_transport_parameters();
        assert_eq!(params.initial_max_data, cfg.initial_max_data);
        assert_eq!(params.max_idle_timeout, cfg.max_idle_timeout);
    }
}
