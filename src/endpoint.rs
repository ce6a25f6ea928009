//! Configuration and the collaborator surfaces: the CID binding, the I/O
//! queue consumed by the datapath/worker backend, and application events.
//!
//! Nothing here performs I/O. The connection pushes `Io` items into the
//! context; the backend executes them (transmit a datagram, re-register the
//! timer wheel, hand buffers back to the datapath).

use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use failure::Fail;
use fnv::FnvHashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::hmac;

use crate::connection::ConnectionError;
use crate::crypto::reset_token_for;
use crate::packet::ConnectionId;
use crate::{Directionality, StreamId, MIN_MTU, RESET_TOKEN_SIZE};

/// Parameters governing connection behavior.
pub struct Config {
    /// Idle period after which the connection is silently closed (ms).
    /// Zero disables the idle timer. The effective value is negotiated down
    /// to the peer's advertised idle timeout when both are non-zero.
    pub idle_timeout_ms: u64,
    /// Interval for keep-alive PINGs (ms). Zero disables.
    pub keep_alive_interval_ms: u64,
    /// How long to wait for a peer acknowledgement before declaring the
    /// connection dead (μs).
    pub disconnect_timeout_us: u64,
    /// Longest ACK delay we will apply to incoming ack-eliciting packets (ms).
    pub max_ack_delay_ms: u64,
    /// Exponent applied to ACK delay fields we encode.
    pub ack_delay_exponent: u8,

    /// Maximum number of bytes the peer may transmit on one stream before
    /// becoming blocked.
    pub stream_receive_window: u64,
    /// Maximum number of bytes the peer may transmit across all streams of a
    /// connection before becoming blocked.
    pub receive_window: u64,
    /// Maximum number of peer-initiated bidirectional streams.
    pub max_remote_bidi_streams: u64,
    /// Maximum number of peer-initiated unidirectional streams.
    pub max_remote_uni_streams: u64,

    /// Operations executed per drain before the connection yields its
    /// worker. Bounds starvation of sibling connections.
    pub max_operations_per_drain: usize,
    /// Receive-queue depth beyond which inbound datagram chains are dropped.
    pub max_receive_queue: usize,
    /// Datagrams parked per packet space while its read key is pending.
    pub max_deferred_datagrams: usize,
    /// Attempts at generating a non-colliding source CID before giving up.
    pub max_cid_collision_retries: usize,
    /// active_connection_id_limit we advertise.
    pub active_cid_limit: u64,

    /// Datagram payload budget until the path MTU is learned.
    pub mtu: u16,
    /// Bytes a server may send per received byte before address validation.
    pub amplification_ratio: u64,
    /// RTT assumed before the first sample (μs).
    pub default_initial_rtt_us: u64,

    pub use_send_pacing: bool,
    pub use_send_buffering: bool,
    /// Whether a client shares its UDP binding and therefore offers a
    /// non-empty source CID.
    pub share_udp_binding: bool,
}

/// Ceiling on `disconnect_timeout_us`.
pub const MAX_DISCONNECT_TIMEOUT_US: u64 = 600_000_000;

impl Default for Config {
    fn default() -> Self {
        const EXPECTED_RTT_MS: u64 = 100;
        const MAX_STREAM_BANDWIDTH: u64 = 12500 * 1000; // bytes/s
        let stream_rwnd = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT_MS;
        Self {
            idle_timeout_ms: 30_000,
            keep_alive_interval_ms: 0,
            disconnect_timeout_us: 16_000_000,
            max_ack_delay_ms: 25,
            ack_delay_exponent: 3,

            stream_receive_window: stream_rwnd,
            receive_window: 8 * stream_rwnd,
            max_remote_bidi_streams: 0,
            max_remote_uni_streams: 0,

            max_operations_per_drain: 16,
            max_receive_queue: 512,
            max_deferred_datagrams: 8,
            max_cid_collision_retries: 8,
            active_cid_limit: 4,

            mtu: MIN_MTU,
            amplification_ratio: 3,
            default_initial_rtt_us: EXPECTED_RTT_MS * 1000,

            use_send_pacing: true,
            use_send_buffering: true,
            share_udp_binding: false,
        }
    }
}

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "{} out of bounds", _0)]
    OutOfBounds(&'static str),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.disconnect_timeout_us == 0
            || self.disconnect_timeout_us > MAX_DISCONNECT_TIMEOUT_US
        {
            return Err(ConfigError::OutOfBounds("disconnect_timeout_us"));
        }
        if self.max_operations_per_drain == 0 {
            return Err(ConfigError::OutOfBounds("max_operations_per_drain"));
        }
        if self.ack_delay_exponent > 20 {
            return Err(ConfigError::OutOfBounds("ack_delay_exponent"));
        }
        Ok(())
    }
}

/// One UDP datagram as delivered by the datapath. The payload buffer is
/// datapath-owned and must be handed back once processing completes.
#[derive(Debug)]
pub struct Datagram {
    pub remote: SocketAddrV6,
    pub payload: BytesMut,
}

/// I/O operations for the backend to execute.
#[derive(Debug)]
pub enum Io {
    Transmit {
        destination: SocketAddrV6,
        packet: Box<[u8]>,
    },
    /// (Re-)register the connection's earliest deadline with the timer
    /// wheel. Absolute μs.
    TimerWheelUpdate { time: u64 },
    TimerWheelRemove,
    /// Hand consumed receive buffers back to the datapath.
    ReturnRecvDatagrams(Vec<Datagram>),
}

/// Events surfaced to the application handle.
#[derive(Debug)]
pub enum Event {
    /// The handshake completed.
    Connected,
    /// The transport is shutting the connection down, either from a local
    /// error or a timeout.
    ShutdownInitiatedByTransport { reason: ConnectionError },
    /// The peer sent CONNECTION_CLOSE.
    ShutdownInitiatedByPeer { error_code: u64 },
    /// Shutdown finished; the handle may be released. `peer_acked` is false
    /// when the shutdown timer expired without the peer confirming.
    ShutdownComplete { peer_acked: bool },
    /// Reserved: path migration is not supported, so this never fires.
    PeerAddressChanged { address: SocketAddrV6 },
    /// The peer wants more streams than currently allowed.
    PeerNeedsStreams { directionality: Directionality },
    /// Stream payload delivered by the frame loop; buffering is the stream
    /// set owner's business.
    StreamData {
        id: StreamId,
        offset: u64,
        fin: bool,
        data: Bytes,
    },
    /// The peer reset a stream.
    StreamReset { id: StreamId, error_code: u64 },
    /// The peer asked us to stop sending on a stream.
    StreamStopSending { id: StreamId, error_code: u64 },
}

/// The CID binding: lookup-table registration, stateless-reset token
/// derivation, and endpoint-wide handshake counters. Owned by the context;
/// all mutation goes through this API.
pub struct Binding {
    lookup: FnvHashMap<ConnectionId, u64>,
    reset_key: hmac::Key,
    /// Server-held key sealing Retry tokens.
    pub retry_key: orion::aead::SecretKey,
    pub current_handshake_connections: usize,
    pub connections: usize,
}

impl Binding {
    pub fn new(rng: &mut OsRng) -> Self {
        let mut reset_master = [0; 64];
        rng.fill_bytes(&mut reset_master);
        Binding {
            lookup: FnvHashMap::default(),
            reset_key: hmac::Key::new(hmac::HMAC_SHA256, &reset_master),
            retry_key: orion::aead::SecretKey::default(),
            current_handshake_connections: 0,
            connections: 0,
        }
    }

    /// Register a source CID. Fails on collision; the caller retries with a
    /// fresh CID up to its collision budget.
    pub fn add_source_cid(&mut self, cid: ConnectionId, correlation_id: u64) -> bool {
        if self.lookup.contains_key(&cid) {
            return false;
        }
        self.lookup.insert(cid, correlation_id);
        true
    }

    pub fn remove_source_cid(&mut self, cid: &ConnectionId) {
        self.lookup.remove(cid);
    }

    /// Re-register all of a connection's CIDs, as on a local-address move.
    pub fn move_source_cids(&mut self, cids: &[ConnectionId], correlation_id: u64) {
        for cid in cids {
            self.lookup.insert(*cid, correlation_id);
        }
    }

    pub fn lookup(&self, cid: &ConnectionId) -> Option<u64> {
        self.lookup.get(cid).cloned()
    }

    pub fn generate_stateless_reset_token(
        &self,
        cid: &ConnectionId,
    ) -> [u8; RESET_TOKEN_SIZE] {
        reset_token_for(&self.reset_key, cid)
    }

    /// Deregister a connection entirely.
    pub fn remove_connection(&mut self, correlation_id: u64) {
        self.lookup.retain(|_, &mut id| id != correlation_id);
        self.connections = self.connections.saturating_sub(1);
    }
}

/// Shared context a connection drains within: configuration, randomness, the
/// binding, and the outbound I/O and event queues.
pub struct Context {
    pub config: Arc<Config>,
    pub rng: OsRng,
    pub io: VecDeque<Io>,
    pub events: VecDeque<Event>,
    pub binding: Binding,
}

impl Context {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = OsRng;
        let binding = Binding::new(&mut rng);
        Ok(Context {
            config: Arc::new(config),
            rng,
            io: VecDeque::new(),
            events: VecDeque::new(),
            binding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn disconnect_timeout_bounds() {
        let config = Config {
            disconnect_timeout_us: MAX_DISCONNECT_TIMEOUT_US + 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn binding_collision_detected() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let cid = ConnectionId::new(&[1; 8]);
        assert!(ctx.binding.add_source_cid(cid, 1));
        assert!(!ctx.binding.add_source_cid(cid, 2));
        assert_eq!(ctx.binding.lookup(&cid), Some(1));
        ctx.binding.remove_source_cid(&cid);
        assert_eq!(ctx.binding.lookup(&cid), None);
    }

    #[test]
    fn remove_connection_clears_all_cids() {
        let mut ctx = Context::new(Config::default()).unwrap();
        ctx.binding.add_source_cid(ConnectionId::new(&[1; 8]), 7);
        ctx.binding.add_source_cid(ConnectionId::new(&[2; 8]), 7);
        ctx.binding.add_source_cid(ConnectionId::new(&[3; 8]), 9);
        ctx.binding.remove_connection(7);
        assert_eq!(ctx.binding.lookup(&ConnectionId::new(&[1; 8])), None);
        assert_eq!(ctx.binding.lookup(&ConnectionId::new(&[3; 8])), Some(9));
    }
}
