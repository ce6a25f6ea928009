//! The per-connection core: an operation-serialized state machine owning the
//! handshake, the packet pipeline, acknowledgement tracking, CID management,
//! key updates, timers and shutdown.
//!
//! All externally-initiated events are enqueued as operations; a single
//! worker drains them, which is the sole mechanism serializing mutation of
//! connection state. The drain loop never blocks.

use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::{cmp, fmt, mem};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use failure::Fail;
use lazy_static::lazy_static;
use slog::{debug, trace, warn, Logger};

use crate::cid::{LocalCid, LocalCidTable, RemoteCid, RemoteCidTable};
use crate::coding::{BufExt, BufMutExt};
use crate::crypto::{self, SecConfig, TlsOutput, TlsSession, AEAD_TAG_SIZE};
use crate::endpoint::{Context, Datagram, Event, Io};
use crate::frame::{self, Frame};
use crate::operation::{ApiCall, OperQueue, Operation};
use crate::packet::{
    self, apply_header_protection, set_payload_length, ConnectionId, EncryptLevel, Header,
    PacketNumber, PartialDecode,
};
use crate::range_set::RangeSet;
use crate::spaces::PacketSpace;
use crate::streams::{Resolve, StreamFrameKind, StreamSet};
use crate::timer::{TimerTable, TimerType};
use crate::transport_parameters::TransportParameters;
use crate::{
    Directionality, Side, TransportError, CONNECTION_ID_LENGTH, MIN_INITIAL_SIZE,
    MIN_STATELESS_RESET_SIZE, RESET_TOKEN_SIZE, VERSION,
};

lazy_static! {
    /// Process-unique, monotonic connection identifiers.
    static ref NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);
}

/// Shutdown-timer backoff exponent applied to the close PTO.
const CLOSE_PTO_COUNT: u32 = 3;

/// CRYPTO data buffered beyond the delivered offset before we give up.
const MAX_CRYPTO_BUFFER: u64 = 1 << 16;

/// Longest accepted close reason phrase, including the terminator.
const MAX_CLOSE_REASON_PHRASE: usize = 512;

// Close flags; `try_close` combines them.
pub const CLOSE_LOCAL: u8 = 0;
pub const CLOSE_REMOTE: u8 = 1 << 0;
pub const CLOSE_APPLICATION: u8 = 1 << 1;
pub const CLOSE_SILENT: u8 = 1 << 2;
pub const CLOSE_QUIC_STATUS: u8 = 1 << 3;
pub const CLOSE_SEND_NOTIFICATION: u8 = 1 << 4;

/// Reasons why a connection was lost.
#[derive(Debug, Clone, Fail)]
pub enum ConnectionError {
    /// The peer responded with a version negotiation packet.
    #[fail(display = "peer doesn't implement our version")]
    VersionNegotiation,
    /// We detected a violation of the transport protocol.
    #[fail(display = "{}", error_code)]
    TransportError { error_code: TransportError },
    /// The peer's transport closed the connection.
    #[fail(display = "closed by peer: {}", reason)]
    ConnectionClosed { reason: frame::ConnectionClose },
    /// The peer's application closed the connection.
    #[fail(display = "closed by peer application: {}", reason)]
    ApplicationClosed { reason: frame::ApplicationClose },
    /// A stateless reset terminated the connection.
    #[fail(display = "reset by peer")]
    Reset,
    /// The idle timer expired.
    #[fail(display = "connection idle")]
    TimedOut,
    /// The datapath reported the peer unreachable during the handshake.
    #[fail(display = "peer unreachable")]
    Unreachable,
    /// An unrecoverable internal failure.
    #[fail(display = "internal error")]
    Internal,
}

impl From<TransportError> for ConnectionError {
    fn from(error_code: TransportError) -> Self {
        ConnectionError::TransportError { error_code }
    }
}

impl From<crate::transport_parameters::Error> for ConnectionError {
    fn from(e: crate::transport_parameters::Error) -> Self {
        TransportError::from(e).into()
    }
}

#[derive(Debug, Clone)]
pub enum CloseReason {
    Connection(frame::ConnectionClose),
    Application(frame::ApplicationClose),
}

/// Top-level lifecycle. Close progress is carried by the orthogonal
/// `closed_locally`/`closed_remotely` flags since the two compose.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Lifecycle {
    Initialized,
    Started,
    Connected,
    /// Handshake confirmed: server at completion, client at HANDSHAKE_DONE.
    Confirmed,
}

/// Orthogonal state bits. The lifecycle enum carries the happy path; these
/// carry capabilities and close progress.
#[derive(Debug, Default)]
struct Flags {
    crypto_initialized: bool,
    closed_locally: bool,
    closed_remotely: bool,
    silent_close: bool,
    app_closed: bool,
    handle_closed: bool,
    uninitialized: bool,
    source_address_validated: bool,
    got_first_server_response: bool,
    received_retry: bool,
    initiated_cid_update: bool,
    shutdown_complete_timed_out: bool,
    send_shutdown_complete_notif: bool,
    shutdown_complete_indicated: bool,
    use_pacing: bool,
    use_send_buffer: bool,
    share_binding: bool,
}

/// Counters surfaced through the parameter interface.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub duplicate_packets: u64,
    pub decryption_failures: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub key_updates: u64,
    pub cid_updates: u64,
    /// μs timestamps.
    pub start_time: u64,
    pub connected_time: u64,
}

/// Accumulated send intent, materialized at the next flush.
#[derive(Default)]
struct SendState {
    ping: bool,
    max_data: bool,
    max_streams_bidi: bool,
    max_streams_uni: bool,
    handshake_done: bool,
    data_blocked: bool,
    path_response: Option<u64>,
    max_stream_data: fnv::FnvHashSet<crate::StreamId>,
    /// Sequence numbers of local CIDs to advertise.
    new_cids: VecDeque<u64>,
    /// Sequence numbers of destination CIDs to retire.
    retire_cids: VecDeque<u64>,
    /// Token to echo in Initial packets after a Retry.
    initial_token: Bytes,
    close: Option<CloseReason>,
    close_pending: bool,
    /// A flush-send operation is already queued.
    flush_queued: bool,
}

impl SendState {
    fn has_control_pending(&self) -> bool {
        self.ping
            || self.max_data
            || self.max_streams_bidi
            || self.max_streams_uni
            || self.handshake_done
            || self.data_blocked
            || self.path_response.is_some()
            || !self.max_stream_data.is_empty()
            || !self.new_cids.is_empty()
            || !self.retire_cids.is_empty()
    }
}

/// Client-side cached state for connecting to a previously seen server.
#[derive(Debug, Clone)]
pub struct CachedSession {
    pub quic_version: u32,
    pub peer_params: TransportParameters,
    pub server_name: String,
    pub ticket: Vec<u8>,
}

/// Typed parameter-surface setters. Preconditions follow the table in the
/// module docs; violations return `ParamError::InvalidState`.
pub enum Param {
    QuicVersion(u32),
    LocalAddress(SocketAddrV6),
    RemoteAddress(SocketAddrV6),
    IdleTimeout(u64),
    PeerBidiStreamCount(u64),
    PeerUnidiStreamCount(u64),
    CloseReasonPhrase(String),
    CertValidationFlags(u32),
    KeepAlive(u64),
    DisconnectTimeout(u64),
    SecConfig(SecConfig),
    SendBuffering(bool),
    SendPacing(bool),
    ShareUdpBinding(bool),
    ForceKeyUpdate,
    ForceCidUpdate,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GetParam {
    QuicVersion,
    RemoteAddress,
    Statistics,
    /// Like `Statistics`, timestamps converted to platform time.
    StatisticsPlat,
    ResumptionState,
}

#[derive(Debug, Eq, PartialEq, Fail)]
pub enum ParamError {
    #[fail(display = "invalid parameter")]
    InvalidParameter,
    #[fail(display = "invalid state")]
    InvalidState,
    #[fail(display = "buffer too small; {} bytes required", required)]
    BufferTooSmall { required: usize },
}

enum PacketDisposition {
    Processed,
    Dropped,
    /// Keys not ready; the datagram from this packet on was parked on the
    /// named space.
    Deferred(EncryptLevel),
}

pub struct Connection {
    log: Logger,
    pub side: Side,
    pub correlation_id: u64,
    version: u32,
    local_address: Option<SocketAddrV6>,
    remote_address: SocketAddrV6,

    //
    // CIDs
    //
    source_cids: LocalCidTable,
    dest_cids: RemoteCidTable,
    next_source_cid_sequence: u64,
    /// Original destination CID, kept for Retry validation (client) or TP
    /// echo (server).
    orig_dst_cid: Option<ConnectionId>,
    /// Destination CID of the last packet the peer sent us, for detecting
    /// peer-driven CID rotation.
    last_peer_dst_cid: Option<ConnectionId>,

    //
    // Packet spaces, indexed by encryption level
    //
    spaces: [Option<PacketSpace>; EncryptLevel::COUNT],
    /// Scratch for ACK frame range decoding.
    decoded_ack_ranges: RangeSet,

    //
    // Handshake
    //
    tls: Option<Box<dyn TlsSession>>,
    sec_config: Option<SecConfig>,
    cert_validation_flags: u32,
    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,
    peer_params_from_cache: bool,
    server_name: Option<String>,
    cached_session: Option<CachedSession>,

    streams: StreamSet,
    send: SendState,
    timers: TimerTable,
    oper_queue: OperQueue,
    recv_queue: Mutex<VecDeque<Datagram>>,

    //
    // RTT estimator, μs
    //
    latest_rtt: u64,
    smoothed_rtt: u64,
    rttvar: u64,
    min_rtt: u64,
    max_rtt: u64,
    got_first_rtt_sample: bool,
    probe_count: u32,

    //
    // Policy
    //
    idle_timeout_ms: u64,
    keep_alive_interval_ms: u64,
    disconnect_timeout_us: u64,
    max_ack_delay_ms: u64,
    ack_delay_exponent: u8,
    mtu: u16,

    //
    // Close
    //
    close_status: Option<ConnectionError>,
    close_reason_phrase: Option<String>,

    /// Bytes we may still send before the peer's address is validated.
    amplification_allowance: u64,

    state: Lifecycle,
    flags: Flags,
    pub stats: Stats,
}

impl Connection {
    /// Allocate a client connection. The handshake does not begin until a
    /// start operation is queued and drained.
    pub fn new_client(
        ctx: &mut Context,
        log: Logger,
        remote: SocketAddrV6,
        tls: Box<dyn TlsSession>,
        cached_session: Option<CachedSession>,
    ) -> Self {
        let dst_cid = ConnectionId::random(&mut ctx.rng, CONNECTION_ID_LENGTH);
        let mut this = Self::new_common(ctx, log, Side::Client, remote);
        this.tls = Some(tls);
        this.flags.crypto_initialized = true;
        this.cached_session = cached_session;
        this.dest_cids.push_back(RemoteCid {
            cid: dst_cid,
            sequence: 0,
            reset_token: None,
            retired: false,
        });
        this.install_initial_keys(&dst_cid);
        // Clients validate the server address implicitly.
        this.flags.source_address_validated = true;
        this.amplification_allowance = u64::max_value();
        if ctx.config.share_udp_binding {
            this.flags.share_binding = true;
            let _ = this.generate_source_cid(ctx, true);
        }
        this
    }

    /// Allocate a connection accepted by a listener. `orig_dst_cid` is the
    /// client's chosen destination CID (keying Initial packets) and
    /// `client_src_cid` its source CID.
    pub fn new_server(
        ctx: &mut Context,
        log: Logger,
        remote: SocketAddrV6,
        orig_dst_cid: ConnectionId,
        client_src_cid: ConnectionId,
        tls: Box<dyn TlsSession>,
    ) -> Self {
        let mut this = Self::new_common(ctx, log, Side::Server, remote);
        this.tls = Some(tls);
        this.dest_cids.push_back(RemoteCid {
            cid: client_src_cid,
            sequence: 0,
            reset_token: None,
            retired: false,
        });
        this.install_initial_keys(&orig_dst_cid);
        let _ = this.generate_source_cid(ctx, true);
        this.amplification_allowance = 0;
        ctx.binding.current_handshake_connections += 1;
        this
    }

    fn new_common(ctx: &mut Context, log: Logger, side: Side, remote: SocketAddrV6) -> Self {
        let correlation_id = NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed);
        ctx.binding.connections += 1;
        let config = &ctx.config;
        Connection {
            log,
            side,
            correlation_id,
            version: VERSION,
            local_address: None,
            remote_address: remote,
            source_cids: LocalCidTable::new(),
            dest_cids: RemoteCidTable::new(),
            next_source_cid_sequence: 0,
            orig_dst_cid: None,
            last_peer_dst_cid: None,
            spaces: [None, None, None, None],
            decoded_ack_ranges: RangeSet::new(),
            tls: None,
            sec_config: None,
            cert_validation_flags: 0,
            local_params: TransportParameters::default(),
            peer_params: None,
            peer_params_from_cache: false,
            server_name: None,
            cached_session: None,
            streams: StreamSet::new(
                side,
                config.max_remote_bidi_streams,
                config.max_remote_uni_streams,
                config.receive_window,
            ),
            send: SendState::default(),
            timers: TimerTable::new(),
            oper_queue: OperQueue::new(),
            recv_queue: Mutex::new(VecDeque::new()),
            latest_rtt: 0,
            smoothed_rtt: 0,
            rttvar: 0,
            min_rtt: u64::max_value(),
            max_rtt: 0,
            got_first_rtt_sample: false,
            probe_count: 0,
            idle_timeout_ms: config.idle_timeout_ms,
            keep_alive_interval_ms: config.keep_alive_interval_ms,
            disconnect_timeout_us: config.disconnect_timeout_us,
            max_ack_delay_ms: config.max_ack_delay_ms,
            ack_delay_exponent: config.ack_delay_exponent,
            mtu: config.mtu,
            close_status: None,
            close_reason_phrase: None,
            amplification_allowance: 0,
            state: Lifecycle::Initialized,
            flags: Flags {
                use_pacing: config.use_send_pacing,
                use_send_buffer: config.use_send_buffering,
                share_binding: config.share_udp_binding || side == Side::Server,
                ..Flags::default()
            },
            stats: Stats::default(),
        }
    }

    fn install_initial_keys(&mut self, dst_cid: &ConnectionId) {
        let mut space = PacketSpace::new(EncryptLevel::Initial);
        space.keys = Some(crypto::Keys::new_initial(dst_cid, self.side));
        self.spaces[EncryptLevel::Initial as usize] = Some(space);
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed_locally || self.flags.closed_remotely
    }

    pub fn remote_address(&self) -> SocketAddrV6 {
        self.remote_address
    }

    pub fn smoothed_rtt(&self) -> u64 {
        self.smoothed_rtt
    }

    fn space(&self, level: EncryptLevel) -> Option<&PacketSpace> {
        self.spaces[level as usize].as_ref()
    }

    fn space_mut(&mut self, level: EncryptLevel) -> Option<&mut PacketSpace> {
        self.spaces[level as usize].as_mut()
    }

    fn ensure_space(&mut self, level: EncryptLevel) -> &mut PacketSpace {
        let slot = &mut self.spaces[level as usize];
        if slot.is_none() {
            *slot = Some(PacketSpace::new(level));
        }
        slot.as_mut().unwrap()
    }

    //
    // Operation enqueueing (callable from any thread holding the handle)
    //

    /// Queue an API operation. Returns whether the worker must be notified.
    pub fn queue_api(&self, call: ApiCall) -> bool {
        self.oper_queue.enqueue(Operation::Api(call))
    }

    /// Chain inbound datagrams. Returns whether the worker must be notified
    /// with a receive flush. Datagrams over the queue bound are handed
    /// straight back to the datapath by the caller.
    pub fn queue_recv_datagrams(
        &self,
        max_queue: usize,
        datagrams: Vec<Datagram>,
    ) -> Result<bool, Vec<Datagram>> {
        let mut queue = self.recv_queue.lock().unwrap();
        if queue.len() + datagrams.len() > max_queue {
            return Err(datagrams);
        }
        let was_empty = queue.is_empty();
        queue.extend(datagrams);
        drop(queue);
        if was_empty {
            Ok(self.oper_queue.enqueue(Operation::FlushRecv))
        } else {
            Ok(false)
        }
    }

    pub fn queue_unreachable(&self) -> bool {
        self.oper_queue.enqueue(Operation::Unreachable)
    }

    pub fn queue_stream_recv_flush(&self, id: crate::StreamId) -> bool {
        self.oper_queue.enqueue(Operation::FlushStreamRecv { id })
    }

    pub fn queue_trace_rundown(&self) -> bool {
        self.oper_queue.enqueue(Operation::TraceRundown)
    }

    /// Release the application's handle. No further events will be
    /// indicated; queued operations still drain before teardown.
    pub fn close_handle(&mut self) {
        self.flags.handle_closed = true;
        self.oper_queue.enqueue_front(Operation::Api(ApiCall::Shutdown {
            application: true,
            error_code: 0,
            reason: Bytes::new(),
            silent: true,
        }));
    }

    //
    // Drain loop
    //

    /// Execute up to `max_operations_per_drain` queued operations. Returns
    /// whether more work remains queued.
    pub fn drain(&mut self, ctx: &mut Context, now: u64) -> bool {
        if !self.flags.crypto_initialized && self.side == Side::Server && self.tls.is_some() {
            // A server child defers crypto setup until its first drain, by
            // which time the listener has installed a configured TLS engine.
            self.initialize_server_crypto(ctx, now);
        }
        let mut processed = 0;
        while processed < ctx.config.max_operations_per_drain {
            let op = match self.oper_queue.pop() {
                Some(op) => op,
                None => break,
            };
            self.process_operation(ctx, now, op);
            processed += 1;
            if self.flags.uninitialized {
                break;
            }
        }
        // Exhausting the budget must not delay an acknowledgement the peer
        // asked for immediately.
        if processed == ctx.config.max_operations_per_drain && self.ack_immediately_pending() {
            self.flush_send(ctx, now);
        }
        if self.flags.send_shutdown_complete_notif && !self.flags.shutdown_complete_indicated {
            self.on_shutdown_complete(ctx);
        }
        self.register_timer_wheel(ctx);
        !self.oper_queue.is_empty() && !self.flags.uninitialized
    }

    fn ack_immediately_pending(&self) -> bool {
        self.spaces
            .iter()
            .flatten()
            .any(|space| space.ack_immediately)
    }

    fn process_operation(&mut self, ctx: &mut Context, now: u64, op: Operation) {
        match op {
            Operation::Api(call) => self.process_api_call(ctx, now, call),
            Operation::FlushRecv => self.flush_recv(ctx, now),
            Operation::Unreachable => {
                if self.state >= Lifecycle::Connected {
                    // Post-handshake unreachable notifications are attack
                    // surface and ignored.
                    trace!(self.log, "ignoring unreachable event");
                } else {
                    self.try_close(
                        ctx,
                        now,
                        CLOSE_SILENT | CLOSE_QUIC_STATUS | CLOSE_SEND_NOTIFICATION,
                        0,
                        Bytes::new(),
                        Some(ConnectionError::Unreachable),
                    );
                }
            }
            Operation::FlushStreamRecv { id } => {
                self.send.max_stream_data.insert(id);
                self.send.max_data = true;
                self.flush_send(ctx, now);
            }
            Operation::FlushSend => {
                self.send.flush_queued = false;
                if self.flush_send(ctx, now) {
                    self.send.flush_queued = true;
                    self.oper_queue.enqueue(Operation::FlushSend);
                }
            }
            Operation::TlsComplete => self.on_handshake_complete(ctx, now),
            Operation::TimerExpired(ty) => self.dispatch_timer(ctx, now, ty),
            Operation::TraceRundown => self.trace_rundown(),
        }
    }

    fn process_api_call(&mut self, ctx: &mut Context, now: u64, call: ApiCall) {
        match call {
            ApiCall::Start { server_name } => {
                if self.state != Lifecycle::Initialized || self.side != Side::Client {
                    return;
                }
                self.server_name = Some(server_name);
                if let Err(e) = self.start_handshake(ctx, now) {
                    warn!(self.log, "handshake start failed"; "reason" => %e);
                    self.fatal_error(ctx, now);
                }
            }
            ApiCall::Shutdown {
                application,
                error_code,
                reason,
                silent,
            } => {
                let mut flags = CLOSE_LOCAL;
                if application {
                    flags |= CLOSE_APPLICATION;
                }
                if silent {
                    flags |= CLOSE_SILENT;
                }
                self.flags.app_closed = true;
                self.try_close(ctx, now, flags, error_code, reason, None);
            }
            ApiCall::Ping => {
                if self.is_closed() {
                    return;
                }
                self.send.ping = true;
                self.flush_send(ctx, now);
            }
        }
    }

    fn trace_rundown(&self) {
        trace!(self.log, "rundown";
               "state" => ?self.state,
               "source_cids" => self.source_cids.len(),
               "dest_cids" => self.dest_cids.len(),
               "packets_received" => self.stats.packets_received,
               "packets_sent" => self.stats.packets_sent,
               "smoothed_rtt" => self.smoothed_rtt);
    }

    //
    // Handshake
    //

    fn initialize_server_crypto(&mut self, ctx: &mut Context, now: u64) {
        self.flags.crypto_initialized = true;
        self.stats.start_time = now;
        self.local_params = self.build_local_params(ctx);
        let mut params = Vec::new();
        self.local_params.write(self.side, &mut params);
        let output = match self
            .tls
            .as_mut()
            .expect("server crypto init without a TLS engine")
            .start(&params)
        {
            Ok(output) => output,
            Err(e) => {
                warn!(self.log, "server crypto init failed"; "reason" => %e);
                self.fatal_error(ctx, now);
                return;
            }
        };
        self.state = Lifecycle::Started;
        self.handle_tls_output(ctx, now, output);
        self.reset_idle_timeout(ctx, now);
    }

    fn start_handshake(&mut self, ctx: &mut Context, now: u64) -> Result<(), TransportError> {
        self.stats.start_time = now;
        self.local_params = self.build_local_params(ctx);
        // A previously cached session pre-installs the server's transport
        // parameters so streams can open before the handshake completes.
        if let Some(cached) = self.cached_session.take() {
            if cached.quic_version == self.version {
                trace!(self.log, "installing cached peer transport parameters");
                self.peer_params_from_cache = true;
                self.peer_params = Some(cached.peer_params);
            }
        }
        let mut params = Vec::new();
        self.local_params.write(self.side, &mut params);
        let output = self
            .tls
            .as_mut()
            .expect("handshake started without a TLS engine")
            .start(&params)?;
        self.state = Lifecycle::Started;
        self.handle_tls_output(ctx, now, output);
        self.reset_idle_timeout(ctx, now);
        self.flush_send(ctx, now);
        Ok(())
    }

    fn build_local_params(&mut self, ctx: &mut Context) -> TransportParameters {
        let config = &ctx.config;
        let mut params = TransportParameters {
            initial_max_stream_data_bidi_local: config.stream_receive_window,
            initial_max_stream_data_bidi_remote: config.stream_receive_window,
            initial_max_stream_data_uni: config.stream_receive_window,
            initial_max_data: config.receive_window,
            initial_max_streams_bidi: config.max_remote_bidi_streams,
            initial_max_streams_uni: config.max_remote_uni_streams,
            idle_timeout: self.idle_timeout_ms,
            max_packet_size: Some(u64::from(self.mtu)),
            ack_delay_exponent: self.ack_delay_exponent,
            max_ack_delay: self.max_ack_delay_ms,
            disable_active_migration: true,
            active_connection_id_limit: config.active_cid_limit,
            stateless_reset_token: None,
            original_connection_id: None,
        };
        if self.side == Side::Server {
            if let Some(entry) = self.source_cids.iter().next() {
                params.stateless_reset_token =
                    Some(ctx.binding.generate_stateless_reset_token(&entry.cid));
            }
            // Echoed only when a Retry token restored it.
            params.original_connection_id = self.orig_dst_cid;
        }
        params
    }

    fn handle_tls_output(&mut self, ctx: &mut Context, now: u64, output: TlsOutput) {
        for (level, data) in output.handshake {
            let space = self.ensure_space(level);
            space.crypto_send.push_back(data.into());
        }
        for (level, keys) in output.keys {
            trace!(self.log, "keys available"; "level" => ?level);
            let space = self.ensure_space(level);
            space.keys = Some(keys);
            let deferred = mem::replace(&mut space.deferred, VecDeque::new());
            for datagram in deferred {
                self.process_datagram(ctx, now, datagram);
            }
        }
        if let Some(raw) = output.peer_params {
            if let Err(e) = self.ingest_peer_params(ctx, raw) {
                debug!(self.log, "bad peer transport parameters"; "reason" => %e);
                self.close_on_error(ctx, now, e);
                return;
            }
        }
        if output.complete {
            self.on_handshake_complete(ctx, now);
        }
        self.queue_flush_send();
    }

    fn ingest_peer_params(
        &mut self,
        _ctx: &mut Context,
        raw: Bytes,
    ) -> Result<(), TransportError> {
        let params = TransportParameters::read(!self.side, &mut std::io::Cursor::new(&raw[..]))?;
        if self.side == Side::Client {
            // The Retry invariant: a server that sent Retry must echo the
            // original destination CID exactly; one that did not must stay
            // silent.
            match (self.flags.received_retry, params.original_connection_id) {
                (true, Some(echoed)) if Some(echoed) == self.orig_dst_cid => {}
                (false, None) => {}
                _ => {
                    debug!(self.log, "original CID echo mismatch");
                    return Err(TransportError::TRANSPORT_PARAMETER_ERROR);
                }
            }
        }
        if let Some(token) = params.stateless_reset_token {
            if let Some(current) = self.dest_cids.current_mut() {
                current.reset_token = Some(token);
            }
        }
        self.streams.apply_peer_limits(
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
            params.initial_max_data,
        );
        self.peer_params_from_cache = false;
        self.peer_params = Some(params);
        Ok(())
    }

    fn on_handshake_complete(&mut self, ctx: &mut Context, now: u64) {
        if self.state >= Lifecycle::Connected {
            return;
        }
        trace!(self.log, "handshake complete");
        self.state = Lifecycle::Connected;
        self.stats.connected_time = now;
        if self.side == Side::Server {
            // The server confirms immediately and tells the client to.
            self.state = Lifecycle::Confirmed;
            self.send.handshake_done = true;
            self.discard_space(ctx, EncryptLevel::Initial);
            ctx.binding.current_handshake_connections = ctx
                .binding
                .current_handshake_connections
                .saturating_sub(1);
        }
        if !self.flags.handle_closed {
            ctx.events.push_back(Event::Connected);
        }
        if self.keep_alive_interval_ms != 0 {
            self.timers
                .set(TimerType::KeepAlive, now, self.keep_alive_interval_ms);
        }
        self.flush_send(ctx, now);
    }

    fn discard_space(&mut self, _ctx: &mut Context, level: EncryptLevel) {
        let log = self.log.clone();
        if let Some(space) = self.space_mut(level) {
            trace!(log, "discarding packet space"; "level" => ?level);
            space.discard_keys();
        }
    }

    //
    // Receive pipeline
    //

    fn flush_recv(&mut self, ctx: &mut Context, now: u64) {
        let datagrams: Vec<Datagram> = {
            let mut queue = self.recv_queue.lock().unwrap();
            queue.drain(..).collect()
        };
        let mut consumed = Vec::with_capacity(datagrams.len());
        for datagram in datagrams {
            let remote = datagram.remote;
            let len = datagram.payload.len();
            self.process_datagram(ctx, now, datagram);
            consumed.push(Datagram {
                remote,
                payload: BytesMut::new(),
            });
            self.stats.bytes_received += len as u64;
        }
        if !consumed.is_empty() {
            ctx.io.push_back(Io::ReturnRecvDatagrams(consumed));
        }
    }

    fn process_datagram(&mut self, ctx: &mut Context, now: u64, datagram: Datagram) {
        if datagram.remote != self.remote_address {
            // No path migration: a remote-address change cannot be followed.
            debug!(self.log, "dropping datagram from unexpected address");
            self.stats.packets_dropped += 1;
            return;
        }
        if !self.flags.source_address_validated {
            self.amplification_allowance = self
                .amplification_allowance
                .saturating_add(ctx.config.amplification_ratio * datagram.payload.len() as u64);
        }
        // A client that does not share its binding offers a zero-length CID;
        // short headers to it carry no destination CID at all.
        let local_cid_len = self
            .source_cids
            .iter()
            .next()
            .map_or(0, |entry| entry.cid.len());
        let mut data = datagram.payload;
        let mut any_valid = false;
        while !data.is_empty() {
            let (decode, rest) = match PartialDecode::new(data, local_cid_len) {
                Ok(x) => x,
                Err(e) => {
                    trace!(self.log, "header parse failed"; "reason" => %e);
                    self.stats.packets_dropped += 1;
                    break;
                }
            };
            let had_long_header = decode.has_long_header();
            match self.process_packet(ctx, now, decode, rest.is_some()) {
                PacketDisposition::Processed => any_valid = true,
                PacketDisposition::Dropped => {
                    // A non-decryptable leading long-header packet poisons
                    // the rest of the datagram too.
                    if had_long_header && !any_valid {
                        break;
                    }
                }
                PacketDisposition::Deferred(level) => {
                    // The parked entry keeps any trailing coalesced packets
                    // so nothing is lost when the keys arrive.
                    if let Some(rest) = rest {
                        if let Some(space) = self.space_mut(level) {
                            if let Some(parked) = space.deferred.back_mut() {
                                parked.payload.extend_from_slice(&rest);
                            }
                        }
                    }
                    break;
                }
            }
            data = match rest {
                Some(rest) => rest,
                None => break,
            };
            if self.flags.uninitialized {
                break;
            }
        }
        if any_valid && !self.is_closed() {
            self.reset_idle_timeout(ctx, now);
            if self.keep_alive_interval_ms != 0 {
                self.timers
                    .set(TimerType::KeepAlive, now, self.keep_alive_interval_ms);
            }
        }
    }

    fn process_packet(
        &mut self,
        ctx: &mut Context,
        now: u64,
        decode: PartialDecode,
        coalesced: bool,
    ) -> PacketDisposition {
        if decode.is_version_negotiate() {
            return self.process_version_negotiation(ctx, now, &decode);
        }
        if decode.is_retry() {
            return self.process_retry(ctx, now, &decode, coalesced);
        }
        let level = decode.level();

        // An Initial carrying a valid token proves the client's address.
        if self.side == Side::Server && decode.is_initial() && !decode.token().is_empty() {
            match crypto::open_retry_token(&ctx.binding.retry_key, decode.token()) {
                Some(orig) => {
                    trace!(self.log, "token validated"; "orig_dst_cid" => %orig);
                    self.orig_dst_cid = Some(orig);
                    self.flags.source_address_validated = true;
                    self.amplification_allowance = u64::max_value();
                }
                None => {
                    debug!(self.log, "dropping Initial with bad token");
                    self.stats.packets_dropped += 1;
                    return PacketDisposition::Dropped;
                }
            }
        }

        // Key availability: defer whole datagrams that outran the handshake,
        // drop packets whose keys are already gone.
        let keys_ready = self.space(level).map_or(false, |s| s.has_keys());
        if !keys_ready {
            let max_live = self.highest_keyed_level();
            if (level as usize) > max_live {
                return self.defer_datagram(ctx, now, decode, level);
            }
            trace!(self.log, "dropping packet for discarded keys"; "level" => ?level);
            self.stats.packets_dropped += 1;
            return PacketDisposition::Dropped;
        }

        let sample = match decode.sample() {
            Ok(x) => x,
            Err(_) => {
                self.stats.packets_dropped += 1;
                return PacketDisposition::Dropped;
            }
        };
        let dst_cid = decode.dst_cid();
        let src_cid = decode.src_cid();
        let had_long_header = decode.has_long_header();
        // Snapshot the tail before AEAD removal scrambles it; a failed open
        // may still be a stateless reset.
        let packet_bytes = decode.data();
        let packet_len = packet_bytes.len();
        let mut tail = [0; RESET_TOKEN_SIZE];
        let tail_valid = packet_len >= MIN_STATELESS_RESET_SIZE;
        if tail_valid {
            tail.copy_from_slice(&packet_bytes[packet_len - RESET_TOKEN_SIZE..]);
        }

        let (mask, expected) = {
            let space = self.space(level).unwrap();
            let keys = space.keys.as_ref().unwrap();
            (keys.read.header.mask(&sample), space.next_recv_pn)
        };
        let (mut packet, pn) = match decode.finish(&mask, expected) {
            Ok(x) => x,
            Err(e) => {
                trace!(self.log, "header unprotect failed"; "reason" => %e);
                self.stats.packets_dropped += 1;
                return PacketDisposition::Dropped;
            }
        };

        // Select packet keys, driving the 1-RTT key phase machine.
        let opened = self.open_payload(ctx, now, level, pn, &mut packet);
        let plain_len = match opened {
            Ok(len) => len,
            Err(()) => {
                if !had_long_header
                    && tail_valid
                    && self.dest_cids.matches_reset_token(&tail)
                {
                    debug!(self.log, "stateless reset detected");
                    self.try_close(
                        ctx,
                        now,
                        CLOSE_REMOTE | CLOSE_SILENT | CLOSE_QUIC_STATUS | CLOSE_SEND_NOTIFICATION,
                        0,
                        Bytes::new(),
                        Some(ConnectionError::Reset),
                    );
                    return PacketDisposition::Dropped;
                }
                trace!(self.log, "packet failed authentication"; "pn" => pn);
                self.stats.decryption_failures += 1;
                return PacketDisposition::Dropped;
            }
        };
        packet.payload.truncate(plain_len);

        // Post-authentication validation.
        if PartialDecode::reserved_bits_violated(packet.header_data[0]) {
            debug!(self.log, "reserved bits set");
            self.close_on_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
            return PacketDisposition::Dropped;
        }
        if plain_len == 0 {
            self.close_on_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
            return PacketDisposition::Dropped;
        }

        // Duplicate suppression happens before the frame loop so replays
        // cannot re-trigger frame side effects.
        let space = self.space_mut(level).unwrap();
        if space.add_packet_number(pn) {
            trace!(self.log, "duplicate packet"; "pn" => pn);
            self.stats.duplicate_packets += 1;
            return PacketDisposition::Dropped;
        }
        space.largest_recv_time = now;
        self.stats.packets_received += 1;

        let payload = packet.payload.freeze();
        if let Err(e) = self.process_frames(ctx, now, level, payload) {
            self.close_on_error(ctx, now, e);
            return PacketDisposition::Processed;
        }

        self.post_process_packet(ctx, level, &dst_cid, &src_cid);
        PacketDisposition::Processed
    }

    fn process_version_negotiation(
        &mut self,
        ctx: &mut Context,
        now: u64,
        decode: &PartialDecode,
    ) -> PacketDisposition {
        if self.side != Side::Client || self.flags.got_first_server_response {
            self.stats.packets_dropped += 1;
            return PacketDisposition::Dropped;
        }
        let list = decode.payload_after_header();
        if list.is_empty() || list.len() % 4 != 0 {
            debug!(self.log, "malformed version negotiation");
            self.close_on_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
            return PacketDisposition::Dropped;
        }
        // A list containing our version means the packet is spurious.
        for word in list.chunks_exact(4) {
            let version = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
            if version == self.version {
                trace!(self.log, "spurious version negotiation");
                self.stats.packets_dropped += 1;
                return PacketDisposition::Dropped;
            }
        }
        debug!(self.log, "server does not support our version");
        self.try_close(
            ctx,
            now,
            CLOSE_LOCAL | CLOSE_SILENT | CLOSE_QUIC_STATUS | CLOSE_SEND_NOTIFICATION,
            0,
            Bytes::new(),
            Some(ConnectionError::VersionNegotiation),
        );
        PacketDisposition::Processed
    }

    /// Client-only Retry handling: adopt the server's new CID and token,
    /// then restart the handshake with fresh Initial keys.
    fn process_retry(
        &mut self,
        ctx: &mut Context,
        now: u64,
        decode: &PartialDecode,
        _coalesced: bool,
    ) -> PacketDisposition {
        if self.side != Side::Client || self.flags.got_first_server_response {
            self.stats.packets_dropped += 1;
            return PacketDisposition::Dropped;
        }
        let current_dst = match self.dest_cids.current() {
            Some(entry) => entry.cid,
            None => return PacketDisposition::Dropped,
        };
        if decode.orig_dst_cid() != current_dst {
            debug!(self.log, "Retry original CID mismatch");
            self.stats.packets_dropped += 1;
            return PacketDisposition::Dropped;
        }
        if decode.token().is_empty() {
            self.stats.packets_dropped += 1;
            return PacketDisposition::Dropped;
        }
        trace!(self.log, "processing Retry"; "new_dst_cid" => %decode.src_cid());
        self.send.initial_token = decode.token().clone();
        self.orig_dst_cid = Some(current_dst);
        self.dest_cids.replace_current(decode.src_cid());
        self.flags.got_first_server_response = true;
        self.flags.received_retry = true;
        let new_dst = decode.src_cid();
        self.restart(ctx, now, false, &new_dst);
        PacketDisposition::Processed
    }

    /// Rebuild handshake state after a Retry. RTT state and statistics are
    /// retained; `complete_reset` would also clear those.
    fn restart(&mut self, ctx: &mut Context, now: u64, complete_reset: bool, dst_cid: &ConnectionId) {
        if complete_reset {
            self.latest_rtt = 0;
            self.smoothed_rtt = 0;
            self.rttvar = 0;
            self.min_rtt = u64::max_value();
            self.got_first_rtt_sample = false;
        }
        self.install_initial_keys(dst_cid);
        let mut params = Vec::new();
        self.local_params.write(self.side, &mut params);
        match self
            .tls
            .as_mut()
            .expect("restart without a TLS engine")
            .start(&params)
        {
            Ok(output) => self.handle_tls_output(ctx, now, output),
            Err(e) => {
                warn!(self.log, "restart failed"; "reason" => %e);
                self.fatal_error(ctx, now);
                return;
            }
        }
        self.flush_send(ctx, now);
    }

    fn highest_keyed_level(&self) -> usize {
        self.spaces
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().map_or(false, |s| s.has_keys()))
            .map(|(i, _)| i)
            .max()
            .unwrap_or(0)
    }

    fn defer_datagram(
        &mut self,
        ctx: &mut Context,
        _now: u64,
        decode: PartialDecode,
        level: EncryptLevel,
    ) -> PacketDisposition {
        let max = ctx.config.max_deferred_datagrams;
        let remote = self.remote_address;
        let payload = BytesMut::from(decode.data());
        let log = self.log.clone();
        let space = self.ensure_space(level);
        if space.deferred.len() >= max {
            self.stats.packets_dropped += 1;
            return PacketDisposition::Dropped;
        }
        trace!(log, "deferring datagram until keys arrive"; "level" => ?level);
        space.deferred.push_back(Datagram { remote, payload });
        PacketDisposition::Deferred(level)
    }

    /// AEAD-open a packet payload, handling the 1-RTT key phase bit.
    fn open_payload(
        &mut self,
        _ctx: &mut Context,
        now: u64,
        level: EncryptLevel,
        pn: u64,
        packet: &mut packet::Packet,
    ) -> Result<usize, ()> {
        let phase_bit = match packet.header {
            Header::Short { key_phase, .. } => Some(key_phase),
            _ => None,
        };
        let header_data = packet.header_data.clone();
        let payload = &mut packet.payload[..];

        match phase_bit {
            None => {
                let space = self.spaces[level as usize].as_ref().unwrap();
                let keys = space.keys.as_ref().unwrap();
                keys.read.packet.open(pn, &header_data, payload)
            }
            Some(phase) => {
                let (current_phase, phase_start, awaiting) = {
                    let space = self.spaces[level as usize].as_ref().unwrap();
                    (
                        space.key_phase,
                        space.read_phase_start_pn,
                        space.awaiting_key_phase_confirm,
                    )
                };
                if phase == current_phase {
                    let space = self.spaces[level as usize].as_mut().unwrap();
                    let use_prev = pn < space.read_phase_start_pn && space.prev_read_keys.is_some();
                    let keys = if use_prev {
                        space.prev_read_keys.as_ref().unwrap()
                    } else {
                        space.keys.as_ref().unwrap()
                    };
                    let len = keys.read.packet.open(pn, &header_data, payload)?;
                    if awaiting {
                        // The peer followed our update; the phase is live.
                        let space = self.spaces[level as usize].as_mut().unwrap();
                        space.awaiting_key_phase_confirm = false;
                        if pn < space.read_phase_start_pn {
                            space.read_phase_start_pn = pn;
                        }
                    } else if pn < phase_start && !use_prev {
                        // Reordered packet from this phase, earlier than any
                        // seen so far.
                        let space = self.spaces[level as usize].as_mut().unwrap();
                        space.read_phase_start_pn = pn;
                    }
                    Ok(len)
                } else if awaiting || pn < phase_start {
                    // Packets from before the update still use the old keys.
                    let space = self.spaces[level as usize].as_ref().unwrap();
                    match space.prev_read_keys.as_ref() {
                        Some(keys) => keys.read.packet.open(pn, &header_data, payload),
                        None => Err(()),
                    }
                } else {
                    // Peer-initiated key update: derive the next generation
                    // and commit only if the packet authenticates under it.
                    let new_keys = match self.tls.as_mut().and_then(|tls| tls.next_1rtt_keys()) {
                        Some(keys) => keys,
                        None => return Err(()),
                    };
                    let len = new_keys.read.packet.open(pn, &header_data, payload)?;
                    trace!(self.log, "key update"; "pn" => pn);
                    let space = self.spaces[level as usize].as_mut().unwrap();
                    space.advance_key_phase(new_keys, pn);
                    space.largest_recv_time = now;
                    self.stats.key_updates += 1;
                    Ok(len)
                }
            }
        }
    }

    fn post_process_packet(
        &mut self,
        ctx: &mut Context,
        level: EncryptLevel,
        dst_cid: &ConnectionId,
        src_cid: &ConnectionId,
    ) {
        // Track first use of each local CID.
        if let Some(entry) = self.source_cids.get_mut(dst_cid) {
            if !entry.used_by_peer {
                trace!(self.log, "local CID first used by peer"; "cid" => %dst_cid);
                entry.used_by_peer = true;
            }
        }

        // A peer-driven CID change we did not ask for is answered by
        // rotating our own destination CID. When we did ask, the change is
        // the confirmation that clears the flag.
        if let Some(prev) = self.last_peer_dst_cid {
            if prev != *dst_cid {
                if self.flags.initiated_cid_update {
                    self.flags.initiated_cid_update = false;
                } else {
                    trace!(self.log, "peer rotated CIDs; following");
                    self.retire_dest_cid(ctx);
                }
            }
        }
        self.last_peer_dst_cid = Some(*dst_cid);

        if self.side == Side::Client && !self.flags.got_first_server_response {
            // The server's first response fixes its chosen CID; the
            // provisional one the client invented is gone.
            self.flags.got_first_server_response = true;
            if !src_cid.is_empty() {
                trace!(self.log, "adopting server CID"; "cid" => %src_cid);
                self.dest_cids.replace_current(*src_cid);
            }
        }

        // A server that decrypts a Handshake packet has validated the
        // client's address and is done with Initial keys.
        if self.side == Side::Server && level == EncryptLevel::Handshake {
            if !self.flags.source_address_validated {
                self.flags.source_address_validated = true;
                self.amplification_allowance = u64::max_value();
            }
            if self
                .space(EncryptLevel::Initial)
                .map_or(false, |s| s.has_keys())
            {
                self.discard_space(ctx, EncryptLevel::Initial);
            }
        }
    }

    //
    // Frame loop
    //

    fn process_frames(
        &mut self,
        ctx: &mut Context,
        now: u64,
        level: EncryptLevel,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let mut ack_eliciting = false;
        let mut ack_immediately = false;
        for frame in frame::Iter::new(payload) {
            self.stats.frames_received += 1;
            if let Frame::Invalid(ty) = frame {
                debug!(self.log, "malformed or unknown frame"; "type" => %ty);
                return Err(TransportError::FRAME_ENCODING_ERROR);
            }
            if !frame.is_allowed(level) {
                debug!(self.log, "frame not allowed at level"; "type" => %frame.ty(), "level" => ?level);
                return Err(TransportError::FRAME_ENCODING_ERROR);
            }
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding => {}
                Frame::Ping => {
                    ack_immediately = true;
                }
                Frame::Ack(ack) => self.on_ack_received(ctx, now, level, ack)?,
                Frame::Crypto(crypto_frame) => {
                    self.on_crypto_frame(ctx, now, level, crypto_frame)?
                }
                Frame::NewToken { .. } => {
                    // Accepted and acknowledged; storage is an open question.
                    ack_immediately = true;
                }
                Frame::Stream(stream) => {
                    let id = stream.id;
                    let end = stream.offset + stream.data.len() as u64;
                    match self.streams.resolve(id, StreamFrameKind::SenderSide)? {
                        Resolve::Closed => {
                            trace!(self.log, "frame for closed stream"; "stream" => %id);
                            continue;
                        }
                        Resolve::Stream(state) => {
                            if let Some(final_size) = state.final_size {
                                if end > final_size || (stream.fin && end != final_size) {
                                    return Err(TransportError::FINAL_SIZE_ERROR);
                                }
                            }
                            let new_bytes = end.saturating_sub(state.recv_offset);
                            if !self.streams.recv_within_flow_control(new_bytes) {
                                debug!(self.log, "connection flow control violated"; "stream" => %id);
                                return Err(TransportError::FLOW_CONTROL_ERROR);
                            }
                            let state = match self
                                .streams
                                .resolve(id, StreamFrameKind::SenderSide)?
                            {
                                Resolve::Stream(state) => state,
                                Resolve::Closed => continue,
                            };
                            if stream.fin {
                                state.final_size = Some(end);
                            }
                            if end > state.recv_offset {
                                state.recv_offset = end;
                            }
                            self.streams.data_recvd += new_bytes;
                            if !self.flags.handle_closed {
                                ctx.events.push_back(Event::StreamData {
                                    id,
                                    offset: stream.offset,
                                    fin: stream.fin,
                                    data: stream.data,
                                });
                            }
                        }
                    }
                }
                Frame::ResetStream(reset) => {
                    match self
                        .streams
                        .resolve(reset.id, StreamFrameKind::SenderSide)?
                    {
                        Resolve::Closed => continue,
                        Resolve::Stream(state) => {
                            state.final_size = Some(reset.final_size);
                            state.recv_closed = true;
                            if !self.flags.handle_closed {
                                ctx.events.push_back(Event::StreamReset {
                                    id: reset.id,
                                    error_code: reset.error_code,
                                });
                            }
                        }
                    }
                }
                Frame::StopSending { id, error_code } => {
                    match self.streams.resolve(id, StreamFrameKind::ReceiverSide)? {
                        Resolve::Closed => continue,
                        Resolve::Stream(state) => {
                            state.send_closed = true;
                            if !self.flags.handle_closed {
                                ctx.events
                                    .push_back(Event::StreamStopSending { id, error_code });
                            }
                        }
                    }
                }
                Frame::MaxStreamData { id, offset } => {
                    match self.streams.resolve(id, StreamFrameKind::ReceiverSide)? {
                        Resolve::Closed => continue,
                        Resolve::Stream(state) => {
                            if offset > state.max_stream_data_remote {
                                state.max_stream_data_remote = offset;
                                self.queue_flush_send();
                            }
                        }
                    }
                }
                Frame::StreamDataBlocked { id, .. } => {
                    match self.streams.resolve(id, StreamFrameKind::SenderSide)? {
                        Resolve::Closed => continue,
                        Resolve::Stream(_) => {
                            self.send.max_stream_data.insert(id);
                        }
                    }
                }
                Frame::MaxData(max) => {
                    if max > self.streams.max_data_remote {
                        self.streams.max_data_remote = max;
                        self.streams.conn_flow_blocked = false;
                        self.queue_flush_send();
                    }
                }
                Frame::MaxStreams {
                    directionality,
                    count,
                } => {
                    self.streams.on_max_streams(directionality, count)?;
                }
                Frame::DataBlocked { .. } => {
                    self.send.max_data = true;
                }
                Frame::StreamsBlocked {
                    directionality, ..
                } => {
                    if !self.flags.handle_closed {
                        ctx.events
                            .push_back(Event::PeerNeedsStreams { directionality });
                    }
                }
                Frame::NewConnectionId(new_cid) => {
                    if self.dest_cids.len() as u64 >= ctx.config.active_cid_limit {
                        trace!(self.log, "ignoring NEW_CONNECTION_ID beyond limit");
                        continue;
                    }
                    self.dest_cids.push_back(RemoteCid {
                        cid: new_cid.cid,
                        sequence: new_cid.sequence,
                        reset_token: Some(new_cid.reset_token),
                        retired: false,
                    });
                }
                Frame::RetireConnectionId { sequence } => {
                    self.on_retire_connection_id(ctx, sequence)?;
                }
                Frame::PathChallenge(data) => {
                    if self.send.path_response != Some(data) {
                        self.send.path_response = Some(data);
                        self.queue_flush_send();
                    }
                }
                Frame::PathResponse(_) => {
                    // Accepted without matching an outstanding challenge.
                    ack_immediately = true;
                }
                Frame::ConnectionClose(close) => {
                    debug!(self.log, "peer closed connection"; "reason" => %close);
                    self.try_close(
                        ctx,
                        now,
                        CLOSE_REMOTE | CLOSE_SEND_NOTIFICATION,
                        u64::from(close.error_code.0),
                        close.reason.clone(),
                        Some(ConnectionError::ConnectionClosed { reason: close }),
                    );
                    if self.flags.handle_closed || self.flags.uninitialized {
                        break;
                    }
                }
                Frame::ApplicationClose(close) => {
                    debug!(self.log, "peer application closed connection"; "reason" => %close);
                    self.try_close(
                        ctx,
                        now,
                        CLOSE_REMOTE | CLOSE_APPLICATION | CLOSE_SEND_NOTIFICATION,
                        close.error_code,
                        close.reason.clone(),
                        Some(ConnectionError::ApplicationClosed { reason: close }),
                    );
                    if self.flags.handle_closed || self.flags.uninitialized {
                        break;
                    }
                }
                Frame::HandshakeDone => {
                    if self.side == Side::Server {
                        debug!(self.log, "client sent HANDSHAKE_DONE");
                        return Err(TransportError::PROTOCOL_VIOLATION);
                    }
                    if self.state == Lifecycle::Connected {
                        trace!(self.log, "handshake confirmed");
                        self.state = Lifecycle::Confirmed;
                        self.discard_space(ctx, EncryptLevel::Handshake);
                        self.discard_space(ctx, EncryptLevel::Initial);
                    }
                }
                Frame::Invalid(_) => unreachable!("handled above"),
            }
        }
        // Closing period: incoming traffic re-arms retransmission of our
        // CONNECTION_CLOSE until the peer answers.
        if self.flags.closed_locally && !self.flags.closed_remotely {
            if ack_eliciting && self.send.close.is_some() {
                self.send.close_pending = true;
                self.queue_flush_send();
            }
            return Ok(());
        }
        if let Some(space) = self.space_mut(level) {
            if ack_eliciting {
                space.ack_eliciting_pending = true;
            }
            if ack_immediately {
                space.ack_immediately = true;
            }
        }
        if ack_immediately {
            self.queue_flush_send();
        } else if ack_eliciting && !self.timers.is_armed(TimerType::AckDelay) {
            self.timers.set(TimerType::AckDelay, now, self.max_ack_delay_ms);
        }
        Ok(())
    }

    fn on_ack_received(
        &mut self,
        _ctx: &mut Context,
        now: u64,
        level: EncryptLevel,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        let mut ranges = mem::replace(&mut self.decoded_ack_ranges, RangeSet::new());
        let result = ack.decode_ranges(&mut ranges);
        if let Err(e) = result {
            self.decoded_ack_ranges = ranges;
            return Err(e);
        }
        let next_send = self.space(level).map_or(0, |s| s.next_send_pn);
        if ranges.max().map_or(false, |max| max >= next_send) {
            // Acknowledging a packet we never sent.
            self.decoded_ack_ranges = ranges;
            return Err(TransportError::FRAME_ENCODING_ERROR);
        }
        let peer_exponent = self
            .peer_params
            .as_ref()
            .map_or(crate::transport_parameters::DEFAULT_ACK_DELAY_EXPONENT, |p| {
                p.ack_delay_exponent
            });
        let largest = ack.largest;
        let space = self.space_mut(level).unwrap();
        let prev_largest = space.largest_acked;
        if prev_largest.map_or(true, |prev| largest > prev) {
            space.largest_acked = Some(largest);
            if let Some(&sent) = space.sent_time.get(&largest) {
                let latest = now.saturating_sub(sent);
                let ack_delay = ack.delay << peer_exponent;
                self.update_rtt(latest, ack_delay);
            }
        }
        let space = self.space_mut(level).unwrap();
        for range in ranges.iter() {
            let keys: Vec<u64> = space
                .sent_time
                .range(range.clone())
                .map(|(&pn, _)| pn)
                .collect();
            for pn in keys {
                space.sent_time.remove(&pn);
            }
        }
        self.probe_count = 0;
        ranges.clear();
        self.decoded_ack_ranges = ranges;
        Ok(())
    }

    fn on_crypto_frame(
        &mut self,
        ctx: &mut Context,
        now: u64,
        level: EncryptLevel,
        crypto_frame: frame::Crypto,
    ) -> Result<(), TransportError> {
        {
            let space = match self.space_mut(level) {
                Some(space) => space,
                None => return Ok(()),
            };
            let end = crypto_frame.offset + crypto_frame.data.len() as u64;
            if end > space.crypto_recv.bytes_delivered() + MAX_CRYPTO_BUFFER {
                return Err(TransportError::CRYPTO_BUFFER_EXCEEDED);
            }
            space
                .crypto_recv
                .insert(crypto_frame.offset, crypto_frame.data);
        }
        loop {
            let chunk = match self.space_mut(level).unwrap().crypto_recv.read() {
                Some(chunk) => chunk,
                None => break,
            };
            let output = self
                .tls
                .as_mut()
                .ok_or(TransportError::PROTOCOL_VIOLATION)?
                .read_handshake(level, &chunk)?;
            self.handle_tls_output(ctx, now, output);
            if self.flags.uninitialized {
                break;
            }
        }
        Ok(())
    }

    fn on_retire_connection_id(
        &mut self,
        ctx: &mut Context,
        sequence: u64,
    ) -> Result<(), TransportError> {
        let removed = match self.source_cids.remove_by_sequence(sequence) {
            Some(entry) => entry,
            None => {
                trace!(self.log, "RETIRE_CONNECTION_ID for unknown sequence"; "sequence" => sequence);
                return Ok(());
            }
        };
        trace!(self.log, "peer retired local CID"; "cid" => %removed.cid);
        ctx.binding.remove_source_cid(&removed.cid);
        if self.source_cids.is_empty() {
            if self.flags.share_binding {
                debug!(self.log, "peer retired our last CID");
                return Err(TransportError::PROTOCOL_VIOLATION);
            }
            return Ok(());
        }
        // Keep the peer supplied with a replacement.
        let _ = self.generate_source_cid(ctx, false);
        Ok(())
    }

    //
    // CID management
    //

    /// Generate, register and record a fresh source CID. Bounded retries
    /// against binding collisions.
    fn generate_source_cid(&mut self, ctx: &mut Context, is_initial: bool) -> Option<ConnectionId> {
        let mut tries = 0;
        let cid = loop {
            let cid = ConnectionId::random(&mut ctx.rng, CONNECTION_ID_LENGTH);
            if ctx.binding.add_source_cid(cid, self.correlation_id) {
                break cid;
            }
            tries += 1;
            if tries >= ctx.config.max_cid_collision_retries {
                warn!(self.log, "exhausted CID collision retries");
                return None;
            }
        };
        let sequence = self.next_source_cid_sequence;
        self.next_source_cid_sequence += 1;
        let entry = LocalCid {
            cid,
            sequence,
            used_by_peer: false,
            retired: false,
        };
        if is_initial {
            self.source_cids.push_front(entry);
        } else {
            self.source_cids.push_back(entry);
        }
        if sequence > 0 {
            self.send.new_cids.push_back(sequence);
            self.queue_flush_send();
        }
        trace!(self.log, "new source CID"; "cid" => %cid, "sequence" => sequence);
        Some(cid)
    }

    /// Rotate to the next destination CID the peer issued, queueing a
    /// RETIRE_CONNECTION_ID for the old one.
    fn retire_dest_cid(&mut self, _ctx: &mut Context) -> bool {
        match self.dest_cids.retire_current() {
            Some(sequence) => {
                self.send.retire_cids.push_back(sequence);
                self.stats.cid_updates += 1;
                self.queue_flush_send();
                true
            }
            None => false,
        }
    }

    //
    // RTT estimation
    //

    fn update_rtt(&mut self, latest: u64, ack_delay: u64) {
        self.latest_rtt = latest;
        self.min_rtt = cmp::min(self.min_rtt, latest);
        self.max_rtt = cmp::max(self.max_rtt, latest);
        let mut adjusted = latest;
        if latest.saturating_sub(self.min_rtt) > ack_delay {
            adjusted = latest - ack_delay;
        }
        if !self.got_first_rtt_sample {
            self.got_first_rtt_sample = true;
            self.smoothed_rtt = adjusted;
            self.rttvar = adjusted / 2;
        } else {
            let sample = (self.smoothed_rtt as i64 - adjusted as i64).abs() as u64;
            self.rttvar = (3 * self.rttvar + sample) / 4;
            self.smoothed_rtt = (7 * self.smoothed_rtt + adjusted) / 8;
        }
        trace!(self.log, "rtt sample"; "latest" => latest, "smoothed" => self.smoothed_rtt);
    }

    /// Probe timeout with exponential backoff, μs.
    fn compute_probe_timeout(&self, ctx: &Context, count: u32) -> u64 {
        let base = if self.got_first_rtt_sample {
            self.smoothed_rtt + 4 * self.rttvar
        } else {
            2 * ctx.config.default_initial_rtt_us
        };
        (base + self.max_ack_delay_ms * 1000) << count
    }

    fn reset_idle_timeout(&mut self, _ctx: &mut Context, now: u64) {
        let peer = self.peer_params.as_ref().map_or(0, |p| p.idle_timeout);
        let local = self.idle_timeout_ms;
        let timeout = if local == 0 || peer == 0 {
            cmp::max(local, peer)
        } else {
            cmp::min(local, peer)
        };
        if timeout == 0 {
            self.timers.cancel(TimerType::Idle);
        } else {
            self.timers.set(TimerType::Idle, now, timeout);
        }
    }

    //
    // Timers
    //

    /// Entry point for the timer wheel. Sweeps expired slots, dispatching
    /// ACK-delay and pacing inline and everything else through the queue.
    /// Returns whether the worker must be notified.
    pub fn on_timer_expired(&mut self, ctx: &mut Context, now: u64) -> bool {
        let fired = self.timers.expired(now);
        let mut needs_worker = false;
        let mut immediate_flush = false;
        for ty in fired {
            trace!(self.log, "timer fired"; "type" => ?ty);
            match ty {
                TimerType::AckDelay => {
                    for space in self.spaces.iter_mut().flatten() {
                        if space.ack_frame_pending() {
                            space.ack_immediately = true;
                        }
                    }
                    immediate_flush = true;
                }
                TimerType::Pacing => {
                    immediate_flush = true;
                }
                ty => {
                    needs_worker |= self.oper_queue.enqueue(Operation::TimerExpired(ty));
                }
            }
        }
        self.register_timer_wheel(ctx);
        // The flush runs after the sweep so re-armed timers cannot corrupt
        // the expiration scan.
        if immediate_flush {
            self.flush_send(ctx, now);
        }
        needs_worker
    }

    fn dispatch_timer(&mut self, ctx: &mut Context, now: u64, ty: TimerType) {
        match ty {
            TimerType::Idle => {
                debug!(self.log, "idle timeout");
                self.try_close(
                    ctx,
                    now,
                    CLOSE_LOCAL | CLOSE_SILENT | CLOSE_QUIC_STATUS | CLOSE_SEND_NOTIFICATION,
                    0,
                    Bytes::new(),
                    Some(ConnectionError::TimedOut),
                );
            }
            TimerType::KeepAlive => {
                if !self.is_closed() {
                    self.send.ping = true;
                    self.flush_send(ctx, now);
                    self.timers
                        .set(TimerType::KeepAlive, now, self.keep_alive_interval_ms);
                }
            }
            TimerType::LossDetection => {
                if !self.is_closed() {
                    // Probe: elicit an acknowledgement so loss detection can
                    // make progress.
                    self.probe_count += 1;
                    self.send.ping = true;
                    self.flush_send(ctx, now);
                }
            }
            TimerType::Shutdown => {
                debug!(self.log, "shutdown timer expired");
                // Only an unanswered local close counts as timing out; a
                // draining-period expiry after a peer close is the normal
                // end of the connection.
                let unanswered = self.flags.closed_locally && !self.flags.closed_remotely;
                self.flags.closed_locally = true;
                self.flags.closed_remotely = true;
                self.flags.shutdown_complete_timed_out = unanswered;
                self.flags.send_shutdown_complete_notif = true;
            }
            TimerType::AckDelay | TimerType::Pacing => {
                // Dispatched inline by the sweep.
            }
        }
    }

    fn register_timer_wheel(&mut self, ctx: &mut Context) {
        match self.timers.next_expiration() {
            Some(time) if !self.flags.uninitialized => {
                ctx.io.push_back(Io::TimerWheelUpdate { time });
            }
            _ => {
                ctx.io.push_back(Io::TimerWheelRemove);
            }
        }
    }

    //
    // Close / shutdown
    //

    fn close_on_error(&mut self, ctx: &mut Context, now: u64, error: TransportError) {
        self.try_close(
            ctx,
            now,
            CLOSE_LOCAL | CLOSE_SEND_NOTIFICATION,
            u64::from(error.0),
            Bytes::new(),
            Some(ConnectionError::TransportError { error_code: error }),
        );
    }

    fn fatal_error(&mut self, ctx: &mut Context, now: u64) {
        self.try_close(
            ctx,
            now,
            CLOSE_LOCAL | CLOSE_SILENT | CLOSE_QUIC_STATUS | CLOSE_SEND_NOTIFICATION,
            0,
            Bytes::new(),
            Some(ConnectionError::Internal),
        );
    }

    /// The close/shutdown state machine. All close paths funnel here.
    fn try_close(
        &mut self,
        ctx: &mut Context,
        now: u64,
        close_flags: u8,
        error_code: u64,
        reason: Bytes,
        status: Option<ConnectionError>,
    ) {
        let remote = close_flags & CLOSE_REMOTE != 0;
        let silent = close_flags & CLOSE_SILENT != 0;
        let application = close_flags & CLOSE_APPLICATION != 0;
        let is_first_close = !self.is_closed();

        if remote {
            if self.flags.closed_remotely {
                return;
            }
            self.flags.closed_remotely = true;
        } else {
            if self.flags.closed_locally {
                // A second local close only matters if it makes both sides
                // closed; nothing more to record.
                if !self.flags.closed_remotely {
                    return;
                }
            }
            self.flags.closed_locally = true;
        }
        if silent {
            self.flags.silent_close = true;
        }

        if is_first_close {
            trace!(self.log, "connection closed"; "remote" => remote, "silent" => silent);
            self.timers.cancel_all_but_shutdown();
            if let Some(ref status) = status {
                self.close_status = Some(status.clone());
            } else if application {
                self.close_status = Some(ConnectionError::ApplicationClosed {
                    reason: frame::ApplicationClose {
                        error_code,
                        reason: reason.clone(),
                    },
                });
            } else {
                self.close_status = Some(ConnectionError::TransportError {
                    error_code: TransportError(error_code as u16),
                });
            }
            self.streams.shutdown();
            self.trace_rundown();
            if close_flags & CLOSE_SEND_NOTIFICATION != 0 && !self.flags.handle_closed {
                let event = if remote {
                    Event::ShutdownInitiatedByPeer { error_code }
                } else {
                    Event::ShutdownInitiatedByTransport {
                        reason: self.close_status.clone().unwrap(),
                    }
                };
                ctx.events.push_back(event);
            }

            if !silent {
                if remote {
                    // Draining period plus one reciprocal CONNECTION_CLOSE.
                    let drain = cmp::max(15_000, 2 * self.smoothed_rtt) / 1000;
                    self.timers.set(TimerType::Shutdown, now, cmp::max(drain, 1));
                    self.send.close = Some(CloseReason::Connection(frame::ConnectionClose {
                        error_code: TransportError::NO_ERROR,
                        frame_type: None,
                        reason: Bytes::new(),
                    }));
                    self.send.close_pending = true;
                } else {
                    let pto_ms = self.compute_probe_timeout(ctx, CLOSE_PTO_COUNT) / 1000;
                    self.timers.set(TimerType::Shutdown, now, cmp::max(pto_ms, 1));
                    let close_reason = if application {
                        CloseReason::Application(frame::ApplicationClose {
                            error_code,
                            reason,
                        })
                    } else {
                        CloseReason::Connection(frame::ConnectionClose {
                            error_code: TransportError(error_code as u16),
                            frame_type: None,
                            reason,
                        })
                    };
                    self.send.close = Some(close_reason);
                    self.send.close_pending = true;
                }
                self.flush_send(ctx, now);
            }
        } else if self.flags.closed_locally && self.flags.closed_remotely {
            // Second close completes the pair.
            if remote {
                // Peer answered our close.
                if self.side == Side::Client {
                    // Clients go straight to shutdown.
                    self.timers.cancel(TimerType::Shutdown);
                } else {
                    let drain = cmp::max(15_000, 2 * self.smoothed_rtt) / 1000;
                    self.timers.set(TimerType::Shutdown, now, cmp::max(drain, 1));
                }
            }
        }

        if (self.flags.closed_locally && self.flags.closed_remotely) || silent {
            self.flags.send_shutdown_complete_notif = true;
            self.flags.shutdown_complete_timed_out = false;
            if self.side == Side::Client || silent {
                self.timers.cancel(TimerType::Shutdown);
            }
        }
    }

    /// Final teardown once shutdown completes: indicate exactly once,
    /// deregister from the binding, drop timers and queued work.
    fn on_shutdown_complete(&mut self, ctx: &mut Context) {
        if self.flags.shutdown_complete_indicated {
            return;
        }
        self.flags.shutdown_complete_indicated = true;
        self.flags.send_shutdown_complete_notif = false;
        // A silent close never heard from the peer, so it cannot have been
        // acknowledged.
        let peer_acked =
            !self.flags.shutdown_complete_timed_out && !self.flags.silent_close;
        trace!(self.log, "shutdown complete"; "peer_acked" => peer_acked);
        if !self.flags.handle_closed {
            ctx.events.push_back(Event::ShutdownComplete { peer_acked });
            // With no external owner left to release us, synthesize the
            // handle close.
            self.flags.handle_closed = true;
        }
        for cid in self.source_cids.drain() {
            ctx.binding.remove_source_cid(&cid);
        }
        ctx.binding.remove_connection(self.correlation_id);
        self.timers.cancel_all_but_shutdown();
        self.timers.cancel(TimerType::Shutdown);
        ctx.io.push_back(Io::TimerWheelRemove);
        self.oper_queue.clear();
        self.flags.uninitialized = true;
    }

    //
    // Send path
    //

    fn queue_flush_send(&mut self) {
        // Send flags accumulate monotonically within a drain; one queued
        // flush materializes all of them, which is what keeps ACK batching
        // effective.
        if !self.send.flush_queued {
            self.send.flush_queued = true;
            self.oper_queue.enqueue(Operation::FlushSend);
        }
    }

    /// Build and emit packets for every space with pending work. Returns
    /// whether more remains to send (the caller re-queues the operation).
    pub fn flush_send(&mut self, ctx: &mut Context, now: u64) -> bool {
        if self.flags.uninitialized {
            return false;
        }
        // During the draining period nothing but the single reciprocal
        // CONNECTION_CLOSE may leave.
        if self.flags.closed_remotely && !self.send.close_pending {
            return false;
        }
        let mut packets = 0;
        for level in [
            EncryptLevel::Initial,
            EncryptLevel::Handshake,
            EncryptLevel::OneRtt,
        ]
        .iter()
        .cloned()
        {
            if packets >= 4 {
                break;
            }
            while self.space_has_send_work(level) {
                if !self.can_afford_send() {
                    trace!(self.log, "amplification limit reached");
                    return false;
                }
                match self.build_packet(ctx, now, level) {
                    Some(len) => {
                        self.amplification_allowance =
                            self.amplification_allowance.saturating_sub(len as u64);
                        packets += 1;
                        if packets >= 4 {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        self.spaces_have_send_work()
    }

    fn can_afford_send(&self) -> bool {
        self.flags.source_address_validated || self.amplification_allowance > 0
    }

    fn space_has_send_work(&self, level: EncryptLevel) -> bool {
        let space = match self.space(level) {
            Some(space) if space.has_keys() => space,
            _ => return false,
        };
        if self.is_closed() {
            return self.send.close_pending && level == self.close_level();
        }
        if !space.crypto_send.is_empty() {
            return true;
        }
        if space.ack_frame_pending() || space.ack_immediately {
            return true;
        }
        if level == EncryptLevel::OneRtt {
            return self.send.has_control_pending();
        }
        false
    }

    fn spaces_have_send_work(&self) -> bool {
        [
            EncryptLevel::Initial,
            EncryptLevel::Handshake,
            EncryptLevel::OneRtt,
        ]
        .iter()
        .any(|&level| self.space_has_send_work(level))
    }

    /// Highest keyed level; CONNECTION_CLOSE goes out at the best level we
    /// can protect.
    fn close_level(&self) -> EncryptLevel {
        for level in [
            EncryptLevel::OneRtt,
            EncryptLevel::Handshake,
            EncryptLevel::Initial,
        ]
        .iter()
        .cloned()
        {
            if self.space(level).map_or(false, |s| s.has_keys()) {
                return level;
            }
        }
        EncryptLevel::Initial
    }

    /// Assemble, seal and emit one packet at `level`. Returns its size.
    fn build_packet(&mut self, ctx: &mut Context, now: u64, level: EncryptLevel) -> Option<usize> {
        let (pn, largest_acked, key_phase) = {
            let space = self.space_mut(level)?;
            if !space.has_keys() {
                return None;
            }
            (
                space.take_send_pn(),
                space.largest_acked.unwrap_or(0),
                space.key_phase,
            )
        };
        let number = PacketNumber::new(pn, largest_acked);
        let dst_cid = self.dest_cids.current()?.cid;
        let src_cid = self
            .source_cids
            .iter()
            .next()
            .map(|e| e.cid)
            .unwrap_or_else(|| ConnectionId::new(&[]));

        let header = match level {
            EncryptLevel::Initial => Header::Initial {
                src_cid,
                dst_cid,
                token: self.send.initial_token.clone(),
                number,
            },
            EncryptLevel::Handshake => Header::Long {
                ty: packet::LongType::Handshake,
                src_cid,
                dst_cid,
                number,
            },
            EncryptLevel::ZeroRtt => return None,
            EncryptLevel::OneRtt => Header::Short {
                dst_cid,
                number,
                key_phase,
            },
        };

        let mut buf = Vec::with_capacity(self.mtu as usize);
        header.encode(&mut buf);
        if level != EncryptLevel::OneRtt {
            // Two-byte length placeholder, patched once the payload is in.
            buf.put_u16(0x4000);
        }
        let pn_offset = buf.len();
        number.encode(&mut buf);
        let header_len = buf.len();
        let max_len = self.mtu as usize - AEAD_TAG_SIZE;

        let mut ack_eliciting = false;

        if self.is_closed() {
            // Closing: only the CONNECTION_CLOSE frame.
            match self.send.close.clone() {
                Some(CloseReason::Connection(ref close)) => {
                    let remaining = max_len - buf.len();
                    close.encode(&mut buf, remaining)
                }
                Some(CloseReason::Application(ref close)) => {
                    // Application closes never leak into handshake packets.
                    if level == EncryptLevel::OneRtt {
                        let remaining = max_len - buf.len();
                        close.encode(&mut buf, remaining);
                    } else {
                        let remaining = max_len - buf.len();
                        frame::ConnectionClose {
                            error_code: TransportError::NO_ERROR,
                            frame_type: None,
                            reason: Bytes::new(),
                        }
                        .encode(&mut buf, remaining);
                    }
                }
                None => return None,
            }
            self.send.close_pending = false;
        } else {
            // ACK first so it cannot be squeezed out.
            let (acked, delay) = {
                let space = self.space(level).unwrap();
                if space.ack_frame_pending() || space.ack_immediately {
                    let delay =
                        now.saturating_sub(space.largest_recv_time) >> self.ack_delay_exponent;
                    (Some(space.pending_acks().clone()), delay)
                } else {
                    (None, 0)
                }
            };
            if let Some(ref acked) = acked {
                if !acked.is_empty() && buf.len() + 32 < max_len {
                    frame::Ack::encode(delay, acked, None, &mut buf);
                    self.space_mut(level).unwrap().on_ack_sent(acked);
                }
            }

            // CRYPTO data.
            loop {
                let (offset, chunk) = {
                    let space = self.space_mut(level).unwrap();
                    if space.crypto_send.is_empty() || buf.len() + 16 >= max_len {
                        break;
                    }
                    let mut chunk = space.crypto_send.pop_front().unwrap();
                    let budget = max_len - buf.len() - 16;
                    let offset = space.crypto_send_offset;
                    if chunk.len() > budget {
                        let rest = chunk.split_off(budget);
                        space.crypto_send.push_front(rest);
                    }
                    space.crypto_send_offset += chunk.len() as u64;
                    (offset, chunk)
                };
                trace!(self.log, "CRYPTO"; "offset" => offset, "len" => chunk.len());
                frame::Crypto {
                    offset,
                    data: chunk,
                }
                .encode(&mut buf);
                ack_eliciting = true;
            }

            if level == EncryptLevel::OneRtt {
                ack_eliciting |= self.write_control_frames(ctx, &mut buf, max_len);
            }

            if buf.len() == header_len {
                // Nothing made it in; rewind the packet number.
                let space = self.space_mut(level).unwrap();
                space.next_send_pn -= 1;
                return None;
            }
        }

        // Initial packets from the client pad the datagram to the minimum.
        if level == EncryptLevel::Initial && self.side == Side::Client {
            let target = MIN_INITIAL_SIZE - AEAD_TAG_SIZE;
            if buf.len() < target {
                buf.resize(target, 0);
            }
        }
        // Leave room for the header-protection sample.
        if buf.len() < pn_offset + number.len() + 4 {
            buf.resize(pn_offset + number.len() + 4, 0);
        }
        if level != EncryptLevel::OneRtt {
            set_payload_length(&mut buf, header_len, number.len(), AEAD_TAG_SIZE);
        }

        // Seal and protect.
        let mut payload = buf.split_off(header_len);
        {
            let space = self.space(level).unwrap();
            let keys = space.keys.as_ref().unwrap();
            keys.write.packet.seal(pn, &buf, &mut payload);
            buf.extend_from_slice(&payload);
            let mut sample = [0; crypto::HP_SAMPLE_SIZE];
            sample.copy_from_slice(&buf[pn_offset + 4..pn_offset + 4 + crypto::HP_SAMPLE_SIZE]);
            let mask = keys.write.header.mask(&sample);
            apply_header_protection(&mut buf, pn_offset, &mask);
        }

        if ack_eliciting {
            let space = self.space_mut(level).unwrap();
            space.on_ack_eliciting_sent(pn, now);
        }
        let len = buf.len();
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += len as u64;
        trace!(self.log, "sending packet"; "level" => ?level, "pn" => pn, "len" => len);
        ctx.io.push_back(Io::Transmit {
            destination: self.remote_address,
            packet: buf.into(),
        });
        Some(len)
    }

    /// Emit pending 1-RTT control frames. Returns whether any were
    /// ack-eliciting.
    fn write_control_frames(
        &mut self,
        ctx: &mut Context,
        buf: &mut Vec<u8>,
        max_len: usize,
    ) -> bool {
        let mut ack_eliciting = false;

        if self.send.ping && buf.len() + 1 < max_len {
            self.send.ping = false;
            buf.put_var(frame::Type::PING.0);
            ack_eliciting = true;
        }
        if self.send.handshake_done && buf.len() + 1 < max_len {
            self.send.handshake_done = false;
            buf.put_var(frame::Type::HANDSHAKE_DONE.0);
            ack_eliciting = true;
        }
        if let Some(data) = self.send.path_response.take() {
            if buf.len() + 9 < max_len {
                buf.put_var(frame::Type::PATH_RESPONSE.0);
                buf.put_slice(&data.to_be_bytes());
                ack_eliciting = true;
            } else {
                self.send.path_response = Some(data);
            }
        }
        if self.send.max_data && buf.len() + 9 < max_len {
            self.send.max_data = false;
            let new_max = self.streams.data_recvd + ctx.config.receive_window;
            self.streams.max_data_local = cmp::max(self.streams.max_data_local, new_max);
            trace!(self.log, "MAX_DATA"; "value" => self.streams.max_data_local);
            buf.put_var(frame::Type::MAX_DATA.0);
            buf.put_var(self.streams.max_data_local);
            ack_eliciting = true;
        }
        while buf.len() + 17 < max_len {
            let id = match self.send.max_stream_data.iter().next().cloned() {
                Some(id) => id,
                None => break,
            };
            self.send.max_stream_data.remove(&id);
            let offset = {
                match self.streams.resolve(id, StreamFrameKind::SenderSide) {
                    Ok(Resolve::Stream(state)) if !state.recv_closed => {
                        state.recv_offset + ctx.config.stream_receive_window
                    }
                    _ => continue,
                }
            };
            trace!(self.log, "MAX_STREAM_DATA"; "stream" => %id, "value" => offset);
            buf.put_var(frame::Type::MAX_STREAM_DATA.0);
            buf.put_var(id.0);
            buf.put_var(offset);
            ack_eliciting = true;
        }
        while buf.len() + 34 < max_len {
            let sequence = match self.send.new_cids.pop_front() {
                Some(x) => x,
                None => break,
            };
            let entry = match self.source_cids.iter().find(|e| e.sequence == sequence) {
                Some(entry) => entry,
                None => continue,
            };
            let token = ctx.binding.generate_stateless_reset_token(&entry.cid);
            trace!(self.log, "NEW_CONNECTION_ID"; "cid" => %entry.cid, "sequence" => sequence);
            frame::NewConnectionId {
                sequence,
                retire_prior_to: 0,
                cid: entry.cid,
                reset_token: token,
            }
            .encode(buf);
            ack_eliciting = true;
        }
        while buf.len() + 9 < max_len {
            let sequence = match self.send.retire_cids.pop_front() {
                Some(x) => x,
                None => break,
            };
            trace!(self.log, "RETIRE_CONNECTION_ID"; "sequence" => sequence);
            buf.put_var(frame::Type::RETIRE_CONNECTION_ID.0);
            buf.put_var(sequence);
            ack_eliciting = true;
        }
        ack_eliciting
    }

    //
    // Parameter surface
    //

    pub fn set_param(&mut self, ctx: &mut Context, now: u64, param: Param) -> Result<(), ParamError> {
        let started = self.state >= Lifecycle::Started;
        let connected = self.state >= Lifecycle::Connected;
        let confirmed = self.state >= Lifecycle::Confirmed;
        match param {
            Param::QuicVersion(version) => {
                if started {
                    return Err(ParamError::InvalidState);
                }
                // Only the supported version or a reserved greasing version.
                if version != VERSION && version & 0x0f0f_0f0f != 0x0a0a_0a0a {
                    return Err(ParamError::InvalidParameter);
                }
                self.version = version;
            }
            Param::LocalAddress(address) => {
                if self.side == Side::Server {
                    return Err(ParamError::InvalidState);
                }
                self.local_address = Some(address);
                if connected {
                    // Rebinding re-registers our CIDs and probes the path.
                    let cids: Vec<_> = self.source_cids.iter().map(|e| e.cid).collect();
                    ctx.binding.move_source_cids(&cids, self.correlation_id);
                    self.send.ping = true;
                    self.flush_send(ctx, now);
                }
            }
            Param::RemoteAddress(address) => {
                if self.side == Side::Server || started {
                    return Err(ParamError::InvalidState);
                }
                self.remote_address = address;
            }
            Param::IdleTimeout(ms) => {
                if started {
                    return Err(ParamError::InvalidState);
                }
                self.idle_timeout_ms = ms;
            }
            Param::PeerBidiStreamCount(count) => {
                self.streams.set_remote_limit(Directionality::Bi, count);
                if connected {
                    self.send.max_streams_bidi = true;
                    self.flush_send(ctx, now);
                }
            }
            Param::PeerUnidiStreamCount(count) => {
                self.streams.set_remote_limit(Directionality::Uni, count);
                if connected {
                    self.send.max_streams_uni = true;
                    self.flush_send(ctx, now);
                }
            }
            Param::CloseReasonPhrase(phrase) => {
                if phrase.len() >= MAX_CLOSE_REASON_PHRASE {
                    return Err(ParamError::InvalidParameter);
                }
                self.close_reason_phrase = Some(phrase);
            }
            Param::CertValidationFlags(flags) => {
                if self.side != Side::Client || started {
                    return Err(ParamError::InvalidState);
                }
                self.cert_validation_flags = flags;
            }
            Param::KeepAlive(ms) => {
                self.keep_alive_interval_ms = ms;
                if ms != 0 && !self.is_closed() {
                    self.timers.set(TimerType::KeepAlive, now, ms);
                } else {
                    self.timers.cancel(TimerType::KeepAlive);
                }
            }
            Param::DisconnectTimeout(us) => {
                if us == 0 || us > crate::endpoint::MAX_DISCONNECT_TIMEOUT_US {
                    return Err(ParamError::InvalidParameter);
                }
                self.disconnect_timeout_us = us;
            }
            Param::SecConfig(config) => {
                if self.side != Side::Server || self.sec_config.is_some() {
                    return Err(ParamError::InvalidState);
                }
                self.sec_config = Some(config);
            }
            Param::SendBuffering(on) => {
                self.flags.use_send_buffer = on;
            }
            Param::SendPacing(on) => {
                self.flags.use_pacing = on;
            }
            Param::ShareUdpBinding(on) => {
                if started {
                    return Err(ParamError::InvalidState);
                }
                self.flags.share_binding = on;
            }
            Param::ForceKeyUpdate => {
                if !connected || !confirmed {
                    return Err(ParamError::InvalidState);
                }
                let ready = self
                    .space(EncryptLevel::OneRtt)
                    .map_or(false, |s| s.has_keys() && !s.awaiting_key_phase_confirm);
                if !ready {
                    return Err(ParamError::InvalidState);
                }
                self.initiate_key_update(ctx, now)?;
            }
            Param::ForceCidUpdate => {
                if !connected || !confirmed {
                    return Err(ParamError::InvalidState);
                }
                if !self.retire_dest_cid(ctx) {
                    return Err(ParamError::InvalidState);
                }
                self.flags.initiated_cid_update = true;
                self.flush_send(ctx, now);
            }
        }
        Ok(())
    }

    fn initiate_key_update(&mut self, _ctx: &mut Context, _now: u64) -> Result<(), ParamError> {
        let new_keys = self
            .tls
            .as_mut()
            .and_then(|tls| tls.next_1rtt_keys())
            .ok_or(ParamError::InvalidState)?;
        let space = self
            .space_mut(EncryptLevel::OneRtt)
            .ok_or(ParamError::InvalidState)?;
        let start_pn = space.next_recv_pn;
        space.advance_key_phase(new_keys, start_pn);
        space.awaiting_key_phase_confirm = true;
        self.stats.key_updates += 1;
        trace!(self.log, "local key update initiated");
        Ok(())
    }

    /// Probe-then-fill getter: callers invoke once with an empty buffer to
    /// learn the size, then again to fill.
    pub fn get_param(&self, param: GetParam, buf: &mut [u8]) -> Result<usize, ParamError> {
        match param {
            GetParam::QuicVersion => {
                let required = 4;
                if buf.len() < required {
                    return Err(ParamError::BufferTooSmall { required });
                }
                buf[..4].copy_from_slice(&self.version.to_be_bytes());
                Ok(required)
            }
            GetParam::RemoteAddress => {
                let bytes = format!("{}", self.remote_address).into_bytes();
                if buf.len() < bytes.len() {
                    return Err(ParamError::BufferTooSmall {
                        required: bytes.len(),
                    });
                }
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            GetParam::Statistics | GetParam::StatisticsPlat => {
                let snapshot = self.statistics_snapshot(param == GetParam::StatisticsPlat);
                if buf.len() < snapshot.len() {
                    return Err(ParamError::BufferTooSmall {
                        required: snapshot.len(),
                    });
                }
                buf[..snapshot.len()].copy_from_slice(&snapshot);
                Ok(snapshot.len())
            }
            GetParam::ResumptionState => {
                let blob = self.resumption_state().ok_or(ParamError::InvalidState)?;
                if buf.len() < blob.len() {
                    return Err(ParamError::BufferTooSmall {
                        required: blob.len(),
                    });
                }
                buf[..blob.len()].copy_from_slice(&blob);
                Ok(blob.len())
            }
        }
    }

    fn statistics_snapshot(&self, platform_time: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(14 * 8);
        // Timestamps are μs from the monotonic clock; platform time on this
        // target shares that epoch, so the _PLAT conversion is the identity.
        let _ = platform_time;
        buf.put_u64(self.correlation_id);
        buf.put_u64(self.stats.start_time);
        buf.put_u64(self.stats.connected_time);
        buf.put_u64(self.stats.packets_received);
        buf.put_u64(self.stats.packets_sent);
        buf.put_u64(self.stats.packets_dropped);
        buf.put_u64(self.stats.duplicate_packets);
        buf.put_u64(self.stats.decryption_failures);
        buf.put_u64(self.stats.frames_received);
        buf.put_u64(self.stats.bytes_received);
        buf.put_u64(self.stats.bytes_sent);
        buf.put_u64(self.stats.key_updates);
        buf.put_u64(self.stats.cid_updates);
        buf.put_u64(self.smoothed_rtt);
        buf
    }

    /// Serialize `(version | peer TPs | server name | ticket)` for the
    /// client's resumption cache.
    fn resumption_state(&self) -> Option<Vec<u8>> {
        if self.side != Side::Client {
            return None;
        }
        let server_name = self.server_name.as_ref()?;
        let peer_params = self.peer_params.as_ref()?;
        let ticket = self.tls.as_ref()?.ticket()?;
        let mut buf = Vec::new();
        buf.put_u32(self.version);
        peer_params.write(!self.side, &mut buf);
        buf.put_u16(server_name.len() as u16);
        buf.put_slice(server_name.as_bytes());
        buf.put_slice(ticket);
        Some(buf)
    }

    /// Parse a blob produced by `resumption_state` back into the cached form
    /// used when dialing the same server again.
    pub fn decode_resumption_state(blob: &[u8]) -> Option<CachedSession> {
        let mut buf = std::io::Cursor::new(blob);
        let version = buf.get_u32_checked().ok()?;
        let peer_params = TransportParameters::read(Side::Server, &mut buf).ok()?;
        let name_len = buf.get_u16_checked().ok()? as usize;
        if buf.remaining() < name_len {
            return None;
        }
        let mut name = vec![0; name_len];
        buf.copy_to_slice(&mut name);
        let server_name = String::from_utf8(name).ok()?;
        let mut ticket = vec![0; buf.remaining()];
        buf.copy_to_slice(&mut ticket);
        Some(CachedSession {
            quic_version: version,
            peer_params,
            server_name,
            ticket,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    use slog::{o, Drain};

    use crate::crypto::testing::{test_keys, TestTls};
    use crate::endpoint::Config;
    use crate::StreamId;

    const SERVER_RESET_TOKEN: [u8; RESET_TOKEN_SIZE] = [0x5c; RESET_TOKEN_SIZE];

    fn logger() -> Logger {
        let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    }

    fn addr(port: u16) -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)
    }

    /// Transport parameters the server's engine reports as the client's.
    fn client_params() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1 << 20,
            initial_max_streams_bidi: 4,
            initial_max_streams_uni: 2,
            idle_timeout: 30_000,
            ..TransportParameters::default()
        }
    }

    /// Transport parameters the client's engine reports as the server's.
    fn server_params() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1 << 20,
            initial_max_streams_bidi: 8,
            initial_max_streams_uni: 4,
            idle_timeout: 30_000,
            stateless_reset_token: Some(SERVER_RESET_TOKEN),
            ..TransportParameters::default()
        }
    }

    struct Pair {
        now: u64,
        client_addr: SocketAddrV6,
        server_addr: SocketAddrV6,
        client_ctx: Context,
        server_ctx: Context,
        client: Connection,
        server: Option<Connection>,
    }

    impl Pair {
        fn start(client_config: Config, server_config: Config) -> Self {
            Self::start_with_server_params(client_config, server_config, server_params())
        }

        fn start_with_server_params(
            client_config: Config,
            server_config: Config,
            params: TransportParameters,
        ) -> Self {
            let mut client_ctx = Context::new(client_config).unwrap();
            let server_ctx = Context::new(server_config).unwrap();
            let client_addr = addr(50_000);
            let server_addr = addr(4433);
            let tls = Box::new(TestTls::new(Side::Client, params));
            let mut client =
                Connection::new_client(&mut client_ctx, logger(), server_addr, tls, None);
            client.queue_api(ApiCall::Start {
                server_name: "example.com".into(),
            });
            let mut pair = Pair {
                now: 1_000_000,
                client_addr,
                server_addr,
                client_ctx,
                server_ctx,
                client,
                server: None,
            };
            while pair.client.drain(&mut pair.client_ctx, pair.now) {}
            pair
        }

        fn handshake(client_config: Config, server_config: Config) -> Self {
            let mut pair = Self::start(client_config, server_config);
            pair.drive();
            pair
        }

        fn transmits(ctx: &mut Context) -> Vec<Box<[u8]>> {
            let mut out = Vec::new();
            while let Some(io) = ctx.io.pop_front() {
                if let Io::Transmit { packet, .. } = io {
                    out.push(packet);
                }
            }
            out
        }

        fn deliver_to_server(&mut self, packets: Vec<Box<[u8]>>) {
            for packet in packets {
                let bytes = BytesMut::from(&packet[..]);
                if self.server.is_none() {
                    let (decode, _) =
                        PartialDecode::new(bytes.clone(), CONNECTION_ID_LENGTH).unwrap();
                    let tls = Box::new(TestTls::new(Side::Server, client_params()));
                    let server = Connection::new_server(
                        &mut self.server_ctx,
                        logger(),
                        self.client_addr,
                        decode.dst_cid(),
                        decode.src_cid(),
                        tls,
                    );
                    self.server = Some(server);
                }
                let server = self.server.as_mut().unwrap();
                let datagram = Datagram {
                    remote: self.client_addr,
                    payload: bytes,
                };
                let _ = server.queue_recv_datagrams(512, vec![datagram]);
            }
            if let Some(server) = self.server.as_mut() {
                while server.drain(&mut self.server_ctx, self.now) {}
            }
        }

        fn deliver_to_client(&mut self, packets: Vec<Box<[u8]>>) {
            for packet in packets {
                let datagram = Datagram {
                    remote: self.server_addr,
                    payload: BytesMut::from(&packet[..]),
                };
                let _ = self.client.queue_recv_datagrams(512, vec![datagram]);
            }
            while self.client.drain(&mut self.client_ctx, self.now) {}
        }

        fn deliver_raw_to_client(&mut self, bytes: &[u8]) {
            let datagram = Datagram {
                remote: self.server_addr,
                payload: BytesMut::from(bytes),
            };
            let _ = self.client.queue_recv_datagrams(512, vec![datagram]);
            while self.client.drain(&mut self.client_ctx, self.now) {}
        }

        /// Shuttle packets both ways until the pair goes quiet.
        fn drive(&mut self) {
            for _ in 0..24 {
                let to_server = Self::transmits(&mut self.client_ctx);
                let to_client = Self::transmits(&mut self.server_ctx);
                if to_server.is_empty() && to_client.is_empty() {
                    break;
                }
                self.deliver_to_server(to_server);
                self.deliver_to_client(to_client);
            }
        }

        fn client_events(&mut self) -> Vec<Event> {
            self.client_ctx.events.drain(..).collect()
        }

        fn server_events(&mut self) -> Vec<Event> {
            self.server_ctx.events.drain(..).collect()
        }
    }

    /// Seal a 1-RTT packet exactly as the test server's keys would.
    fn seal_server_1rtt(pn: u64, frames: &[u8]) -> Vec<u8> {
        let keys = test_keys(EncryptLevel::OneRtt, Side::Server, 0);
        let number = PacketNumber::new(pn, 0);
        let header = Header::Short {
            dst_cid: ConnectionId::new(&[]),
            number,
            key_phase: false,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let pn_offset = buf.len();
        number.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(frames);
        if buf.len() < pn_offset + number.len() + 4 {
            buf.resize(pn_offset + number.len() + 4, 0);
        }
        let mut payload = buf.split_off(header_len);
        keys.write.packet.seal(pn, &buf, &mut payload);
        buf.extend_from_slice(&payload);
        let mut sample = [0; crypto::HP_SAMPLE_SIZE];
        sample.copy_from_slice(&buf[pn_offset + 4..pn_offset + 4 + crypto::HP_SAMPLE_SIZE]);
        let mask = keys.write.header.mask(&sample);
        apply_header_protection(&mut buf, pn_offset, &mask);
        buf
    }

    #[test]
    fn handshake_completes() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        assert_eq!(pair.client.state(), Lifecycle::Confirmed);
        assert_eq!(pair.server.as_ref().unwrap().state(), Lifecycle::Confirmed);
        assert!(pair
            .client_events()
            .iter()
            .any(|e| matches!(e, Event::Connected)));
        assert!(pair
            .server_events()
            .iter()
            .any(|e| matches!(e, Event::Connected)));
        assert!(pair.client.stats.packets_received > 0);
        assert!(pair.server.as_ref().unwrap().stats.packets_received > 0);
    }

    #[test]
    fn source_cid_registered_in_binding() {
        let mut pair = Pair::start(Config::default(), Config::default());
        let to_server = Pair::transmits(&mut pair.client_ctx);
        pair.deliver_to_server(to_server);
        let to_client = Pair::transmits(&mut pair.server_ctx);
        let (decode, _) =
            PartialDecode::new(BytesMut::from(&to_client[0][..]), CONNECTION_ID_LENGTH).unwrap();
        let server = pair.server.as_ref().unwrap();
        assert_eq!(
            pair.server_ctx.binding.lookup(&decode.src_cid()),
            Some(server.correlation_id)
        );
    }

    #[test]
    fn version_negotiation_aborts_silently() {
        let mut pair = Pair::start(Config::default(), Config::default());
        // Discard the first flight.
        let _ = Pair::transmits(&mut pair.client_ctx);
        let mut buf = Vec::new();
        Header::VersionNegotiate {
            random: 0x2a,
            src_cid: ConnectionId::new(&[7; 8]),
            dst_cid: ConnectionId::new(&[]),
        }
        .encode(&mut buf);
        buf.put_u32(0x4a5a_6a7a);
        pair.deliver_raw_to_client(&buf);

        let events = pair.client_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ShutdownInitiatedByTransport {
                reason: ConnectionError::VersionNegotiation,
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ShutdownComplete { peer_acked: false })));
        // Silent: no CONNECTION_CLOSE goes out.
        assert!(Pair::transmits(&mut pair.client_ctx).is_empty());
    }

    #[test]
    fn spurious_version_negotiation_ignored() {
        let mut pair = Pair::start(Config::default(), Config::default());
        let _ = Pair::transmits(&mut pair.client_ctx);
        let mut buf = Vec::new();
        Header::VersionNegotiate {
            random: 0x11,
            src_cid: ConnectionId::new(&[7; 8]),
            dst_cid: ConnectionId::new(&[]),
        }
        .encode(&mut buf);
        buf.put_u32(0x4a5a_6a7a);
        buf.put_u32(VERSION);
        pair.deliver_raw_to_client(&buf);
        assert!(pair.client_events().is_empty());
        assert!(!pair.client.is_closed());
    }

    #[test]
    fn retry_restarts_with_new_keys() {
        let mut pair = Pair::start(Config::default(), Config::default());
        let first_flight = Pair::transmits(&mut pair.client_ctx);
        let (decode, _) =
            PartialDecode::new(BytesMut::from(&first_flight[0][..]), CONNECTION_ID_LENGTH)
                .unwrap();
        let orig_dst = decode.dst_cid();
        let client_src = decode.src_cid();
        let new_server_cid = ConnectionId::new(&[0xd7; 8]);

        let mut retry = Vec::new();
        Header::Retry {
            src_cid: new_server_cid,
            dst_cid: client_src,
            orig_dst_cid: orig_dst,
            token: Bytes::from_static(b"retry-token"),
        }
        .encode(&mut retry);
        pair.deliver_raw_to_client(&retry);

        let resent = Pair::transmits(&mut pair.client_ctx);
        assert!(!resent.is_empty(), "client must resend its first flight");
        let (decode, _) =
            PartialDecode::new(BytesMut::from(&resent[0][..]), CONNECTION_ID_LENGTH).unwrap();
        assert!(decode.is_initial());
        // New destination CID and echoed token.
        assert_eq!(decode.dst_cid(), new_server_cid);
        assert_eq!(&decode.token()[..], b"retry-token");
        // Initial keys were regenerated from the server's new CID.
        let keys = crypto::Keys::new_initial(&new_server_cid, Side::Server);
        let sample = decode.sample().unwrap();
        let mask = keys.read.header.mask(&sample);
        let (packet, pn) = decode.finish(&mask, 0).unwrap();
        let mut payload = packet.payload;
        keys.read
            .packet
            .open(pn, &packet.header_data, &mut payload)
            .expect("new Initial must decrypt under keys from the Retry CID");
    }

    #[test]
    fn unexpected_orig_cid_echo_is_fatal() {
        // Server echoes an original CID although no Retry happened.
        let bad_params = TransportParameters {
            original_connection_id: Some(ConnectionId::new(&[9; 8])),
            ..server_params()
        };
        let mut pair = Pair::start_with_server_params(
            Config::default(),
            Config::default(),
            bad_params,
        );
        pair.drive();
        let events = pair.client_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ShutdownInitiatedByTransport {
                reason:
                    ConnectionError::TransportError {
                        error_code: TransportError::TRANSPORT_PARAMETER_ERROR,
                    },
            }
        )));
    }

    #[test]
    fn stateless_reset_closes_silently() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let _ = pair.client_events();
        let _ = Pair::transmits(&mut pair.client_ctx);

        let mut packet = vec![0x43u8; 40];
        for (i, byte) in packet.iter_mut().enumerate().skip(1) {
            *byte = i as u8;
        }
        let tail_at = packet.len() - RESET_TOKEN_SIZE;
        packet[tail_at..].copy_from_slice(&SERVER_RESET_TOKEN);
        pair.deliver_raw_to_client(&packet);

        let events = pair.client_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ShutdownInitiatedByTransport {
                reason: ConnectionError::Reset,
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ShutdownComplete { peer_acked: false })));
        assert!(Pair::transmits(&mut pair.client_ctx).is_empty());
    }

    #[test]
    fn duplicate_packet_dropped_once() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let server = pair.server.as_mut().unwrap();
        server.queue_api(ApiCall::Ping);
        while server.drain(&mut pair.server_ctx, pair.now) {}
        let packets = Pair::transmits(&mut pair.server_ctx);
        assert!(!packets.is_empty());

        let received_before = pair.client.stats.packets_received;
        pair.deliver_to_client(packets.clone());
        pair.deliver_to_client(packets);
        assert_eq!(pair.client.stats.duplicate_packets, 1);
        assert_eq!(pair.client.stats.packets_received, received_before + 1);
    }

    #[test]
    fn idle_timeout_closes_silently() {
        let config = Config {
            idle_timeout_ms: 1000,
            ..Config::default()
        };
        let mut pair = Pair::handshake(config, Config::default());
        // Flush any delayed ACKs so only the idle timer remains interesting.
        pair.client.on_timer_expired(&mut pair.client_ctx, pair.now + 30_000);
        while pair.client.drain(&mut pair.client_ctx, pair.now + 30_000) {}
        let _ = Pair::transmits(&mut pair.client_ctx);
        let _ = pair.client_events();

        let expiry = pair.now + 2_000_000;
        pair.client.on_timer_expired(&mut pair.client_ctx, expiry);
        while pair.client.drain(&mut pair.client_ctx, expiry) {}

        let events = pair.client_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ShutdownInitiatedByTransport {
                reason: ConnectionError::TimedOut,
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ShutdownComplete { peer_acked: false })));
        assert!(Pair::transmits(&mut pair.client_ctx).is_empty());
    }

    #[test]
    fn peer_key_update_accepted() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let now = pair.now;
        let server = pair.server.as_mut().unwrap();
        server
            .set_param(&mut pair.server_ctx, now, Param::ForceKeyUpdate)
            .unwrap();
        server.queue_api(ApiCall::Ping);
        while server.drain(&mut pair.server_ctx, now) {}
        let packets = Pair::transmits(&mut pair.server_ctx);
        pair.deliver_to_client(packets);
        assert_eq!(pair.client.stats.key_updates, 1);

        // Traffic keeps flowing under the new generation, confirming the
        // update on the initiator.
        pair.client.queue_api(ApiCall::Ping);
        while pair.client.drain(&mut pair.client_ctx, now) {}
        let to_server = Pair::transmits(&mut pair.client_ctx);
        pair.deliver_to_server(to_server);
        assert_eq!(
            pair.server.as_ref().unwrap().stats.decryption_failures,
            0
        );
    }

    #[test]
    fn app_close_round_trip_completes_once() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let _ = pair.client_events();
        let _ = pair.server_events();
        pair.client.queue_api(ApiCall::Shutdown {
            application: true,
            error_code: 7,
            reason: Bytes::from_static(b"done"),
            silent: false,
        });
        while pair.client.drain(&mut pair.client_ctx, pair.now) {}
        let to_server = Pair::transmits(&mut pair.client_ctx);
        assert!(!to_server.is_empty(), "CONNECTION_CLOSE must be emitted");
        pair.deliver_to_server(to_server);

        let server_events = pair.server_events();
        assert!(server_events
            .iter()
            .any(|e| matches!(e, Event::ShutdownInitiatedByPeer { error_code: 7 })));

        // The reciprocal close completes the client immediately.
        let to_client = Pair::transmits(&mut pair.server_ctx);
        assert!(!to_client.is_empty());
        pair.deliver_to_client(to_client);
        let client_events = pair.client_events();
        let completions = client_events
            .iter()
            .filter(|e| matches!(e, Event::ShutdownComplete { .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(client_events
            .iter()
            .any(|e| matches!(e, Event::ShutdownComplete { peer_acked: true })));

        // The server drains, then completes exactly once.
        let expiry = pair.now + 20_000_000;
        let server = pair.server.as_mut().unwrap();
        server.on_timer_expired(&mut pair.server_ctx, expiry);
        while server.drain(&mut pair.server_ctx, expiry) {}
        let completions = pair
            .server_events()
            .iter()
            .filter(|e| matches!(e, Event::ShutdownComplete { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn new_cid_ingest_and_forced_rotation() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let _ = Pair::transmits(&mut pair.client_ctx);

        let new_cid = ConnectionId::new(&[0xab; 8]);
        let mut frames = Vec::new();
        frame::NewConnectionId {
            sequence: 1,
            retire_prior_to: 0,
            cid: new_cid,
            reset_token: [0xcd; RESET_TOKEN_SIZE],
        }
        .encode(&mut frames);
        let packet = seal_server_1rtt(50, &frames);
        pair.deliver_raw_to_client(&packet);
        assert!(!pair.client.is_closed());

        let now = pair.now;
        pair.client
            .set_param(&mut pair.client_ctx, now, Param::ForceCidUpdate)
            .unwrap();
        pair.client.queue_api(ApiCall::Ping);
        while pair.client.drain(&mut pair.client_ctx, now) {}
        assert_eq!(pair.client.stats.cid_updates, 1);

        let packets = Pair::transmits(&mut pair.client_ctx);
        assert!(!packets.is_empty());
        // Short header: the rotated destination CID sits right after the
        // first byte.
        let found = packets
            .iter()
            .filter(|p| p[0] & 0x80 == 0)
            .any(|p| &p[1..9] == &new_cid[..]);
        assert!(found, "outgoing packets must use the rotated CID");
    }

    #[test]
    fn stream_data_delivered_to_application() {
        let config = Config {
            max_remote_uni_streams: 4,
            ..Config::default()
        };
        let mut pair = Pair::handshake(config, Config::default());
        let _ = pair.client_events();

        let id = StreamId::new(Side::Server, Directionality::Uni, 0);
        let mut frames = Vec::new();
        frame::Stream {
            id,
            offset: 0,
            fin: true,
            data: Bytes::from_static(b"hello stream"),
        }
        .encode(true, &mut frames);
        let packet = seal_server_1rtt(60, &frames);
        pair.deliver_raw_to_client(&packet);

        let events = pair.client_events();
        let delivered = events.iter().any(|e| match e {
            Event::StreamData { id: got, fin, data, .. } => {
                *got == id && *fin && &data[..] == b"hello stream"
            }
            _ => false,
        });
        assert!(delivered);
    }

    #[test]
    fn stream_over_limit_is_fatal() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let _ = pair.client_events();

        // Default config allows zero peer-initiated streams.
        let id = StreamId::new(Side::Server, Directionality::Uni, 0);
        let mut frames = Vec::new();
        frame::Stream {
            id,
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"x"),
        }
        .encode(true, &mut frames);
        let packet = seal_server_1rtt(61, &frames);
        pair.deliver_raw_to_client(&packet);

        assert!(pair.client.is_closed());
        let events = pair.client_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ShutdownInitiatedByTransport {
                reason:
                    ConnectionError::TransportError {
                        error_code: TransportError::STREAM_LIMIT_ERROR,
                    },
            }
        )));
    }

    #[test]
    fn param_preconditions() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let tls = Box::new(TestTls::new(Side::Client, server_params()));
        let mut client = Connection::new_client(&mut ctx, logger(), addr(4433), tls, None);

        client.set_param(&mut ctx, 0, Param::IdleTimeout(5000)).unwrap();
        assert_eq!(
            client.set_param(&mut ctx, 0, Param::DisconnectTimeout(0)),
            Err(ParamError::InvalidParameter)
        );
        assert_eq!(
            client.set_param(&mut ctx, 0, Param::QuicVersion(0x1234_5678)),
            Err(ParamError::InvalidParameter)
        );
        assert_eq!(
            client.set_param(&mut ctx, 0, Param::CloseReasonPhrase("x".repeat(600))),
            Err(ParamError::InvalidParameter)
        );
        client
            .set_param(&mut ctx, 0, Param::CloseReasonPhrase("bye".into()))
            .unwrap();
        assert_eq!(
            client.set_param(&mut ctx, 0, Param::ForceKeyUpdate),
            Err(ParamError::InvalidState)
        );

        client.queue_api(ApiCall::Start {
            server_name: "example.com".into(),
        });
        while client.drain(&mut ctx, 0) {}
        assert_eq!(
            client.set_param(&mut ctx, 0, Param::IdleTimeout(1)),
            Err(ParamError::InvalidState)
        );
        assert_eq!(
            client.set_param(&mut ctx, 0, Param::QuicVersion(VERSION)),
            Err(ParamError::InvalidState)
        );
    }

    #[test]
    fn statistics_probe_then_fill() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let required = match pair.client.get_param(GetParam::Statistics, &mut []) {
            Err(ParamError::BufferTooSmall { required }) => required,
            x => panic!("expected probe result, got {:?}", x),
        };
        let mut buf = vec![0; required];
        assert_eq!(
            pair.client.get_param(GetParam::Statistics, &mut buf),
            Ok(required)
        );
        let mut cursor = std::io::Cursor::new(&buf[..]);
        let correlation_id = cursor.get_u64();
        assert_eq!(correlation_id, pair.client.correlation_id);
    }

    #[test]
    fn resumption_state_round_trip() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let required = match pair.client.get_param(GetParam::ResumptionState, &mut []) {
            Err(ParamError::BufferTooSmall { required }) => required,
            x => panic!("expected probe result, got {:?}", x),
        };
        let mut buf = vec![0; required];
        pair.client
            .get_param(GetParam::ResumptionState, &mut buf)
            .unwrap();

        let cached = Connection::decode_resumption_state(&buf).unwrap();
        assert_eq!(cached.quic_version, VERSION);
        assert_eq!(cached.server_name, "example.com");
        assert_eq!(cached.ticket, b"test-ticket");
        assert_eq!(cached.peer_params.idle_timeout, server_params().idle_timeout);
        assert_eq!(
            cached.peer_params.stateless_reset_token,
            Some(SERVER_RESET_TOKEN)
        );
    }

    #[test]
    fn resumption_state_requires_client() {
        let mut pair = Pair::handshake(Config::default(), Config::default());
        let server = pair.server.as_mut().unwrap();
        assert_eq!(
            server.get_param(GetParam::ResumptionState, &mut []),
            Err(ParamError::InvalidState)
        );
    }

    #[test]
    fn drain_respects_operation_budget() {
        let config = Config {
            max_operations_per_drain: 4,
            ..Config::default()
        };
        let mut ctx = Context::new(config).unwrap();
        let tls = Box::new(TestTls::new(Side::Client, server_params()));
        let client = Connection::new_client(&mut ctx, logger(), addr(4433), tls, None);
        for _ in 0..6 {
            client.queue_trace_rundown();
        }
        let mut client = client;
        assert!(client.drain(&mut ctx, 0), "work must remain after budget");
        assert!(!client.drain(&mut ctx, 0));
    }

    #[test]
    fn receive_queue_bounded() {
        let mut ctx = Context::new(Config::default()).unwrap();
        let tls = Box::new(TestTls::new(Side::Client, server_params()));
        let client = Connection::new_client(&mut ctx, logger(), addr(4433), tls, None);
        let make = |n: usize| {
            (0..n)
                .map(|_| Datagram {
                    remote: addr(4433),
                    payload: BytesMut::from(&[0u8; 8][..]),
                })
                .collect::<Vec<_>>()
        };
        assert!(client.queue_recv_datagrams(4, make(3)).is_ok());
        // Over the cap: the chain bounces back to the datapath.
        let rejected = client.queue_recv_datagrams(4, make(2)).unwrap_err();
        assert_eq!(rejected.len(), 2);
    }
}
