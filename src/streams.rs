//! Contract surface of the stream set.
//!
//! Per-stream send/receive buffering lives outside the connection core; what
//! the frame loop needs from the stream set is identity resolution,
//! direction/origin validation, stream-count limits and connection-level
//! flow control accounting.

use fnv::FnvHashMap;

use crate::{Directionality, Side, StreamId, TransportError};

/// Hard bound on any MAX_STREAMS value; larger is a frame encoding error.
pub const MAX_MAX_STREAMS: u64 = 1 << 60;

/// Whether a frame type belongs to the sending or the receiving part of a
/// stream. Sender-side frames (STREAM, RESET_STREAM, STREAM_DATA_BLOCKED)
/// arrive from a stream's writer; receiver-side frames (MAX_STREAM_DATA,
/// STOP_SENDING) from its reader.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamFrameKind {
    SenderSide,
    ReceiverSide,
}

#[derive(Debug, Default)]
pub struct StreamState {
    /// Highest received offset plus one.
    pub recv_offset: u64,
    pub final_size: Option<u64>,
    pub recv_closed: bool,
    pub send_closed: bool,
    /// Peer's flow-control credit for our sending side.
    pub max_stream_data_remote: u64,
}

/// Resolution of a stream reference in an incoming frame.
#[derive(Debug)]
pub enum Resolve<'a> {
    Stream(&'a mut StreamState),
    /// Known-closed stream; the frame is skipped silently.
    Closed,
}

pub struct StreamSet {
    side: Side,
    streams: FnvHashMap<StreamId, StreamState>,

    /// Caps we advertise on peer-initiated streams.
    max_remote_bidi: u64,
    max_remote_uni: u64,
    /// Lowest peer-initiated index not yet opened.
    next_remote_bidi: u64,
    next_remote_uni: u64,

    /// Peer's caps on streams we initiate.
    max_local_bidi: u64,
    max_local_uni: u64,
    next_local_bidi: u64,
    next_local_uni: u64,

    //
    // Connection-level flow control
    //
    /// Credit we have granted the peer.
    pub max_data_local: u64,
    pub data_recvd: u64,
    /// Credit the peer has granted us.
    pub max_data_remote: u64,
    pub data_sent: u64,
    /// Sending stalled on connection-level credit.
    pub conn_flow_blocked: bool,

    shut_down: bool,
}

impl StreamSet {
    pub fn new(side: Side, max_remote_bidi: u64, max_remote_uni: u64, recv_window: u64) -> Self {
        StreamSet {
            side,
            streams: FnvHashMap::default(),
            max_remote_bidi,
            max_remote_uni,
            next_remote_bidi: 0,
            next_remote_uni: 0,
            max_local_bidi: 0,
            max_local_uni: 0,
            next_local_bidi: 0,
            next_local_uni: 0,
            max_data_local: recv_window,
            data_recvd: 0,
            max_data_remote: 0,
            data_sent: 0,
            conn_flow_blocked: false,
            shut_down: false,
        }
    }

    /// Install the peer's transport-parameter limits.
    pub fn apply_peer_limits(&mut self, max_bidi: u64, max_uni: u64, max_data: u64) {
        self.max_local_bidi = max_bidi;
        self.max_local_uni = max_uni;
        if max_data > self.max_data_remote {
            self.max_data_remote = max_data;
        }
    }

    /// Raise the cap on peer-initiated streams (parameter surface).
    pub fn set_remote_limit(&mut self, directionality: Directionality, count: u64) {
        match directionality {
            Directionality::Bi => self.max_remote_bidi = count.max(self.max_remote_bidi),
            Directionality::Uni => self.max_remote_uni = count.max(self.max_remote_uni),
        }
    }

    /// Ingest a MAX_STREAMS frame.
    pub fn on_max_streams(
        &mut self,
        directionality: Directionality,
        count: u64,
    ) -> Result<bool, TransportError> {
        if count > MAX_MAX_STREAMS {
            return Err(TransportError::FRAME_ENCODING_ERROR);
        }
        let limit = match directionality {
            Directionality::Bi => &mut self.max_local_bidi,
            Directionality::Uni => &mut self.max_local_uni,
        };
        if count > *limit {
            *limit = count;
            return Ok(true);
        }
        Ok(false)
    }

    /// Validate direction/origin rules and resolve the stream, creating
    /// peer-initiated streams on first use.
    pub fn resolve(
        &mut self,
        id: StreamId,
        kind: StreamFrameKind,
    ) -> Result<Resolve<'_>, TransportError> {
        if id.directionality() == Directionality::Uni {
            let valid = match kind {
                StreamFrameKind::SenderSide => id.initiator() != self.side,
                StreamFrameKind::ReceiverSide => id.initiator() == self.side,
            };
            if !valid {
                return Err(TransportError::STREAM_STATE_ERROR);
            }
        }
        if id.initiator() == self.side {
            let next = match id.directionality() {
                Directionality::Bi => self.next_local_bidi,
                Directionality::Uni => self.next_local_uni,
            };
            if id.index() >= next {
                // The peer references a stream we never opened.
                return Err(TransportError::STREAM_STATE_ERROR);
            }
            return Ok(match self.streams.get_mut(&id) {
                Some(stream) => Resolve::Stream(stream),
                None => Resolve::Closed,
            });
        }
        let (limit, next) = match id.directionality() {
            Directionality::Bi => (self.max_remote_bidi, &mut self.next_remote_bidi),
            Directionality::Uni => (self.max_remote_uni, &mut self.next_remote_uni),
        };
        if id.index() >= limit {
            return Err(TransportError::STREAM_LIMIT_ERROR);
        }
        if id.index() < *next {
            return Ok(match self.streams.get_mut(&id) {
                Some(stream) => Resolve::Stream(stream),
                None => Resolve::Closed,
            });
        }
        // Opening stream N implicitly opens every lower-numbered stream of
        // the same class.
        for index in *next..=id.index() {
            let opened = StreamId::new(!self.side, id.directionality(), index);
            self.streams.entry(opened).or_default();
        }
        *next = id.index() + 1;
        Ok(Resolve::Stream(self.streams.get_mut(&id).unwrap()))
    }

    /// Open a locally-initiated stream if the peer's limit allows.
    pub fn open(&mut self, directionality: Directionality) -> Option<StreamId> {
        let (limit, next) = match directionality {
            Directionality::Bi => (self.max_local_bidi, &mut self.next_local_bidi),
            Directionality::Uni => (self.max_local_uni, &mut self.next_local_uni),
        };
        if *next >= limit {
            return None;
        }
        let id = StreamId::new(self.side, directionality, *next);
        *next += 1;
        self.streams.insert(id, StreamState::default());
        Some(id)
    }

    /// Discard a fully-closed stream's state.
    pub fn cleanup(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get(&id) {
            if stream.recv_closed && stream.send_closed {
                self.streams.remove(&id);
            }
        }
    }

    /// Abandon all streams on connection close.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        self.streams.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn open_count(&self) -> usize {
        self.streams.len()
    }

    /// Whether connection-level flow control permits `len` more bytes from
    /// the peer.
    pub fn recv_within_flow_control(&self, new_bytes: u64) -> bool {
        self.data_recvd + new_bytes <= self.max_data_local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn set() -> StreamSet {
        StreamSet::new(Side::Server, 4, 2, 1 << 20)
    }

    #[test]
    fn peer_stream_created_on_first_use() {
        let mut streams = set();
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        assert_matches!(
            streams.resolve(id, StreamFrameKind::SenderSide),
            Ok(Resolve::Stream(_))
        );
        assert_eq!(streams.open_count(), 1);
    }

    #[test]
    fn implicit_open_of_lower_streams() {
        let mut streams = set();
        let id = StreamId::new(Side::Client, Directionality::Bi, 3);
        assert_matches!(
            streams.resolve(id, StreamFrameKind::SenderSide),
            Ok(Resolve::Stream(_))
        );
        assert_eq!(streams.open_count(), 4);
    }

    #[test]
    fn limit_violation() {
        let mut streams = set();
        let id = StreamId::new(Side::Client, Directionality::Uni, 2);
        assert_eq!(
            streams
                .resolve(id, StreamFrameKind::SenderSide)
                .err()
                .unwrap(),
            TransportError::STREAM_LIMIT_ERROR
        );
    }

    #[test]
    fn uni_direction_rules() {
        let mut streams = set();
        // Peer-initiated uni stream: peer writes, we read. A MAX_STREAM_DATA
        // from the peer would mean the peer reads its own stream.
        let id = StreamId::new(Side::Client, Directionality::Uni, 0);
        assert_eq!(
            streams
                .resolve(id, StreamFrameKind::ReceiverSide)
                .err()
                .unwrap(),
            TransportError::STREAM_STATE_ERROR
        );
        assert_matches!(
            streams.resolve(id, StreamFrameKind::SenderSide),
            Ok(Resolve::Stream(_))
        );
    }

    #[test]
    fn unknown_local_stream_rejected() {
        let mut streams = set();
        let id = StreamId::new(Side::Server, Directionality::Bi, 0);
        assert_eq!(
            streams
                .resolve(id, StreamFrameKind::SenderSide)
                .err()
                .unwrap(),
            TransportError::STREAM_STATE_ERROR
        );
    }

    #[test]
    fn closed_stream_skipped() {
        let mut streams = set();
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        streams.resolve(id, StreamFrameKind::SenderSide).unwrap();
        streams.streams.get_mut(&id).unwrap().recv_closed = true;
        streams.streams.get_mut(&id).unwrap().send_closed = true;
        streams.cleanup(id);
        assert_matches!(
            streams.resolve(id, StreamFrameKind::SenderSide),
            Ok(Resolve::Closed)
        );
    }

    #[test]
    fn max_streams_bounded() {
        let mut streams = set();
        assert_eq!(
            streams.on_max_streams(Directionality::Bi, MAX_MAX_STREAMS + 1),
            Err(TransportError::FRAME_ENCODING_ERROR)
        );
        assert_eq!(streams.on_max_streams(Directionality::Bi, 10), Ok(true));
        assert_eq!(streams.on_max_streams(Directionality::Bi, 5), Ok(false));
        assert_eq!(streams.open(Directionality::Bi).unwrap().index(), 0);
    }
}
