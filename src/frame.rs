//! Frame model: parsing iterator, encoders, and per-level admissibility.

use std::fmt;

use bytes::{Buf, BufMut, Bytes};

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::packet::{ConnectionId, EncryptLevel};
use crate::range_set::RangeSet;
use crate::{Directionality, StreamId, TransportError, MAX_CID_SIZE, RESET_TOKEN_SIZE};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Type(pub u64);

impl Type {
    pub const PADDING: Type = Type(0x00);
    pub const PING: Type = Type(0x01);
    pub const ACK: Type = Type(0x02);
    pub const ACK_ECN: Type = Type(0x03);
    pub const RESET_STREAM: Type = Type(0x04);
    pub const STOP_SENDING: Type = Type(0x05);
    pub const CRYPTO: Type = Type(0x06);
    pub const NEW_TOKEN: Type = Type(0x07);
    pub const STREAM_BASE: Type = Type(0x08);
    pub const MAX_DATA: Type = Type(0x10);
    pub const MAX_STREAM_DATA: Type = Type(0x11);
    pub const MAX_STREAMS_BIDI: Type = Type(0x12);
    pub const MAX_STREAMS_UNI: Type = Type(0x13);
    pub const DATA_BLOCKED: Type = Type(0x14);
    pub const STREAM_DATA_BLOCKED: Type = Type(0x15);
    pub const STREAMS_BLOCKED_BIDI: Type = Type(0x16);
    pub const STREAMS_BLOCKED_UNI: Type = Type(0x17);
    pub const NEW_CONNECTION_ID: Type = Type(0x18);
    pub const RETIRE_CONNECTION_ID: Type = Type(0x19);
    pub const PATH_CHALLENGE: Type = Type(0x1a);
    pub const PATH_RESPONSE: Type = Type(0x1b);
    pub const CONNECTION_CLOSE: Type = Type(0x1c);
    pub const APPLICATION_CLOSE: Type = Type(0x1d);
    pub const HANDSHAKE_DONE: Type = Type(0x1e);

    /// Largest type this implementation understands.
    pub const MAX: u64 = 0x1e;

    fn is_stream(self) -> bool {
        self.0 >= 0x08 && self.0 <= 0x0f
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Type::PADDING => "PADDING",
            Type::PING => "PING",
            Type::ACK => "ACK",
            Type::ACK_ECN => "ACK_ECN",
            Type::RESET_STREAM => "RESET_STREAM",
            Type::STOP_SENDING => "STOP_SENDING",
            Type::CRYPTO => "CRYPTO",
            Type::NEW_TOKEN => "NEW_TOKEN",
            Type::MAX_DATA => "MAX_DATA",
            Type::MAX_STREAM_DATA => "MAX_STREAM_DATA",
            Type::MAX_STREAMS_BIDI => "MAX_STREAMS_BIDI",
            Type::MAX_STREAMS_UNI => "MAX_STREAMS_UNI",
            Type::DATA_BLOCKED => "DATA_BLOCKED",
            Type::STREAM_DATA_BLOCKED => "STREAM_DATA_BLOCKED",
            Type::STREAMS_BLOCKED_BIDI => "STREAMS_BLOCKED_BIDI",
            Type::STREAMS_BLOCKED_UNI => "STREAMS_BLOCKED_UNI",
            Type::NEW_CONNECTION_ID => "NEW_CONNECTION_ID",
            Type::RETIRE_CONNECTION_ID => "RETIRE_CONNECTION_ID",
            Type::PATH_CHALLENGE => "PATH_CHALLENGE",
            Type::PATH_RESPONSE => "PATH_RESPONSE",
            Type::CONNECTION_CLOSE => "CONNECTION_CLOSE",
            Type::APPLICATION_CLOSE => "CONNECTION_CLOSE_APP",
            Type::HANDSHAKE_DONE => "HANDSHAKE_DONE",
            _ if self.is_stream() => "STREAM",
            _ => return write!(f, "UNKNOWN({:02x})", self.0),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending { id: StreamId, error_code: u64 },
    Crypto(Crypto),
    NewToken { token: Bytes },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { directionality: Directionality, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { directionality: Directionality, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    ConnectionClose(ConnectionClose),
    ApplicationClose(ApplicationClose),
    HandshakeDone,
    Invalid(Type),
}

impl Frame {
    pub fn ty(&self) -> Type {
        match *self {
            Frame::Padding => Type::PADDING,
            Frame::Ping => Type::PING,
            Frame::Ack(_) => Type::ACK,
            Frame::ResetStream(_) => Type::RESET_STREAM,
            Frame::StopSending { .. } => Type::STOP_SENDING,
            Frame::Crypto(_) => Type::CRYPTO,
            Frame::NewToken { .. } => Type::NEW_TOKEN,
            Frame::Stream(ref x) => {
                let mut ty = Type::STREAM_BASE.0;
                if x.offset != 0 {
                    ty |= 0x04;
                }
                ty |= 0x02;
                if x.fin {
                    ty |= 0x01;
                }
                Type(ty)
            }
            Frame::MaxData(_) => Type::MAX_DATA,
            Frame::MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            Frame::MaxStreams {
                directionality: Directionality::Bi,
                ..
            } => Type::MAX_STREAMS_BIDI,
            Frame::MaxStreams { .. } => Type::MAX_STREAMS_UNI,
            Frame::DataBlocked { .. } => Type::DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => Type::STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                ..
            } => Type::STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlocked { .. } => Type::STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId(_) => Type::NEW_CONNECTION_ID,
            Frame::RetireConnectionId { .. } => Type::RETIRE_CONNECTION_ID,
            Frame::PathChallenge(_) => Type::PATH_CHALLENGE,
            Frame::PathResponse(_) => Type::PATH_RESPONSE,
            Frame::ConnectionClose(_) => Type::CONNECTION_CLOSE,
            Frame::ApplicationClose(_) => Type::APPLICATION_CLOSE,
            Frame::HandshakeDone => Type::HANDSHAKE_DONE,
            Frame::Invalid(ty) => ty,
        }
    }

    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            *self,
            Frame::Padding
                | Frame::Ack(_)
                | Frame::ConnectionClose(_)
                | Frame::ApplicationClose(_)
        )
    }

    /// Whether this frame may appear at the given encryption level.
    pub fn is_allowed(&self, level: EncryptLevel) -> bool {
        match level {
            EncryptLevel::Initial | EncryptLevel::Handshake => matches!(
                *self,
                Frame::Padding
                    | Frame::Ping
                    | Frame::Ack(_)
                    | Frame::Crypto(_)
                    | Frame::ConnectionClose(_)
            ),
            EncryptLevel::ZeroRtt => !matches!(
                *self,
                Frame::Ack(_) | Frame::ConnectionClose(_) | Frame::ApplicationClose(_)
            ),
            EncryptLevel::OneRtt => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        out.put_var(Type::CRYPTO.0);
        out.put_var(self.offset);
        out.put_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    pub fn encode<W: BufMut>(&self, length: bool, out: &mut W) {
        let mut ty = Type::STREAM_BASE.0;
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        out.put_var(ty);
        out.put_var(self.id.0);
        if self.offset != 0 {
            out.put_var(self.offset);
        }
        if length {
            out.put_var(self.data.len() as u64);
        }
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: u64,
    pub final_size: u64,
}

impl ResetStream {
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        out.put_var(Type::RESET_STREAM.0);
        out.put_var(self.id.0);
        out.put_var(self.error_code);
        out.put_var(self.final_size);
    }
}

#[derive(Debug, Clone)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub cid: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    pub fn encode<W: BufMut>(&self, out: &mut W) {
        out.put_var(Type::NEW_CONNECTION_ID.0);
        out.put_var(self.sequence);
        out.put_var(self.retire_prior_to);
        out.put_u8(self.cid.len() as u8);
        out.put_slice(&self.cid);
        out.put_slice(&self.reset_token);
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionClose {
    pub error_code: TransportError,
    pub frame_type: Option<Type>,
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ConnectionClose {
    pub fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.put_var(Type::CONNECTION_CLOSE.0);
        out.put_var(u64::from(self.error_code.0));
        out.put_var(self.frame_type.map_or(0, |x| x.0));
        let max_reason = max_len.saturating_sub(12);
        let len = self.reason.len().min(max_reason);
        out.put_var(len as u64);
        out.put_slice(&self.reason[..len]);
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationClose {
    pub error_code: u64,
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    pub fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.put_var(Type::APPLICATION_CLOSE.0);
        out.put_var(self.error_code);
        let max_reason = max_len.saturating_sub(12);
        let len = self.reason.len().min(max_reason);
        out.put_var(len as u64);
        out.put_slice(&self.reason[..len]);
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub largest: u64,
    pub delay: u64,
    pub first_range: u64,
    /// Remaining (gap, range) pairs, still wire-encoded.
    pub additional: Bytes,
    pub range_count: u64,
    pub ecn: Option<EcnCounts>,
}

impl Ack {
    /// Expand into ascending ranges in `out`. Fails on ranges that underflow
    /// below packet number zero.
    pub fn decode_ranges(&self, out: &mut RangeSet) -> Result<(), TransportError> {
        out.clear();
        let mut smallest = self
            .largest
            .checked_sub(self.first_range)
            .ok_or(TransportError::FRAME_ENCODING_ERROR)?;
        out.insert(smallest..self.largest + 1);
        let mut buf = std::io::Cursor::new(&self.additional[..]);
        for _ in 0..self.range_count {
            let gap = buf.get_var()?;
            let range = buf.get_var()?;
            let largest = smallest
                .checked_sub(gap + 2)
                .ok_or(TransportError::FRAME_ENCODING_ERROR)?;
            smallest = largest
                .checked_sub(range)
                .ok_or(TransportError::FRAME_ENCODING_ERROR)?;
            out.insert(smallest..largest + 1);
        }
        Ok(())
    }

    pub fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, ecn: Option<&EcnCounts>, out: &mut W) {
        debug_assert!(!ranges.is_empty(), "ACK frames must contain at least one range");
        out.put_var(if ecn.is_some() {
            Type::ACK_ECN.0
        } else {
            Type::ACK.0
        });
        let mut iter = ranges.iter_descending();
        let first = iter.next().unwrap();
        out.put_var(first.end - 1);
        out.put_var(delay);
        out.put_var(ranges.len() as u64 - 1);
        out.put_var(first.end - first.start - 1);
        let mut prev_start = first.start;
        for range in iter {
            out.put_var(prev_start - range.end - 1);
            out.put_var(range.end - range.start - 1);
            prev_start = range.start;
        }
        if let Some(x) = ecn {
            out.put_var(x.ect0);
            out.put_var(x.ect1);
            out.put_var(x.ce);
        }
    }
}

/// Iterator over the frames of a payload.
///
/// A malformed frame yields `Frame::Invalid` and ends iteration; the caller
/// turns that into FRAME_ENCODING_ERROR.
pub struct Iter {
    bytes: std::io::Cursor<Bytes>,
    malformed: bool,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Iter {
            bytes: std::io::Cursor::new(payload),
            malformed: false,
        }
    }

    fn try_next(&mut self) -> Result<Frame, UnexpectedEnd> {
        let ty = Type(self.bytes.get_var()?);
        Ok(match ty {
            Type::PADDING => {
                // Consume the whole run in one step.
                while self.bytes.has_remaining() && self.bytes.chunk()[0] == 0 {
                    self.bytes.advance(1);
                }
                Frame::Padding
            }
            Type::PING => Frame::Ping,
            Type::ACK | Type::ACK_ECN => {
                let largest = self.bytes.get_var()?;
                let delay = self.bytes.get_var()?;
                let range_count = self.bytes.get_var()?;
                let first_range = self.bytes.get_var()?;
                let additional_start = self.bytes.position() as usize;
                for _ in 0..range_count {
                    self.bytes.get_var()?;
                    self.bytes.get_var()?;
                }
                let additional_end = self.bytes.position() as usize;
                let ecn = if ty == Type::ACK_ECN {
                    Some(EcnCounts {
                        ect0: self.bytes.get_var()?,
                        ect1: self.bytes.get_var()?,
                        ce: self.bytes.get_var()?,
                    })
                } else {
                    None
                };
                Frame::Ack(Ack {
                    largest,
                    delay,
                    first_range,
                    additional: self
                        .bytes
                        .get_ref()
                        .slice(additional_start..additional_end),
                    range_count,
                    ecn,
                })
            }
            Type::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get_var()?,
                final_size: self.bytes.get_var()?,
            }),
            Type::STOP_SENDING => Frame::StopSending {
                id: StreamId(self.bytes.get_var()?),
                error_code: self.bytes.get_var()?,
            },
            Type::CRYPTO => {
                let offset = self.bytes.get_var()?;
                let len = self.bytes.get_var()? as usize;
                Frame::Crypto(Crypto {
                    offset,
                    data: self.take(len)?,
                })
            }
            Type::NEW_TOKEN => {
                let len = self.bytes.get_var()? as usize;
                if len == 0 {
                    return Err(UnexpectedEnd);
                }
                Frame::NewToken {
                    token: self.take(len)?,
                }
            }
            Type::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_BIDI => Frame::MaxStreams {
                directionality: Directionality::Bi,
                count: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_UNI => Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: self.bytes.get_var()?,
            },
            Type::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            Type::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: StreamId(self.bytes.get_var()?),
                offset: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                limit: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                directionality: Directionality::Uni,
                limit: self.bytes.get_var()?,
            },
            Type::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                let len = self.bytes.get_u8_checked()? as usize;
                if len == 0 || len > MAX_CID_SIZE {
                    return Err(UnexpectedEnd);
                }
                let mut cid = [0; MAX_CID_SIZE];
                self.bytes.get_copy(&mut cid[..len])?;
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.get_copy(&mut reset_token)?;
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    cid: ConnectionId::new(&cid[..len]),
                    reset_token,
                })
            }
            Type::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            Type::PATH_CHALLENGE => {
                let mut data = [0; 8];
                self.bytes.get_copy(&mut data)?;
                Frame::PathChallenge(u64::from_be_bytes(data))
            }
            Type::PATH_RESPONSE => {
                let mut data = [0; 8];
                self.bytes.get_copy(&mut data)?;
                Frame::PathResponse(u64::from_be_bytes(data))
            }
            Type::CONNECTION_CLOSE => {
                let error_code = self.bytes.get_var()?;
                let frame_type = self.bytes.get_var()?;
                let len = self.bytes.get_var()? as usize;
                Frame::ConnectionClose(ConnectionClose {
                    error_code: TransportError(error_code as u16),
                    frame_type: if frame_type == 0 {
                        None
                    } else {
                        Some(Type(frame_type))
                    },
                    reason: self.take(len)?,
                })
            }
            Type::APPLICATION_CLOSE => {
                let error_code = self.bytes.get_var()?;
                let len = self.bytes.get_var()? as usize;
                Frame::ApplicationClose(ApplicationClose {
                    error_code,
                    reason: self.take(len)?,
                })
            }
            Type::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ if ty.is_stream() => {
                let id = StreamId(self.bytes.get_var()?);
                let offset = if ty.0 & 0x04 != 0 {
                    self.bytes.get_var()?
                } else {
                    0
                };
                let len = if ty.0 & 0x02 != 0 {
                    self.bytes.get_var()? as usize
                } else {
                    self.bytes.remaining()
                };
                Frame::Stream(Stream {
                    id,
                    offset,
                    fin: ty.0 & 0x01 != 0,
                    data: self.take(len)?,
                })
            }
            _ => Frame::Invalid(ty),
        })
    }

    fn take(&mut self, len: usize) -> Result<Bytes, UnexpectedEnd> {
        if self.bytes.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let start = self.bytes.position() as usize;
        let data = self.bytes.get_ref().slice(start..start + len);
        self.bytes.advance(len);
        Ok(data)
    }
}

impl Iterator for Iter {
    type Item = Frame;
    fn next(&mut self) -> Option<Frame> {
        if self.malformed || !self.bytes.has_remaining() {
            return None;
        }
        let start = self.bytes.position() as usize;
        match self.try_next() {
            Ok(frame @ Frame::Invalid(_)) => {
                self.malformed = true;
                Some(frame)
            }
            Ok(frame) => Some(frame),
            Err(UnexpectedEnd) => {
                self.malformed = true;
                // Re-read the type for the diagnostic; it parsed once already.
                self.bytes.set_position(start as u64);
                let ty = self.bytes.get_var().unwrap_or(0);
                Some(Frame::Invalid(Type(ty)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(payload: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(payload)).collect()
    }

    #[test]
    fn parse_padding_ping() {
        let parsed = frames(vec![0, 0, 0, 1, 0]);
        assert_eq!(parsed.len(), 3);
        assert!(matches!(parsed[0], Frame::Padding));
        assert!(matches!(parsed[1], Frame::Ping));
        assert!(matches!(parsed[2], Frame::Padding));
    }

    #[test]
    fn ack_round_trip() {
        let mut ranges = RangeSet::new();
        ranges.insert(1..3);
        ranges.insert(5..8);
        ranges.insert(10..11);
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, None, &mut buf);
        let parsed = frames(buf);
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            Frame::Ack(ack) => {
                assert_eq!(ack.largest, 10);
                assert_eq!(ack.delay, 42);
                let mut out = RangeSet::new();
                ack.decode_ranges(&mut out).unwrap();
                assert_eq!(out, ranges);
            }
            x => panic!("unexpected frame {:?}", x.ty()),
        }
    }

    #[test]
    fn ack_underflow_rejected() {
        let mut buf = Vec::new();
        buf.put_var(Type::ACK.0);
        buf.put_var(3); // largest
        buf.put_var(0); // delay
        buf.put_var(0); // range count
        buf.put_var(5); // first range exceeds largest
        let parsed = frames(buf);
        match &parsed[0] {
            Frame::Ack(ack) => {
                let mut out = RangeSet::new();
                assert_eq!(
                    ack.decode_ranges(&mut out),
                    Err(TransportError::FRAME_ENCODING_ERROR)
                );
            }
            x => panic!("unexpected frame {:?}", x.ty()),
        }
    }

    #[test]
    fn stream_variants() {
        let frame = Stream {
            id: StreamId(4),
            offset: 100,
            fin: true,
            data: Bytes::from_static(b"hello"),
        };
        let mut buf = Vec::new();
        frame.encode(true, &mut buf);
        let parsed = frames(buf);
        match &parsed[0] {
            Frame::Stream(x) => {
                assert_eq!(x.id, StreamId(4));
                assert_eq!(x.offset, 100);
                assert!(x.fin);
                assert_eq!(&x.data[..], b"hello");
            }
            x => panic!("unexpected frame {:?}", x.ty()),
        }
    }

    #[test]
    fn new_connection_id_round_trip() {
        let frame = NewConnectionId {
            sequence: 3,
            retire_prior_to: 1,
            cid: ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
            reset_token: [0xaa; RESET_TOKEN_SIZE],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let parsed = frames(buf);
        match &parsed[0] {
            Frame::NewConnectionId(x) => {
                assert_eq!(x.sequence, 3);
                assert_eq!(x.retire_prior_to, 1);
                assert_eq!(&x.cid[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
                assert_eq!(x.reset_token, [0xaa; RESET_TOKEN_SIZE]);
            }
            x => panic!("unexpected frame {:?}", x.ty()),
        }
    }

    #[test]
    fn unknown_type_is_invalid() {
        let mut buf = Vec::new();
        buf.put_var(0x1f);
        let parsed = frames(buf);
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], Frame::Invalid(_)));
    }

    #[test]
    fn truncated_frame_is_invalid() {
        let mut buf = Vec::new();
        buf.put_var(Type::MAX_STREAM_DATA.0);
        buf.put_var(8);
        // missing the offset
        let parsed = frames(buf);
        assert!(matches!(parsed.last(), Some(Frame::Invalid(_))));
    }

    #[test]
    fn level_admissibility() {
        let ping = Frame::Ping;
        let stream = Frame::Stream(Stream {
            id: StreamId(0),
            offset: 0,
            fin: false,
            data: Bytes::new(),
        });
        let close = Frame::ConnectionClose(ConnectionClose {
            error_code: TransportError::NO_ERROR,
            frame_type: None,
            reason: Bytes::new(),
        });
        assert!(ping.is_allowed(EncryptLevel::Initial));
        assert!(!stream.is_allowed(EncryptLevel::Initial));
        assert!(stream.is_allowed(EncryptLevel::ZeroRtt));
        assert!(!close.is_allowed(EncryptLevel::ZeroRtt));
        assert!(stream.is_allowed(EncryptLevel::OneRtt));
        assert!(Frame::HandshakeDone.is_allowed(EncryptLevel::OneRtt));
        assert!(!Frame::HandshakeDone.is_allowed(EncryptLevel::Handshake));
    }
}
