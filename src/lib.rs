//! Per-connection core of a QUIC transport endpoint.
//!
//! This library performs no I/O of its own. A connection consumes UDP
//! datagrams and API calls as queued *operations*, drains them on a single
//! logical execution context, and emits packets, timer updates and
//! application events for a backend to act on. The UDP datapath, the TLS
//! engine, the worker scheduler and the CID binding tables are external
//! collaborators reached through the contracts in `endpoint` and `crypto`.

use std::fmt;
use std::ops;

pub mod cid;
pub mod coding;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
pub mod operation;
pub mod packet;
pub mod range_set;
pub mod spaces;
pub mod streams;
pub mod timer;
pub mod transport_parameters;

pub use crate::connection::{Connection, ConnectionError};
pub use crate::endpoint::{Config, Context, Event};

/// The single protocol version this endpoint speaks.
pub const VERSION: u32 = 0xff00_0017;

/// Length of the connection IDs we offer to peers. Compile-time constant so
/// the binding can parse short headers without per-connection state.
pub const CONNECTION_ID_LENGTH: usize = 8;

/// Longest connection ID the wire encoding permits.
pub const MAX_CID_SIZE: usize = 20;

/// Smallest datagram a client may send an Initial packet in.
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Conservative datagram budget before the path MTU is known.
pub const MIN_MTU: u16 = 1232;

pub const RESET_TOKEN_SIZE: usize = 16;

/// Shortest datagram that can carry a stateless reset: one masked header
/// byte, four bytes of entropy, and the trailing token.
pub const MIN_STATELESS_RESET_SIZE: usize = 5 + RESET_TOKEN_SIZE;

/// Sentinel expiration for an unarmed timer slot.
pub const TIMER_INFINITE: u64 = u64::max_value();

/// Whether this connection was dialed or accepted.
///
/// A server connection is always the child of a listener; several parameter
/// surface operations are restricted by this.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
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

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Directionality {
    /// Data flows in both directions.
    Bi,
    /// Data flows only from the stream's initiator.
    Uni,
}

/// Identifier for a stream within a connection.
///
/// The low two bits encode the initiator and directionality, so ordinary
/// arithmetic on the index must go through `new`/`index`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let directionality = match self.directionality() {
            Directionality::Uni => "uni",
            Directionality::Bi => "bi",
        };
        write!(
            f,
            "{} {}directional stream {}",
            initiator,
            directionality,
            self.index()
        )
    }
}

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        let mut id = index << 2;
        if initiator == Side::Server {
            id |= 0x1;
        }
        if directionality == Directionality::Uni {
            id |= 0x2;
        }
        StreamId(id)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl From<StreamId> for u64 {
    fn from(x: StreamId) -> u64 {
        x.0
    }
}

/// Transport-level error code carried in CONNECTION_CLOSE frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransportError(pub u16);

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
    pub const PROTOCOL_VIOLATION: Self = TransportError(0xA);
    pub const CRYPTO_BUFFER_EXCEEDED: Self = TransportError(0xD);
    /// Base of the range reserved for TLS alerts.
    pub const CRYPTO_ERROR: Self = TransportError(0x100);

    pub fn crypto(alert: u8) -> Self {
        TransportError(Self::CRYPTO_ERROR.0 | u16::from(alert))
    }
}

impl From<TransportError> for u16 {
    fn from(x: TransportError) -> u16 {
        x.0
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            TransportError::NO_ERROR => "NO_ERROR",
            TransportError::INTERNAL_ERROR => "INTERNAL_ERROR",
            TransportError::SERVER_BUSY => "SERVER_BUSY",
            TransportError::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            TransportError::STREAM_LIMIT_ERROR => "STREAM_LIMIT_ERROR",
            TransportError::STREAM_STATE_ERROR => "STREAM_STATE_ERROR",
            TransportError::FINAL_SIZE_ERROR => "FINAL_SIZE_ERROR",
            TransportError::FRAME_ENCODING_ERROR => "FRAME_ENCODING_ERROR",
            TransportError::TRANSPORT_PARAMETER_ERROR => "TRANSPORT_PARAMETER_ERROR",
            TransportError::PROTOCOL_VIOLATION => "PROTOCOL_VIOLATION",
            TransportError::CRYPTO_BUFFER_EXCEEDED => "CRYPTO_BUFFER_EXCEEDED",
            _ if self.0 >= 0x100 && self.0 < 0x200 => {
                return write!(f, "CRYPTO_ERROR({:02x})", self.0 as u8);
            }
            _ => return write!(f, "TRANSPORT_ERROR({:04x})", self.0),
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_round_trip() {
        for &side in &[Side::Client, Side::Server] {
            for &dir in &[Directionality::Bi, Directionality::Uni] {
                for index in &[0, 1, 17, 1 << 40] {
                    let id = StreamId::new(side, dir, *index);
                    assert_eq!(id.initiator(), side);
                    assert_eq!(id.directionality(), dir);
                    assert_eq!(id.index(), *index);
                }
            }
        }
    }

    #[test]
    fn transport_error_names() {
        assert_eq!(
            format!("{}", TransportError::PROTOCOL_VIOLATION),
            "PROTOCOL_VIOLATION"
        );
        assert_eq!(format!("{}", TransportError::crypto(0x28)), "CRYPTO_ERROR(28)");
    }
}
