//! Transport-parameter encoding and validation.

use bytes::{Buf, BufMut};
use failure::Fail;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::packet::ConnectionId;
use crate::{Side, TransportError, MAX_CID_SIZE, RESET_TOKEN_SIZE};

// Parameter identifiers from the wire draft.
const ORIGINAL_CONNECTION_ID: u16 = 0x0000;
const IDLE_TIMEOUT: u16 = 0x0001;
const STATELESS_RESET_TOKEN: u16 = 0x0002;
const MAX_PACKET_SIZE: u16 = 0x0003;
const INITIAL_MAX_DATA: u16 = 0x0004;
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u16 = 0x0005;
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u16 = 0x0006;
const INITIAL_MAX_STREAM_DATA_UNI: u16 = 0x0007;
const INITIAL_MAX_STREAMS_BIDI: u16 = 0x0008;
const INITIAL_MAX_STREAMS_UNI: u16 = 0x0009;
const ACK_DELAY_EXPONENT: u16 = 0x000a;
const MAX_ACK_DELAY: u16 = 0x000b;
const DISABLE_ACTIVE_MIGRATION: u16 = 0x000c;
const PREFERRED_ADDRESS: u16 = 0x000d;
const ACTIVE_CONNECTION_ID_LIMIT: u16 = 0x000e;

pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
pub const DEFAULT_MAX_ACK_DELAY: u64 = 25;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportParameters {
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Milliseconds; zero disables.
    pub idle_timeout: u64,
    pub max_packet_size: Option<u64>,
    pub ack_delay_exponent: u8,
    /// Milliseconds.
    pub max_ack_delay: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    /// Server only.
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    /// Server only, echoed after a Retry.
    pub original_connection_id: Option<ConnectionId>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_data: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            idle_timeout: 0,
            max_packet_size: None,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            disable_active_migration: false,
            active_connection_id_limit: 2,
            stateless_reset_token: None,
            original_connection_id: None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "transport parameter had illegal value")]
    IllegalValue,
    #[fail(display = "transport parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(_: Error) -> Self {
        TransportError::TRANSPORT_PARAMETER_ERROR
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

impl TransportParameters {
    /// Encode as the sender of `side`.
    pub fn write<W: BufMut>(&self, side: Side, w: &mut W) {
        let mut body = Vec::new();
        if let Some(ref cid) = self.original_connection_id {
            debug_assert_eq!(side, Side::Server);
            put_param(&mut body, ORIGINAL_CONNECTION_ID, |b| {
                b.extend_from_slice(cid)
            });
        }
        if self.idle_timeout != 0 {
            put_param(&mut body, IDLE_TIMEOUT, |b| b.put_var(self.idle_timeout));
        }
        if let Some(token) = self.stateless_reset_token {
            debug_assert_eq!(side, Side::Server);
            put_param(&mut body, STATELESS_RESET_TOKEN, |b| {
                b.extend_from_slice(&token)
            });
        }
        if let Some(size) = self.max_packet_size {
            put_param(&mut body, MAX_PACKET_SIZE, |b| b.put_var(size));
        }
        put_param(&mut body, INITIAL_MAX_DATA, |b| {
            b.put_var(self.initial_max_data)
        });
        put_param(&mut body, INITIAL_MAX_STREAM_DATA_BIDI_LOCAL, |b| {
            b.put_var(self.initial_max_stream_data_bidi_local)
        });
        put_param(&mut body, INITIAL_MAX_STREAM_DATA_BIDI_REMOTE, |b| {
            b.put_var(self.initial_max_stream_data_bidi_remote)
        });
        put_param(&mut body, INITIAL_MAX_STREAM_DATA_UNI, |b| {
            b.put_var(self.initial_max_stream_data_uni)
        });
        if self.initial_max_streams_bidi != 0 {
            put_param(&mut body, INITIAL_MAX_STREAMS_BIDI, |b| {
                b.put_var(self.initial_max_streams_bidi)
            });
        }
        if self.initial_max_streams_uni != 0 {
            put_param(&mut body, INITIAL_MAX_STREAMS_UNI, |b| {
                b.put_var(self.initial_max_streams_uni)
            });
        }
        if self.ack_delay_exponent != DEFAULT_ACK_DELAY_EXPONENT {
            put_param(&mut body, ACK_DELAY_EXPONENT, |b| {
                b.put_var(u64::from(self.ack_delay_exponent))
            });
        }
        if self.max_ack_delay != DEFAULT_MAX_ACK_DELAY {
            put_param(&mut body, MAX_ACK_DELAY, |b| b.put_var(self.max_ack_delay));
        }
        if self.disable_active_migration {
            put_param(&mut body, DISABLE_ACTIVE_MIGRATION, |_| {});
        }
        put_param(&mut body, ACTIVE_CONNECTION_ID_LIMIT, |b| {
            b.put_var(self.active_connection_id_limit)
        });
        w.put_u16(body.len() as u16);
        w.put_slice(&body);
    }

    /// Decode parameters received from the peer acting as `side`.
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        let mut params = TransportParameters::default();
        let body_len = r.get_u16_checked()? as usize;
        if r.remaining() < body_len {
            return Err(Error::Malformed);
        }
        let mut body = vec![0; body_len];
        r.copy_to_slice(&mut body);
        let mut buf = std::io::Cursor::new(&body[..]);

        let mut seen = [false; 16];
        while buf.has_remaining() {
            let id = buf.get_u16_checked()?;
            let len = buf.get_u16_checked()? as usize;
            if buf.remaining() < len {
                return Err(Error::Malformed);
            }
            if (id as usize) < seen.len() {
                if seen[id as usize] {
                    return Err(Error::Malformed);
                }
                seen[id as usize] = true;
            }
            let mut value = std::io::Cursor::new(&buf.chunk()[..len]);
            match id {
                ORIGINAL_CONNECTION_ID => {
                    // Only a server echoes the client's original CID.
                    if side == Side::Client {
                        return Err(Error::IllegalValue);
                    }
                    if len > MAX_CID_SIZE {
                        return Err(Error::Malformed);
                    }
                    params.original_connection_id =
                        Some(ConnectionId::new(&value.chunk()[..len]));
                }
                IDLE_TIMEOUT => params.idle_timeout = value.get_var()?,
                STATELESS_RESET_TOKEN => {
                    if side == Side::Client || len != RESET_TOKEN_SIZE {
                        return Err(Error::IllegalValue);
                    }
                    let mut token = [0; RESET_TOKEN_SIZE];
                    value.get_copy(&mut token)?;
                    params.stateless_reset_token = Some(token);
                }
                MAX_PACKET_SIZE => {
                    let size = value.get_var()?;
                    if size < 1200 {
                        return Err(Error::IllegalValue);
                    }
                    params.max_packet_size = Some(size);
                }
                INITIAL_MAX_DATA => params.initial_max_data = value.get_var()?,
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = value.get_var()?
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = value.get_var()?
                }
                INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = value.get_var()?
                }
                INITIAL_MAX_STREAMS_BIDI => params.initial_max_streams_bidi = value.get_var()?,
                INITIAL_MAX_STREAMS_UNI => params.initial_max_streams_uni = value.get_var()?,
                ACK_DELAY_EXPONENT => {
                    let exp = value.get_var()?;
                    if exp > 20 {
                        return Err(Error::IllegalValue);
                    }
                    params.ack_delay_exponent = exp as u8;
                }
                MAX_ACK_DELAY => {
                    let delay = value.get_var()?;
                    if delay >= 1 << 14 {
                        return Err(Error::IllegalValue);
                    }
                    params.max_ack_delay = delay;
                }
                DISABLE_ACTIVE_MIGRATION => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                PREFERRED_ADDRESS => {
                    // Recognized but unused; preferred addresses are not
                    // adopted.
                    if side == Side::Client {
                        return Err(Error::IllegalValue);
                    }
                }
                ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = value.get_var()?
                }
                // Unknown parameters must be ignored.
                _ => {}
            }
            buf.advance(len);
        }
        Ok(params)
    }
}

fn put_param(buf: &mut Vec<u8>, id: u16, f: impl FnOnce(&mut Vec<u8>)) {
    buf.put_u16(id);
    let len_at = buf.len();
    buf.put_u16(0);
    f(buf);
    let len = (buf.len() - len_at - 2) as u16;
    buf[len_at..len_at + 2].copy_from_slice(&len.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_server_params() {
        let params = TransportParameters {
            initial_max_data: 42,
            initial_max_stream_data_bidi_local: 100,
            initial_max_stream_data_bidi_remote: 200,
            initial_max_stream_data_uni: 300,
            initial_max_streams_bidi: 8,
            initial_max_streams_uni: 3,
            idle_timeout: 30_000,
            max_packet_size: Some(1452),
            ack_delay_exponent: 2,
            max_ack_delay: 50,
            disable_active_migration: true,
            active_connection_id_limit: 4,
            stateless_reset_token: Some([0xcd; RESET_TOKEN_SIZE]),
            original_connection_id: Some(ConnectionId::new(&[9, 9, 9, 9])),
        };
        let mut buf = Vec::new();
        params.write(Side::Server, &mut buf);
        let read = TransportParameters::read(Side::Server, &mut std::io::Cursor::new(&buf[..]))
            .unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn client_must_not_send_server_params() {
        let mut buf = Vec::new();
        let params = TransportParameters {
            stateless_reset_token: Some([1; RESET_TOKEN_SIZE]),
            ..TransportParameters::default()
        };
        // Encode by hand what a misbehaving client would send.
        let mut body = Vec::new();
        body.put_u16(STATELESS_RESET_TOKEN);
        body.put_u16(RESET_TOKEN_SIZE as u16);
        body.extend_from_slice(&params.stateless_reset_token.unwrap());
        buf.put_u16(body.len() as u16);
        buf.extend_from_slice(&body);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut std::io::Cursor::new(&buf[..])),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let mut body = Vec::new();
        for _ in 0..2 {
            body.put_u16(INITIAL_MAX_DATA);
            body.put_u16(1);
            body.put_var(7);
        }
        let mut buf = Vec::new();
        buf.put_u16(body.len() as u16);
        buf.extend_from_slice(&body);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut std::io::Cursor::new(&buf[..])),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn unknown_parameter_ignored() {
        let mut body = Vec::new();
        body.put_u16(0x7fee);
        body.put_u16(3);
        body.extend_from_slice(&[1, 2, 3]);
        let mut buf = Vec::new();
        buf.put_u16(body.len() as u16);
        buf.extend_from_slice(&body);
        let params =
            TransportParameters::read(Side::Server, &mut std::io::Cursor::new(&buf[..])).unwrap();
        assert_eq!(params, TransportParameters::default());
    }
}
