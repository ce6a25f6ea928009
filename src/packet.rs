//! Packet headers and the partial-decode pipeline.
//!
//! Incoming datagrams are parsed in two stages: `PartialDecode` validates the
//! header invariants and finds the coalesced-packet boundary without touching
//! any keys, then `finish` applies a header-protection mask, recovers the
//! packet number and yields the protected payload for AEAD removal.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use failure::Fail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::coding::{BufExt, BufMutExt};
use crate::{MAX_CID_SIZE, VERSION};

/// Encryption level a packet is protected under, in handshake order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum EncryptLevel {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

impl EncryptLevel {
    pub const COUNT: usize = 4;

    pub fn iter() -> impl Iterator<Item = EncryptLevel> {
        [
            EncryptLevel::Initial,
            EncryptLevel::ZeroRtt,
            EncryptLevel::Handshake,
            EncryptLevel::OneRtt,
        ]
        .iter()
        .cloned()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        ConnectionId {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        ConnectionId {
            len: len as u8,
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// Truncated packet number, sized against the largest acknowledged.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 24 {
            PacketNumber::U24(n as u32)
        } else {
            PacketNumber::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        match self {
            PacketNumber::U8(_) => 1,
            PacketNumber::U16(_) => 2,
            PacketNumber::U24(_) => 3,
            PacketNumber::U32(_) => 4,
        }
    }

    pub fn encode<W: BufMut>(self, w: &mut W) {
        match self {
            PacketNumber::U8(x) => w.put_u8(x),
            PacketNumber::U16(x) => w.put_u16(x),
            PacketNumber::U24(x) => {
                w.put_u8((x >> 16) as u8);
                w.put_u16(x as u16);
            }
            PacketNumber::U32(x) => w.put_u32(x),
        }
    }

    pub fn decode(len: usize, bytes: &[u8]) -> Self {
        let raw = BigEndian::read_uint(bytes, len);
        match len {
            1 => PacketNumber::U8(raw as u8),
            2 => PacketNumber::U16(raw as u16),
            3 => PacketNumber::U24(raw as u32),
            4 => PacketNumber::U32(raw as u32),
            _ => unreachable!("packet number length out of range"),
        }
    }

    fn truncated(self) -> u64 {
        match self {
            PacketNumber::U8(x) => u64::from(x),
            PacketNumber::U16(x) => u64::from(x),
            PacketNumber::U24(x) => u64::from(x),
            PacketNumber::U32(x) => u64::from(x),
        }
    }

    /// Recover the full packet number given the next expected one.
    pub fn expand(self, expected: u64) -> u64 {
        let truncated = self.truncated();
        let nbits = self.len() as u64 * 8;
        let win = 1u64 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        let candidate = (expected & !mask) | truncated;
        if candidate.wrapping_add(hwin) <= expected && candidate < (1 << 62) - win {
            candidate + win
        } else if candidate > expected.wrapping_add(hwin) && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => LongType::Initial,
            1 => LongType::ZeroRtt,
            2 => LongType::Handshake,
            3 => LongType::Retry,
            _ => unreachable!(),
        }
    }

    fn bits(self) -> u8 {
        match self {
            LongType::Initial => 0,
            LongType::ZeroRtt => 1,
            LongType::Handshake => 2,
            LongType::Retry => 3,
        }
    }

    pub fn level(self) -> EncryptLevel {
        match self {
            LongType::Initial => EncryptLevel::Initial,
            LongType::ZeroRtt => EncryptLevel::ZeroRtt,
            LongType::Handshake => EncryptLevel::Handshake,
            // Retry carries no protected payload; Initial keys govern it.
            LongType::Retry => EncryptLevel::Initial,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        orig_dst_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    pub fn level(&self) -> EncryptLevel {
        match *self {
            Header::Initial { .. } => EncryptLevel::Initial,
            Header::Long { ty, .. } => ty.level(),
            Header::Retry { .. } => EncryptLevel::Initial,
            Header::Short { .. } => EncryptLevel::OneRtt,
            Header::VersionNegotiate { .. } => EncryptLevel::Initial,
        }
    }

    pub fn number(&self) -> Option<PacketNumber> {
        match *self {
            Header::Initial { number, .. }
            | Header::Long { number, .. }
            | Header::Short { number, .. } => Some(number),
            _ => None,
        }
    }

    pub fn is_1rtt(&self) -> bool {
        matches!(*self, Header::Short { .. })
    }

    /// Serialize up to (not including) the packet number; the caller encodes
    /// the number, seals the payload, and applies header protection.
    pub fn encode<W: BufMut>(&self, w: &mut W) {
        match *self {
            Header::Initial {
                ref src_cid,
                ref dst_cid,
                ref token,
                number,
            } => {
                w.put_u8(0xc0 | (number.len() as u8 - 1));
                w.put_u32(VERSION);
                w.put_u8(dst_cid.len() as u8);
                w.put_slice(dst_cid);
                w.put_u8(src_cid.len() as u8);
                w.put_slice(src_cid);
                w.put_var(token.len() as u64);
                w.put_slice(token);
            }
            Header::Long {
                ty,
                ref src_cid,
                ref dst_cid,
                number,
            } => {
                w.put_u8(0xc0 | (ty.bits() << 4) | (number.len() as u8 - 1));
                w.put_u32(VERSION);
                w.put_u8(dst_cid.len() as u8);
                w.put_slice(dst_cid);
                w.put_u8(src_cid.len() as u8);
                w.put_slice(src_cid);
            }
            Header::Retry {
                ref src_cid,
                ref dst_cid,
                ref orig_dst_cid,
                ref token,
            } => {
                w.put_u8(0xc0 | (LongType::Retry.bits() << 4));
                w.put_u32(VERSION);
                w.put_u8(dst_cid.len() as u8);
                w.put_slice(dst_cid);
                w.put_u8(src_cid.len() as u8);
                w.put_slice(src_cid);
                w.put_u8(orig_dst_cid.len() as u8);
                w.put_slice(orig_dst_cid);
                w.put_slice(token);
            }
            Header::Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                w.put_u8(0x40 | if key_phase { 0x04 } else { 0 } | (number.len() as u8 - 1));
                w.put_slice(dst_cid);
            }
            Header::VersionNegotiate {
                random,
                ref src_cid,
                ref dst_cid,
            } => {
                w.put_u8(0x80 | random);
                w.put_u32(0);
                w.put_u8(dst_cid.len() as u8);
                w.put_slice(dst_cid);
                w.put_u8(src_cid.len() as u8);
                w.put_slice(src_cid);
            }
        }
    }
}

/// Mask the first byte and packet-number bytes of an encoded packet.
pub fn apply_header_protection(buf: &mut [u8], pn_offset: usize, mask: &[u8; 5]) {
    let pn_len = (buf[0] & 0x03) as usize + 1;
    if buf[0] & 0x80 != 0 {
        buf[0] ^= mask[0] & 0x0f;
    } else {
        buf[0] ^= mask[0] & 0x1f;
    }
    for i in 0..pn_len {
        buf[pn_offset + i] ^= mask[1 + i];
    }
}

/// Patch the length field of a long-header packet. The field is always
/// encoded in two bytes so it can be reserved before the payload is built.
pub fn set_payload_length(buf: &mut [u8], header_len: usize, pn_len: usize, tag_len: usize) {
    let len = buf.len() - header_len + pn_len + tag_len;
    debug_assert!(len < 1 << 14);
    BigEndian::write_u16(
        &mut buf[header_len - pn_len - 2..],
        len as u16 | 0x4000,
    );
}

#[derive(Debug, Fail, Eq, PartialEq)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version")]
    UnsupportedVersion {
        source: ConnectionId,
        destination: ConnectionId,
    },
    #[fail(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
}

impl From<crate::coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: crate::coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

/// A packet with its invariant header parsed and its boundary within the
/// datagram established, but header protection still in place.
pub struct PartialDecode {
    first: u8,
    version: u32,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    token: Bytes,
    orig_dst_cid: ConnectionId,
    long_ty: Option<LongType>,
    /// Offset of the (protected) packet number within `bytes`.
    pn_offset: usize,
    /// This packet's bytes exactly, header included.
    bytes: BytesMut,
}

impl PartialDecode {
    /// Parse the invariant header. On success returns the decode state and
    /// any trailing coalesced bytes remaining in the datagram.
    pub fn new(
        mut bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = std::io::Cursor::new(&bytes[..]);
        let first = buf.get_u8_checked()?;
        if first & 0x80 != 0 {
            // Long header.
            let version = buf.get_u32_checked()?;
            let dst_cid = Self::get_cid(&mut buf)?;
            let src_cid = Self::get_cid(&mut buf)?;
            if version == 0 {
                // Version negotiation consumes the rest of the datagram.
                let pn_offset = buf.position() as usize;
                return Ok((
                    PartialDecode {
                        first,
                        version,
                        dst_cid,
                        src_cid,
                        token: Bytes::new(),
                        orig_dst_cid: ConnectionId::new(&[]),
                        long_ty: None,
                        pn_offset,
                        bytes,
                    },
                    None,
                ));
            }
            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    source: src_cid,
                    destination: dst_cid,
                });
            }
            if first & 0x40 == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            let ty = LongType::from_bits(first >> 4);
            match ty {
                LongType::Retry => {
                    let odcil = buf.get_u8_checked()? as usize;
                    if odcil > MAX_CID_SIZE {
                        return Err(PacketDecodeError::InvalidHeader(
                            "excessive original CID length",
                        ));
                    }
                    let mut odcid = [0; MAX_CID_SIZE];
                    buf.get_copy(&mut odcid[..odcil])?;
                    let token_start = buf.position() as usize;
                    let token = Bytes::copy_from_slice(&bytes[token_start..]);
                    let pn_offset = bytes.len();
                    return Ok((
                        PartialDecode {
                            first,
                            version,
                            dst_cid,
                            src_cid,
                            token,
                            orig_dst_cid: ConnectionId::new(&odcid[..odcil]),
                            long_ty: Some(LongType::Retry),
                            pn_offset,
                            bytes,
                        },
                        None,
                    ));
                }
                LongType::Initial => {
                    let token_len = buf.get_var()? as usize;
                    if token_len > buf.remaining() {
                        return Err(PacketDecodeError::InvalidHeader("malformed token"));
                    }
                    let token_start = buf.position() as usize;
                    let token =
                        Bytes::copy_from_slice(&bytes[token_start..token_start + token_len]);
                    buf.advance(token_len);
                    let len = buf.get_var()? as usize;
                    let pn_offset = buf.position() as usize;
                    if len < 4 || bytes.len() < pn_offset + len {
                        return Err(PacketDecodeError::InvalidHeader("malformed packet length"));
                    }
                    let rest = Self::split_off(&mut bytes, pn_offset + len);
                    return Ok((
                        PartialDecode {
                            first,
                            version,
                            dst_cid,
                            src_cid,
                            token,
                            orig_dst_cid: ConnectionId::new(&[]),
                            long_ty: Some(LongType::Initial),
                            pn_offset,
                            bytes,
                        },
                        rest,
                    ));
                }
                ty => {
                    let len = buf.get_var()? as usize;
                    let pn_offset = buf.position() as usize;
                    if len < 4 || bytes.len() < pn_offset + len {
                        return Err(PacketDecodeError::InvalidHeader("malformed packet length"));
                    }
                    let rest = Self::split_off(&mut bytes, pn_offset + len);
                    return Ok((
                        PartialDecode {
                            first,
                            version,
                            dst_cid,
                            src_cid,
                            token: Bytes::new(),
                            orig_dst_cid: ConnectionId::new(&[]),
                            long_ty: Some(ty),
                            pn_offset,
                            bytes,
                        },
                        rest,
                    ));
                }
            }
        }
        // Short header.
        if first & 0x40 == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        if bytes.len() < 1 + local_cid_len {
            return Err(PacketDecodeError::InvalidHeader("destination CID truncated"));
        }
        let dst_cid = ConnectionId::new(&bytes[1..1 + local_cid_len]);
        let pn_offset = 1 + local_cid_len;
        Ok((
            PartialDecode {
                first,
                version: VERSION,
                dst_cid,
                src_cid: ConnectionId::new(&[]),
                token: Bytes::new(),
                orig_dst_cid: ConnectionId::new(&[]),
                long_ty: None,
                pn_offset,
                bytes,
            },
            None,
        ))
    }

    fn get_cid(buf: &mut std::io::Cursor<&[u8]>) -> Result<ConnectionId, PacketDecodeError> {
        let len = buf.get_u8_checked()? as usize;
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader("excessive CID length"));
        }
        let mut cid = [0; MAX_CID_SIZE];
        buf.get_copy(&mut cid[..len])?;
        Ok(ConnectionId::new(&cid[..len]))
    }

    fn split_off(bytes: &mut BytesMut, at: usize) -> Option<BytesMut> {
        if at < bytes.len() {
            Some(bytes.split_off(at))
        } else {
            None
        }
    }

    pub fn has_long_header(&self) -> bool {
        self.first & 0x80 != 0
    }

    pub fn is_initial(&self) -> bool {
        self.long_ty == Some(LongType::Initial)
    }

    pub fn is_retry(&self) -> bool {
        self.long_ty == Some(LongType::Retry)
    }

    pub fn is_version_negotiate(&self) -> bool {
        self.has_long_header() && self.version == 0
    }

    pub fn level(&self) -> EncryptLevel {
        match self.long_ty {
            Some(ty) => ty.level(),
            None if self.has_long_header() => EncryptLevel::Initial,
            None => EncryptLevel::OneRtt,
        }
    }

    pub fn dst_cid(&self) -> ConnectionId {
        self.dst_cid
    }

    pub fn src_cid(&self) -> ConnectionId {
        self.src_cid
    }

    pub fn token(&self) -> &Bytes {
        &self.token
    }

    pub fn orig_dst_cid(&self) -> ConnectionId {
        self.orig_dst_cid
    }

    /// Full bytes of this packet, for paths that bypass decryption
    /// (Retry, version negotiation, stateless-reset inspection).
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes following the invariant header. For version-negotiation
    /// packets this is the supported-version list.
    pub fn payload_after_header(&self) -> &[u8] {
        &self.bytes[self.pn_offset..]
    }

    /// Header-protection sample: 16 bytes at 4 past the packet number start.
    pub fn sample(&self) -> Result<[u8; 16], PacketDecodeError> {
        let start = self.pn_offset + 4;
        if self.bytes.len() < start + 16 {
            return Err(PacketDecodeError::InvalidHeader("too short to sample"));
        }
        let mut sample = [0; 16];
        sample.copy_from_slice(&self.bytes[start..start + 16]);
        Ok(sample)
    }

    /// Remove header protection and decode the packet number. `expected` is
    /// the space's next expected receive packet number.
    pub fn finish(
        mut self,
        mask: &[u8; 5],
        expected: u64,
    ) -> Result<(Packet, u64), PacketDecodeError> {
        let long = self.has_long_header();
        self.first ^= mask[0] & if long { 0x0f } else { 0x1f };
        let pn_len = (self.first & 0x03) as usize + 1;
        if self.bytes.len() < self.pn_offset + pn_len {
            return Err(PacketDecodeError::InvalidHeader("packet number truncated"));
        }
        self.bytes[0] = self.first;
        for i in 0..pn_len {
            self.bytes[self.pn_offset + i] ^= mask[1 + i];
        }
        let number = PacketNumber::decode(pn_len, &self.bytes[self.pn_offset..]);
        let full_number = number.expand(expected);

        let header = match self.long_ty {
            Some(LongType::Initial) => Header::Initial {
                src_cid: self.src_cid,
                dst_cid: self.dst_cid,
                token: self.token.clone(),
                number,
            },
            Some(ty) => Header::Long {
                ty,
                src_cid: self.src_cid,
                dst_cid: self.dst_cid,
                number,
            },
            None => Header::Short {
                dst_cid: self.dst_cid,
                number,
                key_phase: self.first & 0x04 != 0,
            },
        };
        let header_len = self.pn_offset + pn_len;
        let payload = self.bytes.split_off(header_len);
        let header_data = self.bytes.freeze();
        Ok((
            Packet {
                header,
                header_data,
                payload,
            },
            full_number,
        ))
    }

    /// Reserved bits that must be zero once header protection is removed.
    pub fn reserved_bits_violated(first: u8) -> bool {
        if first & 0x80 != 0 {
            first & 0x0c != 0
        } else {
            first & 0x18 != 0
        }
    }

    pub fn key_phase_bit(&self) -> bool {
        // Only meaningful after `finish`; exposed for the batched path which
        // unmasks externally.
        self.first & 0x04 != 0
    }
}

pub struct Packet {
    pub header: Header,
    pub header_data: Bytes,
    pub payload: BytesMut,
}
