//! Buffer extension traits for the wire encoding.
//!
//! Everything on the wire is big-endian; integers without a fixed width use
//! the variable-length encoding whose two leading bits select 1, 2, 4 or 8
//! bytes.

use bytes::{Buf, BufMut};

use crate::TransportError;

/// Largest value the variable-length encoding can carry.
pub const MAX_VAR_INT: u64 = (1 << 62) - 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnexpectedEnd;

impl From<UnexpectedEnd> for TransportError {
    fn from(_: UnexpectedEnd) -> Self {
        TransportError::FRAME_ENCODING_ERROR
    }
}

pub trait BufExt {
    fn get_var(&mut self) -> Result<u64, UnexpectedEnd>;
    fn get_u8_checked(&mut self) -> Result<u8, UnexpectedEnd>;
    fn get_u16_checked(&mut self) -> Result<u16, UnexpectedEnd>;
    fn get_u32_checked(&mut self) -> Result<u32, UnexpectedEnd>;
    fn get_copy(&mut self, buf: &mut [u8]) -> Result<(), UnexpectedEnd>;
}

impl<T: Buf> BufExt for T {
    fn get_var(&mut self) -> Result<u64, UnexpectedEnd> {
        if !self.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let first = self.get_u8();
        let len = 1usize << (first >> 6);
        if self.remaining() < len - 1 {
            return Err(UnexpectedEnd);
        }
        let mut x = u64::from(first & 0x3f);
        for _ in 1..len {
            x = (x << 8) | u64::from(self.get_u8());
        }
        Ok(x)
    }

    fn get_u8_checked(&mut self) -> Result<u8, UnexpectedEnd> {
        if !self.has_remaining() {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u8())
    }

    fn get_u16_checked(&mut self) -> Result<u16, UnexpectedEnd> {
        if self.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u16())
    }

    fn get_u32_checked(&mut self) -> Result<u32, UnexpectedEnd> {
        if self.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u32())
    }

    fn get_copy(&mut self, buf: &mut [u8]) -> Result<(), UnexpectedEnd> {
        if self.remaining() < buf.len() {
            return Err(UnexpectedEnd);
        }
        self.copy_to_slice(buf);
        Ok(())
    }
}

pub trait BufMutExt {
    fn put_var(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn put_var(&mut self, x: u64) {
        debug_assert!(x <= MAX_VAR_INT, "var int too large");
        if x < 1 << 6 {
            self.put_u8(x as u8);
        } else if x < 1 << 14 {
            self.put_u16(0x4000 | x as u16);
        } else if x < 1 << 30 {
            self.put_u32(0x8000_0000 | x as u32);
        } else {
            self.put_u64(0xc000_0000_0000_0000 | x);
        }
    }
}

/// Number of bytes `put_var` will use for `x`.
pub fn var_int_size(x: u64) -> usize {
    if x < 1 << 6 {
        1
    } else if x < 1 << 14 {
        2
    } else if x < 1 << 30 {
        4
    } else {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn var_int_round_trip() {
        for &x in &[
            0u64,
            1,
            63,
            64,
            16_383,
            16_384,
            1_073_741_823,
            1_073_741_824,
            MAX_VAR_INT,
        ] {
            let mut buf = Vec::new();
            buf.put_var(x);
            assert_eq!(buf.len(), var_int_size(x));
            let mut r = Cursor::new(&buf[..]);
            assert_eq!(r.get_var().unwrap(), x);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn var_int_known_encodings() {
        // Examples from the transport draft's appendix.
        let mut buf = Vec::new();
        buf.put_var(151_288_809_941_952_652);
        assert_eq!(buf, [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]);
        let mut buf = Vec::new();
        buf.put_var(494_878_333);
        assert_eq!(buf, [0x9d, 0x7f, 0x3e, 0x7d]);
        let mut buf = Vec::new();
        buf.put_var(15_293);
        assert_eq!(buf, [0x7b, 0xbd]);
    }

    #[test]
    fn truncated_var_int() {
        let mut r = Cursor::new(&[0x9d, 0x7f][..]);
        assert_eq!(r.get_var(), Err(UnexpectedEnd));
    }
}
