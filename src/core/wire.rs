//! # Wire Helpers
//!
//! Bounds-checked big-endian cursors for writing `Packet::marshal` and
//! `Packet::unmarshal_range` implementations.
//!
//! Strings and byte arrays carry a `u16` big-endian length prefix. A read that
//! would cross the end of the readable region fails with
//! [`ProtocolError::BufferUnderflow`]; a write past the end of the buffer fails
//! with [`ProtocolError::BufferOverflow`].
//!
//! ```rust
//! use mesh_protocol::core::wire::{WireReader, WireWriter};
//!
//! let mut buf = [0u8; 32];
//! let mut w = WireWriter::new(&mut buf, 0);
//! w.put_u32(7).unwrap();
//! w.put_str("hi").unwrap();
//! let written = w.written();
//!
//! let mut r = WireReader::new(&buf, 0, written);
//! assert_eq!(r.get_u32().unwrap(), 7);
//! assert_eq!(r.get_string().unwrap(), "hi");
//! assert_eq!(r.consumed(), written);
//! ```

use crate::error::{ProtocolError, Result};

/// Writes big-endian values into a caller-provided buffer
#[derive(Debug)]
pub struct WireWriter<'a> {
    buf: &'a mut [u8],
    start: usize,
    pos: usize,
}

impl<'a> WireWriter<'a> {
    /// Start writing at `offset`
    pub fn new(buf: &'a mut [u8], offset: usize) -> Self {
        Self {
            buf,
            start: offset,
            pos: offset,
        }
    }

    /// Bytes written since construction
    pub fn written(&self) -> usize {
        self.pos - self.start
    }

    /// Absolute position of the next write
    pub fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, needed: usize) -> Result<&mut [u8]> {
        let end = self
            .pos
            .checked_add(needed)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ProtocolError::BufferOverflow {
                offset: self.pos,
                needed,
                capacity: self.buf.len(),
            })?;
        let slot = &mut self.buf[self.pos..end];
        self.pos = end;
        Ok(slot)
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub fn put_bool(&mut self, value: bool) -> Result<()> {
        self.put_u8(u8::from(value))
    }

    pub fn put_u16(&mut self, value: u16) -> Result<()> {
        self.reserve(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn put_i32(&mut self, value: i32) -> Result<()> {
        self.reserve(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<()> {
        self.reserve(8)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn put_i64(&mut self, value: i64) -> Result<()> {
        self.reserve(8)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Raw bytes with no length prefix
    pub fn put_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Length-prefixed byte array
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len =
            u16::try_from(bytes.len()).map_err(|_| ProtocolError::OversizedPacket(bytes.len()))?;
        self.put_u16(len)?;
        self.put_raw(bytes)
    }

    /// Length-prefixed UTF-8 string
    pub fn put_str(&mut self, value: &str) -> Result<()> {
        self.put_bytes(value.as_bytes())
    }
}

/// Reads big-endian values from `buf[offset..end]`
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    start: usize,
    pos: usize,
    end: usize,
}

impl<'a> WireReader<'a> {
    /// Read the region `[offset, end)`. `end` is clamped to the buffer length.
    pub fn new(buf: &'a [u8], offset: usize, end: usize) -> Self {
        let end = end.min(buf.len());
        Self {
            buf,
            start: offset,
            pos: offset,
            end,
        }
    }

    /// Bytes consumed since construction
    pub fn consumed(&self) -> usize {
        self.pos.saturating_sub(self.start)
    }

    /// Bytes left in the readable region
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        if self.remaining() < needed {
            return Err(ProtocolError::BufferUnderflow {
                offset: self.pos,
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Malformed(format!(
                "invalid boolean byte {other:#04x}"
            ))),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.take_array().map(i32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_be_bytes)
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.take_array().map(i64::from_be_bytes)
    }

    /// Raw bytes with no length prefix
    pub fn get_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Length-prefixed byte array
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u16()? as usize;
        self.take(len)
    }

    /// Length-prefixed UTF-8 string
    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8 string: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut buf = [0u8; 8];
        let mut w = WireWriter::new(&mut buf, 1);
        w.put_u16(0x0102).unwrap();
        w.put_u32(0x0304_0506).unwrap();
        assert_eq!(w.written(), 6);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 0]);
    }

    #[test]
    fn test_write_overflow() {
        let mut buf = [0u8; 3];
        let mut w = WireWriter::new(&mut buf, 0);
        w.put_u16(1).unwrap();
        let err = w.put_u16(2).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferOverflow {
                offset: 2,
                needed: 2,
                capacity: 3
            }
        ));
    }

    #[test]
    fn test_read_respects_end_bound() {
        let buf = [0u8, 0, 0, 9, 0xff, 0xff];
        let mut r = WireReader::new(&buf, 0, 4);
        assert_eq!(r.get_u32().unwrap(), 9);
        assert!(matches!(
            r.get_u8(),
            Err(ProtocolError::BufferUnderflow { available: 0, .. })
        ));
    }

    #[test]
    fn test_string_length_past_end() {
        // Declares 10 bytes of string but only 2 follow
        let buf = [0u8, 10, b'h', b'i'];
        let mut r = WireReader::new(&buf, 0, buf.len());
        assert!(matches!(
            r.get_string(),
            Err(ProtocolError::BufferUnderflow { needed: 10, .. })
        ));
    }

    #[test]
    fn test_invalid_bool_and_utf8() {
        let mut r = WireReader::new(&[2u8], 0, 1);
        assert!(matches!(r.get_bool(), Err(ProtocolError::Malformed(_))));

        let buf = [0u8, 2, 0xc3, 0x28];
        let mut r = WireReader::new(&buf, 0, buf.len());
        assert!(matches!(r.get_string(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_mixed_roundtrip_with_offset() {
        let mut buf = [0u8; 64];
        let mut w = WireWriter::new(&mut buf, 5);
        w.put_i64(-42).unwrap();
        w.put_bool(true).unwrap();
        w.put_bytes(&[1, 2, 3]).unwrap();
        w.put_str("mesh").unwrap();
        let written = w.written();

        let mut r = WireReader::new(&buf, 5, 5 + written);
        assert_eq!(r.get_i64().unwrap(), -42);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_bytes().unwrap(), &[1, 2, 3]);
        assert_eq!(r.get_string().unwrap(), "mesh");
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.consumed(), written);
    }
}
