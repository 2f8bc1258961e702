//! Serialization buffer
//!
//! Growable byte container used to encode and decode every persisted
//! record. Writers append with the `put_*` family; readers either grab at
//! an explicit offset or walk the buffer with a [`BufferReader`]. All
//! integers are little endian.

use bytes::{BufMut, BytesMut};
use nslog_common::checksum::compute_crc32c;
use nslog_common::{Error, Result};

/// Growable byte buffer with positional accessors
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with reserved capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Create a buffer holding a copy of `data`
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
        }
    }

    /// Number of bytes held
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop all content, keeping the allocation
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Resize to `len` bytes, zero-filling new space
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Raw content
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw content
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Append raw bytes
    pub fn put_data(&mut self, data: &[u8]) {
        self.data.put_slice(data);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.data.put_u16_le(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.data.put_u64_le(value);
    }

    /// Append a string as `u16` length (including a NUL terminator), the
    /// bytes and the terminator
    pub fn put_string(&mut self, value: &str) -> Result<()> {
        let len = value.len() + 1;
        let encoded = u16::try_from(len).map_err(|_| Error::SizeExceeded {
            needed: len,
            available: usize::from(u16::MAX),
        })?;
        self.put_u16(encoded);
        self.put_data(value.as_bytes());
        self.put_u8(0);
        Ok(())
    }

    /// Borrow `len` bytes starting at `offset`
    pub fn grab_data(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::SizeExceeded {
            needed: usize::MAX,
            available: self.len(),
        })?;
        if end > self.len() {
            return Err(Error::SizeExceeded {
                needed: end,
                available: self.len(),
            });
        }
        Ok(&self.data[offset..end])
    }

    pub fn grab_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.grab_data(offset, 1)?[0])
    }

    pub fn grab_u16(&self, offset: usize) -> Result<u16> {
        let bytes = self.grab_data(offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn grab_u32(&self, offset: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.grab_data(offset, 4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn grab_u64(&self, offset: usize) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.grab_data(offset, 8)?);
        Ok(u64::from_le_bytes(raw))
    }

    /// CRC32C of the whole buffer
    #[must_use]
    pub fn crc32(&self) -> u32 {
        compute_crc32c(&self.data)
    }

    /// CRC32C of a sub-range
    pub fn crc32_range(&self, offset: usize, len: usize) -> Result<u32> {
        Ok(compute_crc32c(self.grab_data(offset, len)?))
    }

    /// Sequential reader starting at offset 0
    #[must_use]
    pub fn reader(&self) -> BufferReader<'_> {
        BufferReader { buf: self, pos: 0 }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&data[..]),
        }
    }
}

/// Cursor over a [`Buffer`]
pub struct BufferReader<'a> {
    buf: &'a Buffer,
    pos: usize,
}

impl BufferReader<'_> {
    /// Current position
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn u8(&mut self) -> Result<u8> {
        let value = self.buf.grab_u8(self.pos)?;
        self.pos += 1;
        Ok(value)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let value = self.buf.grab_u16(self.pos)?;
        self.pos += 2;
        Ok(value)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let value = self.buf.grab_u32(self.pos)?;
        self.pos += 4;
        Ok(value)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let value = self.buf.grab_u64(self.pos)?;
        self.pos += 8;
        Ok(value)
    }

    /// Read `len` raw bytes
    pub fn bytes(&mut self, len: usize) -> Result<&[u8]> {
        let start = self.pos;
        let data = self.buf.grab_data(start, len)?;
        self.pos += len;
        Ok(data)
    }

    /// Read a string written by [`Buffer::put_string`]
    pub fn string(&mut self) -> Result<String> {
        let start = self.pos;
        let len = usize::from(self.u16()?);
        if len == 0 {
            return Err(Error::corruption(
                start as u64,
                "zero-length string field",
            ));
        }
        let raw = self.bytes(len)?;
        let text = &raw[..len - 1];
        std::str::from_utf8(text)
            .map(str::to_owned)
            .map_err(|_| Error::corruption(start as u64, "string field is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_grab() {
        let mut buf = Buffer::new();
        buf.put_u8(7);
        buf.put_u16(0xBEEF);
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u64(u64::MAX - 1);

        assert_eq!(buf.len(), 15);
        assert_eq!(buf.grab_u8(0).unwrap(), 7);
        assert_eq!(buf.grab_u16(1).unwrap(), 0xBEEF);
        assert_eq!(buf.grab_u32(3).unwrap(), 0xDEAD_BEEF);
        assert_eq!(buf.grab_u64(7).unwrap(), u64::MAX - 1);
    }

    #[test]
    fn test_grab_past_end() {
        let buf = Buffer::from_slice(&[1, 2, 3]);
        let err = buf.grab_u32(0).unwrap_err();
        assert!(matches!(
            err,
            Error::SizeExceeded {
                needed: 4,
                available: 3
            }
        ));
        assert!(buf.grab_data(usize::MAX, 2).is_err());
        assert_eq!(buf.grab_data(1, 2).unwrap(), &[2, 3]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = Buffer::new();
        buf.put_string("hello").unwrap();
        buf.put_string("").unwrap();

        // 2 bytes length + 5 bytes + terminator, then an empty string
        assert_eq!(buf.len(), 8 + 3);

        let mut reader = buf.reader();
        assert_eq!(reader.string().unwrap(), "hello");
        assert_eq!(reader.string().unwrap(), "");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_string_too_long() {
        let mut buf = Buffer::new();
        let long = "x".repeat(usize::from(u16::MAX));
        assert!(buf.put_string(&long).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reader_truncated_string() {
        let mut buf = Buffer::new();
        buf.put_u16(10);
        buf.put_data(b"abc");

        let err = buf.reader().string().unwrap_err();
        assert!(matches!(err, Error::SizeExceeded { .. }));
    }

    #[test]
    fn test_reader_zero_length_string() {
        let mut buf = Buffer::new();
        buf.put_u16(0);
        assert!(buf.reader().string().unwrap_err().is_corruption());
    }

    #[test]
    fn test_crc32() {
        let buf = Buffer::from_slice(b"123456789");
        // CRC32C check value
        assert_eq!(buf.crc32(), 0xE306_9283);
        assert_eq!(buf.crc32_range(0, 9).unwrap(), buf.crc32());
        assert!(buf.crc32_range(5, 10).is_err());
    }
}
