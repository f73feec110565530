//! Little-endian field cursor used by every message handler
//!
//! [`Unpacker`] reads fixed-width fields from a borrowed buffer and keeps a
//! consumed-byte offset, so a handler can check it read exactly the payload
//! length it was given. Reads past the end return
//! [`GatewayError::Truncated`](crate::GatewayError::Truncated) instead of
//! panicking. [`Packer`] is the matching writer used to synthesize replies.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{GatewayError, Result};

/// Cursor over a little-endian payload.
#[derive(Debug, Clone)]
pub struct Unpacker<'a> {
    buf: &'a [u8],
    offset: usize,
    context: &'static str,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_context(buf, "payload")
    }

    /// Create a cursor whose truncation errors name `context`.
    pub fn with_context(buf: &'a [u8], context: &'static str) -> Self {
        Self { buf, offset: 0, context }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        let available = self.remaining();
        if needed > available {
            return Err(GatewayError::Truncated {
                context: self.context.to_string(),
                offset: self.offset,
                needed,
                available,
            });
        }
        let bytes = &self.buf[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(bytes)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a fixed-length byte array.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let b = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    /// Read `len` raw bytes.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Read `count` consecutive records with `read`.
    pub fn repeat<T, F>(&mut self, count: usize, mut read: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(read(self)?);
        }
        Ok(out)
    }

    /// Consume everything left in the buffer.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.offset..];
        self.offset = self.buf.len();
        rest
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Move the cursor, clamped to the buffer length.
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset.min(self.buf.len());
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Up to `n` unconsumed bytes, without advancing the cursor.
    pub fn remainder(&self, n: usize) -> &'a [u8] {
        let end = self.offset + n.min(self.remaining());
        &self.buf[self.offset..end]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True once every byte has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.offset == self.buf.len()
    }
}

/// Little-endian payload writer.
#[derive(Debug, Default)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.buf.put_i16_le(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reads_common_header_layout() {
        // cseq, reserved1, reserved2, device id
        let data = [0xFF, 0x02, 0x04, 0x00, 0xAA, 0xF2, 0x8D, 0x23];
        let mut unpack = Unpacker::new(&data);
        assert_eq!(unpack.u8().unwrap(), 0xFF);
        assert_eq!(unpack.u8().unwrap(), 0x02);
        assert_eq!(unpack.u16().unwrap(), 0x0004);
        assert_eq!(unpack.u32().unwrap(), 0x238D_F2AA);
        assert!(unpack.is_exhausted());
    }

    #[test]
    fn truncated_read_reports_offsets() {
        let data = [0x01, 0x02, 0x03];
        let mut unpack = Unpacker::with_context(&data, "PING");
        unpack.u16().unwrap();
        let err = unpack.u32().unwrap_err();
        match err {
            GatewayError::Truncated { context, offset, needed, available } => {
                assert_eq!(context, "PING");
                assert_eq!(offset, 2);
                assert_eq!(needed, 4);
                assert_eq!(available, 1);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
        // a failed read does not move the cursor
        assert_eq!(unpack.offset(), 2);
    }

    #[test]
    fn remainder_does_not_consume() {
        let data = [1, 2, 3, 4, 5];
        let mut unpack = Unpacker::new(&data);
        unpack.u8().unwrap();
        assert_eq!(unpack.remainder(2), &[2, 3]);
        assert_eq!(unpack.remainder(10), &[2, 3, 4, 5]);
        assert_eq!(unpack.offset(), 1);
        assert_eq!(unpack.rest(), &[2, 3, 4, 5]);
        assert!(unpack.is_exhausted());
    }

    #[test]
    fn repeat_reads_explicit_count() {
        let data = [1, 0, 2, 0, 3, 0];
        let mut unpack = Unpacker::new(&data);
        let values = unpack.repeat(3, |u| u.u16()).unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(unpack.repeat(1, |u| u.u16()).is_err());
    }

    #[test]
    fn packer_writes_little_endian() {
        let mut packer = Packer::new();
        packer.u8(0x01).u16(0x0203).u32(0x0405_0607).i16(-2);
        assert_eq!(packer.finish().as_ref(), &[0x01, 0x03, 0x02, 0x07, 0x06, 0x05, 0x04, 0xFE, 0xFF]);
    }

    proptest! {
        #[test]
        fn arbitrary_reads_never_panic(
            data in prop::collection::vec(any::<u8>(), 0..32),
            ops in prop::collection::vec(0u8..5, 0..16),
        ) {
            let mut unpack = Unpacker::new(&data);
            for op in ops {
                let before = unpack.offset();
                let result = match op {
                    0 => unpack.u8().map(|_| ()),
                    1 => unpack.u16().map(|_| ()),
                    2 => unpack.u32().map(|_| ()),
                    3 => unpack.array::<3>().map(|_| ()),
                    _ => unpack.bytes(5).map(|_| ()),
                };
                if result.is_err() {
                    prop_assert_eq!(unpack.offset(), before);
                }
                prop_assert!(unpack.offset() <= data.len());
            }
        }
    }
}
