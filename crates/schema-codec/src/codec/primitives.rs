//! Primitive encoding/decoding for the wire protocol.
//!
//! All multi-byte integers are little-endian and fixed width. The writer
//! supports two-pass emission: reserve a header, write the body, then
//! patch the header through the [`Slot`] token returned at reservation.

use std::marker::PhantomData;

use crate::error::DecodeError;

// =============================================================================
// DECODING
// =============================================================================

/// Reader for decoding binary data.
///
/// Wraps a byte slice and provides methods for reading primitives
/// with bounds checking and error handling.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the current position in the data.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the remaining bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Returns the number of remaining bytes.
    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true if all data has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Reads a single byte.
    #[inline]
    pub fn read_byte(&mut self, context: &'static str) -> Result<u8, DecodeError> {
        if self.pos >= self.data.len() {
            return Err(DecodeError::UnexpectedEof { context });
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Reads exactly n bytes.
    #[inline]
    pub fn read_bytes(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining_len() {
            return Err(DecodeError::UnexpectedEof { context });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    #[inline]
    fn read_array<const N: usize>(
        &mut self,
        context: &'static str,
    ) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_bytes(N, context)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u16(&mut self, context: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_u32(&mut self, context: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_u64(&mut self, context: &'static str) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_f64(&mut self, context: &'static str) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.read_array(context)?))
    }

    /// Reads a `u32` length prefix followed by that many bytes.
    ///
    /// A length past the end of the data is reported as a boundary overrun.
    pub fn read_sized(&mut self, context: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32(context)? as usize;
        if len > self.remaining_len() {
            return Err(DecodeError::RecordOverrun {
                context,
                len,
                remaining: self.remaining_len(),
            });
        }
        self.read_bytes(len, context)
    }

    /// Splits off a sub-reader over the next `len` bytes.
    pub fn sub_reader(
        &mut self,
        len: usize,
        context: &'static str,
    ) -> Result<Reader<'a>, DecodeError> {
        if len > self.remaining_len() {
            return Err(DecodeError::RecordOverrun {
                context,
                len,
                remaining: self.remaining_len(),
            });
        }
        Ok(Reader::new(self.read_bytes(len, context)?))
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// A reserved, not yet written region of `N` bytes in a [`Writer`].
///
/// Returned by [`Writer::reserve`] and consumed by [`Writer::patch`], so a
/// header can only be filled with exactly as many bytes as were reserved.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reserved slot must be patched"]
pub struct Slot<const N: usize> {
    pos: usize,
    _marker: PhantomData<[u8; N]>,
}

impl<const N: usize> Slot<N> {
    /// Byte position of the slot in its writer.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Rebuilds a slot at a known position.
    ///
    /// Used to keep patch obligations across calls; the caller guarantees
    /// the position was obtained from a reservation of the same width.
    pub(crate) fn at(pos: usize) -> Self {
        Self {
            pos,
            _marker: PhantomData,
        }
    }
}

/// Writer for encoding binary data.
#[derive(Debug, Clone, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Creates a new writer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Creates a new writer with capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Returns the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Returns a reference to the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if no bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drops everything written after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Writes a single byte.
    #[inline]
    pub fn write_byte(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Writes raw bytes.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a `u32` length prefix followed by the bytes.
    pub fn write_sized(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Reserves `N` zero bytes to be patched later.
    pub fn reserve<const N: usize>(&mut self) -> Slot<N> {
        let pos = self.buf.len();
        self.buf.extend_from_slice(&[0u8; N]);
        Slot::at(pos)
    }

    /// Fills a reserved slot.
    pub fn patch<const N: usize>(&mut self, slot: Slot<N>, bytes: [u8; N]) {
        self.buf[slot.pos..slot.pos + N].copy_from_slice(&bytes);
    }

    /// Fills a reserved 4-byte slot with a little-endian `u32`.
    pub fn patch_u32(&mut self, slot: Slot<4>, value: u32) {
        self.patch(slot, value.to_le_bytes());
    }

    /// Reserves a `u32` size header; pair with [`Writer::close_sized`].
    pub fn open_sized(&mut self) -> (Slot<4>, usize) {
        let slot = self.reserve::<4>();
        (slot, self.buf.len())
    }

    /// Patches a size header with the number of bytes written since it.
    pub fn close_sized(&mut self, (slot, start): (Slot<4>, usize)) -> usize {
        let size = self.buf.len() - start;
        self.patch_u32(slot, size as u32);
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_roundtrip() {
        let mut writer = Writer::new();
        writer.write_byte(7);
        writer.write_u16(0xBEEF);
        writer.write_u32(123_456);
        writer.write_u64(u64::MAX - 1);
        writer.write_f64(-2.5);

        let mut reader = Reader::new(writer.as_bytes());
        assert_eq!(reader.read_byte("t").unwrap(), 7);
        assert_eq!(reader.read_u16("t").unwrap(), 0xBEEF);
        assert_eq!(reader.read_u32("t").unwrap(), 123_456);
        assert_eq!(reader.read_u64("t").unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_f64("t").unwrap(), -2.5);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_reserve_and_patch() {
        let mut writer = Writer::new();
        writer.write_byte(0xAA);
        let sized = writer.open_sized();
        writer.write_bytes(b"hello");
        assert_eq!(writer.close_sized(sized), 5);

        let mut reader = Reader::new(writer.as_bytes());
        reader.read_byte("tag").unwrap();
        assert_eq!(reader.read_sized("body").unwrap(), b"hello");
    }

    #[test]
    fn test_patch_fixed_slot() {
        let mut writer = Writer::new();
        let slot = writer.reserve::<2>();
        writer.write_byte(1);
        assert_eq!(slot.position(), 0);
        writer.patch(slot, [9, 8]);
        assert_eq!(writer.as_bytes(), &[9, 8, 1]);
    }

    #[test]
    fn test_sized_overrun() {
        let mut writer = Writer::new();
        writer.write_u32(100);
        writer.write_bytes(&[0u8; 3]);

        let mut reader = Reader::new(writer.as_bytes());
        let result = reader.read_sized("field");
        assert!(matches!(
            result,
            Err(DecodeError::RecordOverrun { len: 100, remaining: 3, .. })
        ));
    }

    #[test]
    fn test_unexpected_eof() {
        let data = [0u8; 3];
        let mut reader = Reader::new(&data);
        assert!(matches!(
            reader.read_u32("test"),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }
}
