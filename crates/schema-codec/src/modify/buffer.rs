//! Bounded write buffer.
//!
//! Instructions are appended whole: a write that does not fit fails with
//! [`RangeExceeded`] before any of its bytes land in the buffer.

use crate::codec::primitives::{Slot, Writer};
use crate::error::RangeExceeded;

#[derive(Debug, Clone)]
pub struct WriteBuffer {
    writer: Writer,
    max: usize,
}

impl WriteBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            writer: Writer::new(),
            max,
        }
    }

    /// A buffer without a capacity limit, for edge sub-blocks.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn remaining(&self) -> usize {
        self.max.saturating_sub(self.writer.len())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.writer.as_bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.writer.into_bytes()
    }

    /// Fails if `needed` more bytes do not fit.
    pub fn ensure(&self, needed: usize) -> Result<(), RangeExceeded> {
        if needed > self.remaining() {
            return Err(RangeExceeded {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    /// Appends a complete instruction; returns its start position.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, RangeExceeded> {
        self.ensure(bytes.len())?;
        let start = self.writer.len();
        self.writer.write_bytes(bytes);
        Ok(start)
    }

    /// Drops everything after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.writer.truncate(len);
    }

    /// Overwrites one byte at a known position.
    pub fn patch_byte(&mut self, pos: usize, value: u8) {
        self.writer.patch(Slot::<1>::at(pos), [value]);
    }

    /// Overwrites a `u32` at a known position.
    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        self.writer.patch_u32(Slot::at(pos), value);
    }

    /// Empties the buffer and returns its contents.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.writer).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_is_all_or_nothing() {
        let mut buffer = WriteBuffer::new(8);
        assert_eq!(buffer.append(&[1, 2, 3, 4, 5]).unwrap(), 0);
        let err = buffer.append(&[6, 7, 8, 9]).unwrap_err();
        assert_eq!(
            err,
            RangeExceeded {
                needed: 4,
                available: 3
            }
        );
        assert_eq!(buffer.as_bytes(), &[1, 2, 3, 4, 5]);
        assert_eq!(buffer.append(&[6, 7, 8]).unwrap(), 5);
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_patch_and_take() {
        let mut buffer = WriteBuffer::unbounded();
        buffer.append(&[0, 0, 0, 0, 0]).unwrap();
        buffer.patch_byte(0, 9);
        buffer.patch_u32(1, 0x01020304);
        assert_eq!(buffer.take(), vec![9, 4, 3, 2, 1]);
        assert!(buffer.is_empty());
    }
}
