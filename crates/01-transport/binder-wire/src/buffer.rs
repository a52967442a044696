//! Byte buffers exchanged with the driver.
//!
//! `CommandWriter` accumulates outbound records; `CommandReader` walks the
//! records the driver handed back, keeping a cursor over partially consumed
//! input.

use crate::error::{WireError, WireResult};

/// Growable outbound command buffer.
#[derive(Debug, Default, Clone)]
pub struct CommandWriter {
    buf: Vec<u8>,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Hands the accumulated bytes out, leaving the writer empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn reserve(&mut self, additional: usize) -> WireResult<()> {
        self.buf
            .try_reserve(additional)
            .map_err(|_| WireError::AllocationFailed {
                requested: additional,
            })
    }

    pub fn put_u32(&mut self, value: u32) -> WireResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_i32(&mut self, value: i32) -> WireResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> WireResult<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> WireResult<()> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn put_zeros(&mut self, count: usize) -> WireResult<()> {
        self.reserve(count)?;
        self.buf.resize(self.buf.len() + count, 0);
        Ok(())
    }
}

/// Inbound command buffer with a read cursor.
#[derive(Debug, Default, Clone)]
pub struct CommandReader {
    buf: Vec<u8>,
    pos: usize,
}

impl CommandReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
            pos: 0,
        }
    }

    /// Replaces the contents and rewinds the cursor.
    pub fn reset(&mut self, bytes: Vec<u8>) {
        self.buf = bytes;
        self.pos = 0;
    }

    /// Mutable access to the backing storage for a driver read.
    pub fn storage_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Marks `len` freshly read bytes as the buffer contents.
    pub fn set_filled(&mut self, len: usize) {
        self.buf.truncate(len);
        self.pos = 0;
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once every byte has been consumed.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Moves the cursor to the end, discarding whatever is left.
    pub fn drain(&mut self) {
        self.pos = self.buf.len();
    }

    pub fn take_bytes(&mut self, len: usize) -> WireResult<&[u8]> {
        let available = self.remaining();
        if len > available {
            return Err(WireError::Truncated {
                needed: len,
                available,
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..self.pos])
    }

    /// Steps over up to `len` bytes.
    pub fn skip(&mut self, len: usize) {
        self.pos = (self.pos + len).min(self.buf.len());
    }

    pub fn get_u32(&mut self) -> WireResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take_bytes(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn get_i32(&mut self) -> WireResult<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> WireResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take_bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_truncation_without_moving() {
        let mut reader = CommandReader::from_bytes(&[1, 2, 3]);
        assert_eq!(
            reader.get_u32(),
            Err(WireError::Truncated {
                needed: 4,
                available: 3
            })
        );
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn writer_and_reader_agree_on_layout() {
        let mut writer = CommandWriter::new();
        writer.put_u32(0xdead_beef).unwrap();
        writer.put_i32(-1).unwrap();
        writer.put_u64(42).unwrap();
        let mut reader = CommandReader::from_bytes(writer.as_bytes());
        assert_eq!(reader.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.get_i32().unwrap(), -1);
        assert_eq!(reader.get_u64().unwrap(), 42);
        assert!(reader.is_drained());
    }

    #[test]
    fn skip_saturates_at_end() {
        let mut reader = CommandReader::from_bytes(&[0; 6]);
        reader.skip(100);
        assert!(reader.is_drained());
    }
}
