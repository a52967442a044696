//! Flat payload container carried by transactions and replies.

use std::fmt;

use smallvec::SmallVec;

use crate::error::{WireError, WireResult};

type ReleaseFn = Box<dyn FnOnce(u64) + Send>;

/// Peer buffer backing an inbound parcel, returned exactly once.
struct PeerBuffer {
    id: u64,
    release: ReleaseFn,
}

/// Typed read/write view over a transaction payload.
///
/// Values are little-endian and every item is padded to four bytes. A parcel
/// built from an inbound record keeps the peer buffer id and hands it back
/// through its release hook when dropped or cleared.
#[derive(Default)]
pub struct Parcel {
    data: Vec<u8>,
    objects: SmallVec<[u64; 4]>,
    pos: usize,
    error: i32,
    owner: Option<PeerBuffer>,
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps bytes received from the peer; `release` runs once with `buffer_id`.
    pub fn from_peer<F>(data: Vec<u8>, objects: Vec<u64>, buffer_id: u64, release: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        Self {
            data,
            objects: SmallVec::from_vec(objects),
            pos: 0,
            error: 0,
            owner: Some(PeerBuffer {
                id: buffer_id,
                release: Box::new(release),
            }),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let mut parcel = Self::default();
        parcel.data = data.to_vec();
        parcel
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn objects(&self) -> &[u64] {
        &self.objects
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    #[inline]
    pub fn data_avail(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Peer buffer still owned by this parcel, if any.
    pub fn buffer_id(&self) -> Option<u64> {
        self.owner.as_ref().map(|owner| owner.id)
    }

    /// Marks the parcel as carrying a status instead of data.
    pub fn set_error(&mut self, status: i32) {
        self.error = status;
    }

    /// Status set with [`Self::set_error`]; zero when the parcel carries data.
    #[inline]
    pub fn error(&self) -> i32 {
        self.error
    }

    /// Returns any peer buffer and empties the parcel.
    pub fn clear(&mut self) {
        self.release_owner();
        self.data.clear();
        self.objects.clear();
        self.pos = 0;
        self.error = 0;
    }

    /// Replaces the contents with an inbound record, releasing the previous buffer first.
    pub fn adopt<F>(&mut self, data: Vec<u8>, objects: Vec<u64>, buffer_id: u64, release: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.clear();
        *self = Self::from_peer(data, objects, buffer_id, release);
    }

    /// Copies out the payload and object offsets for an outbound record.
    pub fn to_wire(&self) -> (Vec<u8>, Vec<u64>) {
        (self.data.clone(), self.objects.to_vec())
    }

    fn release_owner(&mut self) {
        if let Some(owner) = self.owner.take() {
            (owner.release)(owner.id);
        }
    }

    fn pad(&mut self) {
        let rem = self.data.len() % 4;
        if rem != 0 {
            self.data.resize(self.data.len() + 4 - rem, 0);
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> WireResult<()> {
        self.data
            .try_reserve(bytes.len() + 3)
            .map_err(|_| WireError::AllocationFailed {
                requested: bytes.len(),
            })?;
        self.data.extend_from_slice(bytes);
        self.pad();
        self.pos = self.data.len();
        Ok(())
    }

    fn read_raw(&mut self, len: usize) -> WireResult<&[u8]> {
        let padded = (len + 3) & !3;
        let available = self.data_avail();
        if padded > available {
            return Err(WireError::Truncated {
                needed: padded,
                available,
            });
        }
        let start = self.pos;
        self.pos += padded;
        Ok(&self.data[start..start + len])
    }

    pub fn write_i32(&mut self, value: i32) -> WireResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> WireResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> WireResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> WireResult<()> {
        self.write_raw(&value.to_le_bytes())
    }

    pub fn write_bool(&mut self, value: bool) -> WireResult<()> {
        self.write_i32(value as i32)
    }

    pub fn write_byte_array(&mut self, bytes: &[u8]) -> WireResult<()> {
        let len = i32::try_from(bytes.len()).map_err(|_| WireError::Malformed("byte array too long"))?;
        self.write_i32(len)?;
        self.write_raw(bytes)
    }

    pub fn write_string(&mut self, value: &str) -> WireResult<()> {
        self.write_byte_array(value.as_bytes())
    }

    /// Writes a flattened object reference and records its offset.
    pub fn write_object(&mut self, value: u64) -> WireResult<()> {
        let offset = self.data.len() as u64;
        self.write_u64(value)?;
        self.objects.push(offset);
        Ok(())
    }

    pub fn read_i32(&mut self) -> WireResult<i32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_raw(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    pub fn read_u32(&mut self) -> WireResult<u32> {
        Ok(self.read_i32()? as u32)
    }

    pub fn read_i64(&mut self) -> WireResult<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_raw(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn read_u64(&mut self) -> WireResult<u64> {
        Ok(self.read_i64()? as u64)
    }

    pub fn read_bool(&mut self) -> WireResult<bool> {
        Ok(self.read_i32()? != 0)
    }

    pub fn read_byte_array(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_i32()?;
        let len = usize::try_from(len).map_err(|_| WireError::Malformed("negative array length"))?;
        Ok(self.read_raw(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> WireResult<String> {
        String::from_utf8(self.read_byte_array()?).map_err(|_| WireError::Malformed("string is not utf-8"))
    }

    pub fn read_object(&mut self) -> WireResult<u64> {
        if !self.objects.contains(&(self.pos as u64)) {
            return Err(WireError::Malformed("no object at read position"));
        }
        self.read_u64()
    }
}

impl Drop for Parcel {
    fn drop(&mut self) {
        self.release_owner();
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("data_size", &self.data.len())
            .field("objects", &self.objects.len())
            .field("pos", &self.pos)
            .field("error", &self.error)
            .field("buffer_id", &self.buffer_id())
            .finish()
    }
}
