//! The peer seam: one combined write-then-read exchange plus a few controls.

use thiserror::Error;

/// Errors reported by the peer exchange itself, before any record is looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The call was interrupted and should be retried.
    #[error("interrupted")]
    Interrupted,
    /// The descriptor is closed or invalid.
    #[error("bad descriptor")]
    BadDescriptor,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("errno {0}")]
    Errno(i32),
}

/// A single exchange with the peer.
///
/// The peer consumes up to `write.len()` bytes, reporting how many through
/// `write_consumed`, then fills `read` with at most `read_size` bytes when
/// `read_size` is non-zero.
#[derive(Debug)]
pub struct WriteRead<'a> {
    pub write: &'a [u8],
    pub write_consumed: usize,
    pub read: &'a mut Vec<u8>,
    pub read_size: usize,
}

/// Pid and uid the peer knows this process by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: i32,
    pub uid: u32,
}

/// Pending work observed for a frozen process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrozenInfo {
    pub sync_received: u32,
    pub async_received: u32,
}

pub trait Driver: Send + Sync {
    fn write_read(&self, bwr: &mut WriteRead<'_>) -> Result<(), DriverError>;

    /// Releases the peer's bookkeeping for the calling thread.
    fn thread_exit(&self) {}

    fn set_max_threads(&self, max_threads: usize) -> Result<(), DriverError>;

    fn enable_oneway_spam_detection(&self, _enable: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn freeze(&self, pid: i32, enable: bool, timeout_ms: u32) -> Result<(), DriverError>;

    fn frozen_info(&self, pid: i32) -> Result<FrozenInfo, DriverError>;

    fn identity(&self) -> ProcessIdentity;
}
