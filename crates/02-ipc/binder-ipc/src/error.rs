use thiserror::Error;

use binder_wire::WireError;

use crate::driver::DriverError;

/// Result alias used throughout the engine.
pub type BinderResult<T, E = BinderError> = Result<T, E>;

const UNKNOWN_ERROR: i32 = i32::MIN;
const FAILED_TRANSACTION: i32 = i32::MIN + 2;

/// Binder status taxonomy; every variant has a 32-bit wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum BinderError {
    #[error("dead object")]
    DeadObject,
    #[error("failed transaction")]
    FailedTransaction,
    #[error("timed out")]
    TimedOut,
    #[error("unknown transaction")]
    UnknownTransaction,
    #[error("bad value")]
    BadValue,
    #[error("invalid operation")]
    InvalidOperation,
    #[error("no memory")]
    NoMemory,
    #[error("would block")]
    WouldBlock,
    #[error("permission denied")]
    PermissionDenied,
    #[error("bad descriptor")]
    BadDescriptor,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("not initialised")]
    NoInit,
    /// The calling thread has no usable engine (shut down or already in use).
    #[error("engine unavailable")]
    Unavailable,
    #[error("unknown error")]
    Unknown,
    #[error("status {0}")]
    Status(i32),
}

impl BinderError {
    /// Status code carried on the wire.
    pub fn code(self) -> i32 {
        match self {
            BinderError::DeadObject => -32,
            BinderError::FailedTransaction => FAILED_TRANSACTION,
            BinderError::TimedOut => -110,
            BinderError::UnknownTransaction => -74,
            BinderError::BadValue => -22,
            BinderError::InvalidOperation => -38,
            BinderError::NoMemory => -12,
            BinderError::WouldBlock => -11,
            BinderError::PermissionDenied => -1,
            BinderError::BadDescriptor => -9,
            BinderError::ConnectionRefused => -111,
            BinderError::NoInit => -19,
            BinderError::Unavailable => -108,
            BinderError::Unknown => UNKNOWN_ERROR,
            BinderError::Status(code) => code,
        }
    }

    /// Maps a non-zero wire status back onto the taxonomy.
    pub fn from_code(code: i32) -> Self {
        match code {
            -32 => BinderError::DeadObject,
            FAILED_TRANSACTION => BinderError::FailedTransaction,
            -110 => BinderError::TimedOut,
            -74 => BinderError::UnknownTransaction,
            -22 => BinderError::BadValue,
            -38 => BinderError::InvalidOperation,
            -12 => BinderError::NoMemory,
            -11 => BinderError::WouldBlock,
            -1 => BinderError::PermissionDenied,
            -9 => BinderError::BadDescriptor,
            -111 => BinderError::ConnectionRefused,
            -19 => BinderError::NoInit,
            -108 => BinderError::Unavailable,
            UNKNOWN_ERROR => BinderError::Unknown,
            other => BinderError::Status(other),
        }
    }
}

/// Turns a wire status into a result; zero is success.
pub fn status_to_result(code: i32) -> BinderResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(BinderError::from_code(code))
    }
}

impl From<WireError> for BinderError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::AllocationFailed { .. } => BinderError::NoMemory,
            WireError::UnknownCommand { .. } => BinderError::Unknown,
            WireError::Truncated { .. } | WireError::Malformed(_) => BinderError::FailedTransaction,
        }
    }
}

impl From<DriverError> for BinderError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::BadDescriptor => BinderError::DeadObject,
            DriverError::ConnectionRefused => BinderError::ConnectionRefused,
            DriverError::Interrupted => BinderError::Status(-4),
            DriverError::Errno(errno) => BinderError::from_code(-errno),
        }
    }
}

/// Outcome of a call that reached the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactStatus {
    Completed,
    /// One-way call queued for a frozen receiver.
    PendingFrozen,
}

/// Logs and aborts the whole process on a broken invariant shared with the peer.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort()
    }};
}
pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for err in [
            BinderError::DeadObject,
            BinderError::FailedTransaction,
            BinderError::TimedOut,
            BinderError::UnknownTransaction,
            BinderError::InvalidOperation,
            BinderError::Unavailable,
            BinderError::Unknown,
            BinderError::Status(-1234),
        ] {
            assert_eq!(BinderError::from_code(err.code()), err);
        }
    }

    #[test]
    fn zero_status_is_success() {
        assert_eq!(status_to_result(0), Ok(()));
        assert_eq!(status_to_result(-32), Err(BinderError::DeadObject));
    }

    #[test]
    fn closed_descriptor_reads_as_dead_object() {
        assert_eq!(BinderError::from(DriverError::BadDescriptor), BinderError::DeadObject);
    }
}
