use thiserror::Error;

/// Result alias for queue operations.
pub type QueueResult<T, E = QueueError> = Result<T, E>;

/// Status returned by producer and consumer calls.
///
/// `WouldBlock` and `TimedOut` are the retryable ones: the caller asked for
/// a slot while the producer already held as many as it may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("buffer queue has been abandoned")]
    Abandoned,
    #[error("buffer queue has no connected producer")]
    NotConnected,
    #[error("buffer queue has no consumer")]
    NoConsumer,
    #[error("bad value: {0}")]
    BadValue(&'static str),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("would block")]
    WouldBlock,
    #[error("timed out")]
    TimedOut,
    #[error("no free buffer")]
    NoMemory,
    /// The released frame is no longer the one held in the slot.
    #[error("stale buffer slot")]
    StaleBufferSlot,
}

impl QueueError {
    pub fn is_retryable(self) -> bool {
        matches!(self, QueueError::WouldBlock | QueueError::TimedOut)
    }

    /// Status code the queue would report over binder.
    pub fn code(self) -> i32 {
        match self {
            QueueError::Abandoned | QueueError::NotConnected | QueueError::NoConsumer => -19,
            QueueError::BadValue(_) => -22,
            QueueError::InvalidOperation(_) => -38,
            QueueError::WouldBlock => -11,
            QueueError::TimedOut => -110,
            QueueError::NoMemory => -12,
            QueueError::StaleBufferSlot => 1,
        }
    }
}
