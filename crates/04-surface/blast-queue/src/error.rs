use thiserror::Error;

use buffer_queue::QueueError;

pub type BlastResult<T, E = BlastError> = Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlastError {
    /// Nothing to acquire right now, or the compositor already holds its share.
    #[error("no buffer available")]
    NoBufferAvailable,
    #[error("no surface has been set")]
    NoSurface,
    #[error("acquired item carries no buffer")]
    EmptyBuffer,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl BlastError {
    /// The steady state when frames arrive slower than the compositor consumes them.
    pub fn is_no_buffer(&self) -> bool {
        matches!(self, BlastError::NoBufferAvailable)
    }
}
