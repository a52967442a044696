use thiserror::Error;

/// Result alias for codec operations.
pub type WireResult<T, E = WireError> = Result<T, E>;

/// Failures raised while encoding or decoding driver records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The tag is not part of the protocol; its payload has already been skipped.
    #[error("unknown command tag {tag:#010x}")]
    UnknownCommand { tag: u32 },
    /// Not enough bytes were left to read the record.
    #[error("record truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    /// The record was complete but internally inconsistent.
    #[error("malformed record: {0}")]
    Malformed(&'static str),
    /// The destination buffer could not grow.
    #[error("failed to grow command buffer by {requested} bytes")]
    AllocationFailed { requested: usize },
}
