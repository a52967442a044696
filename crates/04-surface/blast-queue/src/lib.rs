//! Hands frames from a buffer queue to a compositor as atomic transactions.
//!
//! [`BlastBufferQueue`] owns a [`buffer_queue`] pair, acquires every frame
//! the producer queues and wraps it in a [`Transaction`] sent to a
//! [`Composer`]. The compositor returns buffers through release callbacks,
//! which in turn free slots for the producer.

mod blast;
pub mod composer;
mod config;
mod error;
mod transaction;

pub use blast::{BlastBufferQueue, LastBufferInfo, Size, TransactionReadyCallback};
pub use composer::{AppliedTransaction, Composer, RecordingComposer};
pub use config::BlastConfig;
pub use error::{BlastError, BlastResult};
pub use transaction::{
    BufferData, FrameTimelineInfo, LayerState, ReleaseCallback, ReleaseCallbackId, SurfaceControl, SurfaceId,
    SurfaceStats, Transaction, TransactionCallback,
};
