//! Slot-based buffer exchange between one producer and one consumer.
//!
//! The producer dequeues a slot, draws into its buffer and queues it; the
//! consumer acquires queued frames in order and releases them back. Both ends
//! share a single state guarded by one lock, and every listener callback
//! runs after that lock is dropped.
//!
//! ```
//! use std::sync::Arc;
//! use buffer_queue::{create_buffer_queue, Api, BufferItem, ConsumerListener, Fence, QueueBufferInput, QueueConfig};
//!
//! struct Noop;
//! impl ConsumerListener for Noop {
//!     fn on_frame_available(&self, _item: &BufferItem) {}
//! }
//!
//! let (producer, consumer) = create_buffer_queue(&QueueConfig::default())?;
//! consumer.connect(Arc::new(Noop), false)?;
//! producer.connect(None, Api::Cpu, false)?;
//!
//! let out = producer.dequeue_buffer(64, 64, 0, 0)?;
//! producer.request_buffer(out.slot)?;
//! producer.queue_buffer(out.slot, QueueBufferInput::default())?;
//!
//! let item = consumer.acquire_buffer(0, 0)?.into_item().expect("queued frame");
//! consumer.release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)?;
//! # Ok::<(), buffer_queue::QueueError>(())
//! ```

mod config;
mod consumer;
mod error;
mod listener;
mod producer;
mod state;
mod types;

pub use config::QueueConfig;
pub use consumer::BufferQueueConsumer;
pub use error::{QueueError, QueueResult};
pub use listener::{ConsumerListener, ProducerListener};
pub use producer::{BufferQueueProducer, LastQueued, ProducerQuery};
pub use state::create_buffer_queue;
pub use types::*;
