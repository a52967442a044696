use std::time::Duration;

use serde::Deserialize;

use crate::types::{PixelFormat, PIXEL_FORMAT_RGBA_8888};

/// Settings a queue starts with; everything can be changed later through
/// the producer and consumer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix for every log line the queue writes.
    pub consumer_name: String,
    pub max_acquired_buffers: usize,
    pub max_dequeued_buffers: usize,
    /// `None` waits forever for a free slot.
    pub dequeue_timeout_ms: Option<u64>,
    pub default_width: u32,
    pub default_height: u32,
    pub default_format: PixelFormat,
    /// ORed into every dequeue request.
    pub consumer_usage: u64,
    /// Lets the consumer hold one buffer past its limit for a non-droppable frame.
    pub allow_extra_acquire: bool,
    pub async_mode: bool,
    /// Together with an app-controlled producer, dequeues fail instead of waiting.
    pub consumer_controlled_by_app: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            consumer_name: "unnamed".to_owned(),
            max_acquired_buffers: 1,
            max_dequeued_buffers: 1,
            dequeue_timeout_ms: None,
            default_width: 1,
            default_height: 1,
            default_format: PIXEL_FORMAT_RGBA_8888,
            consumer_usage: 0,
            allow_extra_acquire: false,
            async_mode: false,
            consumer_controlled_by_app: false,
        }
    }
}

impl QueueConfig {
    pub fn dequeue_timeout(&self) -> Option<Duration> {
        self.dequeue_timeout_ms.map(Duration::from_millis)
    }
}
