//! Callbacks the queue makes into its two sides.
//!
//! Every callback runs without the queue lock held, so implementations may
//! call straight back into the producer or consumer.

use crate::types::BufferItem;

/// Told about producer activity. Frame-available and frame-replaced calls
/// arrive in queue order even when several producer threads race.
pub trait ConsumerListener: Send + Sync {
    fn on_frame_available(&self, item: &BufferItem);

    /// A droppable frame still in the queue was overwritten by `item`.
    fn on_frame_replaced(&self, item: &BufferItem) {
        self.on_frame_available(item);
    }

    fn on_frame_dequeued(&self, _buffer_id: u64) {}

    fn on_frame_cancelled(&self, _buffer_id: u64) {}

    fn on_frame_detached(&self, _buffer_id: u64) {}

    /// Slot contents were dropped; cached slot to buffer mappings are stale.
    fn on_buffers_released(&self) {}

    fn on_disconnect(&self) {}
}

/// Told when the consumer hands buffers back.
pub trait ProducerListener: Send + Sync {
    fn on_buffer_released(&self);

    fn on_buffer_detached(&self, _slot: usize) {}

    /// Whether `on_buffer_released` should be called at all.
    fn needs_release_notify(&self) -> bool {
        true
    }
}
