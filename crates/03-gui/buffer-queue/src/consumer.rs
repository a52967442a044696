//! The consumer end: acquire queued frames and release them back.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::state::{bq_log, BufferQueueCore, BufferSlot, CoreState};
use crate::error::{QueueError, QueueResult};
use crate::listener::ConsumerListener;
use crate::types::{
    AcquireOutcome, BufferState, Dataspace, Fence, GraphicBuffer, PixelFormat,
    MAX_MAX_ACQUIRED_BUFFERS, NUM_BUFFER_SLOTS,
};

/// Frames timed further out than this are treated as having no timestamp.
const MAX_REASONABLE_NSEC: i64 = 1_000_000_000;

#[derive(Clone)]
pub struct BufferQueueConsumer {
    core: Arc<BufferQueueCore>,
}

impl BufferQueueConsumer {
    pub(crate) fn new(core: Arc<BufferQueueCore>) -> Self {
        Self { core }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.core.state.lock()
    }

    /// Takes the next frame off the queue.
    ///
    /// With a non-zero `expected_present` (nanoseconds), frames that are
    /// already overdue are dropped in favour of a later one, and a frame that
    /// is not due yet yields [`AcquireOutcome::PresentLater`]. A non-zero
    /// `max_frame_number` keeps frames past that number in the queue.
    pub fn acquire_buffer(&self, expected_present: i64, max_frame_number: u64) -> QueueResult<AcquireOutcome> {
        let (outcome, dropped, producer) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let acquired = state.count_in(BufferState::Acquired);
            let extra_for_non_droppable =
                state.allow_extra_acquire && acquired == state.max_acquired + 1;
            if acquired > state.max_acquired && !extra_for_non_droppable {
                bq_log!(debug, state, "acquire_buffer: max acquired buffer count reached: {acquired} (max {})", state.max_acquired);
                return Ok(AcquireOutcome::NoBufferAvailable);
            }
            if state.queue.is_empty() {
                return Ok(AcquireOutcome::NoBufferAvailable);
            }

            let mut dropped = 0usize;
            let mut producer = None;
            if expected_present != 0 {
                // Drop frames the display has already passed, as long as a
                // later one is queued to take their place.
                while state.queue.len() > 1 && !state.queue[0].is_auto_timestamp {
                    let next = &state.queue[1];
                    if max_frame_number != 0 && next.frame_number > max_frame_number {
                        break;
                    }
                    let desired = next.timestamp;
                    if desired < expected_present.saturating_sub(MAX_REASONABLE_NSEC) || desired > expected_present {
                        break;
                    }
                    let Some(front) = state.queue.pop_front() else {
                        break;
                    };
                    bq_log!(trace, state, "acquire_buffer: dropping frame {} (desire={} expect={expected_present})", front.frame_number, front.timestamp);
                    if !front.is_stale {
                        state.slots[front.slot].state = BufferState::Free;
                        state.active_buffers.remove(&front.slot);
                        state.free_buffers.push_back(front.slot);
                        if state.buffer_released_cb_enabled {
                            producer = state.producer_listener.clone();
                        }
                        dropped += 1;
                    }
                }

                let front = &state.queue[0];
                let desired = front.timestamp;
                let due = desired <= expected_present || desired > expected_present.saturating_add(MAX_REASONABLE_NSEC);
                let ready = max_frame_number == 0 || front.frame_number <= max_frame_number;
                if !due || !ready {
                    bq_log!(trace, state, "acquire_buffer: defer frame {} (desire={desired} expect={expected_present} max={max_frame_number})", front.frame_number);
                    if dropped > 0 {
                        self.core.dequeue_cond.notify_all();
                    }
                    (AcquireOutcome::PresentLater, dropped, producer)
                } else {
                    (self.take_front(state, extra_for_non_droppable), dropped, producer)
                }
            } else {
                (self.take_front(state, extra_for_non_droppable), dropped, producer)
            }
        };

        if let Some(producer) = producer {
            for _ in 0..dropped {
                producer.on_buffer_released();
            }
        }
        Ok(outcome)
    }

    fn take_front(&self, state: &mut CoreState, extra_for_non_droppable: bool) -> AcquireOutcome {
        if extra_for_non_droppable && state.queue.front().is_some_and(|item| item.is_droppable) {
            return AcquireOutcome::NoBufferAvailable;
        }
        let Some(item) = state.queue.pop_front() else {
            return AcquireOutcome::NoBufferAvailable;
        };
        if !item.is_stale {
            let entry = &mut state.slots[item.slot];
            entry.acquire_called = true;
            entry.state = BufferState::Acquired;
            entry.fence = Fence::NO_FENCE;
        }
        self.core.dequeue_cond.notify_all();
        debug_assert!(state.is_consistent());
        bq_log!(trace, state, "acquire_buffer: acquiring slot {} frame {}", item.slot, item.frame_number);
        AcquireOutcome::Acquired(item)
    }

    /// Returns an acquired slot; the producer waits on `fence` before reuse.
    pub fn release_buffer(&self, slot: usize, frame_number: u64, fence: Fence) -> QueueResult<()> {
        let producer = {
            let mut state = self.lock();
            state.check_slot(slot, "release_buffer")?;
            if state.slots[slot].frame_number != frame_number {
                return Err(QueueError::StaleBufferSlot);
            }
            if state.slots[slot].state != BufferState::Acquired {
                bq_log!(error, state, "release_buffer: attempted to release slot {slot} but its state was {:?}", state.slots[slot].state);
                return Err(QueueError::BadValue("slot is not acquired"));
            }
            let entry = &mut state.slots[slot];
            entry.fence = fence;
            entry.state = BufferState::Free;
            state.active_buffers.remove(&slot);
            state.free_buffers.push_back(slot);
            self.core.dequeue_cond.notify_all();
            debug_assert!(state.is_consistent());
            if state.buffer_released_cb_enabled {
                state.producer_listener.clone()
            } else {
                None
            }
        };
        if let Some(producer) = producer {
            producer.on_buffer_released();
        }
        Ok(())
    }

    /// Takes an acquired buffer out of the queue for good.
    pub fn detach_buffer(&self, slot: usize) -> QueueResult<()> {
        let producer = {
            let mut state = self.lock();
            if state.is_abandoned {
                bq_log!(error, state, "detach_buffer: BufferQueue has been abandoned");
                return Err(QueueError::Abandoned);
            }
            state.check_slot(slot, "detach_buffer")?;
            if state.slots[slot].state != BufferState::Acquired {
                bq_log!(error, state, "detach_buffer: slot {slot} is not owned by the consumer ({:?})", state.slots[slot].state);
                return Err(QueueError::BadValue("slot is not acquired"));
            }
            state.active_buffers.remove(&slot);
            state.free_slots.insert(slot);
            state.clear_slot(slot);
            self.core.dequeue_cond.notify_all();
            debug_assert!(state.is_consistent());
            if state.buffer_released_cb_enabled {
                state.producer_listener.clone()
            } else {
                None
            }
        };
        if let Some(producer) = producer {
            producer.on_buffer_detached(slot);
        }
        Ok(())
    }

    /// Adopts an outside buffer as acquired; the producer is told to
    /// refetch the slot on its next dequeue.
    pub fn attach_buffer(&self, buffer: Arc<GraphicBuffer>) -> QueueResult<usize> {
        let mut state = self.lock();
        let acquired = state.count_in(BufferState::Acquired);
        if acquired > state.max_acquired {
            bq_log!(error, state, "attach_buffer: max acquired buffer count reached: {acquired} (max {})", state.max_acquired);
            return Err(QueueError::InvalidOperation("max acquired buffer count reached"));
        }
        if buffer.generation_number() != state.generation_number {
            bq_log!(error, state, "attach_buffer: generation number mismatch [buffer {}] [queue {}]", buffer.generation_number(), state.generation_number);
            return Err(QueueError::BadValue("generation number mismatch"));
        }
        let Some(slot) = state.pop_free_slot().or_else(|| state.pop_free_buffer()) else {
            bq_log!(error, state, "attach_buffer: could not find free buffer slot");
            return Err(QueueError::NoMemory);
        };
        state.active_buffers.insert(slot);
        state.slots[slot] = BufferSlot {
            graphic_buffer: Some(buffer),
            state: BufferState::Acquired,
            request_called: false,
            frame_number: 0,
            fence: Fence::NO_FENCE,
            acquire_called: false,
            needs_reallocation: true,
        };
        debug_assert!(state.is_consistent());
        bq_log!(trace, state, "attach_buffer: returning slot {slot}");
        Ok(slot)
    }

    /// Registers the consumer; producers can connect afterwards.
    pub fn connect(&self, listener: Arc<dyn ConsumerListener>, controlled_by_app: bool) -> QueueResult<()> {
        let mut state = self.lock();
        if state.is_abandoned {
            bq_log!(error, state, "connect: BufferQueue has been abandoned");
            return Err(QueueError::Abandoned);
        }
        state.consumer_listener = Some(listener);
        state.consumer_controlled_by_app = controlled_by_app;
        bq_log!(debug, state, "consumer connected (controlled_by_app={controlled_by_app})");
        Ok(())
    }

    /// Abandons the queue: every later producer call fails and waiters wake.
    pub fn disconnect(&self) -> QueueResult<()> {
        let mut state = self.lock();
        if state.consumer_listener.is_none() {
            bq_log!(error, state, "disconnect: no consumer is connected");
            return Err(QueueError::BadValue("no consumer is connected"));
        }
        state.is_abandoned = true;
        state.consumer_listener = None;
        state.queue.clear();
        state.free_all_buffers();
        self.core.dequeue_cond.notify_all();
        bq_log!(debug, state, "consumer disconnected; queue abandoned");
        Ok(())
    }

    /// Bit mask of slots whose buffer the consumer has not seen yet.
    pub fn released_buffers(&self) -> QueueResult<u64> {
        let state = self.lock();
        if state.is_abandoned {
            bq_log!(error, state, "released_buffers: BufferQueue has been abandoned");
            return Err(QueueError::Abandoned);
        }
        let mut mask = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.acquire_called)
            .fold(0u64, |mask, (index, _)| mask | (1 << index));
        for item in state.queue.iter().filter(|item| item.acquire_called) {
            mask &= !(1 << item.slot);
        }
        Ok(mask)
    }

    pub fn set_default_buffer_size(&self, width: u32, height: u32) -> QueueResult<()> {
        if width == 0 || height == 0 {
            return Err(QueueError::BadValue("default size must be non-zero"));
        }
        let mut state = self.lock();
        state.default_width = width;
        state.default_height = height;
        Ok(())
    }

    /// Caps the total buffer count. Only allowed before a producer connects.
    pub fn set_max_buffer_count(&self, count: usize) -> QueueResult<()> {
        if count == 0 || count > NUM_BUFFER_SLOTS {
            return Err(QueueError::BadValue("buffer count out of range"));
        }
        let mut state = self.lock();
        if state.connected_api.is_some() {
            bq_log!(error, state, "set_max_buffer_count: producer is already connected");
            return Err(QueueError::InvalidOperation("producer is already connected"));
        }
        if count < state.max_acquired {
            bq_log!(error, state, "set_max_buffer_count: {count} is less than the max acquired count {}", state.max_acquired);
            return Err(QueueError::BadValue("buffer count below max acquired"));
        }
        let delta = state.max_buffer_count_for(state.async_mode, state.dequeue_cannot_block, count) as isize
            - state.max_buffer_count() as isize;
        if !state.adjust_available_slots(delta) {
            bq_log!(error, state, "set_max_buffer_count: failed to adjust available slots by {delta}");
            return Err(QueueError::BadValue("could not adjust available slots"));
        }
        state.max_buffer_count_limit = count;
        Ok(())
    }

    /// Changes how many buffers the consumer may hold at once.
    pub fn set_max_acquired_buffer_count(&self, max_acquired: usize) -> QueueResult<()> {
        if max_acquired == 0 || max_acquired > MAX_MAX_ACQUIRED_BUFFERS {
            return Err(QueueError::BadValue("max acquired count out of range"));
        }
        let listener = {
            let mut state = self.lock();
            if state.is_abandoned {
                bq_log!(error, state, "set_max_acquired_buffer_count: consumer is abandoned");
                return Err(QueueError::Abandoned);
            }
            if max_acquired == state.max_acquired {
                return Ok(());
            }
            let acquired = state.count_in(BufferState::Acquired);
            if acquired > max_acquired {
                bq_log!(error, state, "set_max_acquired_buffer_count: {max_acquired} is below the {acquired} buffers already acquired");
                return Err(QueueError::BadValue("fewer than the buffers already acquired"));
            }
            let extra = usize::from(state.async_mode || state.dequeue_cannot_block);
            if max_acquired + state.max_dequeued + extra > state.max_buffer_count_limit {
                bq_log!(error, state, "set_max_acquired_buffer_count: {max_acquired} acquired buffers would exceed the max buffer count ({})", state.max_buffer_count_limit);
                return Err(QueueError::BadValue("exceeds the max buffer count"));
            }
            let delta = max_acquired as isize - state.max_acquired as isize;
            if !state.adjust_available_slots(delta) {
                return Err(QueueError::BadValue("could not adjust available slots"));
            }
            state.max_acquired = max_acquired;
            debug_assert!(state.is_consistent());
            if delta < 0 && state.buffer_released_cb_enabled {
                state.consumer_listener.clone()
            } else {
                None
            }
        };
        if let Some(listener) = listener {
            listener.on_buffers_released();
        }
        Ok(())
    }

    pub fn set_consumer_name(&self, name: impl Into<String>) {
        self.lock().consumer_name = name.into();
    }

    pub fn consumer_name(&self) -> String {
        self.lock().consumer_name.clone()
    }

    pub fn set_default_buffer_format(&self, format: PixelFormat) {
        self.lock().default_format = format;
    }

    pub fn set_default_buffer_dataspace(&self, dataspace: Dataspace) {
        self.lock().default_dataspace = dataspace;
    }

    pub fn set_consumer_usage_bits(&self, usage: u64) {
        self.lock().consumer_usage = usage;
    }

    /// Reported to the producer with the next queue or connect.
    pub fn set_transform_hint(&self, hint: u32) {
        self.lock().transform_hint = hint;
    }

    /// Drops the buffers of every free slot.
    pub fn discard_free_buffers(&self) -> QueueResult<()> {
        let mut state = self.lock();
        if state.is_abandoned {
            bq_log!(error, state, "discard_free_buffers: BufferQueue has been abandoned");
            return Err(QueueError::Abandoned);
        }
        state.discard_free_buffers();
        Ok(())
    }

    pub fn set_allow_extra_acquire(&self, allow: bool) {
        self.lock().allow_extra_acquire = allow;
    }

    pub fn max_acquired_buffer_count(&self) -> usize {
        self.lock().max_acquired
    }

    pub fn is_abandoned(&self) -> bool {
        self.lock().is_abandoned
    }

    /// Frames waiting to be acquired.
    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn frame_counter(&self) -> u64 {
        self.lock().frame_counter
    }

    pub fn dump_state(&self) -> String {
        self.lock().dump()
    }
}

impl std::fmt::Debug for BufferQueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BufferQueueConsumer")
            .field("consumer_name", &state.consumer_name)
            .field("abandoned", &state.is_abandoned)
            .finish()
    }
}
