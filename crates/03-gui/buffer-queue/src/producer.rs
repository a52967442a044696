//! The producer end: dequeue a slot, fill it, queue it.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use crate::state::{bq_log, BufferQueueCore, CoreState};
use crate::error::{QueueError, QueueResult};
use crate::listener::ProducerListener;
use crate::types::{
    Api, BufferItem, BufferState, Dataspace, DequeueFlags, DequeueOutput, Fence,
    GraphicBuffer, PixelFormat, QueueBufferInput, QueueBufferOutput, Rect, DATASPACE_UNKNOWN,
    TRANSFORM_INVERSE_DISPLAY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreeSlotCaller {
    Dequeue,
    Attach,
}

/// Values a producer can ask the queue about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerQuery {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub min_undequeued_buffers: usize,
    pub sticky_transform: u32,
    /// More than one frame is waiting for the consumer.
    pub consumer_running_behind: bool,
    pub consumer_usage: u64,
    pub default_dataspace: Dataspace,
    pub buffer_age: u64,
    pub max_buffer_count: usize,
}

/// The most recently queued buffer, as the producer left it.
#[derive(Debug, Clone)]
pub struct LastQueued {
    pub buffer: Arc<GraphicBuffer>,
    pub fence: Fence,
    pub crop: Rect,
    pub transform: u32,
}

#[derive(Clone)]
pub struct BufferQueueProducer {
    core: Arc<BufferQueueCore>,
}

impl BufferQueueProducer {
    pub(crate) fn new(core: Arc<BufferQueueCore>) -> Self {
        Self { core }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.core.state.lock()
    }

    /// Hands out the buffer behind a dequeued slot.
    pub fn request_buffer(&self, slot: usize) -> QueueResult<Arc<GraphicBuffer>> {
        let mut state = self.lock();
        if state.is_abandoned {
            bq_log!(error, state, "request_buffer: BufferQueue has been abandoned");
            return Err(QueueError::Abandoned);
        }
        state.check_slot(slot, "request_buffer")?;
        if state.slots[slot].state != BufferState::Dequeued {
            bq_log!(error, state, "request_buffer: slot {slot} is not owned by the producer ({:?})", state.slots[slot].state);
            return Err(QueueError::BadValue("slot is not dequeued"));
        }
        let entry = &mut state.slots[slot];
        entry.request_called = true;
        entry
            .graphic_buffer
            .clone()
            .ok_or(QueueError::BadValue("slot has no buffer"))
    }

    /// Changes how many slots the producer may hold at once; returns the new
    /// buffer count.
    pub fn set_max_dequeued_buffer_count(&self, max_dequeued: usize) -> QueueResult<usize> {
        let (listener, max_buffer_count) = {
            let mut state = self.lock();
            if state.is_abandoned {
                bq_log!(error, state, "set_max_dequeued_buffer_count: BufferQueue has been abandoned");
                return Err(QueueError::Abandoned);
            }
            if max_dequeued == state.max_dequeued {
                return Ok(state.max_buffer_count());
            }
            let dequeued = state.count_in(BufferState::Dequeued);
            if dequeued > max_dequeued {
                bq_log!(error, state, "set_max_dequeued_buffer_count: {max_dequeued} is below the {dequeued} buffers already dequeued");
                return Err(QueueError::BadValue("fewer than the buffers already dequeued"));
            }
            let buffer_count = state.min_undequeued_buffer_count() + max_dequeued;
            if buffer_count > crate::types::NUM_BUFFER_SLOTS {
                bq_log!(error, state, "set_max_dequeued_buffer_count: buffer count {buffer_count} too large");
                return Err(QueueError::BadValue("buffer count too large"));
            }
            if buffer_count < state.min_max_buffer_count() {
                bq_log!(error, state, "set_max_dequeued_buffer_count: buffer count {buffer_count} below minimum {}", state.min_max_buffer_count());
                return Err(QueueError::BadValue("buffer count too small"));
            }
            if buffer_count > state.max_buffer_count_limit {
                bq_log!(error, state, "set_max_dequeued_buffer_count: {max_dequeued} dequeued buffers would exceed the max buffer count ({})", state.max_buffer_count_limit);
                return Err(QueueError::BadValue("exceeds the max buffer count"));
            }
            let delta = max_dequeued as isize - state.max_dequeued as isize;
            if !state.adjust_available_slots(delta) {
                return Err(QueueError::BadValue("could not adjust available slots"));
            }
            state.max_dequeued = max_dequeued;
            debug_assert!(state.is_consistent());
            self.core.dequeue_cond.notify_all();
            let listener = if delta < 0 { state.consumer_listener.clone() } else { None };
            (listener, state.max_buffer_count())
        };
        if let Some(listener) = listener {
            listener.on_buffers_released();
        }
        Ok(max_buffer_count)
    }

    /// In async mode queued frames are droppable and one extra buffer is
    /// kept so the producer never waits on the consumer.
    pub fn set_async_mode(&self, async_mode: bool) -> QueueResult<()> {
        let listener = {
            let mut state = self.lock();
            if state.is_abandoned {
                bq_log!(error, state, "set_async_mode: BufferQueue has been abandoned");
                return Err(QueueError::Abandoned);
            }
            if async_mode == state.async_mode {
                return Ok(());
            }
            let wanted = state.max_acquired
                + state.max_dequeued
                + usize::from(async_mode || state.dequeue_cannot_block);
            if wanted > state.max_buffer_count_limit {
                bq_log!(error, state, "set_async_mode({async_mode}) would exceed the max buffer count ({})", state.max_buffer_count_limit);
                return Err(QueueError::BadValue("exceeds the max buffer count"));
            }
            let delta = state.max_buffer_count_for(async_mode, state.dequeue_cannot_block, state.max_buffer_count_limit)
                as isize
                - state.max_buffer_count() as isize;
            if !state.adjust_available_slots(delta) {
                bq_log!(error, state, "set_async_mode: failed to adjust available slots by {delta}");
                return Err(QueueError::BadValue("could not adjust available slots"));
            }
            state.async_mode = async_mode;
            debug_assert!(state.is_consistent());
            self.core.dequeue_cond.notify_all();
            if delta < 0 {
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

    /// Finds a slot for dequeue or attach, waiting while none is available.
    ///
    /// At the dequeued-buffer limit a dequeue waits like any other shortage;
    /// an attach fails straight away.
    fn wait_for_free_slot(
        &self,
        state: &mut MutexGuard<'_, CoreState>,
        caller: FreeSlotCaller,
    ) -> QueueResult<usize> {
        let op = match caller {
            FreeSlotCaller::Dequeue => "dequeue_buffer",
            FreeSlotCaller::Attach => "attach_buffer",
        };
        let deadline = state.dequeue_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if state.is_abandoned {
                bq_log!(error, state, "{op}: BufferQueue has been abandoned");
                return Err(QueueError::Abandoned);
            }
            let dequeued = state.count_in(BufferState::Dequeued);
            let acquired = state.count_in(BufferState::Acquired);
            let at_limit = dequeued >= state.max_dequeued;
            if at_limit && caller == FreeSlotCaller::Attach {
                bq_log!(error, state, "{op}: attempting to exceed the max dequeued buffer count ({})", state.max_dequeued);
                return Err(QueueError::InvalidOperation("max dequeued buffer count reached"));
            }

            // A quick disconnect/reconnect can leave many frames queued with
            // empty slots; wait instead of outrunning the consumer.
            let too_many_queued = state.queue.len() > state.max_buffer_count();
            let found = if at_limit || too_many_queued {
                None
            } else {
                match caller {
                    FreeSlotCaller::Dequeue => state.pop_free_buffer().or_else(|| {
                        if state.allow_allocation {
                            state.pop_free_slot()
                        } else {
                            None
                        }
                    }),
                    FreeSlotCaller::Attach => state.pop_free_slot().or_else(|| state.pop_free_buffer()),
                }
            };
            if let Some(slot) = found {
                return Ok(slot);
            }

            // The consumer may briefly hold one extra buffer, so only fail
            // fast while it is within its limit.
            if (state.dequeue_cannot_block || state.async_mode) && acquired <= state.max_acquired {
                return Err(QueueError::WouldBlock);
            }
            bq_log!(trace, state, "{op}: waiting for a slot (dequeued {dequeued}, queued {})", state.queue.len());
            match deadline {
                Some(deadline) => {
                    if self.core.dequeue_cond.wait_until(state, deadline).timed_out() {
                        bq_log!(debug, state, "{op}: timed out waiting for a slot");
                        return Err(QueueError::TimedOut);
                    }
                }
                None => self.core.dequeue_cond.wait(state),
            }
        }
    }

    /// Takes a slot for the producer to draw into.
    ///
    /// Zero width and height ask for the default size, and format 0 for the
    /// default format. `NEEDS_REALLOCATION` in the result means the slot's
    /// buffer is new and must be fetched with [`request_buffer`](Self::request_buffer).
    pub fn dequeue_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: u64,
    ) -> QueueResult<DequeueOutput> {
        let mut guard = self.lock();
        guard.check_producer("dequeue_buffer")?;
        if (width == 0) != (height == 0) {
            bq_log!(error, guard, "dequeue_buffer: invalid size: w={width} h={height}");
            return Err(QueueError::BadValue("width and height must both be zero or both be set"));
        }
        let format = if format == 0 { guard.default_format } else { format };
        let usage = usage | guard.consumer_usage;
        let (width, height) = if width == 0 {
            (guard.default_width, guard.default_height)
        } else {
            (width, height)
        };

        let slot = loop {
            let found = self.wait_for_free_slot(&mut guard, FreeSlotCaller::Dequeue)?;
            if !guard.allow_allocation {
                let stale = guard.slots[found]
                    .graphic_buffer
                    .as_ref()
                    .is_some_and(|buffer| buffer.needs_reallocation(width, height, format, usage));
                if stale {
                    guard.free_slots.insert(found);
                    guard.clear_slot(found);
                    continue;
                }
            }
            break found;
        };

        let state = &mut *guard;
        let needs_reallocation = state.slots[slot]
            .graphic_buffer
            .as_ref()
            .map_or(true, |buffer| buffer.needs_reallocation(width, height, format, usage));
        state.active_buffers.insert(slot);
        let entry = &mut state.slots[slot];
        let attached_by_consumer = mem::take(&mut entry.needs_reallocation);
        entry.state = BufferState::Dequeued;

        let mut flags = DequeueFlags::NONE;
        if needs_reallocation {
            bq_log!(debug, state, "dequeue_buffer: allocating {width}x{height} format {format} for slot {slot}");
            let entry = &mut state.slots[slot];
            entry.acquire_called = false;
            entry.request_called = false;
            entry.fence = Fence::NO_FENCE;
            entry.graphic_buffer = Some(GraphicBuffer::allocate(
                width,
                height,
                format,
                usage,
                state.generation_number,
            ));
            state.buffer_age = 0;
            flags |= DequeueFlags::NEEDS_REALLOCATION;
        } else {
            state.buffer_age = (state.frame_counter + 1).saturating_sub(state.slots[slot].frame_number);
        }
        let fence = mem::take(&mut state.slots[slot].fence);
        let buffer_id = state.slots[slot].graphic_buffer.as_ref().map(|buffer| buffer.id());
        let listener = state.consumer_listener.clone();
        let buffer_age = state.buffer_age;
        debug_assert!(state.is_consistent());
        bq_log!(trace, state, "dequeue_buffer: returning slot {slot} flags {:#x}", flags.bits());
        drop(guard);

        if let (Some(listener), Some(buffer_id)) = (listener, buffer_id) {
            listener.on_frame_dequeued(buffer_id);
        }
        if attached_by_consumer {
            flags |= DequeueFlags::NEEDS_REALLOCATION;
        }
        Ok(DequeueOutput {
            slot,
            fence,
            flags,
            buffer_age,
        })
    }

    /// Gives up a dequeued slot and its buffer; the slot becomes empty.
    pub fn detach_buffer(&self, slot: usize) -> QueueResult<()> {
        let (listener, buffer_id) = {
            let mut state = self.lock();
            state.check_producer("detach_buffer")?;
            state.check_slot(slot, "detach_buffer")?;
            if state.slots[slot].state != BufferState::Dequeued {
                bq_log!(warn, state, "detach_buffer: slot {slot} is not owned by the producer ({:?})", state.slots[slot].state);
                return Err(QueueError::BadValue("slot is not dequeued"));
            }
            if !state.slots[slot].request_called {
                bq_log!(error, state, "detach_buffer: buffer in slot {slot} has not been requested");
                return Err(QueueError::BadValue("buffer was not requested"));
            }
            let buffer_id = state.slots[slot].graphic_buffer.as_ref().map(|buffer| buffer.id());
            state.active_buffers.remove(&slot);
            state.free_slots.insert(slot);
            state.clear_slot(slot);
            self.core.dequeue_cond.notify_all();
            debug_assert!(state.is_consistent());
            (state.consumer_listener.clone(), buffer_id)
        };
        if let Some(listener) = listener {
            if let Some(buffer_id) = buffer_id {
                listener.on_frame_detached(buffer_id);
            }
            listener.on_buffers_released();
        }
        Ok(())
    }

    /// Takes the oldest free buffer out of the queue along with its fence.
    pub fn detach_next_buffer(&self) -> QueueResult<(Arc<GraphicBuffer>, Fence)> {
        let (detached, listener) = {
            let mut state = self.lock();
            state.check_producer("detach_next_buffer")?;
            let Some(slot) = state.free_buffers.pop_front() else {
                return Err(QueueError::NoMemory);
            };
            state.free_slots.insert(slot);
            let entry = mem::take(&mut state.slots[slot]);
            state.clear_slot(slot);
            bq_log!(trace, state, "detach_next_buffer: detached slot {slot}");
            debug_assert!(state.is_consistent());
            let buffer = entry
                .graphic_buffer
                .ok_or(QueueError::BadValue("free buffer slot was empty"))?;
            ((buffer, entry.fence), state.consumer_listener.clone())
        };
        if let Some(listener) = listener {
            listener.on_buffers_released();
        }
        Ok(detached)
    }

    /// Puts an outside buffer into a slot already owned by the producer.
    pub fn attach_buffer(&self, buffer: Arc<GraphicBuffer>) -> QueueResult<usize> {
        let mut guard = self.lock();
        guard.check_producer("attach_buffer")?;
        if buffer.generation_number() != guard.generation_number {
            bq_log!(error, guard, "attach_buffer: generation number mismatch [buffer {}] [queue {}]", buffer.generation_number(), guard.generation_number);
            return Err(QueueError::BadValue("generation number mismatch"));
        }
        let slot = self.wait_for_free_slot(&mut guard, FreeSlotCaller::Attach)?;
        let state = &mut *guard;
        state.slots[slot] = crate::state::BufferSlot {
            graphic_buffer: Some(buffer),
            state: BufferState::Dequeued,
            request_called: true,
            frame_number: state.slots[slot].frame_number,
            fence: Fence::NO_FENCE,
            acquire_called: false,
            needs_reallocation: false,
        };
        state.active_buffers.insert(slot);
        debug_assert!(state.is_consistent());
        bq_log!(trace, state, "attach_buffer: returning slot {slot}");
        Ok(slot)
    }

    /// Hands a filled slot to the consumer.
    pub fn queue_buffer(&self, slot: usize, input: QueueBufferInput) -> QueueResult<QueueBufferOutput> {
        let Some(fence) = input.fence.clone() else {
            let state = self.lock();
            bq_log!(error, state, "queue_buffer: fence is missing");
            return Err(QueueError::BadValue("fence is missing"));
        };

        let (item, ticket, listener, replaced, output) = {
            let mut guard = self.lock();
            guard.check_producer("queue_buffer")?;
            guard.check_slot(slot, "queue_buffer")?;
            if guard.slots[slot].state != BufferState::Dequeued {
                bq_log!(error, guard, "queue_buffer: slot {slot} is not owned by the producer ({:?})", guard.slots[slot].state);
                return Err(QueueError::BadValue("slot is not dequeued"));
            }
            if !guard.slots[slot].request_called {
                bq_log!(error, guard, "queue_buffer: slot {slot} was queued without requesting a buffer");
                return Err(QueueError::BadValue("buffer was not requested"));
            }
            let Some(buffer) = guard.slots[slot].graphic_buffer.clone() else {
                return Err(QueueError::BadValue("slot has no buffer"));
            };
            if !input.crop.fits_within(&buffer.bounds()) {
                bq_log!(error, guard, "queue_buffer: crop rect is not contained within the buffer in slot {slot}");
                return Err(QueueError::BadValue("crop exceeds the buffer"));
            }

            let state = &mut *guard;
            let dataspace = if input.dataspace == DATASPACE_UNKNOWN {
                state.default_dataspace
            } else {
                input.dataspace
            };
            state.frame_counter += 1;
            let frame_number = state.frame_counter;
            let entry = &mut state.slots[slot];
            entry.fence = fence.clone();
            entry.state = BufferState::Queued;
            entry.frame_number = frame_number;

            let mut item = BufferItem {
                slot,
                graphic_buffer: Some(buffer),
                fence: fence.clone(),
                crop: input.crop,
                transform: input.transform & !TRANSFORM_INVERSE_DISPLAY,
                transform_to_display_inverse: input.transform & TRANSFORM_INVERSE_DISPLAY != 0,
                scaling_mode: input.scaling_mode,
                timestamp: input.timestamp,
                is_auto_timestamp: input.is_auto_timestamp,
                dataspace,
                hdr_metadata: input.hdr_metadata,
                frame_number,
                is_droppable: state.async_mode || (state.legacy_buffer_drop && state.queue_buffer_can_drop),
                acquire_called: entry.acquire_called,
                surface_damage: input.surface_damage,
                auto_refresh: false,
                queued_buffer: true,
                is_stale: false,
                api: state.connected_api,
            };
            state.sticky_transform = input.sticky_transform;

            let mut replaced = false;
            let mut buffer_replaced = false;
            match state.queue.back() {
                Some(last) if last.is_droppable => {
                    let last_slot = last.slot;
                    if !last.is_stale {
                        state.slots[last_slot].state = BufferState::Free;
                        state.active_buffers.remove(&last_slot);
                        state.free_buffers.push_back(last_slot);
                        buffer_replaced = true;
                    }
                    item.surface_damage.merge(&last.surface_damage);
                    if let Some(back) = state.queue.back_mut() {
                        *back = item.clone();
                    }
                    replaced = true;
                }
                _ => state.queue.push_back(item.clone()),
            }

            state.buffer_has_been_queued = true;
            self.core.dequeue_cond.notify_all();
            state.last_queued_slot = Some(slot);
            state.last_queued_fence = fence;
            state.last_queued_crop = item.crop;
            state.last_queued_transform = item.transform;
            state.transform_hint_in_use = state.transform_hint;

            let output = QueueBufferOutput {
                width: state.default_width,
                height: state.default_height,
                transform_hint: state.transform_hint_in_use,
                num_pending_buffers: state.queue.len(),
                next_frame_number: state.frame_counter + 1,
                buffer_replaced,
                max_buffer_count: state.max_buffer_count_limit,
            };
            let ticket = state.next_callback_ticket;
            state.next_callback_ticket += 1;
            debug_assert!(state.is_consistent());
            bq_log!(trace, state, "queue_buffer: slot {slot} frame {frame_number} pending {}", output.num_pending_buffers);
            (item, ticket, state.consumer_listener.clone(), replaced, output)
        };

        self.core.run_in_ticket_order(ticket, || {
            if let Some(listener) = &listener {
                if replaced {
                    listener.on_frame_replaced(&item);
                } else {
                    listener.on_frame_available(&item);
                }
            }
        });
        Ok(output)
    }

    /// Returns a dequeued slot unused; the next dequeue of it waits on `fence`.
    pub fn cancel_buffer(&self, slot: usize, fence: Fence) -> QueueResult<()> {
        let (listener, buffer_id) = {
            let mut state = self.lock();
            state.check_producer("cancel_buffer")?;
            state.check_slot(slot, "cancel_buffer")?;
            if state.slots[slot].state != BufferState::Dequeued {
                bq_log!(error, state, "cancel_buffer: slot {slot} is not owned by the producer ({:?})", state.slots[slot].state);
                return Err(QueueError::BadValue("slot is not dequeued"));
            }
            state.active_buffers.remove(&slot);
            let entry = &mut state.slots[slot];
            entry.state = BufferState::Free;
            entry.fence = fence;
            let buffer_id = entry.graphic_buffer.as_ref().map(|buffer| buffer.id());
            if buffer_id.is_some() {
                state.free_buffers.push_back(slot);
            } else {
                state.free_slots.insert(slot);
            }
            self.core.dequeue_cond.notify_all();
            debug_assert!(state.is_consistent());
            (state.consumer_listener.clone(), buffer_id)
        };
        if let (Some(listener), Some(buffer_id)) = (listener, buffer_id) {
            listener.on_frame_cancelled(buffer_id);
        }
        Ok(())
    }

    pub fn query(&self) -> QueueResult<ProducerQuery> {
        let state = self.lock();
        if state.is_abandoned {
            bq_log!(error, state, "query: BufferQueue has been abandoned");
            return Err(QueueError::Abandoned);
        }
        Ok(ProducerQuery {
            width: state.default_width,
            height: state.default_height,
            format: state.default_format,
            min_undequeued_buffers: state.min_undequeued_buffer_count(),
            sticky_transform: state.sticky_transform,
            consumer_running_behind: state.queue.len() > 1,
            consumer_usage: state.consumer_usage,
            default_dataspace: state.default_dataspace,
            buffer_age: if state.buffer_age > i32::MAX as u64 { 0 } else { state.buffer_age },
            max_buffer_count: state.max_buffer_count(),
        })
    }

    /// Attaches a producer. Needs a connected consumer and no other producer.
    pub fn connect(
        &self,
        listener: Option<Arc<dyn ProducerListener>>,
        api: Api,
        producer_controlled_by_app: bool,
    ) -> QueueResult<QueueBufferOutput> {
        let mut state = self.lock();
        if state.is_abandoned {
            bq_log!(error, state, "connect: BufferQueue has been abandoned");
            return Err(QueueError::Abandoned);
        }
        if state.consumer_listener.is_none() {
            bq_log!(error, state, "connect: BufferQueue has no consumer");
            return Err(QueueError::NoConsumer);
        }
        if let Some(current) = state.connected_api {
            bq_log!(error, state, "connect: already connected (cur={current:?} req={api:?})");
            return Err(QueueError::BadValue("a producer is already connected"));
        }

        let both_app = state.consumer_controlled_by_app && producer_controlled_by_app;
        let cannot_block = state.dequeue_timeout.is_none() && both_app;
        let delta = state.max_buffer_count_for(state.async_mode, cannot_block, state.max_buffer_count_limit) as isize
            - state.max_buffer_count() as isize;
        if !state.adjust_available_slots(delta) {
            bq_log!(error, state, "connect: failed to adjust available slots by {delta}");
            return Err(QueueError::BadValue("could not adjust available slots"));
        }

        state.connected_api = Some(api);
        state.transform_hint_in_use = state.transform_hint;
        if let Some(listener) = listener {
            state.buffer_released_cb_enabled = listener.needs_release_notify();
            state.producer_listener = Some(listener);
        }
        state.buffer_has_been_queued = false;
        state.dequeue_cannot_block = false;
        state.queue_buffer_can_drop = false;
        state.legacy_buffer_drop = true;
        if both_app {
            state.dequeue_cannot_block = state.dequeue_timeout.is_none();
            state.queue_buffer_can_drop = state.dequeue_timeout.map_or(true, |timeout| timeout.is_zero());
        }
        state.allow_allocation = true;
        debug_assert!(state.is_consistent());
        bq_log!(debug, state, "connect: api={api:?} producer_controlled_by_app={producer_controlled_by_app}");
        Ok(QueueBufferOutput {
            width: state.default_width,
            height: state.default_height,
            transform_hint: state.transform_hint_in_use,
            num_pending_buffers: state.queue.len(),
            next_frame_number: state.frame_counter + 1,
            buffer_replaced: false,
            max_buffer_count: state.max_buffer_count_limit,
        })
    }

    /// Detaches the producer connected with `api`, freeing every buffer.
    pub fn disconnect(&self, api: Api) -> QueueResult<()> {
        self.disconnect_matching(Some(api))
    }

    /// Detaches whichever producer is connected; a no-op when none is.
    pub fn disconnect_current(&self) -> QueueResult<()> {
        self.disconnect_matching(None)
    }

    fn disconnect_matching(&self, api: Option<Api>) -> QueueResult<()> {
        let listener = {
            let mut state = self.lock();
            if state.is_abandoned {
                return Ok(());
            }
            let Some(connected) = state.connected_api else {
                if let Some(api) = api {
                    bq_log!(error, state, "disconnect: not connected (req={api:?})");
                    return Err(QueueError::NotConnected);
                }
                return Ok(());
            };
            if api.is_some_and(|api| api != connected) {
                bq_log!(error, state, "disconnect: still connected to another api (cur={connected:?} req={api:?})");
                return Err(QueueError::BadValue("connected with a different api"));
            }
            state.free_all_buffers();
            state.producer_listener = None;
            state.buffer_released_cb_enabled = false;
            state.connected_api = None;
            self.core.dequeue_cond.notify_all();
            bq_log!(debug, state, "disconnect: api={connected:?}");
            state.consumer_listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_buffers_released();
            listener.on_disconnect();
        }
        Ok(())
    }

    /// When disallowed, dequeue only hands out slots whose buffer already fits.
    pub fn allow_allocation(&self, allow: bool) {
        self.lock().allow_allocation = allow;
    }

    pub fn set_generation_number(&self, generation: u32) {
        self.lock().generation_number = generation;
    }

    pub fn consumer_name(&self) -> String {
        self.lock().consumer_name.clone()
    }

    /// `None` waits forever. Any timeout makes dequeues wait even in
    /// non-blocking configurations.
    pub fn set_dequeue_timeout(&self, timeout: Option<Duration>) -> QueueResult<()> {
        let mut state = self.lock();
        let cannot_block = if timeout.is_some() { false } else { state.dequeue_cannot_block };
        let delta = state.max_buffer_count_for(state.async_mode, cannot_block, state.max_buffer_count_limit) as isize
            - state.max_buffer_count() as isize;
        if !state.adjust_available_slots(delta) {
            bq_log!(error, state, "set_dequeue_timeout: failed to adjust available slots by {delta}");
            return Err(QueueError::BadValue("could not adjust available slots"));
        }
        state.dequeue_timeout = timeout;
        state.dequeue_cannot_block = cannot_block;
        if timeout.is_some_and(|timeout| !timeout.is_zero()) {
            state.queue_buffer_can_drop = false;
        }
        debug_assert!(state.is_consistent());
        Ok(())
    }

    pub fn set_legacy_buffer_drop(&self, drop: bool) {
        self.lock().legacy_buffer_drop = drop;
    }

    /// The last queued buffer, unless its slot was dequeued again since.
    pub fn last_queued_buffer(&self) -> Option<LastQueued> {
        let state = self.lock();
        let slot = state.last_queued_slot?;
        let entry = &state.slots[slot];
        if entry.state == BufferState::Dequeued {
            return None;
        }
        Some(LastQueued {
            buffer: entry.graphic_buffer.clone()?,
            fence: state.last_queued_fence.clone(),
            crop: state.last_queued_crop,
            transform: state.last_queued_transform,
        })
    }

    pub fn unique_id(&self) -> u64 {
        self.lock().unique_id
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected_api.is_some()
    }
}

impl std::fmt::Debug for BufferQueueProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BufferQueueProducer")
            .field("consumer_name", &state.consumer_name)
            .field("connected_api", &state.connected_api)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::consumer::BufferQueueConsumer;
    use crate::state::create_buffer_queue;
    use crate::listener::ConsumerListener;
    use crate::types::{Damage, PIXEL_FORMAT_RGBA_8888, PIXEL_FORMAT_RGB_565};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl ConsumerListener for Events {
        fn on_frame_available(&self, item: &BufferItem) {
            self.0.lock().push(format!("available {}", item.frame_number));
        }

        fn on_frame_replaced(&self, item: &BufferItem) {
            self.0.lock().push(format!("replaced {}", item.frame_number));
        }

        fn on_frame_dequeued(&self, _buffer_id: u64) {
            self.0.lock().push("dequeued".to_owned());
        }

        fn on_frame_cancelled(&self, _buffer_id: u64) {
            self.0.lock().push("cancelled".to_owned());
        }

        fn on_buffers_released(&self) {
            self.0.lock().push("released".to_owned());
        }
    }

    fn queue(config: QueueConfig) -> (BufferQueueProducer, BufferQueueConsumer, Arc<Events>) {
        let (producer, consumer) = create_buffer_queue(&config).expect("queue");
        let events = Arc::new(Events::default());
        consumer.connect(events.clone(), false).expect("consumer connect");
        producer.connect(None, Api::Cpu, false).expect("producer connect");
        (producer, consumer, events)
    }

    #[test]
    fn dequeue_needs_a_connected_producer() {
        let (producer, consumer) = create_buffer_queue(&QueueConfig::default()).expect("queue");
        assert_eq!(producer.dequeue_buffer(0, 0, 0, 0).unwrap_err(), QueueError::NotConnected);
        assert_eq!(producer.connect(None, Api::Cpu, false).unwrap_err(), QueueError::NoConsumer);
        consumer.connect(Arc::new(Events::default()), false).expect("connect");
        producer.connect(None, Api::Cpu, false).expect("connect");
        assert!(matches!(
            producer.connect(None, Api::Egl, false),
            Err(QueueError::BadValue(_))
        ));
    }

    #[test]
    fn half_specified_size_is_rejected_and_defaults_fill_in() {
        let (producer, _consumer, _events) = queue(QueueConfig {
            default_width: 32,
            default_height: 16,
            ..QueueConfig::default()
        });
        assert!(matches!(producer.dequeue_buffer(10, 0, 0, 0), Err(QueueError::BadValue(_))));
        let out = producer.dequeue_buffer(0, 0, 0, 0).expect("dequeue");
        assert!(out.flags.contains(DequeueFlags::NEEDS_REALLOCATION));
        let buffer = producer.request_buffer(out.slot).expect("request");
        assert_eq!((buffer.width(), buffer.height()), (32, 16));
        assert_eq!(buffer.format(), PIXEL_FORMAT_RGBA_8888);
    }

    #[test]
    fn reused_buffer_reports_its_age() {
        let (producer, consumer, _events) = queue(QueueConfig::default());
        let first = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        producer.request_buffer(first.slot).expect("request");
        producer
            .queue_buffer(first.slot, QueueBufferInput::default())
            .expect("queue");
        let item = consumer.acquire_buffer(0, 0).expect("acquire").into_item().expect("item");
        consumer
            .release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)
            .expect("release");

        // The free slot with a buffer is preferred over the empty one.
        let again = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        assert_eq!(again.slot, first.slot);
        assert!(!again.flags.contains(DequeueFlags::NEEDS_REALLOCATION));
        assert_eq!(again.buffer_age, 1);
        assert_eq!(producer.query().expect("query").buffer_age, 1);
    }

    #[test]
    fn geometry_change_reallocates() {
        let (producer, _consumer, _events) = queue(QueueConfig::default());
        let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        let old = producer.request_buffer(out.slot).expect("request");
        producer.cancel_buffer(out.slot, Fence::NO_FENCE).expect("cancel");
        let out = producer.dequeue_buffer(8, 8, PIXEL_FORMAT_RGB_565, 0).expect("dequeue");
        assert!(out.flags.contains(DequeueFlags::NEEDS_REALLOCATION));
        let new = producer.request_buffer(out.slot).expect("request");
        assert_ne!(old.id(), new.id());
        assert_eq!(new.format(), PIXEL_FORMAT_RGB_565);
    }

    #[test]
    fn cancelled_fence_comes_back_on_the_next_dequeue() {
        let (producer, _consumer, events) = queue(QueueConfig::default());
        let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        producer.request_buffer(out.slot).expect("request");
        let fence = Fence::pending();
        producer.cancel_buffer(out.slot, fence.clone()).expect("cancel");
        let again = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        assert_eq!(again.slot, out.slot);
        assert!(again.fence.same_as(&fence));
        assert_eq!(
            events.0.lock().clone(),
            vec!["dequeued", "cancelled", "dequeued"]
        );
    }

    #[test]
    fn queue_validates_slot_fence_and_crop() {
        let (producer, _consumer, _events) = queue(QueueConfig::default());
        let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        let missing_fence = QueueBufferInput {
            fence: None,
            ..QueueBufferInput::default()
        };
        assert!(matches!(producer.queue_buffer(out.slot, missing_fence), Err(QueueError::BadValue(_))));
        assert!(matches!(
            producer.queue_buffer(out.slot, QueueBufferInput::default()),
            Err(QueueError::BadValue("buffer was not requested"))
        ));
        producer.request_buffer(out.slot).expect("request");
        let oversized = QueueBufferInput {
            crop: Rect::from_size(9, 8),
            ..QueueBufferInput::default()
        };
        assert!(matches!(producer.queue_buffer(out.slot, oversized), Err(QueueError::BadValue(_))));
        assert!(matches!(
            producer.queue_buffer(63, QueueBufferInput::default()),
            Err(QueueError::BadValue(_))
        ));
        let output = producer
            .queue_buffer(out.slot, QueueBufferInput::default())
            .expect("queue");
        assert_eq!(output.num_pending_buffers, 1);
        assert_eq!(output.next_frame_number, 2);
        assert!(!output.buffer_replaced);
    }

    #[test]
    fn droppable_frame_is_replaced_in_place() {
        let (producer, consumer, events) = queue(QueueConfig {
            max_dequeued_buffers: 2,
            async_mode: true,
            ..QueueConfig::default()
        });
        for _ in 0..2 {
            let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
            producer.request_buffer(out.slot).expect("request");
            producer.queue_buffer(out.slot, QueueBufferInput::default()).expect("queue");
        }
        let log = events.0.lock().clone();
        assert!(log.contains(&"available 1".to_owned()));
        assert!(log.contains(&"replaced 2".to_owned()));
        let item = consumer.acquire_buffer(0, 0).expect("acquire").into_item().expect("item");
        assert_eq!(item.frame_number, 2);
        assert!(matches!(
            consumer.acquire_buffer(0, 0).expect("acquire"),
            crate::types::AcquireOutcome::NoBufferAvailable
        ));
    }

    #[test]
    fn attach_and_detach_move_buffers_between_queues() {
        let (producer, _consumer, _events) = queue(QueueConfig {
            max_dequeued_buffers: 2,
            ..QueueConfig::default()
        });
        let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        assert!(matches!(producer.detach_buffer(out.slot), Err(QueueError::BadValue(_))));
        let buffer = producer.request_buffer(out.slot).expect("request");
        producer.detach_buffer(out.slot).expect("detach");
        assert!(matches!(producer.detach_next_buffer(), Err(QueueError::NoMemory)));

        let slot = producer.attach_buffer(Arc::clone(&buffer)).expect("attach");
        producer.queue_buffer(slot, QueueBufferInput::default()).expect("queue");

        producer.set_generation_number(7);
        assert!(matches!(producer.attach_buffer(buffer), Err(QueueError::BadValue(_))));
    }

    #[test]
    fn attach_fails_at_the_dequeued_limit() {
        let (producer, _consumer, _events) = queue(QueueConfig::default());
        producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        let outside = GraphicBuffer::allocate(8, 8, PIXEL_FORMAT_RGBA_8888, 0, 0);
        assert!(matches!(
            producer.attach_buffer(outside),
            Err(QueueError::InvalidOperation(_))
        ));
    }

    #[test]
    fn max_dequeued_count_is_validated() {
        let (producer, _consumer, events) = queue(QueueConfig::default());
        assert_eq!(producer.set_max_dequeued_buffer_count(3).expect("grow"), 4);
        for _ in 0..2 {
            producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        }
        assert!(matches!(producer.set_max_dequeued_buffer_count(1), Err(QueueError::BadValue(_))));
        assert!(matches!(producer.set_max_dequeued_buffer_count(64), Err(QueueError::BadValue(_))));
        assert_eq!(producer.set_max_dequeued_buffer_count(2).expect("shrink"), 3);
        assert_eq!(events.0.lock().last().map(String::as_str), Some("released"));
    }

    #[test]
    fn disconnect_frees_everything_and_checks_the_api() {
        let (producer, _consumer, _events) = queue(QueueConfig::default());
        producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        assert!(matches!(producer.disconnect(Api::Egl), Err(QueueError::BadValue(_))));
        producer.disconnect(Api::Cpu).expect("disconnect");
        assert!(!producer.is_connected());
        assert_eq!(producer.disconnect(Api::Cpu).unwrap_err(), QueueError::NotConnected);
        producer.disconnect_current().expect("no-op");
        producer.connect(None, Api::Egl, false).expect("reconnect");
        let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        assert!(out.flags.contains(DequeueFlags::NEEDS_REALLOCATION));
    }

    #[test]
    fn app_controlled_pair_fails_fast_instead_of_waiting() {
        let (producer, consumer) = create_buffer_queue(&QueueConfig::default()).expect("queue");
        consumer.connect(Arc::new(Events::default()), true).expect("connect");
        producer.connect(None, Api::Cpu, true).expect("connect");
        assert_eq!(producer.query().expect("query").min_undequeued_buffers, 2);
        producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        assert_eq!(producer.dequeue_buffer(8, 8, 0, 0).unwrap_err(), QueueError::WouldBlock);
    }

    #[test]
    fn last_queued_buffer_tracks_the_latest_frame() {
        let (producer, _consumer, _events) = queue(QueueConfig::default());
        assert!(producer.last_queued_buffer().is_none());
        let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
        let buffer = producer.request_buffer(out.slot).expect("request");
        let input = QueueBufferInput {
            crop: Rect::new(1, 1, 4, 4),
            transform: crate::types::TRANSFORM_ROT_90 | TRANSFORM_INVERSE_DISPLAY,
            ..QueueBufferInput::default()
        };
        producer.queue_buffer(out.slot, input).expect("queue");
        let last = producer.last_queued_buffer().expect("last");
        assert_eq!(last.buffer.id(), buffer.id());
        assert_eq!(last.crop, Rect::new(1, 1, 4, 4));
        assert_eq!(last.transform, crate::types::TRANSFORM_ROT_90);
    }

    #[test]
    fn surface_damage_of_replaced_frames_is_merged() {
        let (producer, consumer, _events) = queue(QueueConfig {
            max_dequeued_buffers: 2,
            async_mode: true,
            ..QueueConfig::default()
        });
        for rect in [Rect::from_size(2, 2), Rect::new(4, 4, 6, 6)] {
            let out = producer.dequeue_buffer(8, 8, 0, 0).expect("dequeue");
            producer.request_buffer(out.slot).expect("request");
            let input = QueueBufferInput {
                surface_damage: Damage::rect(rect),
                ..QueueBufferInput::default()
            };
            producer.queue_buffer(out.slot, input).expect("queue");
        }
        let item = consumer.acquire_buffer(0, 0).expect("acquire").into_item().expect("item");
        assert!(matches!(&item.surface_damage, Damage::Rects(rects) if rects.len() == 2));
    }
}
