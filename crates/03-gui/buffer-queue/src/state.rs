//! Shared state behind a producer/consumer pair.
//!
//! Every slot index is in exactly one of four sets:
//! - `free_slots`: free, no buffer attached.
//! - `free_buffers`: free, buffer attached, in release order.
//! - `active_buffers`: dequeued, queued or acquired.
//! - `unused_slots`: beyond the current buffer count.
//!
//! Growing or shrinking the buffer count moves slots between `unused_slots`
//! and the two free sets.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::QueueConfig;
use crate::consumer::BufferQueueConsumer;
use crate::error::{QueueError, QueueResult};
use crate::listener::{ConsumerListener, ProducerListener};
use crate::producer::BufferQueueProducer;
use crate::types::{
    Api, BufferItem, BufferState, Dataspace, Fence, GraphicBuffer, PixelFormat, Rect,
    DATASPACE_UNKNOWN, MAX_MAX_ACQUIRED_BUFFERS, NUM_BUFFER_SLOTS,
};

/// Logs through `log` with the queue's name and id in front.
macro_rules! bq_log {
    ($level:ident, $state:expr, $($arg:tt)+) => {
        log::$level!(
            "[{}](id:{:x}) {}",
            $state.consumer_name,
            $state.unique_id,
            format_args!($($arg)+)
        )
    };
}
pub(crate) use bq_log;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
pub(crate) struct BufferSlot {
    pub(crate) graphic_buffer: Option<Arc<GraphicBuffer>>,
    pub(crate) state: BufferState,
    /// The producer fetched the buffer since it was (re)allocated.
    pub(crate) request_called: bool,
    pub(crate) frame_number: u64,
    /// Release fence while free, acquire fence while queued.
    pub(crate) fence: Fence,
    pub(crate) acquire_called: bool,
    /// Set when the consumer attached the buffer; the next dequeue reports
    /// reallocation so the producer refetches it.
    pub(crate) needs_reallocation: bool,
}

pub(crate) struct CoreState {
    pub(crate) consumer_name: String,
    pub(crate) unique_id: u64,
    pub(crate) slots: Vec<BufferSlot>,
    pub(crate) queue: VecDeque<BufferItem>,
    pub(crate) free_slots: BTreeSet<usize>,
    pub(crate) free_buffers: VecDeque<usize>,
    /// Popped from the back, so the lowest index is reused first.
    pub(crate) unused_slots: Vec<usize>,
    pub(crate) active_buffers: BTreeSet<usize>,

    pub(crate) consumer_listener: Option<Arc<dyn ConsumerListener>>,
    pub(crate) consumer_controlled_by_app: bool,
    pub(crate) consumer_usage: u64,
    pub(crate) producer_listener: Option<Arc<dyn ProducerListener>>,
    pub(crate) buffer_released_cb_enabled: bool,
    pub(crate) connected_api: Option<Api>,

    pub(crate) dequeue_cannot_block: bool,
    pub(crate) queue_buffer_can_drop: bool,
    pub(crate) legacy_buffer_drop: bool,
    pub(crate) dequeue_timeout: Option<Duration>,
    pub(crate) async_mode: bool,
    pub(crate) allow_allocation: bool,
    pub(crate) allow_extra_acquire: bool,
    pub(crate) is_abandoned: bool,

    pub(crate) default_format: PixelFormat,
    pub(crate) default_width: u32,
    pub(crate) default_height: u32,
    pub(crate) default_dataspace: Dataspace,

    /// Consumer-imposed ceiling on the buffer count.
    pub(crate) max_buffer_count_limit: usize,
    pub(crate) max_acquired: usize,
    pub(crate) max_dequeued: usize,

    pub(crate) buffer_has_been_queued: bool,
    pub(crate) frame_counter: u64,
    pub(crate) transform_hint: u32,
    pub(crate) transform_hint_in_use: u32,
    pub(crate) buffer_age: u64,
    pub(crate) generation_number: u32,
    pub(crate) sticky_transform: u32,

    pub(crate) last_queued_slot: Option<usize>,
    pub(crate) last_queued_fence: Fence,
    pub(crate) last_queued_crop: Rect,
    pub(crate) last_queued_transform: u32,

    pub(crate) next_callback_ticket: u64,
}

impl CoreState {
    fn new(config: &QueueConfig) -> QueueResult<Self> {
        if config.max_acquired_buffers == 0 || config.max_acquired_buffers > MAX_MAX_ACQUIRED_BUFFERS {
            return Err(QueueError::BadValue("max acquired buffer count out of range"));
        }
        let extra = usize::from(config.async_mode);
        let starting = config.max_acquired_buffers + config.max_dequeued_buffers + extra;
        if config.max_dequeued_buffers == 0 || starting > NUM_BUFFER_SLOTS {
            return Err(QueueError::BadValue("max dequeued buffer count out of range"));
        }
        Ok(Self {
            consumer_name: config.consumer_name.clone(),
            unique_id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            slots: (0..NUM_BUFFER_SLOTS).map(|_| BufferSlot::default()).collect(),
            queue: VecDeque::new(),
            free_slots: (0..starting).collect(),
            free_buffers: VecDeque::new(),
            unused_slots: (starting..NUM_BUFFER_SLOTS).rev().collect(),
            active_buffers: BTreeSet::new(),
            consumer_listener: None,
            consumer_controlled_by_app: config.consumer_controlled_by_app,
            consumer_usage: config.consumer_usage,
            producer_listener: None,
            buffer_released_cb_enabled: false,
            connected_api: None,
            dequeue_cannot_block: false,
            queue_buffer_can_drop: false,
            legacy_buffer_drop: true,
            dequeue_timeout: config.dequeue_timeout(),
            async_mode: config.async_mode,
            allow_allocation: true,
            allow_extra_acquire: config.allow_extra_acquire,
            is_abandoned: false,
            default_format: config.default_format,
            default_width: config.default_width.max(1),
            default_height: config.default_height.max(1),
            default_dataspace: DATASPACE_UNKNOWN,
            max_buffer_count_limit: NUM_BUFFER_SLOTS,
            max_acquired: config.max_acquired_buffers,
            max_dequeued: config.max_dequeued_buffers,
            buffer_has_been_queued: false,
            frame_counter: 0,
            transform_hint: 0,
            transform_hint_in_use: 0,
            buffer_age: 0,
            generation_number: 0,
            sticky_transform: 0,
            last_queued_slot: None,
            last_queued_fence: Fence::NO_FENCE,
            last_queued_crop: Rect::EMPTY,
            last_queued_transform: 0,
            next_callback_ticket: 0,
        })
    }

    /// Buffers the consumer may hold while the producer still gets one.
    pub(crate) fn min_undequeued_buffer_count(&self) -> usize {
        if self.async_mode || self.dequeue_cannot_block {
            self.max_acquired + 1
        } else {
            self.max_acquired
        }
    }

    pub(crate) fn min_max_buffer_count(&self) -> usize {
        self.min_undequeued_buffer_count() + 1
    }

    /// The buffer count the given modes and limit would produce.
    pub(crate) fn max_buffer_count_for(&self, async_mode: bool, cannot_block: bool, limit: usize) -> usize {
        let extra = usize::from(async_mode || cannot_block);
        limit.min(self.max_acquired + self.max_dequeued + extra)
    }

    pub(crate) fn max_buffer_count(&self) -> usize {
        self.max_buffer_count_for(self.async_mode, self.dequeue_cannot_block, self.max_buffer_count_limit)
    }

    pub(crate) fn count_in(&self, state: BufferState) -> usize {
        self.active_buffers
            .iter()
            .filter(|&&slot| self.slots[slot].state == state)
            .count()
    }

    pub(crate) fn check_slot(&self, slot: usize, op: &str) -> QueueResult<()> {
        if slot >= NUM_BUFFER_SLOTS {
            bq_log!(error, self, "{op}: slot index {slot} out of range [0, {NUM_BUFFER_SLOTS})");
            return Err(QueueError::BadValue("slot index out of range"));
        }
        Ok(())
    }

    /// Producer calls need a live queue and a connected producer.
    pub(crate) fn check_producer(&self, op: &str) -> QueueResult<()> {
        if self.is_abandoned {
            bq_log!(error, self, "{op}: BufferQueue has been abandoned");
            return Err(QueueError::Abandoned);
        }
        if self.connected_api.is_none() {
            bq_log!(error, self, "{op}: BufferQueue has no connected producer");
            return Err(QueueError::NotConnected);
        }
        Ok(())
    }

    pub(crate) fn pop_free_buffer(&mut self) -> Option<usize> {
        self.free_buffers.pop_front()
    }

    pub(crate) fn pop_free_slot(&mut self) -> Option<usize> {
        self.free_slots.pop_first()
    }

    /// Drops the slot's buffer and resets its bookkeeping.
    pub(crate) fn clear_slot(&mut self, slot: usize) {
        bq_log!(trace, self, "clear_slot: slot {slot}");
        self.slots[slot] = BufferSlot {
            needs_reallocation: true,
            ..BufferSlot::default()
        };
        if self.last_queued_slot == Some(slot) {
            self.last_queued_slot = None;
        }
    }

    /// Empties every slot; queued items stay but are marked stale.
    pub(crate) fn free_all_buffers(&mut self) {
        let free_slots: Vec<usize> = self.free_slots.iter().copied().collect();
        for slot in free_slots {
            self.clear_slot(slot);
        }
        while let Some(slot) = self.free_buffers.pop_front() {
            self.free_slots.insert(slot);
            self.clear_slot(slot);
        }
        for slot in std::mem::take(&mut self.active_buffers) {
            self.free_slots.insert(slot);
            self.clear_slot(slot);
        }
        for item in &mut self.queue {
            item.is_stale = true;
            item.acquire_called = false;
        }
        debug_assert!(self.is_consistent());
    }

    pub(crate) fn discard_free_buffers(&mut self) {
        while let Some(slot) = self.free_buffers.pop_front() {
            self.free_slots.insert(slot);
            self.clear_slot(slot);
        }
        debug_assert!(self.is_consistent());
    }

    /// Moves `delta` slots into (positive) or out of (negative) use.
    ///
    /// Fails without changing anything when there are not enough slots to
    /// move.
    pub(crate) fn adjust_available_slots(&mut self, delta: isize) -> bool {
        if delta >= 0 {
            let delta = delta.unsigned_abs();
            if delta > self.unused_slots.len() {
                return false;
            }
            for _ in 0..delta {
                let Some(slot) = self.unused_slots.pop() else {
                    return false;
                };
                self.free_slots.insert(slot);
            }
        } else {
            let delta = delta.unsigned_abs();
            if delta > self.free_slots.len() + self.free_buffers.len() {
                return false;
            }
            for _ in 0..delta {
                let slot = if let Some(slot) = self.free_slots.pop_first() {
                    slot
                } else if let Some(slot) = self.free_buffers.pop_back() {
                    slot
                } else {
                    return false;
                };
                self.clear_slot(slot);
                self.unused_slots.push(slot);
            }
        }
        true
    }

    /// Checks the set membership rules from the module docs.
    pub(crate) fn is_consistent(&self) -> bool {
        (0..NUM_BUFFER_SLOTS).all(|slot| {
            let in_free_slots = self.free_slots.contains(&slot);
            let in_free_buffers = self.free_buffers.contains(&slot);
            let in_active = self.active_buffers.contains(&slot);
            let in_unused = self.unused_slots.contains(&slot);
            let memberships = [in_free_slots, in_free_buffers, in_active, in_unused]
                .iter()
                .filter(|&&member| member)
                .count();
            let entry = &self.slots[slot];
            let shape = if in_free_slots || in_unused {
                entry.state == BufferState::Free && entry.graphic_buffer.is_none()
            } else if in_free_buffers {
                entry.state == BufferState::Free && entry.graphic_buffer.is_some()
            } else {
                entry.state != BufferState::Free
            };
            if memberships != 1 || !shape {
                bq_log!(error, self, "slot {slot} is inconsistent: {:?}", entry.state);
                return false;
            }
            true
        })
    }

    pub(crate) fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}: max_acquired={} max_dequeued={} max_buffers={} async={} cannot_block={} frame={}",
            self.consumer_name,
            self.max_acquired,
            self.max_dequeued,
            self.max_buffer_count(),
            self.async_mode,
            self.dequeue_cannot_block,
            self.frame_counter,
        );
        for item in &self.queue {
            let _ = writeln!(
                out,
                "  queued slot={} frame={} droppable={} stale={}",
                item.slot, item.frame_number, item.is_droppable, item.is_stale
            );
        }
        for &slot in &self.active_buffers {
            let entry = &self.slots[slot];
            let _ = writeln!(out, "  slot {slot}: {:?} frame={}", entry.state, entry.frame_number);
        }
        let _ = writeln!(
            out,
            "  free_slots={:?} free_buffers={:?} unused={}",
            self.free_slots,
            self.free_buffers,
            self.unused_slots.len()
        );
        out
    }
}

pub(crate) struct BufferQueueCore {
    pub(crate) state: Mutex<CoreState>,
    /// Woken whenever a slot may have become available to the producer.
    pub(crate) dequeue_cond: Condvar,
    current_callback_ticket: Mutex<u64>,
    callback_cond: Condvar,
}

impl BufferQueueCore {
    fn new(config: &QueueConfig) -> QueueResult<Self> {
        Ok(Self {
            state: Mutex::new(CoreState::new(config)?),
            dequeue_cond: Condvar::new(),
            current_callback_ticket: Mutex::new(0),
            callback_cond: Condvar::new(),
        })
    }

    /// Runs `f` once every earlier ticket has had its turn.
    pub(crate) fn run_in_ticket_order(&self, ticket: u64, f: impl FnOnce()) {
        let mut current = self.current_callback_ticket.lock();
        while *current != ticket {
            self.callback_cond.wait(&mut current);
        }
        f();
        *current += 1;
        self.callback_cond.notify_all();
    }
}

/// Builds a queue and returns its two ends.
///
/// The consumer must `connect` a listener before a producer can connect.
pub fn create_buffer_queue(config: &QueueConfig) -> QueueResult<(BufferQueueProducer, BufferQueueConsumer)> {
    let core = Arc::new(BufferQueueCore::new(config)?);
    {
        let state = core.state.lock();
        bq_log!(debug, state, "created (max acquired {}, max dequeued {})", state.max_acquired, state.max_dequeued);
    }
    Ok((
        BufferQueueProducer::new(Arc::clone(&core)),
        BufferQueueConsumer::new(core),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CoreState {
        CoreState::new(&QueueConfig::default()).expect("default config")
    }

    #[test]
    fn starting_slots_cover_the_buffer_count() {
        let state = state();
        assert_eq!(state.max_buffer_count(), 2);
        assert_eq!(state.free_slots.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(state.unused_slots.len(), NUM_BUFFER_SLOTS - 2);
        assert_eq!(state.unused_slots.last(), Some(&2));
        assert!(state.is_consistent());
    }

    #[test]
    fn async_mode_adds_a_buffer() {
        let mut state = state();
        assert_eq!(state.min_undequeued_buffer_count(), 1);
        state.async_mode = true;
        assert_eq!(state.min_undequeued_buffer_count(), 2);
        assert_eq!(state.max_buffer_count(), 3);
        assert_eq!(state.max_buffer_count_for(false, false, 64), 2);
        assert_eq!(state.max_buffer_count_for(false, true, 2), 2);
    }

    #[test]
    fn adjusting_slots_fails_without_side_effects() {
        let mut state = state();
        assert!(!state.adjust_available_slots(-3));
        assert_eq!(state.free_slots.len(), 2);
        assert!(state.adjust_available_slots(2));
        assert_eq!(state.free_slots.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(state.adjust_available_slots(-3));
        assert_eq!(state.free_slots.iter().copied().collect::<Vec<_>>(), vec![3]);
        assert!(!state.adjust_available_slots(NUM_BUFFER_SLOTS as isize));
        assert!(state.is_consistent());
    }

    #[test]
    fn config_bounds_are_checked() {
        let too_many = QueueConfig {
            max_acquired_buffers: 40,
            max_dequeued_buffers: 30,
            ..QueueConfig::default()
        };
        assert!(matches!(CoreState::new(&too_many), Err(QueueError::BadValue(_))));
        let none_acquired = QueueConfig {
            max_acquired_buffers: 0,
            ..QueueConfig::default()
        };
        assert!(CoreState::new(&none_acquired).is_err());
    }
}
