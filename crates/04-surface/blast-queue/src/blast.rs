//! Turns queued frames into compositor transactions.
//!
//! Every frame the producer queues is acquired and sent to the compositor in
//! its own one-way transaction, unless a caller asked to sync: then the next
//! frame (or every frame, until stopped) goes into a transaction the caller
//! applies itself. Frames that arrive while a synced transaction has not been
//! committed yet are only counted; that backlog is the shadow queue.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use buffer_queue::{
    create_buffer_queue, AcquireOutcome, Api, BufferItem, BufferQueueConsumer, BufferQueueProducer,
    ConsumerListener, Fence, GraphicBuffer, PixelFormat, QueueConfig, Rect, ScalingMode,
    PIXEL_FORMAT_RGBA_8888, TRANSFORM_ROT_90, USAGE_HW_COMPOSER, USAGE_HW_TEXTURE,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::composer::Composer;
use crate::config::BlastConfig;
use crate::error::{BlastError, BlastResult};
use crate::transaction::{
    BufferData, FrameTimelineInfo, ReleaseCallback, ReleaseCallbackId, SurfaceControl, SurfaceId,
    SurfaceStats, Transaction, TransactionCallback,
};

static NEXT_PRODUCER_ID: AtomicU32 = AtomicU32::new(0);

/// Receives the synced transaction once its frame has been acquired into it.
pub type TransactionReadyCallback = Box<dyn FnOnce(Transaction) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Buffer size as it will be displayed, after a 90 degree rotation.
    fn of_buffer(item: &BufferItem, buffer: &GraphicBuffer) -> Self {
        let (width, height) = (buffer.width(), buffer.height());
        if item.transform & TRANSFORM_ROT_90 != 0 {
            Self::new(height, width)
        } else {
            Self::new(width, height)
        }
    }

    fn rect(self) -> Rect {
        Rect::from_size(self.width as i32, self.height as i32)
    }
}

/// What the last accepted buffer looked like.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastBufferInfo {
    pub has_buffer: bool,
    pub width: u32,
    pub height: u32,
    pub transform: u32,
    pub scaling_mode: ScalingMode,
    pub crop: Rect,
}

/// Producer disconnects, keyed by the last frame seen before each one.
#[derive(Debug, Default)]
struct ConnectionEvents {
    last_frame_seen: u64,
    disconnects: VecDeque<u64>,
}

impl ConnectionEvents {
    /// Whether the producer disconnected before `frame_number` was queued.
    fn take_disconnect(&mut self, frame_number: u64) -> bool {
        if self.disconnects.front().is_some_and(|&frame| frame <= frame_number) {
            self.disconnects.pop_front();
            true
        } else {
            false
        }
    }
}

struct BlastState {
    surface: Option<SurfaceControl>,
    /// Size the compositor shows; lags `requested_size` under freeze scaling.
    size: Size,
    requested_size: Size,
    format: PixelFormat,
    transform_hint: u32,

    transaction_ready: Option<TransactionReadyCallback>,
    sync_transaction: Option<Transaction>,
    acquire_single_buffer: bool,

    /// Shadow queue depth: frames queued but not acquired yet.
    num_frame_available: usize,
    num_acquired: usize,
    current_max_acquired: usize,

    submitted: HashMap<ReleaseCallbackId, BufferItem>,
    pending_release: VecDeque<(ReleaseCallbackId, Fence)>,
    /// Frames sitting in a sync transaction that has not been committed.
    synced_frame_numbers: BTreeSet<u64>,
    surfaces_with_pending_callback: VecDeque<SurfaceId>,

    pending_transactions: Vec<(u64, Transaction)>,
    pending_frame_timelines: VecDeque<(u64, FrameTimelineInfo)>,

    last_acquired_frame_number: u64,
    last_applied_frame_number: u64,
    applied_last_transaction: bool,
    last_buffer_info: LastBufferInfo,

    /// Buffers of other producers knocked out of a transaction; released
    /// once the lock is dropped.
    deferred_releases: Vec<BufferData>,
}

impl BlastState {
    fn new(max_acquired: usize) -> Self {
        Self {
            surface: None,
            size: Size::new(1, 1),
            requested_size: Size::new(1, 1),
            format: PIXEL_FORMAT_RGBA_8888,
            transform_hint: 0,
            transaction_ready: None,
            sync_transaction: None,
            acquire_single_buffer: true,
            num_frame_available: 0,
            num_acquired: 0,
            current_max_acquired: max_acquired,
            submitted: HashMap::new(),
            pending_release: VecDeque::new(),
            synced_frame_numbers: BTreeSet::new(),
            surfaces_with_pending_callback: VecDeque::new(),
            pending_transactions: Vec::new(),
            pending_frame_timelines: VecDeque::new(),
            last_acquired_frame_number: 0,
            last_applied_frame_number: 0,
            applied_last_transaction: false,
            last_buffer_info: LastBufferInfo::default(),
            deferred_releases: Vec::new(),
        }
    }

    /// Under freeze scaling, a buffer whose size matches neither the shown
    /// size nor a pending resize would be stretched.
    fn reject_buffer(&self, item: &BufferItem, buffer: &GraphicBuffer) -> bool {
        if item.scaling_mode != ScalingMode::Freeze {
            return false;
        }
        let buffer_size = Size::of_buffer(item, buffer);
        if self.requested_size != self.size && self.requested_size == buffer_size {
            return false;
        }
        self.size != buffer_size
    }
}

struct Shared {
    name: String,
    producer_id: u32,
    composer: Arc<dyn Composer>,
    consumer: BufferQueueConsumer,
    update_destination_frame: bool,
    max_acquired: usize,
    state: Mutex<BlastState>,
    callback_cond: Condvar,
    dequeue_timestamps: Mutex<HashMap<u64, Instant>>,
    connection: Mutex<ConnectionEvents>,
}

/// Adapter from a [`BufferQueueProducer`] to compositor transactions.
///
/// Dropping it flushes any transaction still waiting for a frame and
/// abandons the queue.
pub struct BlastBufferQueue {
    shared: Arc<Shared>,
    producer: BufferQueueProducer,
}

impl BlastBufferQueue {
    pub fn new(config: &BlastConfig, composer: Arc<dyn Composer>) -> BlastResult<Self> {
        let producer_id = NEXT_PRODUCER_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}#{producer_id}", config.name);
        let (producer, consumer) = create_buffer_queue(&QueueConfig {
            consumer_name: format!("{name}(BLAST Consumer){producer_id}"),
            max_acquired_buffers: config.max_acquired_buffers,
            max_dequeued_buffers: 2,
            dequeue_timeout_ms: None,
            consumer_usage: USAGE_HW_COMPOSER | USAGE_HW_TEXTURE,
            allow_extra_acquire: true,
            ..QueueConfig::default()
        })?;

        let shared = Arc::new(Shared {
            name,
            producer_id,
            composer,
            consumer: consumer.clone(),
            update_destination_frame: config.update_destination_frame,
            max_acquired: config.max_acquired_buffers,
            state: Mutex::new(BlastState::new(config.max_acquired_buffers)),
            callback_cond: Condvar::new(),
            dequeue_timestamps: Mutex::new(HashMap::new()),
            connection: Mutex::new(ConnectionEvents::default()),
        });
        consumer.connect(
            Arc::new(FrameListener {
                shared: Arc::downgrade(&shared),
            }),
            false,
        )?;
        debug!(bbq = %shared.name, "created");
        Ok(Self { shared, producer })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The producer end applications queue frames into.
    pub fn producer(&self) -> BufferQueueProducer {
        self.producer.clone()
    }

    /// Points the queue at `surface` and requests a new size and format.
    ///
    /// A new surface gets backpressure enabled. Under freeze scaling the
    /// shown size only changes once a buffer of the requested size arrives.
    pub fn update(&self, surface: &SurfaceControl, width: u32, height: u32, format: PixelFormat) -> BlastResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.format != format {
            state.format = format;
            shared.consumer.set_default_buffer_format(format);
        }

        let changed = !state
            .surface
            .as_ref()
            .is_some_and(|current| current.is_same_surface(surface));
        if changed && state.surface.is_some() {
            debug!(bbq = %shared.name, "updating surface without recreating the queue");
        }
        state.surface = Some(surface.clone());
        let id = surface.id();

        let mut t = Transaction::new();
        let mut apply = false;
        if changed {
            t.layer_mut(id).enable_backpressure = Some(true);
            apply = true;
        }
        state.transform_hint = surface.transform_hint();
        shared.consumer.set_transform_hint(state.transform_hint);
        trace!(bbq = %shared.name, width, height, format, hint = state.transform_hint, "update");

        let requested = Size::new(width, height);
        if state.requested_size != requested {
            shared.consumer.set_default_buffer_size(width, height)?;
            state.requested_size = requested;
            if state.last_buffer_info.scaling_mode != ScalingMode::Freeze {
                state.size = requested;
                if shared.update_destination_frame {
                    t.layer_mut(id).destination_frame = Some(requested.rect());
                    apply = true;
                }
            }
        }
        if apply {
            shared.composer.apply(t, true);
        }
        Ok(())
    }

    /// Routes the next frame into a transaction handed to `callback` instead
    /// of the compositor. With `acquire_single_buffer` false every later frame
    /// is merged in as well, until [`stop_continuous_sync_transaction`].
    ///
    /// Returns false when a sync is already armed.
    ///
    /// [`stop_continuous_sync_transaction`]: Self::stop_continuous_sync_transaction
    pub fn sync_next_transaction(
        &self,
        callback: impl FnOnce(Transaction) + Send + 'static,
        acquire_single_buffer: bool,
    ) -> bool {
        let mut state = self.shared.state.lock();
        if state.transaction_ready.is_some() {
            warn!(bbq = %self.shared.name, "sync already armed; not overwriting the transaction callback");
            return false;
        }
        state.transaction_ready = Some(Box::new(callback));
        state.sync_transaction = Some(Transaction::new());
        state.acquire_single_buffer = acquire_single_buffer;
        true
    }

    /// Ends a continuous sync and hands its transaction to the callback.
    pub fn stop_continuous_sync_transaction(&self) {
        let ready = {
            let mut state = self.shared.state.lock();
            if state.acquire_single_buffer || state.transaction_ready.is_none() {
                warn!(bbq = %self.shared.name, "no continuous sync to stop");
                return;
            }
            state.acquire_single_buffer = true;
            state.transaction_ready.take().zip(state.sync_transaction.take())
        };
        if let Some((callback, transaction)) = ready {
            callback(transaction);
        }
    }

    /// Disarms a single-frame sync that has not caught a frame yet.
    pub fn clear_sync_transaction(&self) {
        let mut state = self.shared.state.lock();
        if !state.acquire_single_buffer {
            warn!(bbq = %self.shared.name, "no single-frame sync to clear");
            return;
        }
        state.transaction_ready = None;
        state.sync_transaction = None;
    }

    /// Applies `transaction` together with frame `frame_number`, or right
    /// away when that frame was already acquired.
    pub fn merge_with_next_transaction(&self, transaction: Transaction, frame_number: u64) {
        let mut state = self.shared.state.lock();
        if state.last_acquired_frame_number >= frame_number {
            self.shared.composer.apply(transaction, false);
        } else {
            state.pending_transactions.push((frame_number, transaction));
        }
    }

    /// Applies every pending transaction meant for `frame_number` or earlier.
    pub fn apply_pending_transactions(&self, frame_number: u64) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let mut t = Transaction::new();
        shared.merge_pending_transactions(&mut state, &mut t, frame_number);
        shared.composer.apply(t, true);
        shared.finish(state);
    }

    /// Like [`apply_pending_transactions`](Self::apply_pending_transactions),
    /// but hands the merged transaction back instead of applying it.
    pub fn gather_pending_transactions(&self, frame_number: u64) -> Transaction {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let mut t = Transaction::new();
        shared.merge_pending_transactions(&mut state, &mut t, frame_number);
        shared.finish(state);
        t
    }

    /// Attaches pacing info to the frame with `frame_number`.
    pub fn set_frame_timeline_info(&self, frame_number: u64, info: FrameTimelineInfo) {
        self.shared
            .state
            .lock()
            .pending_frame_timelines
            .push_back((frame_number, info));
    }

    pub fn last_acquired_frame_number(&self) -> u64 {
        self.shared.state.lock().last_acquired_frame_number
    }

    pub fn transform_hint(&self) -> u32 {
        self.shared.state.lock().transform_hint
    }

    /// Size the compositor currently shows.
    pub fn size(&self) -> Size {
        self.shared.state.lock().size
    }

    pub fn last_buffer_info(&self) -> LastBufferInfo {
        self.shared.state.lock().last_buffer_info
    }

    /// Whether the last acquired frame went out in its own transaction.
    pub fn applied_last_transaction(&self) -> bool {
        self.shared.state.lock().applied_last_transaction
    }

    pub fn is_same_surface(&self, surface: &SurfaceControl) -> bool {
        self.shared
            .state
            .lock()
            .surface
            .as_ref()
            .is_some_and(|current| current.is_same_surface(surface))
    }
}

impl Drop for BlastBufferQueue {
    fn drop(&mut self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.pending_transactions.is_empty() {
            error!(bbq = %shared.name, count = state.pending_transactions.len(), "applying pending transactions on drop");
            let mut t = Transaction::new();
            shared.merge_pending_transactions(&mut state, &mut t, u64::MAX);
            shared.composer.apply(t, true);
        }
        let ready = state.transaction_ready.take().zip(state.sync_transaction.take());
        shared.finish(state);
        if let Some((callback, transaction)) = ready {
            callback(transaction);
        }
        if let Err(err) = shared.consumer.disconnect() {
            debug!(bbq = %shared.name, %err, "consumer disconnect on drop");
        }
    }
}

impl fmt::Debug for BlastBufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlastBufferQueue")
            .field("name", &self.shared.name)
            .field("producer_id", &self.shared.producer_id)
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Drops the lock, then releases buffers collected while it was held.
    fn finish(&self, mut state: MutexGuard<'_, BlastState>) {
        let deferred = std::mem::take(&mut state.deferred_releases);
        drop(state);
        for data in deferred {
            let fence = data.acquire_fence.clone();
            data.release(fence, None);
        }
    }

    fn merge_pending_transactions(&self, state: &mut BlastState, t: &mut Transaction, frame_number: u64) {
        let mut overwritten = Vec::new();
        for (target, pending) in std::mem::take(&mut state.pending_transactions) {
            if frame_number < target {
                state.pending_transactions.push((target, pending));
            } else {
                overwritten.extend(t.merge_deferred(pending));
            }
        }
        self.dispose_overwritten(state, overwritten);
    }

    /// Our own buffers go straight back to the queue; anyone else's are
    /// released through their callback after unlocking.
    fn dispose_overwritten(&self, state: &mut BlastState, overwritten: Vec<BufferData>) {
        for data in overwritten {
            if data.producer_id == self.producer_id {
                let fence = data.acquire_fence.clone();
                self.release_buffer(state, data.release_callback_id(), fence);
            } else {
                state.deferred_releases.push(data);
            }
        }
    }

    fn consumer_release(&self, item: &BufferItem, fence: Fence) {
        if let Err(err) = self.consumer.release_buffer(item.slot, item.frame_number, fence) {
            debug!(bbq = %self.name, frame = item.frame_number, %err, "consumer release failed");
        }
    }

    fn on_frame_available(self: &Arc<Self>, item: &BufferItem) {
        let mut ready = None;
        let mut state = self.state.lock();
        let wait_for_callback = !state.synced_frame_numbers.is_empty();
        let sync_set = state.transaction_ready.is_some();
        trace!(bbq = %self.name, frame = item.frame_number, sync_set, wait_for_callback, "frame available");

        if sync_set {
            if !state.acquire_single_buffer {
                // Reusing the sync transaction: free the slot its old buffer holds.
                let surface = state.surface.as_ref().map(SurfaceControl::id);
                let previous = match (surface, state.sync_transaction.as_mut()) {
                    (Some(surface), Some(t)) => t.take_buffer(surface),
                    _ => None,
                };
                if let Some(data) = previous {
                    debug!(bbq = %self.name, frame = data.frame_number, "releasing previous buffer when syncing");
                    let fence = data.acquire_fence.clone();
                    self.release_buffer(&mut state, data.release_callback_id(), fence);
                }
            }
            if wait_for_callback {
                // An earlier sync is still uncommitted; drain what queued up
                // in between so the new sync catches this frame.
                while state.num_frame_available > 0 {
                    if !self.acquire_and_release_buffer(&mut state) {
                        break;
                    }
                }
            } else {
                while state.num_frame_available > 0 {
                    debug!(bbq = %self.name, "waiting until no queued buffers");
                    self.callback_cond.wait(&mut state);
                }
            }
        }

        state.num_frame_available += 1;
        if wait_for_callback && state.num_frame_available >= 2 {
            self.acquire_and_release_buffer(&mut state);
        }

        if sync_set {
            // Recorded before waiting so release callbacks leave this frame alone.
            state.synced_frame_numbers.insert(item.frame_number);
            loop {
                match self.acquire_next_buffer_locked(&mut state, true) {
                    Err(BlastError::NoBufferAvailable) => {
                        debug!(bbq = %self.name, "waiting for available buffer");
                        self.callback_cond.wait(&mut state);
                    }
                    Err(err) => {
                        error!(bbq = %self.name, %err, "failed to acquire a buffer for the sync transaction");
                        break;
                    }
                    Ok(()) => break,
                }
            }
            let committed = self.committed_thunk();
            if let Some(t) = state.sync_transaction.as_mut() {
                t.add_committed_callback(committed);
            }
            if state.acquire_single_buffer {
                ready = state.transaction_ready.take().zip(state.sync_transaction.take());
            }
        } else if !wait_for_callback {
            if let Err(err) = self.acquire_next_buffer_locked(&mut state, false) {
                if !err.is_no_buffer() {
                    error!(bbq = %self.name, %err, "failed to acquire next buffer");
                }
            }
        }
        self.finish(state);
        if let Some((callback, transaction)) = ready {
            callback(transaction);
        }
    }

    /// Acquires the next frame into the sync transaction (`into_sync`) or
    /// into a fresh transaction that is applied right away.
    fn acquire_next_buffer_locked(self: &Arc<Self>, state: &mut BlastState, into_sync: bool) -> BlastResult<()> {
        let mut sync = if into_sync { state.sync_transaction.take() } else { None };
        let result = match sync.as_mut() {
            Some(t) => self.acquire_into(state, t, false),
            None => self.acquire_into(state, &mut Transaction::new(), true),
        };
        if into_sync {
            state.sync_transaction = sync;
        }
        result
    }

    fn acquire_into(self: &Arc<Self>, state: &mut BlastState, t: &mut Transaction, apply: bool) -> BlastResult<()> {
        if state.num_acquired >= self.max_acquired + 2 {
            trace!(bbq = %self.name, acquired = state.num_acquired, "already acquired max frames");
            return Err(BlastError::NoBufferAvailable);
        }
        let Some(surface) = state.surface.as_ref().map(SurfaceControl::id) else {
            error!(bbq = %self.name, "no surface control");
            return Err(BlastError::NoSurface);
        };

        let (item, buffer) = loop {
            if state.num_frame_available == 0 {
                trace!(bbq = %self.name, "no available frames");
                return Err(BlastError::NoBufferAvailable);
            }
            let item = match self.consumer.acquire_buffer(0, 0)? {
                AcquireOutcome::Acquired(item) => item,
                AcquireOutcome::NoBufferAvailable | AcquireOutcome::PresentLater => {
                    trace!(bbq = %self.name, "consumer has no buffer for us");
                    return Err(BlastError::NoBufferAvailable);
                }
            };
            state.num_frame_available -= 1;
            let Some(buffer) = item.graphic_buffer.clone() else {
                self.consumer_release(&item, Fence::NO_FENCE);
                error!(bbq = %self.name, frame = item.frame_number, "acquired an empty buffer");
                return Err(BlastError::EmptyBuffer);
            };
            if state.reject_buffer(&item, &buffer) {
                error!(
                    bbq = %self.name,
                    active = ?state.size,
                    requested = ?state.requested_size,
                    buffer = ?Size::of_buffer(&item, &buffer),
                    transform = item.transform,
                    "rejecting buffer"
                );
                self.consumer_release(&item, Fence::NO_FENCE);
                continue;
            }
            break (item, buffer);
        };

        let frame_number = item.frame_number;
        state.num_acquired += 1;
        state.last_acquired_frame_number = frame_number;
        let release_id = ReleaseCallbackId {
            buffer_id: buffer.id(),
            frame_number,
        };
        state.submitted.insert(release_id, item.clone());

        let needs_disconnect = self.connection.lock().take_disconnect(frame_number);
        if state.requested_size == Size::of_buffer(&item, &buffer) || item.scaling_mode != ScalingMode::Freeze {
            state.size = state.requested_size;
        }
        let crop = compute_crop(&item, state.size);
        state.last_buffer_info = LastBufferInfo {
            has_buffer: true,
            width: buffer.width(),
            height: buffer.height(),
            transform: item.transform,
            scaling_mode: item.scaling_mode,
            crop,
        };
        let dequeue_time = self.dequeue_timestamps.lock().remove(&buffer.id());

        let mut overwritten = Vec::new();
        if let Some(old) = t.take_buffer(surface) {
            overwritten.push(old);
        }
        let layer = t.layer_mut(surface);
        layer.buffer = Some(BufferData {
            buffer,
            acquire_fence: item.fence.clone(),
            frame_number,
            producer_id: self.producer_id,
            dequeue_time,
            barrier_frame_number: None,
            release_callback: Some(self.release_thunk()),
        });
        layer.producer_disconnect |= needs_disconnect;
        layer.dataspace = Some(item.dataspace);
        layer.hdr_metadata = item.hdr_metadata;
        layer.surface_damage = Some(item.surface_damage.clone());
        if self.update_destination_frame {
            layer.destination_frame = Some(state.size.rect());
        } else {
            layer.ignore_destination_frame = Some(item.scaling_mode == ScalingMode::Freeze);
        }
        layer.crop = Some(crop);
        layer.transform = Some(item.transform);
        layer.transform_to_display_inverse = Some(item.transform_to_display_inverse);
        layer.auto_refresh = Some(item.auto_refresh);
        if !item.is_auto_timestamp {
            layer.desired_present_time = Some(item.timestamp);
        }

        while state
            .pending_frame_timelines
            .front()
            .is_some_and(|(frame, _)| *frame < frame_number)
        {
            if let Some((frame, info)) = state.pending_frame_timelines.pop_front() {
                trace!(bbq = %self.name, frame, vsync_id = info.vsync_id, "dropping stale frame timeline");
            }
        }
        if state
            .pending_frame_timelines
            .front()
            .is_some_and(|(frame, _)| *frame == frame_number)
        {
            layer.frame_timeline = state.pending_frame_timelines.pop_front().map(|(_, info)| info);
        }

        t.add_completed_callback(self.completed_thunk());
        state.surfaces_with_pending_callback.push_back(surface);

        self.dispose_overwritten(state, overwritten);
        self.merge_pending_transactions(state, t, frame_number);
        if apply {
            self.composer.apply(std::mem::take(t), true);
            state.applied_last_transaction = true;
            state.last_applied_frame_number = frame_number;
        } else {
            if let Some(data) = t.layer_mut(surface).buffer.as_mut() {
                data.barrier_frame_number = Some(state.last_applied_frame_number);
            }
            state.applied_last_transaction = false;
        }
        trace!(
            bbq = %self.name,
            frame_number,
            apply,
            size = ?state.size,
            pending = state.pending_transactions.len(),
            "acquired next buffer"
        );
        Ok(())
    }

    /// Takes the front frame and hands it straight back, never shown.
    fn acquire_and_release_buffer(&self, state: &mut BlastState) -> bool {
        match self.consumer.acquire_buffer(0, 0) {
            Ok(AcquireOutcome::Acquired(item)) => {
                state.num_frame_available = state.num_frame_available.saturating_sub(1);
                let fence = item.fence.clone();
                self.consumer_release(&item, fence);
                true
            }
            Ok(_) => {
                error!(bbq = %self.name, "nothing to acquire while draining the shadow queue");
                false
            }
            Err(err) => {
                error!(bbq = %self.name, %err, "failed to acquire while draining the shadow queue");
                false
            }
        }
    }

    fn flush_shadow_queue(self: &Arc<Self>, state: &mut BlastState) {
        trace!(bbq = %self.name, frames = state.num_frame_available, "flush shadow queue");
        for _ in 0..state.num_frame_available {
            // Failures are logged inside; the rest waits for the next release.
            let _ = self.acquire_next_buffer_locked(state, false);
        }
    }

    fn release_buffer(&self, state: &mut BlastState, id: ReleaseCallbackId, fence: Fence) {
        let Some(item) = state.submitted.remove(&id) else {
            return;
        };
        state.num_acquired = state.num_acquired.saturating_sub(1);
        trace!(bbq = %self.name, %id, "released");
        self.consumer_release(&item, fence);
        // A dropped buffer is released without its transaction ever committing.
        state.synced_frame_numbers.remove(&id.frame_number);
    }

    fn release_buffer_callback(self: &Arc<Self>, id: ReleaseCallbackId, fence: Fence, current_max: Option<usize>) {
        let mut state = self.state.lock();
        self.release_buffer_callback_locked(&mut state, id, fence, current_max, false);
        self.finish(state);
    }

    fn release_buffer_callback_locked(
        self: &Arc<Self>,
        state: &mut BlastState,
        id: ReleaseCallbackId,
        fence: Fence,
        current_max: Option<usize>,
        fake_release: bool,
    ) {
        trace!(bbq = %self.name, %id, fake_release, "release buffer callback");
        let is_egl = state
            .submitted
            .get(&id)
            .is_some_and(|item| item.api == Some(Api::Egl));
        if let Some(current_max) = current_max {
            state.current_max_acquired = current_max;
        }
        // EGL producers below the top refresh rate keep a few buffers back
        // so their latency does not grow.
        let hold = if is_egl {
            self.max_acquired.saturating_sub(state.current_max_acquired)
        } else {
            0
        };

        let known = state
            .pending_release
            .iter()
            .any(|(pending, pending_fence)| *pending == id && pending_fence.same_as(&fence));
        if !known {
            if fake_release {
                warn!(bbq = %self.name, frame = id.frame_number, "faking release callback from transaction completion");
            }
            state.pending_release.push_back((id, fence));
        }

        while state.pending_release.len() > hold {
            let Some((released, released_fence)) = state.pending_release.pop_front() else {
                break;
            };
            self.release_buffer(state, released, released_fence);
            // A sync still in flight picks up the next frame itself.
            if state.synced_frame_numbers.is_empty() {
                let _ = self.acquire_next_buffer_locked(state, false);
            }
        }
        self.callback_cond.notify_all();
    }

    fn transaction_committed_callback(self: &Arc<Self>, stats: &[SurfaceStats]) {
        let mut state = self.state.lock();
        trace!(bbq = %self.name, "transaction committed");
        match state.surfaces_with_pending_callback.front().copied() {
            Some(pending) => match find_stat(stats, pending) {
                Some(stat) => {
                    state.synced_frame_numbers.remove(&stat.frame_number);
                    if state.synced_frame_numbers.is_empty() {
                        self.flush_shadow_queue(&mut state);
                    }
                }
                None => error!(bbq = %self.name, "no stats for the pending surface in committed callback"),
            },
            None => error!(bbq = %self.name, "committed callback with no surface pending"),
        }
        self.finish(state);
    }

    fn transaction_callback(self: &Arc<Self>, stats: &[SurfaceStats]) {
        let mut state = self.state.lock();
        trace!(bbq = %self.name, "transaction completed");
        match state.surfaces_with_pending_callback.pop_front() {
            Some(pending) => match find_stat(stats, pending) {
                Some(stat) => {
                    if let Some(hint) = stat.transform_hint {
                        state.transform_hint = hint;
                        self.consumer.set_transform_hint(hint);
                        trace!(bbq = %self.name, hint, "updated transform hint");
                    }
                    let mut stale: Vec<ReleaseCallbackId> = state
                        .submitted
                        .keys()
                        .filter(|id| id.frame_number < stat.frame_number)
                        .copied()
                        .collect();
                    stale.sort_by_key(|id| id.frame_number);
                    let fence = stat.previous_release_fence.clone().unwrap_or(Fence::NO_FENCE);
                    for id in stale {
                        self.release_buffer_callback_locked(
                            &mut state,
                            id,
                            fence.clone(),
                            stat.current_max_acquired_buffer_count,
                            true,
                        );
                    }
                }
                None => error!(bbq = %self.name, "no stats for the pending surface in transaction callback"),
            },
            None => error!(bbq = %self.name, "transaction callback with no surface pending"),
        }
        self.finish(state);
    }

    fn committed_thunk(self: &Arc<Self>) -> TransactionCallback {
        let shared = Arc::clone(self);
        Box::new(move |stats: &[SurfaceStats]| shared.transaction_committed_callback(stats))
    }

    fn completed_thunk(self: &Arc<Self>) -> TransactionCallback {
        let shared = Arc::clone(self);
        Box::new(move |stats: &[SurfaceStats]| shared.transaction_callback(stats))
    }

    /// Does not keep the queue alive: once it is gone the client has
    /// already taken its buffers back.
    fn release_thunk(self: &Arc<Self>) -> ReleaseCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |id: ReleaseCallbackId, fence: Fence, current_max: Option<usize>| {
            match weak.upgrade() {
                Some(shared) => shared.release_buffer_callback(id, fence, current_max),
                None => trace!(%id, "release callback after the queue is gone"),
            }
        })
    }
}

fn find_stat(stats: &[SurfaceStats], surface: SurfaceId) -> Option<&SurfaceStats> {
    stats.iter().find(|stat| stat.surface == Some(surface))
}

fn compute_crop(item: &BufferItem, size: Size) -> Rect {
    if item.scaling_mode == ScalingMode::ScaleCrop {
        scale_down_crop(item.crop, size.width, size.height)
    } else {
        item.crop
    }
}

/// Trims `crop` symmetrically to the aspect ratio of a `width` x `height`
/// window.
fn scale_down_crop(crop: Rect, width: u32, height: u32) -> Rect {
    if width == 0 || height == 0 || crop.is_empty() {
        return crop;
    }
    let (width, height) = (i64::from(width), i64::from(height));
    let (crop_width, crop_height) = (i64::from(crop.width()), i64::from(crop.height()));
    let mut out = crop;
    if crop_width * height > crop_height * width {
        let dw = crop_width - crop_height * width / height;
        let half = dw / 2;
        out.left += half as i32;
        out.right -= (dw - half) as i32;
    } else if crop_width * height < crop_height * width {
        let dh = crop_height - crop_width * height / width;
        let half = dh / 2;
        out.top += half as i32;
        out.bottom -= (dh - half) as i32;
    }
    out
}

/// Registered with the consumer end; holds the queue weakly so the consumer
/// never keeps it alive.
struct FrameListener {
    shared: Weak<Shared>,
}

impl ConsumerListener for FrameListener {
    fn on_frame_available(&self, item: &BufferItem) {
        if let Some(shared) = self.shared.upgrade() {
            shared.connection.lock().last_frame_seen = item.frame_number;
            shared.on_frame_available(item);
        }
    }

    fn on_frame_replaced(&self, item: &BufferItem) {
        // Nothing to do: unacquired frames are only counted.
        trace!(frame = item.frame_number, "frame replaced");
    }

    fn on_frame_dequeued(&self, buffer_id: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dequeue_timestamps.lock().insert(buffer_id, Instant::now());
        }
    }

    fn on_frame_cancelled(&self, buffer_id: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dequeue_timestamps.lock().remove(&buffer_id);
        }
    }

    fn on_disconnect(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut connection = shared.connection.lock();
            let frame = connection.last_frame_seen;
            connection.disconnects.push_back(frame);
        }
    }
}
