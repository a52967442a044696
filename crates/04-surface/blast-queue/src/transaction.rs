//! Compositor transactions: per-surface state changes applied atomically.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use buffer_queue::{Damage, Dataspace, Fence, GraphicBuffer, HdrMetadata, Rect};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Compositor-side layer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub u64);

/// Handle to a compositor layer, as handed out by the window manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceControl {
    id: SurfaceId,
    transform_hint: u32,
}

impl SurfaceControl {
    pub fn new(id: u64) -> Self {
        Self {
            id: SurfaceId(id),
            transform_hint: 0,
        }
    }

    pub fn with_transform_hint(mut self, hint: u32) -> Self {
        self.transform_hint = hint;
        self
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn transform_hint(&self) -> u32 {
        self.transform_hint
    }

    pub fn is_same_surface(&self, other: &SurfaceControl) -> bool {
        self.id == other.id
    }
}

/// Names one submitted buffer for its release callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReleaseCallbackId {
    pub buffer_id: u64,
    pub frame_number: u64,
}

impl fmt::Display for ReleaseCallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.buffer_id, self.frame_number)
    }
}

/// Called once the compositor is done with a buffer. The last argument is the
/// compositor's current max-acquired count, when it reports one.
pub type ReleaseCallback = Arc<dyn Fn(ReleaseCallbackId, Fence, Option<usize>) + Send + Sync>;

/// Per-surface result handed to transaction callbacks.
#[derive(Debug, Clone, Default)]
pub struct SurfaceStats {
    pub surface: Option<SurfaceId>,
    /// Frame number of the buffer latched on this surface, 0 without one.
    pub frame_number: u64,
    /// Zero when nothing was latched.
    pub latch_time: i64,
    pub transform_hint: Option<u32>,
    /// Fence for the buffer this one replaced on screen.
    pub previous_release_fence: Option<Fence>,
    pub current_max_acquired_buffer_count: Option<usize>,
}

pub type TransactionCallback = Box<dyn FnOnce(&[SurfaceStats]) + Send>;

/// Frame pacing hints forwarded with a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTimelineInfo {
    pub vsync_id: i64,
    pub input_event_id: i32,
}

/// A buffer set on a surface, with what the compositor needs to return it.
pub struct BufferData {
    pub buffer: Arc<GraphicBuffer>,
    pub acquire_fence: Fence,
    pub frame_number: u64,
    pub producer_id: u32,
    pub dequeue_time: Option<Instant>,
    /// Do not latch before this frame of the same producer was applied.
    pub barrier_frame_number: Option<u64>,
    pub release_callback: Option<ReleaseCallback>,
}

impl BufferData {
    pub fn release_callback_id(&self) -> ReleaseCallbackId {
        ReleaseCallbackId {
            buffer_id: self.buffer.id(),
            frame_number: self.frame_number,
        }
    }

    /// Hands the buffer back through its release callback.
    pub fn release(self, fence: Fence, current_max_acquired: Option<usize>) {
        let id = self.release_callback_id();
        if let Some(callback) = self.release_callback {
            callback(id, fence, current_max_acquired);
        }
    }
}

impl fmt::Debug for BufferData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferData")
            .field("buffer_id", &self.buffer.id())
            .field("frame_number", &self.frame_number)
            .field("producer_id", &self.producer_id)
            .field("barrier_frame_number", &self.barrier_frame_number)
            .finish_non_exhaustive()
    }
}

/// Pending changes to one surface. `None` fields leave the current value alone.
#[derive(Debug, Default)]
pub struct LayerState {
    pub buffer: Option<BufferData>,
    pub destination_frame: Option<Rect>,
    pub crop: Option<Rect>,
    pub transform: Option<u32>,
    pub transform_to_display_inverse: Option<bool>,
    pub dataspace: Option<Dataspace>,
    pub hdr_metadata: Option<HdrMetadata>,
    pub surface_damage: Option<Damage>,
    pub auto_refresh: Option<bool>,
    pub desired_present_time: Option<i64>,
    pub frame_timeline: Option<FrameTimelineInfo>,
    pub enable_backpressure: Option<bool>,
    pub ignore_destination_frame: Option<bool>,
    /// The producer disconnected before this buffer was queued.
    pub producer_disconnect: bool,
}

macro_rules! take_if_set {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

impl LayerState {
    /// Applies `other` on top; a buffer it overwrites is pushed to `overwritten`.
    fn merge(&mut self, other: LayerState, overwritten: &mut Vec<BufferData>) {
        if let Some(buffer) = other.buffer {
            if let Some(old) = self.buffer.replace(buffer) {
                overwritten.push(old);
            }
        }
        take_if_set!(
            self,
            other,
            destination_frame,
            crop,
            transform,
            transform_to_display_inverse,
            dataspace,
            hdr_metadata,
            surface_damage,
            auto_refresh,
            desired_present_time,
            frame_timeline,
            enable_backpressure,
            ignore_destination_frame,
        );
        self.producer_disconnect |= other.producer_disconnect;
    }
}

/// A set of surface changes plus the callbacks to run once they take effect.
pub struct Transaction {
    id: u64,
    layers: BTreeMap<SurfaceId, LayerState>,
    committed: Vec<TransactionCallback>,
    completed: Vec<TransactionCallback>,
    merged_ids: Vec<u64>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            layers: BTreeMap::new(),
            committed: Vec::new(),
            completed: Vec::new(),
            merged_ids: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ids of every transaction merged into this one.
    pub fn merged_ids(&self) -> &[u64] {
        &self.merged_ids
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.committed.is_empty() && self.completed.is_empty()
    }

    pub fn layer(&self, surface: SurfaceId) -> Option<&LayerState> {
        self.layers.get(&surface)
    }

    pub fn layer_mut(&mut self, surface: SurfaceId) -> &mut LayerState {
        self.layers.entry(surface).or_default()
    }

    pub fn surfaces(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.layers.keys().copied()
    }

    /// Frame number of the buffer set on `surface`, if any.
    pub fn buffer_frame(&self, surface: SurfaceId) -> Option<u64> {
        self.layer(surface)?.buffer.as_ref().map(|data| data.frame_number)
    }

    /// Sets a buffer, releasing whichever buffer it replaces.
    pub fn set_buffer(&mut self, surface: SurfaceId, data: BufferData) {
        if let Some(old) = self.layer_mut(surface).buffer.replace(data) {
            let fence = old.acquire_fence.clone();
            old.release(fence, None);
        }
    }

    /// Takes the buffer back out without releasing it.
    pub fn take_buffer(&mut self, surface: SurfaceId) -> Option<BufferData> {
        self.layers.get_mut(&surface)?.buffer.take()
    }

    /// Runs once the compositor has taken the transaction into its next frame.
    pub fn add_committed_callback(&mut self, callback: TransactionCallback) {
        self.committed.push(callback);
    }

    /// Runs once the transaction has been latched and presented.
    pub fn add_completed_callback(&mut self, callback: TransactionCallback) {
        self.completed.push(callback);
    }

    pub fn take_committed_callbacks(&mut self) -> Vec<TransactionCallback> {
        std::mem::take(&mut self.committed)
    }

    pub fn take_completed_callbacks(&mut self) -> Vec<TransactionCallback> {
        std::mem::take(&mut self.completed)
    }

    /// Drains every surface's pending state.
    pub fn take_layers(&mut self) -> BTreeMap<SurfaceId, LayerState> {
        std::mem::take(&mut self.layers)
    }

    /// Moves `other` into `self`. A buffer that gets overwritten is released
    /// with its acquire fence.
    pub fn merge(&mut self, other: Transaction) {
        for old in self.merge_deferred(other) {
            let fence = old.acquire_fence.clone();
            old.release(fence, None);
        }
    }

    /// Like [`merge`](Self::merge), but returns overwritten buffers for the
    /// caller to release once it no longer holds its own locks.
    pub(crate) fn merge_deferred(&mut self, mut other: Transaction) -> Vec<BufferData> {
        let mut overwritten = Vec::new();
        for (surface, state) in other.take_layers() {
            self.layer_mut(surface).merge(state, &mut overwritten);
        }
        self.committed.append(&mut other.committed);
        self.completed.append(&mut other.completed);
        self.merged_ids.push(other.id);
        self.merged_ids.append(&mut other.merged_ids);
        overwritten
    }

    pub fn clear(&mut self) {
        self.layers.clear();
        self.committed.clear();
        self.completed.clear();
        self.merged_ids.clear();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("layers", &self.layers)
            .field("committed", &self.committed.len())
            .field("completed", &self.completed.len())
            .field("merged_ids", &self.merged_ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer_queue::PIXEL_FORMAT_RGBA_8888;
    use parking_lot::Mutex;

    fn data(frame_number: u64, released: &Arc<Mutex<Vec<u64>>>) -> BufferData {
        let released = Arc::clone(released);
        BufferData {
            buffer: GraphicBuffer::allocate(4, 4, PIXEL_FORMAT_RGBA_8888, 0, 0),
            acquire_fence: Fence::NO_FENCE,
            frame_number,
            producer_id: 0,
            dequeue_time: None,
            barrier_frame_number: None,
            release_callback: Some(Arc::new(move |id: ReleaseCallbackId, _fence: Fence, _max: Option<usize>| {
                released.lock().push(id.frame_number)
            })),
        }
    }

    #[test]
    fn merge_overrides_set_fields_only() {
        let surface = SurfaceId(1);
        let mut base = Transaction::new();
        base.layer_mut(surface).crop = Some(Rect::from_size(2, 2));
        base.layer_mut(surface).transform = Some(4);

        let mut other = Transaction::new();
        other.layer_mut(surface).crop = Some(Rect::from_size(3, 3));
        other.layer_mut(SurfaceId(2)).auto_refresh = Some(true);
        let other_id = other.id();
        base.merge(other);

        let layer = base.layer(surface).expect("layer");
        assert_eq!(layer.crop, Some(Rect::from_size(3, 3)));
        assert_eq!(layer.transform, Some(4));
        assert_eq!(base.layer(SurfaceId(2)).and_then(|l| l.auto_refresh), Some(true));
        assert_eq!(base.merged_ids(), &[other_id]);
    }

    #[test]
    fn overwritten_buffer_is_released() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let surface = SurfaceId(7);
        let mut base = Transaction::new();
        base.set_buffer(surface, data(1, &released));
        let mut other = Transaction::new();
        other.set_buffer(surface, data(2, &released));
        base.merge(other);
        assert_eq!(*released.lock(), vec![1]);
        assert_eq!(base.buffer_frame(surface), Some(2));

        base.set_buffer(surface, data(3, &released));
        assert_eq!(*released.lock(), vec![1, 2]);
        let taken = base.take_buffer(surface).expect("buffer");
        assert_eq!(taken.frame_number, 3);
        assert_eq!(*released.lock(), vec![1, 2]);
    }

    #[test]
    fn callbacks_travel_with_merges() {
        let mut base = Transaction::new();
        let mut other = Transaction::new();
        other.add_committed_callback(Box::new(|_: &[SurfaceStats]| {}));
        other.add_completed_callback(Box::new(|_: &[SurfaceStats]| {}));
        base.merge(other);
        assert_eq!(base.take_committed_callbacks().len(), 1);
        assert_eq!(base.take_completed_callbacks().len(), 1);
        assert!(base.is_empty());
    }
}
