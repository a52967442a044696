//! Values exchanged between producer, queue and consumer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

/// Fixed number of slots every queue has.
pub const NUM_BUFFER_SLOTS: usize = 64;
/// Two slots are always kept back from the consumer.
pub const MAX_MAX_ACQUIRED_BUFFERS: usize = NUM_BUFFER_SLOTS - 2;

pub type PixelFormat = i32;
pub const PIXEL_FORMAT_UNKNOWN: PixelFormat = 0;
pub const PIXEL_FORMAT_RGBA_8888: PixelFormat = 1;
pub const PIXEL_FORMAT_RGBX_8888: PixelFormat = 2;
pub const PIXEL_FORMAT_RGB_565: PixelFormat = 4;

pub type Dataspace = u32;
pub const DATASPACE_UNKNOWN: Dataspace = 0;

pub const TRANSFORM_FLIP_H: u32 = 0x01;
pub const TRANSFORM_FLIP_V: u32 = 0x02;
pub const TRANSFORM_ROT_90: u32 = 0x04;
pub const TRANSFORM_ROT_180: u32 = 0x03;
pub const TRANSFORM_ROT_270: u32 = 0x07;
/// Queue-input bit asking for the inverse of the display transform.
pub const TRANSFORM_INVERSE_DISPLAY: u32 = 0x08;

pub const USAGE_HW_TEXTURE: u64 = 0x100;
pub const USAGE_HW_COMPOSER: u64 = 0x800;

#[derive(Debug, Default)]
struct FenceState {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// A point in some device's work queue; the buffer is safe to touch once it
/// signals.
///
/// [`Fence::NO_FENCE`] stands for work that already finished. Clones share
/// the same signal.
#[derive(Clone, Debug, Default)]
pub struct Fence {
    state: Option<Arc<FenceState>>,
}

impl Fence {
    pub const NO_FENCE: Fence = Fence { state: None };

    /// A fence that signals when [`Fence::signal`] is called on any clone.
    pub fn pending() -> Self {
        Self {
            state: Some(Arc::new(FenceState::default())),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    pub fn signal(&self) {
        if let Some(state) = &self.state {
            *state.signaled.lock() = true;
            state.cond.notify_all();
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.state.as_ref().map_or(true, |state| *state.signaled.lock())
    }

    /// Waits up to `timeout`; true once signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let Some(state) = &self.state else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        let mut signaled = state.signaled.lock();
        while !*signaled {
            if state.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }

    /// Both handles refer to the same signal (or both are `NO_FENCE`).
    pub fn same_as(&self, other: &Fence) -> bool {
        match (&self.state, &other.state) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// An allocated graphics buffer. Identity is the process-unique `id`.
#[derive(Debug, PartialEq, Eq)]
pub struct GraphicBuffer {
    id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: u64,
    generation: u32,
}

impl GraphicBuffer {
    pub fn allocate(
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: u64,
        generation: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            usage,
            generation,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub fn generation_number(&self) -> u32 {
        self.generation
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width as i32, self.height as i32)
    }

    /// True when a request cannot be served by this allocation.
    pub fn needs_reallocation(&self, width: u32, height: u32, format: PixelFormat, usage: u64) -> bool {
        self.width != width
            || self.height != height
            || self.format != format
            || (self.usage & usage) != usage
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect::new(0, 0, 0, 0);
    pub const INVALID: Rect = Rect::new(0, 0, -1, -1);

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn is_valid(&self) -> bool {
        self.width() >= 0 && self.height() >= 0
    }

    /// The overlap of both rectangles; `EMPTY` when they do not meet.
    pub fn intersect(&self, other: &Rect) -> Rect {
        let out = Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        if out.is_empty() {
            Rect::EMPTY
        } else {
            out
        }
    }

    /// Whether cropping `bounds` by `self` leaves `self` unchanged.
    pub fn fits_within(&self, bounds: &Rect) -> bool {
        self.intersect(bounds) == *self
    }
}

/// Part of a frame that changed since the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Damage {
    /// Everything may have changed.
    #[default]
    Whole,
    Rects(SmallVec<[Rect; 4]>),
}

impl Damage {
    pub fn rect(rect: Rect) -> Self {
        Damage::Rects(smallvec::smallvec![rect])
    }

    /// Grows `self` to also cover `other`.
    pub fn merge(&mut self, other: &Damage) {
        match (&mut *self, other) {
            (Damage::Whole, _) => {}
            (_, Damage::Whole) => *self = Damage::Whole,
            (Damage::Rects(mine), Damage::Rects(theirs)) => mine.extend(theirs.iter().copied()),
        }
    }
}

/// How the compositor fits a buffer that does not match the window size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ScalingMode {
    /// Keep showing the old content until a buffer of the right size arrives.
    #[default]
    Freeze,
    ScaleToWindow,
    ScaleCrop,
    NoScaleCrop,
}

/// Which client API a producer connected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    Egl,
    Cpu,
    Media,
    Camera,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HdrMetadata {
    pub min_luminance: f32,
    pub max_luminance: f32,
    pub max_content_light_level: f32,
    pub max_frame_average_light_level: f32,
}

/// Where a slot currently lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BufferState {
    #[default]
    Free,
    Dequeued,
    Queued,
    Acquired,
}

/// A queued frame, as handed to the consumer.
#[derive(Debug, Clone)]
pub struct BufferItem {
    pub slot: usize,
    pub graphic_buffer: Option<Arc<GraphicBuffer>>,
    /// Signals once the producer finished writing.
    pub fence: Fence,
    pub crop: Rect,
    pub transform: u32,
    pub transform_to_display_inverse: bool,
    pub scaling_mode: ScalingMode,
    /// Requested present time in nanoseconds.
    pub timestamp: i64,
    pub is_auto_timestamp: bool,
    pub dataspace: Dataspace,
    pub hdr_metadata: Option<HdrMetadata>,
    pub frame_number: u64,
    /// May be replaced by a later frame before it is acquired.
    pub is_droppable: bool,
    /// The consumer already saw this slot's buffer.
    pub acquire_called: bool,
    pub surface_damage: Damage,
    pub auto_refresh: bool,
    pub queued_buffer: bool,
    /// The producer disconnected after queueing; the slot no longer backs it.
    pub is_stale: bool,
    pub api: Option<Api>,
}

impl BufferItem {
    pub fn buffer_id(&self) -> Option<u64> {
        self.graphic_buffer.as_ref().map(|buffer| buffer.id())
    }
}

/// Everything the producer says about a frame when queueing it.
#[derive(Debug, Clone)]
pub struct QueueBufferInput {
    pub timestamp: i64,
    pub is_auto_timestamp: bool,
    pub dataspace: Dataspace,
    pub crop: Rect,
    pub scaling_mode: ScalingMode,
    /// May include [`TRANSFORM_INVERSE_DISPLAY`].
    pub transform: u32,
    pub sticky_transform: u32,
    /// Required; `None` is rejected.
    pub fence: Option<Fence>,
    pub surface_damage: Damage,
    pub hdr_metadata: Option<HdrMetadata>,
}

impl QueueBufferInput {
    pub fn new(timestamp: i64, fence: Fence) -> Self {
        Self {
            timestamp,
            is_auto_timestamp: false,
            fence: Some(fence),
            ..Self::default()
        }
    }
}

impl Default for QueueBufferInput {
    fn default() -> Self {
        Self {
            timestamp: 0,
            is_auto_timestamp: true,
            dataspace: DATASPACE_UNKNOWN,
            crop: Rect::EMPTY,
            scaling_mode: ScalingMode::Freeze,
            transform: 0,
            sticky_transform: 0,
            fence: Some(Fence::NO_FENCE),
            surface_damage: Damage::Whole,
            hdr_metadata: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueBufferOutput {
    pub width: u32,
    pub height: u32,
    pub transform_hint: u32,
    pub num_pending_buffers: usize,
    pub next_frame_number: u64,
    /// The frame replaced an earlier droppable one still in the queue.
    pub buffer_replaced: bool,
    pub max_buffer_count: usize,
}

/// Extra information returned with a dequeued slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DequeueFlags(u32);

impl DequeueFlags {
    pub const NONE: DequeueFlags = DequeueFlags(0);
    /// The slot's buffer changed; call `request_buffer` before using it.
    pub const NEEDS_REALLOCATION: DequeueFlags = DequeueFlags(0x1);

    pub fn contains(self, other: DequeueFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for DequeueFlags {
    type Output = DequeueFlags;

    fn bitor(self, rhs: DequeueFlags) -> DequeueFlags {
        DequeueFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DequeueFlags {
    fn bitor_assign(&mut self, rhs: DequeueFlags) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone)]
pub struct DequeueOutput {
    pub slot: usize,
    /// The producer must wait on this before writing.
    pub fence: Fence,
    pub flags: DequeueFlags,
    /// Frames since this buffer's content was last queued; 0 when fresh.
    pub buffer_age: u64,
}

/// Result of `acquire_buffer`. Only `Acquired` changes queue state.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired(BufferItem),
    /// Nothing queued, or the consumer already holds all it may.
    NoBufferAvailable,
    /// The front frame wants to be shown later than the given present time.
    PresentLater,
}

impl AcquireOutcome {
    pub fn into_item(self) -> Option<BufferItem> {
        match self {
            AcquireOutcome::Acquired(item) => Some(item),
            AcquireOutcome::NoBufferAvailable | AcquireOutcome::PresentLater => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pending_fence_signals_across_clones() {
        let fence = Fence::pending();
        let clone = fence.clone();
        assert!(!fence.is_signaled());
        assert!(fence.same_as(&clone));
        assert!(!fence.same_as(&Fence::NO_FENCE));
        let waiter = thread::spawn(move || clone.wait(Duration::from_secs(5)));
        fence.signal();
        assert!(waiter.join().expect("waiter"));
        assert!(Fence::NO_FENCE.wait(Duration::ZERO));
    }

    #[test]
    fn unsignalled_fence_wait_times_out() {
        assert!(!Fence::pending().wait(Duration::from_millis(5)));
    }

    #[test]
    fn crop_must_fit_inside_the_buffer() {
        let bounds = Rect::from_size(100, 50);
        assert!(Rect::EMPTY.fits_within(&bounds));
        assert!(Rect::new(10, 10, 100, 50).fits_within(&bounds));
        assert!(!Rect::new(10, 10, 101, 50).fits_within(&bounds));
        assert_eq!(Rect::new(90, 40, 120, 60).intersect(&bounds), Rect::new(90, 40, 100, 50));
    }

    #[test]
    fn whole_damage_absorbs_rects() {
        let mut damage = Damage::rect(Rect::from_size(4, 4));
        damage.merge(&Damage::rect(Rect::new(4, 4, 8, 8)));
        assert!(matches!(&damage, Damage::Rects(rects) if rects.len() == 2));
        damage.merge(&Damage::Whole);
        assert_eq!(damage, Damage::Whole);
    }

    #[test]
    fn reallocation_follows_size_format_and_missing_usage() {
        let buffer = GraphicBuffer::allocate(64, 32, PIXEL_FORMAT_RGBA_8888, 0b0110, 0);
        assert!(!buffer.needs_reallocation(64, 32, PIXEL_FORMAT_RGBA_8888, 0b0010));
        assert!(buffer.needs_reallocation(64, 32, PIXEL_FORMAT_RGBA_8888, 0b1000));
        assert!(buffer.needs_reallocation(32, 32, PIXEL_FORMAT_RGBA_8888, 0));
        assert!(buffer.needs_reallocation(64, 32, PIXEL_FORMAT_RGB_565, 0));
        let other = GraphicBuffer::allocate(64, 32, PIXEL_FORMAT_RGBA_8888, 0, 0);
        assert_ne!(buffer.id(), other.id());
    }
}
