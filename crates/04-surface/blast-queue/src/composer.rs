//! The compositor seam.
//!
//! [`RecordingComposer`] stands in for a real compositor in tests and tools:
//! applied transactions land on a channel, and the caller decides when each
//! one is presented or dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use buffer_queue::Fence;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::transaction::{BufferData, SurfaceId, SurfaceStats, Transaction};

pub trait Composer: Send + Sync {
    /// Takes ownership of `transaction`.
    ///
    /// Must not block, and must not run any of the transaction's callbacks
    /// before returning; callers may hold their own locks.
    fn apply(&self, transaction: Transaction, one_way: bool);
}

/// A transaction as it reached the compositor.
#[derive(Debug)]
pub struct AppliedTransaction {
    pub transaction: Transaction,
    pub one_way: bool,
}

#[derive(Debug)]
pub struct RecordingComposer {
    tx: Sender<AppliedTransaction>,
    rx: Receiver<AppliedTransaction>,
    /// Buffer on screen per surface.
    current: Mutex<HashMap<SurfaceId, BufferData>>,
    current_max_acquired: Mutex<Option<usize>>,
    clock: AtomicI64,
}

impl Default for RecordingComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingComposer {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            current: Mutex::new(HashMap::new()),
            current_max_acquired: Mutex::new(None),
            clock: AtomicI64::new(0),
        }
    }

    /// Reported to release callbacks, as a compositor running below its
    /// top refresh rate would.
    pub fn set_current_max_acquired(&self, count: Option<usize>) {
        *self.current_max_acquired.lock() = count;
    }

    pub fn try_next(&self) -> Option<AppliedTransaction> {
        self.rx.try_recv().ok()
    }

    pub fn next_timeout(&self, timeout: Duration) -> Option<AppliedTransaction> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Transactions applied but not yet taken.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Latches every buffer in `transaction` and reports it presented.
    ///
    /// The buffer each one replaces is released first, then committed
    /// callbacks run, then completed callbacks.
    pub fn present(&self, mut transaction: Transaction) {
        let latch_time = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let current_max = *self.current_max_acquired.lock();
        let mut stats = Vec::new();
        let mut released = Vec::new();
        {
            let mut current = self.current.lock();
            for (surface, mut layer) in transaction.take_layers() {
                let mut stat = SurfaceStats {
                    surface: Some(surface),
                    current_max_acquired_buffer_count: current_max,
                    ..SurfaceStats::default()
                };
                if let Some(data) = layer.buffer.take() {
                    stat.frame_number = data.frame_number;
                    stat.latch_time = latch_time;
                    if let Some(old) = current.insert(surface, data) {
                        stat.previous_release_fence = Some(Fence::NO_FENCE);
                        released.push(old);
                    }
                }
                stats.push(stat);
            }
        }
        trace!(latch_time, surfaces = stats.len(), released = released.len(), "present");
        for old in released {
            old.release(Fence::NO_FENCE, current_max);
        }
        for callback in transaction.take_committed_callbacks() {
            callback(&stats);
        }
        for callback in transaction.take_completed_callbacks() {
            callback(&stats);
        }
    }

    /// Drops the transaction unseen: every buffer in it is released at once
    /// and only completed callbacks run, with nothing latched.
    pub fn discard(&self, mut transaction: Transaction) {
        let current_max = *self.current_max_acquired.lock();
        let mut stats = Vec::new();
        for (surface, mut layer) in transaction.take_layers() {
            if let Some(data) = layer.buffer.take() {
                stats.push(SurfaceStats {
                    surface: Some(surface),
                    frame_number: data.frame_number,
                    current_max_acquired_buffer_count: current_max,
                    ..SurfaceStats::default()
                });
                data.release(Fence::NO_FENCE, current_max);
            }
        }
        for callback in transaction.take_completed_callbacks() {
            callback(&stats);
        }
    }

    /// Frame number on screen for `surface`.
    pub fn current_frame(&self, surface: SurfaceId) -> Option<u64> {
        self.current.lock().get(&surface).map(|data| data.frame_number)
    }

    /// Takes the surface off screen and releases its buffer.
    pub fn remove_surface(&self, surface: SurfaceId) {
        let removed = self.current.lock().remove(&surface);
        if let Some(data) = removed {
            data.release(Fence::NO_FENCE, None);
        }
    }
}

impl Composer for RecordingComposer {
    fn apply(&self, transaction: Transaction, one_way: bool) {
        trace!(id = transaction.id(), one_way, "apply");
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.tx.send(AppliedTransaction { transaction, one_way });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::ReleaseCallbackId;
    use buffer_queue::{GraphicBuffer, PIXEL_FORMAT_RGBA_8888};
    use std::sync::Arc;

    fn data(frame_number: u64, released: &Arc<Mutex<Vec<(u64, Option<usize>)>>>) -> BufferData {
        let released = Arc::clone(released);
        BufferData {
            buffer: GraphicBuffer::allocate(4, 4, PIXEL_FORMAT_RGBA_8888, 0, 0),
            acquire_fence: Fence::NO_FENCE,
            frame_number,
            producer_id: 0,
            dequeue_time: None,
            barrier_frame_number: None,
            release_callback: Some(Arc::new(move |id: ReleaseCallbackId, _fence: Fence, max: Option<usize>| {
                released.lock().push((id.frame_number, max))
            })),
        }
    }

    #[test]
    fn presenting_releases_the_previous_buffer() {
        let composer = RecordingComposer::new();
        let released = Arc::new(Mutex::new(Vec::new()));
        let surface = SurfaceId(3);
        composer.set_current_max_acquired(Some(2));

        for frame in 1..=2 {
            let mut t = Transaction::new();
            t.set_buffer(surface, data(frame, &released));
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            t.add_completed_callback(Box::new(move |stats: &[SurfaceStats]| {
                sink.lock().extend(stats.iter().map(|s| s.frame_number));
            }));
            composer.apply(t, true);
            let applied = composer.try_next().expect("applied");
            assert!(applied.one_way);
            composer.present(applied.transaction);
            assert_eq!(*seen.lock(), vec![frame]);
        }
        assert_eq!(*released.lock(), vec![(1, Some(2))]);
        assert_eq!(composer.current_frame(surface), Some(2));
        composer.remove_surface(surface);
        assert_eq!(released.lock().len(), 2);
    }

    #[test]
    fn discarded_buffers_come_straight_back() {
        let composer = RecordingComposer::new();
        let released = Arc::new(Mutex::new(Vec::new()));
        let mut t = Transaction::new();
        t.set_buffer(SurfaceId(1), data(9, &released));
        composer.discard(t);
        assert_eq!(*released.lock(), vec![(9, None)]);
        assert_eq!(composer.current_frame(SurfaceId(1)), None);
        assert!(composer.try_next().is_none());
    }
}
