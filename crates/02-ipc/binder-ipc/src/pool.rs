//! Thread pool bookkeeping: how many threads serve the peer, how many are
//! busy, and how long the pool has been saturated.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::config::IpcConfig;
use crate::error::fatal;

#[derive(Debug, Default)]
struct SlotState {
    executing: usize,
    waiting: usize,
    /// Set while every slot is busy.
    starvation_start: Option<Instant>,
}

pub struct ThreadPool {
    max_threads: AtomicUsize,
    started: AtomicBool,
    /// Threads currently inside the pool loop.
    current: AtomicUsize,
    /// Threads started at the peer's request.
    kernel_started: AtomicUsize,
    seq: AtomicU32,
    slots: Mutex<SlotState>,
    available: Condvar,
    starvation_threshold: Duration,
    wait_log_interval: Duration,
}

impl ThreadPool {
    pub fn new(config: &IpcConfig) -> Self {
        Self {
            max_threads: AtomicUsize::new(config.max_threads),
            started: AtomicBool::new(false),
            current: AtomicUsize::new(0),
            kernel_started: AtomicUsize::new(0),
            seq: AtomicU32::new(0),
            slots: Mutex::new(SlotState::default()),
            available: Condvar::new(),
            starvation_threshold: config.starvation_threshold(),
            wait_log_interval: config.thread_wait_log_interval(),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_threads(&self, max_threads: usize) {
        self.max_threads.store(max_threads, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Flips the pool to started; false if it already was.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    pub fn executing(&self) -> usize {
        self.slots.lock().executing
    }

    pub fn current_threads(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn kernel_started_threads(&self) -> usize {
        self.kernel_started.load(Ordering::Acquire)
    }

    pub(crate) fn thread_joined(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn thread_left(&self) {
        let old = self.current.fetch_sub(1, Ordering::AcqRel);
        if old == 0 {
            fatal!(
                "thread pool count underflowed: a thread cannot exit an empty pool \
                 (raise the configured max threads)"
            );
        }
    }

    pub(crate) fn kernel_thread_spawned(&self) {
        self.kernel_started.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::AcqRel)
    }

    /// Upper bound on threads that may serve the peer at once.
    pub fn max_total_thread_count(&self) -> usize {
        let kernel_started = self.kernel_started_threads();
        if self.is_started() {
            let max = self.max_threads();
            if kernel_started > max + 1 {
                fatal!("too many kernel-started threads: {kernel_started} > {max} + 1");
            }
            let current = self.current_threads();
            // One thread from starting the pool plus whatever the peer may ask for.
            let mut threads = 1 + max;
            if current > kernel_started {
                threads += current - kernel_started;
            }
            return threads;
        }
        if kernel_started != 0 {
            fatal!("expected no kernel-started threads but have {kernel_started}");
        }
        self.current_threads()
    }

    /// Marks one more thread as executing a command.
    pub fn acquire_slot(&self) {
        let saturated = {
            let mut slots = self.slots.lock();
            slots.executing += 1;
            slots.executing >= self.max_threads()
        };
        if saturated {
            self.on_saturated();
        }
    }

    /// Marks a thread as done; returns the starvation it ended, if any.
    pub fn release_slot(&self) -> Option<Duration> {
        let (unsaturated, waiting) = {
            let mut slots = self.slots.lock();
            match slots.executing.checked_sub(1) {
                Some(executing) => slots.executing = executing,
                None => fatal!("executing thread count underflowed"),
            }
            (slots.executing < self.max_threads(), slots.waiting)
        };
        let starved = if unsaturated { self.on_unsaturated() } else { None };
        if waiting > 0 {
            self.available.notify_all();
        }
        starved
    }

    /// Starts the starvation timer unless one is already running.
    pub fn on_saturated(&self) {
        let mut slots = self.slots.lock();
        if slots.starvation_start.is_none() {
            slots.starvation_start = Some(Instant::now());
        }
    }

    /// Stops the starvation timer, reporting how long it ran.
    pub fn on_unsaturated(&self) -> Option<Duration> {
        let start = self.slots.lock().starvation_start.take()?;
        let starved = start.elapsed();
        if starved > self.starvation_threshold {
            error!(
                "binder thread pool ({} threads) starved for {} ms",
                self.max_threads(),
                starved.as_millis()
            );
        }
        Some(starved)
    }

    pub fn is_starving(&self) -> bool {
        self.slots.lock().starvation_start.is_some()
    }

    /// Waits until fewer than the maximum threads are executing.
    pub fn block_until_thread_available(&self) {
        let mut slots = self.slots.lock();
        slots.waiting += 1;
        while slots.executing >= self.max_threads() {
            warn!(
                executing = slots.executing,
                max = self.max_threads(),
                "waiting for a binder thread to be free"
            );
            self.available.wait_for(&mut slots, self.wait_log_interval);
        }
        slots.waiting -= 1;
    }
}
