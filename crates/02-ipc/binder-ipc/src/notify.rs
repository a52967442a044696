//! Death and freeze subscriptions on remote handles, keyed by the cookie the
//! peer echoes back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::binder::{DeathRecipient, FrozenStateListener};

struct Subscription<L: ?Sized> {
    handle: u32,
    listener: Arc<L>,
    clearing: bool,
}

pub struct NotificationRegistry {
    next_cookie: AtomicU64,
    deaths: Mutex<HashMap<u64, Subscription<dyn DeathRecipient>>>,
    freezes: Mutex<HashMap<u64, Subscription<dyn FrozenStateListener>>>,
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self {
            next_cookie: AtomicU64::new(1),
            deaths: Mutex::new(HashMap::new()),
            freezes: Mutex::new(HashMap::new()),
        }
    }
}

impl NotificationRegistry {
    pub fn add_death(&self, handle: u32, recipient: Arc<dyn DeathRecipient>) -> u64 {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        self.deaths.lock().insert(
            cookie,
            Subscription {
                handle,
                listener: recipient,
                clearing: false,
            },
        );
        cookie
    }

    pub fn add_freeze(&self, handle: u32, listener: Arc<dyn FrozenStateListener>) -> u64 {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        self.freezes.lock().insert(
            cookie,
            Subscription {
                handle,
                listener,
                clearing: false,
            },
        );
        cookie
    }

    /// Marks a death subscription as being cleared; returns its handle.
    pub fn begin_clear_death(&self, cookie: u64) -> Option<u32> {
        let mut deaths = self.deaths.lock();
        let sub = deaths.get_mut(&cookie)?;
        sub.clearing = true;
        Some(sub.handle)
    }

    pub fn begin_clear_freeze(&self, cookie: u64) -> Option<u32> {
        let mut freezes = self.freezes.lock();
        let sub = freezes.get_mut(&cookie)?;
        sub.clearing = true;
        Some(sub.handle)
    }

    /// Drops a subscription in case the request never reached the peer.
    pub fn forget_death(&self, cookie: u64) {
        self.deaths.lock().remove(&cookie);
    }

    pub fn forget_freeze(&self, cookie: u64) {
        self.freezes.lock().remove(&cookie);
    }

    /// Recipient to notify for a dead handle. The entry stays until cleared.
    pub fn obituary(&self, cookie: u64) -> Option<(u32, Arc<dyn DeathRecipient>)> {
        let deaths = self.deaths.lock();
        let sub = deaths.get(&cookie)?;
        Some((sub.handle, Arc::clone(&sub.listener)))
    }

    pub fn frozen_listener(&self, cookie: u64) -> Option<(u32, Arc<dyn FrozenStateListener>)> {
        let freezes = self.freezes.lock();
        let sub = freezes.get(&cookie)?;
        Some((sub.handle, Arc::clone(&sub.listener)))
    }

    /// The peer confirmed a clear; returns whether a clear was pending.
    pub fn finish_clear_death(&self, cookie: u64) -> bool {
        self.deaths
            .lock()
            .remove(&cookie)
            .is_some_and(|sub| sub.clearing)
    }

    pub fn finish_clear_freeze(&self, cookie: u64) -> bool {
        self.freezes
            .lock()
            .remove(&cookie)
            .is_some_and(|sub| sub.clearing)
    }

    pub fn death_count(&self) -> usize {
        self.deaths.lock().len()
    }

    pub fn freeze_count(&self) -> usize {
        self.freezes.lock().len()
    }
}
