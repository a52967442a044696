//! Deferred reference work.
//!
//! Releases requested by the peer are queued and applied only once the inbound
//! buffer is drained. Every pending weak decrement is applied before the next
//! strong one, and a strong decrement may queue more weak work while it runs,
//! so draining loops until both queues are empty.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;

/// A reference kept alive until the outbound buffer reaches the peer.
pub type Pin = Arc<dyn Any + Send + Sync>;
pub type WeakPin = Weak<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deref<T> {
    Weak(T),
    Strong(T),
}

#[derive(Debug)]
pub struct DerefQueues<T> {
    weak: VecDeque<T>,
    strong: VecDeque<T>,
}

impl<T> Default for DerefQueues<T> {
    fn default() -> Self {
        Self {
            weak: VecDeque::new(),
            strong: VecDeque::new(),
        }
    }
}

impl<T> DerefQueues<T> {
    pub fn push_weak(&mut self, item: T) {
        self.weak.push_back(item);
    }

    pub fn push_strong(&mut self, item: T) {
        self.strong.push_back(item);
    }

    pub fn is_empty(&self) -> bool {
        self.weak.is_empty() && self.strong.is_empty()
    }

    pub fn len(&self) -> usize {
        self.weak.len() + self.strong.len()
    }

    /// Moves everything queued in `other` behind this queue's entries.
    pub fn append(&mut self, other: &mut Self) {
        self.weak.append(&mut other.weak);
        self.strong.append(&mut other.strong);
    }

    /// Applies queued work in order; `apply` may queue more through the handle it gets.
    pub fn drain_with<F>(&mut self, mut apply: F)
    where
        F: FnMut(Deref<T>, &mut Self),
    {
        loop {
            while let Some(item) = self.weak.pop_front() {
                apply(Deref::Weak(item), self);
            }
            match self.strong.pop_front() {
                Some(item) => apply(Deref::Strong(item), self),
                None => break,
            }
        }
    }
}

/// Temporary references dropped once a write has been fully consumed.
#[derive(Default)]
pub struct PostWritePins {
    weak: SmallVec<[WeakPin; 4]>,
    strong: SmallVec<[Pin; 4]>,
}

impl PostWritePins {
    pub fn hold_weak(&mut self, pin: WeakPin) {
        self.weak.push(pin);
    }

    pub fn hold_strong(&mut self, pin: Pin) {
        self.strong.push(pin);
    }

    pub fn len(&self) -> usize {
        self.weak.len() + self.strong.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the weak pins first, then the strong ones.
    pub fn release(&mut self) {
        self.weak.clear();
        self.strong.clear();
    }
}
