//! Local objects the peer holds references to.
//!
//! Each node is addressed by the `{ptr, cookie}` pair handed to the peer.
//! A strong reference also counts as a weak one, so the node entry lives until
//! the weak count drains, while the object itself is only kept alive by the
//! strong owner slot.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use binder_wire::PtrCookie;
use parking_lot::Mutex;
use tracing::debug;

use crate::binder::Binder;
use crate::error::fatal;

const FIRST_NODE_PTR: u64 = 0x1000;
const NODE_PTR_STRIDE: u64 = 0x10;

struct NodeEntry {
    cookie: u64,
    strong: u32,
    weak: u32,
    object: Weak<dyn Binder>,
    owner: Option<Arc<dyn Binder>>,
}

struct NodeTableInner {
    nodes: HashMap<u64, NodeEntry>,
    by_cookie: HashMap<u64, u64>,
    next_ptr: u64,
}

pub struct NodeTable {
    inner: Mutex<NodeTableInner>,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self {
            inner: Mutex::new(NodeTableInner {
                nodes: HashMap::new(),
                by_cookie: HashMap::new(),
                next_ptr: FIRST_NODE_PTR,
            }),
        }
    }
}

fn cookie_of(object: &Arc<dyn Binder>) -> u64 {
    Arc::as_ptr(object) as *const () as usize as u64
}

impl NodeTable {
    /// Returns the node for `object`, creating it on first use.
    pub fn register(&self, object: &Arc<dyn Binder>) -> PtrCookie {
        let cookie = cookie_of(object);
        let mut inner = self.inner.lock();
        if let Some(&ptr) = inner.by_cookie.get(&cookie) {
            let live = inner
                .nodes
                .get(&ptr)
                .is_some_and(|node| node.object.upgrade().is_some());
            if live {
                return PtrCookie { ptr, cookie };
            }
        }
        let ptr = inner.next_ptr;
        inner.next_ptr += NODE_PTR_STRIDE;
        inner.nodes.insert(
            ptr,
            NodeEntry {
                cookie,
                strong: 0,
                weak: 0,
                object: Arc::downgrade(object),
                owner: None,
            },
        );
        inner.by_cookie.insert(cookie, ptr);
        debug!(ptr, cookie, "registered local node");
        PtrCookie { ptr, cookie }
    }

    pub fn inc_weak(&self, target: PtrCookie) {
        let mut inner = self.inner.lock();
        match inner.nodes.get_mut(&target.ptr) {
            Some(node) => node.weak += 1,
            None => fatal!("BR_INCREFS for unknown node {:#x}", target.ptr),
        }
    }

    /// Takes a strong reference on behalf of the peer.
    pub fn acquire(&self, target: PtrCookie) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(&target.ptr) else {
            fatal!("BR_ACQUIRE for unknown node {:#x}", target.ptr);
        };
        if node.cookie != target.cookie {
            fatal!(
                "BR_ACQUIRE: object {:#x} does not match cookie {:#x} (expected {:#x})",
                target.ptr,
                target.cookie,
                node.cookie
            );
        }
        if node.owner.is_none() {
            match node.object.upgrade() {
                Some(object) => node.owner = Some(object),
                None => fatal!("BR_ACQUIRE on destroyed node {:#x}", target.ptr),
            }
        }
        node.strong += 1;
        node.weak += 1;
    }

    /// Validates a release request before it is deferred.
    pub fn check_cookie(&self, target: PtrCookie) {
        let inner = self.inner.lock();
        match inner.nodes.get(&target.ptr) {
            Some(node) if node.cookie == target.cookie => {}
            Some(node) => fatal!(
                "BR_RELEASE: object {:#x} does not match cookie {:#x} (expected {:#x})",
                target.ptr,
                target.cookie,
                node.cookie
            ),
            None => fatal!("BR_RELEASE for unknown node {:#x}", target.ptr),
        }
    }

    /// Promotes a weak reference if the object is still alive.
    pub fn attempt_acquire(&self, target: PtrCookie) -> bool {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(&target.ptr) else {
            return false;
        };
        if node.cookie != target.cookie {
            return false;
        }
        let Some(object) = node.object.upgrade() else {
            return false;
        };
        node.owner.get_or_insert(object);
        node.strong += 1;
        node.weak += 1;
        true
    }

    /// Drops one strong reference; returns the owner once the last one goes.
    ///
    /// The matching weak decrement is left to the caller.
    pub fn dec_strong(&self, ptr: u64) -> Option<Arc<dyn Binder>> {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(&ptr) else {
            fatal!("strong decrement for unknown node {ptr:#x}");
        };
        if node.strong == 0 {
            fatal!("strong count underflow on node {ptr:#x}");
        }
        node.strong -= 1;
        if node.strong == 0 {
            node.owner.take()
        } else {
            None
        }
    }

    pub fn dec_weak(&self, ptr: u64) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(&ptr) else {
            fatal!("weak decrement for unknown node {ptr:#x}");
        };
        if node.weak == 0 {
            fatal!("weak count underflow on node {ptr:#x}");
        }
        node.weak -= 1;
        if node.weak == 0 && node.strong == 0 {
            let cookie = node.cookie;
            inner.nodes.remove(&ptr);
            if inner.by_cookie.get(&cookie) == Some(&ptr) {
                inner.by_cookie.remove(&cookie);
            }
            debug!(ptr, "removed local node");
        }
    }

    /// Object addressed by an inbound transaction, if it can still be used.
    pub fn promote(&self, ptr: u64, cookie: u64) -> Option<Arc<dyn Binder>> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(&ptr)?;
        if node.cookie != cookie {
            return None;
        }
        node.object.upgrade()
    }

    /// `(strong, weak)` counts held by the peer.
    pub fn counts(&self, ptr: u64) -> Option<(u32, u32)> {
        let inner = self.inner.lock();
        inner.nodes.get(&ptr).map(|node| (node.strong, node.weak))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
