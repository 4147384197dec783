//! Cooperative cancellation fabric.
//!
//! Long-lived owners (a resolver, a server) keep a registry of everything
//! that might be blocked on their behalf; teardown broadcasts `cancel_all`
//! and every registered handle unblocks within a bounded wake latency.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

/// An object whose outstanding blocking operations can be aborted.
///
/// `cancel` must be idempotent, non-blocking, callable from any thread, and
/// must never panic.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

/// Registry of weak handles to cancellable objects.
///
/// Handles unregister themselves when their owner is torn down in an orderly
/// fashion; dead handles left behind are pruned on the next registration.
#[derive(Default)]
pub struct CancellableRegistry {
    inner: Mutex<Registered>,
}

#[derive(Default)]
struct Registered {
    next_id: u64,
    handles: HashMap<u64, Weak<dyn Cancellable>>,
}

impl CancellableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handle and returns the id used to unregister it.
    pub fn register(&self, handle: Weak<dyn Cancellable>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.handles.retain(|_, h| h.strong_count() > 0);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handles.insert(id, handle);
        id
    }

    /// Removes a handle; unknown ids are ignored.
    pub fn unregister(&self, id: u64) {
        self.inner.lock().unwrap().handles.remove(&id);
    }

    /// Cancels every currently registered handle.
    ///
    /// The live handles are collected first so the cancel calls run without
    /// holding the registry lock; a handle may unregister itself concurrently.
    pub fn cancel_all(&self) {
        let live: Vec<_> = {
            let inner = self.inner.lock().unwrap();
            inner.handles.values().filter_map(|h| h.upgrade()).collect()
        };
        for handle in live {
            handle.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
