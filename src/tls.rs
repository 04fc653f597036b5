//! Per-thread storage whose nodes remain reachable from any thread.
//!
//! Every thread that touches a `ThreadKeyStorage` gets its own node,
//! registered in a shared list so that coordinator threads can iterate all
//! nodes (`for_each`) without knowing which threads exist. Nodes live until
//! the storage itself is dropped; a thread that exits simply leaves its node
//! behind, which is the desired behavior for epoch bookkeeping.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

static NEXT_STORAGE_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    // One cache entry per (thread, storage instance). Storage ids are never
    // reused, so a stale entry for a dropped storage can never be confused
    // with a live one.
    static NODE_CACHE: RefCell<HashMap<usize, Arc<dyn Any + Send + Sync>>> =
        RefCell::new(HashMap::new());
}

pub struct ThreadKeyStorage<T: Send + Sync + 'static> {
    id: usize,
    nodes: Mutex<Vec<Arc<T>>>,
}

impl<T: Send + Sync + 'static> ThreadKeyStorage<T> {
    pub fn new() -> Self {
        Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Returns the calling thread's node, creating it with `init` on first
    /// access.
    pub fn get_with(&self, init: impl FnOnce() -> T) -> Arc<T> {
        NODE_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some(node) = cache.get(&self.id) {
                return node
                    .clone()
                    .downcast::<T>()
                    .expect("thread-key storage id collision");
            }
            let node = Arc::new(init());
            self.nodes.lock().push(node.clone());
            cache.insert(self.id, node.clone() as Arc<dyn Any + Send + Sync>);
            node
        })
    }

    /// Visits every node ever created for this storage, from any thread.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for node in self.nodes.lock().iter() {
            f(node);
        }
    }
}

impl<T: Send + Sync + Default + 'static> ThreadKeyStorage<T> {
    pub fn get(&self) -> Arc<T> {
        self.get_with(T::default)
    }
}

impl<T: Send + Sync + 'static> Default for ThreadKeyStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}
