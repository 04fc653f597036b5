//! MPMC open-addressed hash table with concurrent rehash.
//!
//! The table is a single atomic pointer to an array of atomic cells; each
//! cell points to an immutable `(key, value, 8-byte prefix)` node. Reads are
//! lock-free; inserts CAS into the first empty probe slot; a published node
//! is never moved or replaced, so value pointers handed out by `get` are
//! stable for the lifetime of the set.
//!
//! Rehashing happens on a dedicated thread. It installs a reserved sentinel
//! into every migrated cell so that concurrent operations notice the
//! redirection, reload the table pointer, and restart. The retired table is
//! reclaimed only after an epoch sync, when no reader can still hold it.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::epoch::EpochFramework;

const INITIAL_TABLE_SIZE: usize = 4096;
const MAX_PROBE_DISTANCE: usize = 100;
const REDIRECTED: usize = 0x4B1D;

struct TableNode<T> {
    key: String,
    key_prefix: u64,
    value: Arc<T>,
}

fn key_prefix(key: &str) -> u64 {
    let bytes = key.as_bytes();
    let mut prefix = [0u8; 8];
    let len = bytes.len().min(8);
    prefix[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(prefix)
}

struct Table<T> {
    cells: Box<[AtomicPtr<TableNode<T>>]>,
}

impl<T> Table<T> {
    fn new(capacity: usize) -> Self {
        let cells = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells }
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }

    fn slot_of(&self, key: &str) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        // The capacity acts as a salt so that rehashing also reshuffles
        // probe sequences.
        ((hasher.finish() as usize) ^ self.capacity()) % self.capacity()
    }
}

fn redirected<T>() -> *mut TableNode<T> {
    REDIRECTED as *mut TableNode<T>
}

fn is_redirected<T>(ptr: *mut TableNode<T>) -> bool {
    ptr as usize == REDIRECTED
}

struct SetShared<T: Send + Sync> {
    rehash_threshold: f64,
    table: AtomicPtr<Table<T>>,
    populated_count: AtomicUsize,
    // Excludes rehash from for_each and teardown.
    table_lock: Mutex<()>,
    rehash_mutex: Mutex<()>,
    rehash_cv: Condvar,
    force_rehash: AtomicBool,
    stop: AtomicBool,
    // Private framework used purely for quiescent-state reclamation of
    // retired tables.
    epochs: EpochFramework,
}

impl<T: Send + Sync> SetShared<T> {
    fn fill_rate(&self, table: &Table<T>) -> f64 {
        self.populated_count.load(Ordering::Relaxed) as f64 / table.capacity() as f64
    }

    fn current_table(&self) -> &Table<T> {
        // Callers are online in the reclamation framework (or hold
        // table_lock), so the pointer cannot be freed under them.
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    fn request_rehash(&self) {
        self.force_rehash.store(true, Ordering::Release);
        self.rehash_cv.notify_all();
    }

    fn rehash(&self) {
        let _guard = self.table_lock.lock();
        let old_ptr = self.table.load(Ordering::Acquire);
        let old_table = unsafe { &*old_ptr };
        let new_table = Box::new(Table::<T>::new(old_table.capacity() * 2));

        for cell in old_table.cells.iter() {
            let mut node_ptr = cell.load(Ordering::Acquire);
            if node_ptr.is_null() {
                if cell
                    .compare_exchange(
                        node_ptr,
                        redirected(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    continue;
                }
                // A writer published a node while we were looking; migrate
                // it like any other.
                node_ptr = cell.load(Ordering::Acquire);
            }

            let node = unsafe { &*node_ptr };
            let mut slot = new_table.slot_of(&node.key);
            loop {
                let target = &new_table.cells[slot];
                if target.load(Ordering::Relaxed).is_null() {
                    target.store(node_ptr, Ordering::Release);
                    break;
                }
                slot = (slot + 1) % new_table.capacity();
            }

            // Published node pointers are never replaced, so this cannot
            // fail.
            let exchanged = cell
                .compare_exchange(node_ptr, redirected(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            debug_assert!(exchanged);
        }

        let new_ptr = Box::into_raw(new_table);
        let swung = self
            .table
            .compare_exchange(old_ptr, new_ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(swung);

        // Readers that loaded the old pointer are still probing it; wait for
        // them to pass a quiescent state before freeing.
        self.epochs.sync();
        drop(unsafe { Box::from_raw(old_ptr) });
    }
}

pub struct MpmcConcurrentSet<T: Send + Sync + 'static> {
    shared: Arc<SetShared<T>>,
    rehash_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> MpmcConcurrentSet<T> {
    pub fn new(rehash_threshold: f64) -> Self {
        let shared = Arc::new(SetShared {
            rehash_threshold,
            table: AtomicPtr::new(Box::into_raw(Box::new(Table::new(INITIAL_TABLE_SIZE)))),
            populated_count: AtomicUsize::new(0),
            table_lock: Mutex::new(()),
            rehash_mutex: Mutex::new(()),
            rehash_cv: Condvar::new(),
            force_rehash: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            epochs: EpochFramework::new(1),
        });
        shared.epochs.start();

        let rehash_shared = shared.clone();
        let rehash_thread = thread::Builder::new()
            .name("basalt-rehash".to_string())
            .spawn(move || rehash_job(rehash_shared))
            .expect("failed to spawn the rehash thread");

        Self {
            shared,
            rehash_thread: Mutex::new(Some(rehash_thread)),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.populated_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let shared = &self.shared;
        let prefix = key_prefix(key);
        shared.epochs.make_me_online();

        let result = 'restart: loop {
            let mut table = shared.current_table();
            let mut slot = table.slot_of(key);
            let mut probed = 0usize;

            loop {
                let node_ptr = table.cells[slot].load(Ordering::Acquire);
                if is_redirected(node_ptr) {
                    table = shared.current_table();
                    slot = table.slot_of(key);
                    probed = 0;
                    continue;
                }
                if node_ptr.is_null() {
                    break 'restart None;
                }
                let node = unsafe { &*node_ptr };
                if node.key_prefix == prefix && node.key == key {
                    break 'restart Some(node.value.clone());
                }
                slot = (slot + 1) % table.capacity();
                probed += 1;
                if probed > MAX_PROBE_DISTANCE {
                    // Shrink the probe chain before trying again.
                    shared.epochs.make_me_offline();
                    shared.request_rehash();
                    shared.epochs.sync();
                    shared.epochs.make_me_online();
                    continue 'restart;
                }
            }
        };

        shared.epochs.make_me_offline();
        result
    }

    /// Inserts iff absent. Returns false when the key already exists; a
    /// published node is never overwritten.
    pub fn put(&self, key: &str, value: Arc<T>) -> bool {
        let shared = &self.shared;
        let prefix = key_prefix(key);
        let new_node = Box::into_raw(Box::new(TableNode {
            key: key.to_string(),
            key_prefix: prefix,
            value,
        }));
        shared.epochs.make_me_online();

        let inserted = 'restart: loop {
            let mut table = shared.current_table();
            let mut slot = table.slot_of(key);
            let mut probed = 0usize;

            loop {
                let cell = &table.cells[slot];
                let node_ptr = cell.load(Ordering::Acquire);
                if is_redirected(node_ptr) {
                    table = shared.current_table();
                    slot = table.slot_of(key);
                    probed = 0;
                    continue;
                }
                if node_ptr.is_null() {
                    if cell
                        .compare_exchange_weak(
                            node_ptr,
                            new_node,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let stored = shared.populated_count.fetch_add(1, Ordering::Relaxed) + 1;
                        if shared.rehash_threshold < stored as f64 / table.capacity() as f64 {
                            shared.rehash_cv.notify_one();
                        }
                        break 'restart true;
                    }
                    continue;
                }
                let node = unsafe { &*node_ptr };
                if node.key_prefix == prefix && node.key == key {
                    drop(unsafe { Box::from_raw(new_node) });
                    break 'restart false;
                }
                slot = (slot + 1) % table.capacity();
                probed += 1;
                if probed > MAX_PROBE_DISTANCE {
                    shared.epochs.make_me_offline();
                    shared.request_rehash();
                    shared.epochs.sync();
                    shared.epochs.make_me_online();
                    continue 'restart;
                }
            }
        };

        shared.epochs.make_me_offline();
        inserted
    }

    /// Visits every entry. A maintenance operation: it excludes rehash but
    /// runs concurrently with reads. Returning false from `f` stops the
    /// walk.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<T>) -> bool) {
        let _guard = self.shared.table_lock.lock();
        let table = unsafe { &*self.shared.table.load(Ordering::Acquire) };
        for cell in table.cells.iter() {
            let node_ptr = cell.load(Ordering::Acquire);
            if node_ptr.is_null() {
                continue;
            }
            debug_assert!(!is_redirected(node_ptr));
            let node = unsafe { &*node_ptr };
            if !f(&node.key, &node.value) {
                break;
            }
        }
    }
}

fn rehash_job<T: Send + Sync>(shared: Arc<SetShared<T>>) {
    loop {
        {
            let mut guard = shared.rehash_mutex.lock();
            shared.rehash_cv.wait_while(&mut guard, |_| {
                let table = unsafe { &*shared.table.load(Ordering::Acquire) };
                let over_threshold = shared.rehash_threshold <= shared.fill_rate(table);
                !(over_threshold
                    || shared.force_rehash.load(Ordering::Acquire)
                    || shared.stop.load(Ordering::Acquire))
            });
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        let table = unsafe { &*shared.table.load(Ordering::Acquire) };
        if shared.rehash_threshold <= shared.fill_rate(table)
            || shared.force_rehash.load(Ordering::Acquire)
        {
            shared.force_rehash.store(false, Ordering::Release);
            shared.rehash();
        }
    }
}

impl<T: Send + Sync + 'static> Drop for MpmcConcurrentSet<T> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.rehash_cv.notify_all();
        if let Some(handle) = self.rehash_thread.lock().take() {
            let _ = handle.join();
        }
        self.shared.epochs.stop();

        // No concurrent access can remain; free every node and the table.
        let _guard = self.shared.table_lock.lock();
        let table_ptr = self.shared.table.load(Ordering::Acquire);
        let table = unsafe { &*table_ptr };
        for cell in table.cells.iter() {
            let node_ptr = cell.load(Ordering::Acquire);
            if node_ptr.is_null() || is_redirected(node_ptr) {
                continue;
            }
            drop(unsafe { Box::from_raw(node_ptr) });
        }
        drop(unsafe { Box::from_raw(table_ptr) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_what_put_stored() {
        let set: MpmcConcurrentSet<u64> = MpmcConcurrentSet::new(0.75);
        assert!(set.put("alice", Arc::new(1)));
        assert!(set.put("bob", Arc::new(2)));
        assert_eq!(set.get("alice").as_deref(), Some(&1));
        assert_eq!(set.get("bob").as_deref(), Some(&2));
        assert!(set.get("carol").is_none());
    }

    #[test]
    fn put_never_overwrites() {
        let set: MpmcConcurrentSet<u64> = MpmcConcurrentSet::new(0.75);
        assert!(set.put("alice", Arc::new(1)));
        assert!(!set.put("alice", Arc::new(9)));
        assert_eq!(set.get("alice").as_deref(), Some(&1));
    }

    #[test]
    fn published_value_address_is_stable_across_rehash() {
        let set: MpmcConcurrentSet<u64> = MpmcConcurrentSet::new(0.75);
        set.put("pinned", Arc::new(7));
        let before = set.get("pinned").unwrap();

        // Push the fill rate over the threshold to force a rehash.
        for i in 0..4000 {
            set.put(&format!("key-{i}"), Arc::new(i));
        }
        std::thread::sleep(std::time::Duration::from_millis(100));

        let after = set.get("pinned").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        for i in (0..4000).step_by(371) {
            assert_eq!(set.get(&format!("key-{i}")).as_deref(), Some(&i));
        }
    }

    #[test]
    fn concurrent_puts_have_a_single_winner() {
        let set: Arc<MpmcConcurrentSet<usize>> = Arc::new(MpmcConcurrentSet::new(0.75));
        let mut handles = Vec::new();
        for t in 0..8 {
            let set = set.clone();
            handles.push(std::thread::spawn(move || {
                let mut wins = 0usize;
                for i in 0..200 {
                    if set.put(&format!("contended-{i}"), Arc::new(t)) {
                        wins += 1;
                    }
                }
                wins
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 200);
        assert_eq!(set.len(), 200);
    }

    #[test]
    fn for_each_visits_every_entry() {
        let set: MpmcConcurrentSet<u64> = MpmcConcurrentSet::new(0.75);
        for i in 0..32 {
            set.put(&format!("k{i}"), Arc::new(i));
        }
        let mut count = 0;
        set.for_each(|_, _| {
            count += 1;
            true
        });
        assert_eq!(count, 32);
    }
}
