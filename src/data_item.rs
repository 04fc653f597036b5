//! The leaf of an index slot: one versioned value cell per (table, key).
//!
//! A `DataItem` is created once and its address never changes afterwards;
//! indices hand out `Arc<DataItem>` and never relocate published items. The
//! atomic transaction id is both the version and the optimistic-protocol
//! spinlock (odd tid = locked); the reader/writer word serves the pessimistic
//! protocol; `exclusive_lock` takes both so that the checkpointer observes a
//! consistent value regardless of which protocol a concurrent writer uses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::cc::pivot::PivotCell;
use crate::lock::{RwLockMode, RwLockWord};
use crate::types::TransactionId;

/// Resizable value buffer plus the logical-existence flag.
///
/// `initialized == false` with an empty buffer is a tombstone, equivalent to
/// "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataBuffer {
    bytes: Vec<u8>,
    initialized: bool,
}

impl DataBuffer {
    pub fn from_value(value: Option<&[u8]>) -> Self {
        let mut buffer = Self::default();
        buffer.reset(value);
        buffer
    }

    /// Replaces the contents. `None` or an empty slice marks the buffer as
    /// logically deleted.
    pub fn reset(&mut self, value: Option<&[u8]>) {
        match value {
            Some(v) if !v.is_empty() => {
                self.bytes.clear();
                self.bytes.extend_from_slice(v);
                self.initialized = true;
            }
            _ => {
                self.bytes.clear();
                self.initialized = false;
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub struct DataItem {
    transaction_id: AtomicU64,
    // Guards only the byte copy; visibility ordering comes from
    // `transaction_id` re-checks or from the protocol-level locks.
    buffer: Mutex<DataBuffer>,
    // Stable copy captured when checkpointing crosses a concurrent write.
    checkpoint_buffer: Mutex<Option<DataBuffer>>,
    pivot: PivotCell,
    rw_lock: RwLockWord,
}

impl Default for DataItem {
    fn default() -> Self {
        Self {
            transaction_id: AtomicU64::new(0),
            buffer: Mutex::new(DataBuffer::default()),
            checkpoint_buffer: Mutex::new(None),
            pivot: PivotCell::new(),
            rw_lock: RwLockWord::new(),
        }
    }
}

impl DataItem {
    pub fn new(value: Option<&[u8]>, tid: TransactionId) -> Self {
        let item = Self::default();
        item.reset(value, Some(tid));
        item
    }

    pub fn tid(&self) -> TransactionId {
        TransactionId::unpack(self.transaction_id.load(Ordering::Acquire))
    }

    pub fn store_tid(&self, tid: TransactionId) {
        self.transaction_id.store(tid.pack(), Ordering::Release);
    }

    pub fn compare_exchange_tid(&self, current: TransactionId, desired: TransactionId) -> bool {
        self.transaction_id
            .compare_exchange_weak(
                current.pack(),
                desired.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Copies the bytes and optionally installs a new version.
    pub fn reset(&self, value: Option<&[u8]>, tid: Option<TransactionId>) {
        self.buffer.lock().reset(value);
        if let Some(tid) = tid {
            if !tid.is_empty() {
                self.store_tid(tid);
            }
        }
    }

    pub fn clone_buffer(&self) -> DataBuffer {
        self.buffer.lock().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.buffer.lock().is_initialized()
    }

    /// Optimistic snapshot: spins past writers, copies the value, and
    /// retries until the version is unchanged across the copy.
    pub fn read_consistent(&self) -> (DataBuffer, TransactionId) {
        loop {
            let tid = self.tid();
            if tid.is_locked() {
                thread::yield_now();
                continue;
            }
            let snapshot = self.clone_buffer();
            if self.tid() == tid {
                return (snapshot, tid);
            }
        }
    }

    /// Acquires exclusive ownership for every protocol at once: flips the
    /// odd-tid lock bit and takes the reader/writer word. Used by the
    /// checkpointer so that lockers from either protocol observe each other.
    pub fn exclusive_lock(&self) {
        loop {
            let tid = self.tid();
            if tid.is_locked() {
                thread::yield_now();
                continue;
            }
            let locked = TransactionId::new(tid.epoch, tid.tid + 1);
            if self.compare_exchange_tid(tid, locked) {
                break;
            }
        }
        self.rw_lock.lock_backoff(RwLockMode::Exclusive);
    }

    pub fn exclusive_unlock(&self) {
        let tid = self.tid();
        debug_assert!(tid.is_locked());
        self.store_tid(TransactionId::new(tid.epoch, tid.tid - 1));
        self.rw_lock.unlock();
    }

    /// Clones the live value into the checkpoint buffer. Idempotent: a
    /// snapshot that is already present is the version that existed at the
    /// point of consistency and must not be overwritten. The caller must
    /// hold this item exclusively.
    pub fn copy_live_version_to_stable_version(&self) {
        let mut stable = self.checkpoint_buffer.lock();
        if stable.is_some() {
            return;
        }
        *stable = Some(self.buffer.lock().clone());
    }

    /// Removes and returns the stable copy, if any.
    pub fn take_checkpoint_buffer(&self) -> Option<DataBuffer> {
        self.checkpoint_buffer.lock().take()
    }

    pub fn pivot(&self) -> &PivotCell {
        &self.pivot
    }

    pub fn rw_lock(&self) -> &RwLockWord {
        &self.rw_lock
    }

    /// Stable 64-bit identity used for versioned-set slot hashing.
    pub fn identity(&self) -> u64 {
        self as *const DataItem as u64
    }
}
