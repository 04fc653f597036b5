//! Pessimistic two-phase locking.
//!
//! Reads take the item's reader/writer lock in shared mode; writes take it
//! exclusively (upgrading when the item was read first), push an undo entry,
//! and apply the new value immediately. Precommit succeeds unconditionally;
//! serializability comes from holding every lock until post-processing.
//! Lock acquisition is bounded: a transaction that cannot get a lock within
//! its retry budget aborts instead of risking a deadlock spin.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cc::CcProtocol;
use crate::data_item::{DataBuffer, DataItem};
use crate::lock::{RwLockMode, RwLockWord};
use crate::snapshot::{ReadSet, WriteSet};
use crate::types::{EpochNumber, TransactionId, TxStatus};

const LOCK_RETRY_LIMIT: usize = 64;
const LOCK_RETRY_MAX_SLEEP_NS: u64 = 1 << 17;

fn try_lock_bounded(lock: &RwLockWord, mode: RwLockMode) -> bool {
    let mut sleep_ns = 100u64;
    for _ in 0..LOCK_RETRY_LIMIT {
        if lock.try_lock(mode) {
            return true;
        }
        thread::sleep(Duration::from_nanos(sleep_ns));
        sleep_ns = (sleep_ns * 2).min(LOCK_RETRY_MAX_SLEEP_NS);
    }
    false
}

#[derive(PartialEq, Eq)]
enum HeldMode {
    Shared,
    Exclusive,
}

struct HeldLock {
    leaf: Arc<DataItem>,
    mode: HeldMode,
}

pub(crate) struct TwoPhaseLocking {
    held_locks: Vec<HeldLock>,
    undo_set: Vec<(Arc<DataItem>, DataBuffer)>,
}

impl TwoPhaseLocking {
    pub fn new() -> Self {
        Self {
            held_locks: Vec::new(),
            undo_set: Vec::new(),
        }
    }

    fn undo(&mut self) {
        for (leaf, image) in self.undo_set.drain(..).rev() {
            let value = if image.is_initialized() {
                Some(image.as_slice())
            } else {
                None
            };
            leaf.reset(value, None);
        }
    }
}

impl CcProtocol for TwoPhaseLocking {
    fn read(&mut self, leaf: &Arc<DataItem>) -> Option<(DataBuffer, TransactionId)> {
        if !try_lock_bounded(leaf.rw_lock(), RwLockMode::Shared) {
            return None;
        }
        self.held_locks.push(HeldLock {
            leaf: leaf.clone(),
            mode: HeldMode::Shared,
        });
        Some((leaf.clone_buffer(), leaf.tid()))
    }

    fn write(
        &mut self,
        key: &str,
        table_name: &str,
        index_name: Option<&str>,
        value: Option<&[u8]>,
        leaf: &Arc<DataItem>,
        read_set: &ReadSet,
        need_checkpoint: bool,
    ) -> bool {
        let is_read_modify_write = read_set
            .iter()
            .any(|snapshot| snapshot.matches(table_name, index_name, key));

        if is_read_modify_write {
            // The shared lock is already held; promote it.
            if !try_lock_bounded(leaf.rw_lock(), RwLockMode::Upgrade) {
                return false;
            }
            for held in self.held_locks.iter_mut() {
                if Arc::ptr_eq(&held.leaf, leaf) {
                    held.mode = HeldMode::Exclusive;
                    break;
                }
            }
        } else {
            if !try_lock_bounded(leaf.rw_lock(), RwLockMode::Exclusive) {
                return false;
            }
            self.held_locks.push(HeldLock {
                leaf: leaf.clone(),
                mode: HeldMode::Exclusive,
            });
        }

        self.undo_set.push((leaf.clone(), leaf.clone_buffer()));
        if need_checkpoint {
            leaf.copy_live_version_to_stable_version();
        }
        leaf.reset(value, None);
        true
    }

    fn abort(&mut self) {
        self.undo();
    }

    fn precommit(
        &mut self,
        _read_set: &mut ReadSet,
        _write_set: &mut WriteSet,
        _epoch: EpochNumber,
        _need_checkpoint: bool,
    ) -> bool {
        // The locks already serialized us.
        true
    }

    fn post_processing(
        &mut self,
        _read_set: &mut ReadSet,
        write_set: &mut WriteSet,
        status: TxStatus,
        epoch: EpochNumber,
    ) {
        if status == TxStatus::Committed {
            // Publish fresh versions while the exclusive locks are still
            // held, so recovery can order these writes against optimistic
            // commits.
            for snapshot in write_set.iter_mut() {
                let current = snapshot.index_cache.tid();
                let published = if epoch != current.epoch {
                    TransactionId::new(epoch, 2)
                } else {
                    TransactionId::new(epoch, current.tid + 2)
                };
                snapshot.index_cache.store_tid(published);
                snapshot.version = published;
            }
        }
        for held in self.held_locks.drain(..) {
            held.leaf.rw_lock().unlock();
        }
        self.undo_set.clear();
    }
}
