//! Range index with phantom avoidance by precision locking.
//!
//! Worker threads never mutate the sorted container directly. Scans record a
//! predicate for their epoch; inserts and deletes record an event for
//! theirs; a background manager applies events to the container once their
//! epoch is stable (two behind the global). A scan fails when its range
//! overlaps another transaction's pending event, and an insert/delete fails
//! when its key falls inside another transaction's predicate; either failure
//! means a phantom could exist, so the transaction aborts.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};

use crate::epoch::EpochFramework;
use crate::types::EpochNumber;

/// Identity of the transaction performing an index operation. Entries
/// tagged with the caller's own context never conflict with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext(u64);

static NEXT_TX_CONTEXT: AtomicU64 = AtomicU64::new(1);

impl TxContext {
    pub fn allocate() -> Self {
        Self(NEXT_TX_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct Predicate {
    begin: String,
    end: Option<String>,
    tx_context: Option<TxContext>,
}

impl Predicate {
    fn covers(&self, key: &str) -> bool {
        self.begin.as_str() <= key && self.end.as_deref().map_or(true, |end| key <= end)
    }
}

struct InsertOrDeleteEvent {
    key: String,
    is_delete_event: bool,
    tx_context: Option<TxContext>,
}

#[derive(Default)]
struct IndexItem {
    is_deleted: bool,
}

#[derive(Default)]
struct UpdateState {
    insert_or_delete_key_set: BTreeMap<EpochNumber, Vec<InsertOrDeleteEvent>>,
    container: BTreeMap<String, IndexItem>,
}

struct RangeShared {
    predicate_list: RwLock<BTreeMap<EpochNumber, Vec<Predicate>>>,
    updates: RwLock<UpdateState>,
    last_processed_epoch: AtomicU32,
    stop: AtomicBool,
    epochs: Arc<EpochFramework>,
}

impl RangeShared {
    fn is_in_predicate_set(
        &self,
        predicates: &BTreeMap<EpochNumber, Vec<Predicate>>,
        key: &str,
        ctx: Option<TxContext>,
    ) -> bool {
        predicates.values().flatten().any(|predicate| {
            if ctx.is_some() && predicate.tx_context == ctx {
                return false;
            }
            predicate.covers(key)
        })
    }

    fn is_overlap_with_insert_or_delete(
        &self,
        updates: &UpdateState,
        begin: &str,
        end: Option<&str>,
        ctx: Option<TxContext>,
    ) -> bool {
        updates
            .insert_or_delete_key_set
            .values()
            .flatten()
            .any(|event| {
                if ctx.is_some() && event.tx_context == ctx {
                    return false;
                }
                begin <= event.key.as_str() && end.map_or(true, |end| event.key.as_str() <= end)
            })
    }

    fn drain_stable_epochs(&self) {
        let global = self.epochs.global_epoch();
        let stable_epoch = global.saturating_sub(2);

        let mut predicates = self.predicate_list.write();
        let mut updates = self.updates.write();

        let live_predicates = predicates.split_off(&(stable_epoch + 1));
        *predicates = live_predicates;

        let live_events = updates.insert_or_delete_key_set.split_off(&(stable_epoch + 1));
        let drained = std::mem::replace(&mut updates.insert_or_delete_key_set, live_events);
        // Apply outdated (already committed) insertions and deletions to the
        // stable container before discarding them.
        for (_, events) in drained {
            for event in events {
                updates
                    .container
                    .entry(event.key)
                    .or_default()
                    .is_deleted = event.is_delete_event;
            }
        }

        self.last_processed_epoch
            .store(stable_epoch, Ordering::Release);
    }
}

pub struct PrecisionLockingIndex {
    shared: Arc<RangeShared>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl PrecisionLockingIndex {
    pub fn new(epochs: Arc<EpochFramework>) -> Self {
        let shared = Arc::new(RangeShared {
            predicate_list: RwLock::new(BTreeMap::new()),
            updates: RwLock::new(UpdateState::default()),
            last_processed_epoch: AtomicU32::new(0),
            stop: AtomicBool::new(false),
            epochs,
        });

        let manager_shared = shared.clone();
        let manager = thread::Builder::new()
            .name("basalt-range-index".to_string())
            .spawn(move || {
                while !manager_shared.stop.load(Ordering::Acquire) {
                    manager_shared.epochs.sync();
                    if manager_shared.epochs.is_stopped() {
                        // The epoch writer is quiescing; avoid a hot loop
                        // while waiting for our own stop flag.
                        thread::sleep(std::time::Duration::from_millis(1));
                    }
                    manager_shared.drain_stable_epochs();
                }
            })
            .expect("failed to spawn the range-index manager thread");

        Self {
            shared,
            manager: Mutex::new(Some(manager)),
        }
    }

    /// Enumerates keys in `[begin, end]` ascending (or `[begin, +inf)` when
    /// `end` is absent), invoking `visit` for each; `visit` returning true
    /// cancels the walk. Records a predicate for the caller's epoch.
    /// Returns `None` when the range overlaps another transaction's pending
    /// insert or delete.
    pub fn scan(
        &self,
        begin: &str,
        end: Option<&str>,
        ctx: Option<TxContext>,
        visit: impl FnMut(&str) -> bool,
    ) -> Option<usize> {
        self.scan_impl(begin, end, ctx, false, visit)
    }

    /// Descending variant: `[begin, +inf)` with no `end` runs from the
    /// maximum key down to `begin`.
    pub fn scan_reverse(
        &self,
        begin: &str,
        end: Option<&str>,
        ctx: Option<TxContext>,
        visit: impl FnMut(&str) -> bool,
    ) -> Option<usize> {
        self.scan_impl(begin, end, ctx, true, visit)
    }

    fn scan_impl(
        &self,
        begin: &str,
        end: Option<&str>,
        ctx: Option<TxContext>,
        reverse: bool,
        mut visit: impl FnMut(&str) -> bool,
    ) -> Option<usize> {
        if let Some(end) = end {
            if end < begin {
                return None;
            }
        }

        let shared = &self.shared;
        let mut predicates = shared.predicate_list.write();
        let updates = shared.updates.read();
        if shared.is_overlap_with_insert_or_delete(&updates, begin, end, ctx) {
            return None;
        }

        let mut hit = 0usize;
        let range = (
            Bound::Included(begin.to_string()),
            end.map_or(Bound::Unbounded, |end| Bound::Included(end.to_string())),
        );
        let mut walk = |key: &String, item: &IndexItem| -> bool {
            if item.is_deleted {
                return true;
            }
            hit += 1;
            // visit returns true to cancel.
            !visit(key)
        };
        if reverse {
            for (key, item) in updates.container.range(range).rev() {
                if !walk(key, item) {
                    break;
                }
            }
        } else {
            for (key, item) in updates.container.range(range) {
                if !walk(key, item) {
                    break;
                }
            }
        }

        let epoch = shared.epochs.my_thread_local_epoch();
        predicates.entry(epoch).or_default().push(Predicate {
            begin: begin.to_string(),
            end: end.map(str::to_string),
            tx_context: ctx,
        });

        Some(hit)
    }

    /// Fails when `key` lies inside another transaction's predicate.
    pub fn insert(&self, key: &str, ctx: Option<TxContext>) -> bool {
        self.push_event(key, false, ctx)
    }

    /// Symmetric to [`insert`](Self::insert) for deletions.
    pub fn delete(&self, key: &str, ctx: Option<TxContext>) -> bool {
        self.push_event(key, true, ctx)
    }

    fn push_event(&self, key: &str, is_delete_event: bool, ctx: Option<TxContext>) -> bool {
        let shared = &self.shared;
        let predicates = shared.predicate_list.read();
        if shared.is_in_predicate_set(&predicates, key, ctx) {
            return false;
        }

        let epoch = shared.epochs.my_thread_local_epoch();
        let mut updates = shared.updates.write();
        updates
            .insert_or_delete_key_set
            .entry(epoch)
            .or_default()
            .push(InsertOrDeleteEvent {
                key: key.to_string(),
                is_delete_event,
                tx_context: ctx,
            });
        true
    }

    /// Unconditional insert, used by recovery and forced blank entries.
    pub fn force_insert(&self, key: &str) {
        let epoch = self.shared.epochs.my_thread_local_epoch();
        let mut updates = self.shared.updates.write();
        updates
            .insert_or_delete_key_set
            .entry(epoch)
            .or_default()
            .push(InsertOrDeleteEvent {
                key: key.to_string(),
                is_delete_event: false,
                tx_context: None,
            });
    }

    /// Consults only the stable container.
    pub fn contains(&self, key: &str) -> bool {
        let updates = self.shared.updates.read();
        updates
            .container
            .get(key)
            .map_or(false, |item| !item.is_deleted)
    }

    /// Blocks until the manager has drained every epoch that was stable when
    /// this call started, making all index updates visible to scans.
    pub fn wait_for_index_is_linearizable(&self) {
        let target = self.shared.epochs.global_epoch().saturating_sub(2);
        while self.shared.last_processed_epoch.load(Ordering::Acquire) < target {
            if self.shared.epochs.is_stopped() {
                return;
            }
            thread::yield_now();
        }
    }
}

impl Drop for PrecisionLockingIndex {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(manager) = self.manager.lock().take() {
            let _ = manager.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn framework() -> Arc<EpochFramework> {
        let epochs = Arc::new(EpochFramework::new(1));
        epochs.start();
        epochs
    }

    fn drain(index: &PrecisionLockingIndex) {
        index.shared.epochs.sync();
        index.wait_for_index_is_linearizable();
    }

    #[test]
    fn inserted_keys_become_visible_after_drain() {
        let epochs = framework();
        let index = PrecisionLockingIndex::new(epochs.clone());
        epochs.make_me_online();
        assert!(index.insert("alice", None));
        epochs.make_me_offline();

        drain(&index);
        assert!(index.contains("alice"));

        let mut keys = Vec::new();
        let count = index.scan("a", Some("z"), None, |key| {
            keys.push(key.to_string());
            false
        });
        assert_eq!(count, Some(1));
        assert_eq!(keys, vec!["alice"]);
    }

    #[test]
    fn scan_conflicts_with_a_pending_insert_of_another_transaction() {
        let epochs = framework();
        let index = PrecisionLockingIndex::new(epochs.clone());
        let inserter = TxContext::allocate();
        let scanner = TxContext::allocate();

        epochs.make_me_online();
        assert!(index.insert("bob", Some(inserter)));
        assert_eq!(index.scan("alice", Some("carol"), Some(scanner), |_| false), None);
        // The inserter itself is not blocked by its own event.
        assert!(index
            .scan("alice", Some("carol"), Some(inserter), |_| false)
            .is_some());
        epochs.make_me_offline();
    }

    #[test]
    fn insert_conflicts_with_a_predicate_of_another_transaction() {
        let epochs = framework();
        let index = PrecisionLockingIndex::new(epochs.clone());
        let scanner = TxContext::allocate();
        let inserter = TxContext::allocate();

        epochs.make_me_online();
        assert!(index.scan("alice", Some("carol"), Some(scanner), |_| false).is_some());
        assert!(!index.insert("bob", Some(inserter)));
        // Outside the predicate no conflict exists.
        assert!(index.insert("dave", Some(inserter)));
        // The scanner's own insert is fine.
        assert!(index.insert("bob", Some(scanner)));
        epochs.make_me_offline();
    }

    #[test]
    fn delete_hides_keys_from_scans() {
        let epochs = framework();
        let index = PrecisionLockingIndex::new(epochs.clone());
        epochs.make_me_online();
        index.force_insert("alice");
        index.force_insert("bob");
        epochs.make_me_offline();
        drain(&index);

        epochs.make_me_online();
        assert!(index.delete("bob", None));
        epochs.make_me_offline();
        drain(&index);

        assert!(index.contains("alice"));
        assert!(!index.contains("bob"));
    }

    #[test]
    fn reverse_scan_walks_from_the_maximum_key_down() {
        let epochs = framework();
        let index = PrecisionLockingIndex::new(epochs.clone());
        epochs.make_me_online();
        for key in ["alice", "bob", "carol"] {
            index.force_insert(key);
        }
        epochs.make_me_offline();
        drain(&index);

        let mut keys = Vec::new();
        let count = index.scan_reverse("alice", None, None, |key| {
            keys.push(key.to_string());
            false
        });
        assert_eq!(count, Some(3));
        assert_eq!(keys, vec!["carol", "bob", "alice"]);
    }

    #[test]
    fn predicates_expire_once_their_epoch_is_stable() {
        let epochs = framework();
        let index = PrecisionLockingIndex::new(epochs.clone());
        let scanner = TxContext::allocate();
        let inserter = TxContext::allocate();

        epochs.make_me_online();
        assert!(index.scan("a", Some("z"), Some(scanner), |_| false).is_some());
        epochs.make_me_offline();

        // After the predicate's epoch drains, inserts stop conflicting.
        std::thread::sleep(Duration::from_millis(20));
        drain(&index);
        epochs.make_me_online();
        assert!(index.insert("middle", Some(inserter)));
        epochs.make_me_offline();
    }
}
