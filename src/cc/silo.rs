//! Optimistic lock-on-write validation, with an optional omission overlay.
//!
//! `SiloValidator<false>` is the plain protocol: reads record the observed
//! version, writes buffer privately, and precommit locks the write set,
//! re-validates every read, installs the new values, and publishes fresh
//! versions.
//!
//! `SiloValidator<true>` adds the omission path. Before taking any lock it
//! tries to prove, from the pivot objects of the touched data items, that
//! ordering this transaction's writes just before each item's pivot version
//! creates no dependency cycle. On success the write set is discarded
//! without locking anything; the writes were absorbed into the version
//! order. On most failures the protocol falls back to the lock path; a
//! failed anti-dependency validation aborts outright, because the lock path
//! would fail the same check.

use std::sync::Arc;
use std::thread;

use crate::cc::pivot::{NwrValidation, PivotObject};
use crate::cc::CcProtocol;
use crate::data_item::{DataBuffer, DataItem};
use crate::snapshot::{ReadSet, WriteSet};
use crate::types::{EpochNumber, TransactionId, TxStatus};

struct ValidationItem {
    leaf: Arc<DataItem>,
    observed: TransactionId,
}

struct PivotSnapshot {
    leaf: Arc<DataItem>,
    pivot: PivotObject,
    from_write_set: bool,
}

pub(crate) struct SiloValidator<const ENABLE_NWR: bool> {
    validation_set: Vec<ValidationItem>,
    nwr_result: NwrValidation,
    my_pivot: PivotObject,
    pivot_snapshots: Vec<PivotSnapshot>,
}

impl<const ENABLE_NWR: bool> SiloValidator<ENABLE_NWR> {
    pub fn new() -> Self {
        Self {
            validation_set: Vec::new(),
            nwr_result: NwrValidation::NotYetValidated,
            my_pivot: PivotObject::default(),
            pivot_snapshots: Vec::new(),
        }
    }

    fn anti_dependency_validation(&self) -> bool {
        self.validation_set
            .iter()
            .all(|item| item.leaf.tid() == item.observed)
    }

    /// The omission validation. Snapshots every pivot, rejects omission for
    /// pivots outside the current epoch, squashes this transaction's
    /// read/write versions into merged sets, checks reachability against
    /// each write pivot, re-validates anti-dependencies, and finally
    /// CAS-merges the transaction's sets into every pivot. Contention on
    /// any CAS restarts the whole procedure with fresh snapshots.
    fn is_omittable(
        &mut self,
        read_set: &ReadSet,
        write_set: &WriteSet,
        epoch: EpochNumber,
    ) -> bool {
        'retry: loop {
            self.pivot_snapshots.clear();
            for snapshot in write_set {
                self.pivot_snapshots.push(PivotSnapshot {
                    leaf: snapshot.index_cache.clone(),
                    pivot: snapshot.index_cache.pivot().load(),
                    from_write_set: true,
                });
            }
            for snapshot in read_set {
                self.pivot_snapshots.push(PivotSnapshot {
                    leaf: snapshot.index_cache.clone(),
                    pivot: snapshot.index_cache.pivot().load(),
                    from_write_set: false,
                });
            }

            // Linearizability: omission may only reorder transactions that
            // are concurrent, i.e. in the same epoch as every write pivot.
            for ps in &self.pivot_snapshots {
                if !ps.from_write_set {
                    continue;
                }
                if ps.pivot.epoch != epoch {
                    self.nwr_result = NwrValidation::Linearizability;
                    return false;
                }
            }

            // Squash this transaction's reads and writes into merged sets.
            // A version read from an older epoch is below every version of
            // the current epoch, so it degrades to 1.
            self.my_pivot.epoch = epoch;
            for snapshot in read_set {
                let version = if snapshot.version.epoch == epoch {
                    snapshot.version.tid
                } else {
                    1
                };
                self.my_pivot
                    .merged_read_set
                    .put_higher(snapshot.index_cache.identity(), version);
            }
            for ps in &self.pivot_snapshots {
                if !ps.from_write_set {
                    continue;
                }
                self.my_pivot
                    .merged_write_set
                    .put_higher(ps.leaf.identity(), ps.pivot.target_id);
            }

            // A successor T_k that can reach this transaction closes a
            // cycle in the multi-version serialization graph.
            for ps in &self.pivot_snapshots {
                if !ps.from_write_set {
                    continue;
                }
                let result = ps.pivot.is_reachable_into(&self.my_pivot);
                if result != NwrValidation::Acyclic {
                    self.nwr_result = result;
                    return false;
                }
            }

            // Overwriters are covered the same way the baseline covers
            // them: any newer version of a read item may close a cycle.
            if !self.anti_dependency_validation() {
                self.nwr_result = NwrValidation::AntiDependency;
                return false;
            }

            // Publish the merged sets so concurrent omission attempts see
            // this transaction's versions.
            for ps in &self.pivot_snapshots {
                let mut desired = ps.pivot;
                desired.merged_read_set = ps.pivot.merged_read_set.merge(&self.my_pivot.merged_read_set);
                desired.merged_write_set =
                    ps.pivot.merged_write_set.merge(&self.my_pivot.merged_write_set);
                if desired.same_sets(&ps.pivot) {
                    continue;
                }
                if !ps.leaf.pivot().compare_exchange(ps.pivot, desired) {
                    continue 'retry;
                }
            }

            self.nwr_result = NwrValidation::Acyclic;
            return true;
        }
    }

    /// Lock-path counterpart of the pivot bookkeeping. Invoked after the
    /// write set is locked and before anti-dependency validation, so that a
    /// lock-based commit and a concurrent omission-based commit always
    /// observe each other's version numbers.
    fn update_pivot_objects(
        &mut self,
        read_set: &ReadSet,
        write_set: &WriteSet,
        epoch: EpochNumber,
    ) {
        debug_assert_ne!(self.nwr_result, NwrValidation::Acyclic);

        self.my_pivot.epoch = epoch;
        for snapshot in read_set {
            let version = if snapshot.version.epoch == epoch {
                snapshot.version.tid
            } else {
                1
            };
            self.my_pivot
                .merged_read_set
                .put_lower(snapshot.index_cache.identity(), version);
        }
        for snapshot in write_set {
            let tid = snapshot.version;
            debug_assert!(tid.is_locked());
            let new_version = if tid.epoch == epoch { tid.tid + 1 } else { 2 };
            self.my_pivot
                .merged_write_set
                .put_higher(snapshot.index_cache.identity(), new_version);
        }

        for ps in &self.pivot_snapshots {
            let old = ps.leaf.pivot().load();
            if old.epoch != epoch && ps.from_write_set {
                // First blind write into this data item in the epoch:
                // install a fresh pivot carrying this write as the pivot
                // version.
                let ws_entry = write_set
                    .iter()
                    .find(|snapshot| Arc::ptr_eq(&snapshot.index_cache, &ps.leaf));
                if let Some(entry) = ws_entry {
                    if !entry.is_read_modify_write {
                        let mut desired = self.my_pivot;
                        desired.target_id = entry.version.tid;
                        ps.leaf.pivot().store(desired);
                        continue;
                    }
                }
            }

            loop {
                let old = ps.leaf.pivot().load();
                let mut desired = old;
                desired.merged_read_set = old.merged_read_set.merge(&self.my_pivot.merged_read_set);
                desired.merged_write_set =
                    old.merged_write_set.merge(&self.my_pivot.merged_write_set);
                if ps.leaf.pivot().compare_exchange(old, desired) {
                    break;
                }
            }
        }
    }
}

impl<const ENABLE_NWR: bool> CcProtocol for SiloValidator<ENABLE_NWR> {
    fn read(&mut self, leaf: &Arc<DataItem>) -> Option<(DataBuffer, TransactionId)> {
        let (buffer, tid) = leaf.read_consistent();
        self.validation_set.push(ValidationItem {
            leaf: leaf.clone(),
            observed: tid,
        });
        Some((buffer, tid))
    }

    fn write(
        &mut self,
        _key: &str,
        _table_name: &str,
        _index_name: Option<&str>,
        _value: Option<&[u8]>,
        _leaf: &Arc<DataItem>,
        _read_set: &ReadSet,
        _need_checkpoint: bool,
    ) -> bool {
        // Writes stay buffered in the write set until precommit.
        true
    }

    fn abort(&mut self) {}

    fn precommit(
        &mut self,
        read_set: &mut ReadSet,
        write_set: &mut WriteSet,
        epoch: EpochNumber,
        need_checkpoint: bool,
    ) -> bool {
        // Lock in a deterministic order to avoid deadlock among committers.
        write_set.sort_by(|a, b| {
            (&a.table_name, &a.index_name, &a.key).cmp(&(&b.table_name, &b.index_name, &b.key))
        });

        if ENABLE_NWR {
            if !write_set.is_empty() && self.is_omittable(read_set, write_set, epoch) {
                // Every buffered write is omittable; nothing to lock,
                // nothing to install.
                write_set.clear();
                return true;
            }
            if self.nwr_result == NwrValidation::AntiDependency {
                // The lock path would fail the same validation.
                return false;
            }
        }

        for snapshot in write_set.iter_mut() {
            let leaf = &snapshot.index_cache;
            loop {
                let current = leaf.tid();
                if current.is_locked() {
                    thread::yield_now();
                    continue;
                }
                let desired = TransactionId::new(current.epoch, current.tid | 1);
                if leaf.compare_exchange_tid(current, desired) {
                    snapshot.version = desired;
                    // A locked item that we also read must account for the
                    // lock bit during validation.
                    for item in self.validation_set.iter_mut() {
                        if Arc::ptr_eq(&item.leaf, leaf) {
                            item.observed.tid += 1;
                            break;
                        }
                    }
                    break;
                }
            }
        }

        if ENABLE_NWR {
            self.update_pivot_objects(read_set, write_set, epoch);
        }

        if !self.anti_dependency_validation() {
            for snapshot in write_set.iter() {
                let current = snapshot.index_cache.tid();
                snapshot
                    .index_cache
                    .store_tid(TransactionId::new(current.epoch, current.tid - 1));
            }
            return false;
        }

        for snapshot in write_set.iter() {
            if need_checkpoint {
                snapshot.index_cache.copy_live_version_to_stable_version();
            }
            let value = if snapshot.buffer.is_initialized() {
                Some(snapshot.buffer.as_slice())
            } else {
                None
            };
            snapshot.index_cache.reset(value, None);
        }

        true
    }

    fn post_processing(
        &mut self,
        _read_set: &mut ReadSet,
        write_set: &mut WriteSet,
        status: TxStatus,
        epoch: EpochNumber,
    ) {
        if status != TxStatus::Committed {
            // Locks were already released on validation failure.
            return;
        }
        if ENABLE_NWR && self.nwr_result == NwrValidation::Acyclic {
            // The writes were omitted; no lock is held and no version
            // changes hands.
            return;
        }

        for snapshot in write_set.iter_mut() {
            let current = snapshot.version;
            let unlocked = if epoch != current.epoch {
                // First unlocked version in this epoch.
                TransactionId::new(epoch, 2)
            } else {
                TransactionId::new(epoch, current.tid + 1)
            };
            snapshot.index_cache.store_tid(unlocked);
            snapshot.version = unlocked;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    fn leaf_with(value: &[u8], tid: TransactionId) -> Arc<DataItem> {
        Arc::new(DataItem::new(Some(value), tid))
    }

    fn write_snapshot(key: &str, leaf: &Arc<DataItem>, value: &[u8]) -> Snapshot {
        Snapshot::new(
            key,
            "t",
            None,
            leaf.clone(),
            DataBuffer::from_value(Some(value)),
            TransactionId::default(),
        )
    }

    #[test]
    fn read_records_a_validation_entry() {
        let mut silo = SiloValidator::<false>::new();
        let leaf = leaf_with(b"v", TransactionId::new(1, 2));
        let (buffer, tid) = silo.read(&leaf).unwrap();
        assert_eq!(buffer.as_slice(), b"v");
        assert_eq!(tid, TransactionId::new(1, 2));
        assert_eq!(silo.validation_set.len(), 1);
    }

    #[test]
    fn commit_installs_values_and_versions() {
        let mut silo = SiloValidator::<false>::new();
        let leaf = leaf_with(b"old", TransactionId::new(1, 2));
        let mut read_set = Vec::new();
        let mut write_set = vec![write_snapshot("k", &leaf, b"new")];

        assert!(silo.precommit(&mut read_set, &mut write_set, 1, false));
        silo.post_processing(&mut read_set, &mut write_set, TxStatus::Committed, 1);

        assert_eq!(leaf.clone_buffer().as_slice(), b"new");
        let tid = leaf.tid();
        assert!(!tid.is_locked());
        assert_eq!(tid, TransactionId::new(1, 4));
    }

    #[test]
    fn committing_into_a_new_epoch_resets_the_counter() {
        let mut silo = SiloValidator::<false>::new();
        let leaf = leaf_with(b"old", TransactionId::new(1, 8));
        let mut read_set = Vec::new();
        let mut write_set = vec![write_snapshot("k", &leaf, b"new")];

        assert!(silo.precommit(&mut read_set, &mut write_set, 3, false));
        silo.post_processing(&mut read_set, &mut write_set, TxStatus::Committed, 3);
        assert_eq!(leaf.tid(), TransactionId::new(3, 2));
    }

    #[test]
    fn stale_read_fails_validation() {
        let mut silo = SiloValidator::<false>::new();
        let read_leaf = leaf_with(b"r", TransactionId::new(1, 2));
        let write_leaf = leaf_with(b"w", TransactionId::new(1, 2));

        let (buffer, version) = silo.read(&read_leaf).unwrap();
        let mut read_set = vec![Snapshot::new(
            "r",
            "t",
            None,
            read_leaf.clone(),
            buffer,
            version,
        )];
        let mut write_set = vec![write_snapshot("w", &write_leaf, b"new")];

        // Another transaction overwrites the read item before we commit.
        read_leaf.reset(Some(b"other"), Some(TransactionId::new(1, 6)));

        assert!(!silo.precommit(&mut read_set, &mut write_set, 1, false));
        // Locks are released on failure.
        assert!(!write_leaf.tid().is_locked());
        assert_eq!(write_leaf.clone_buffer().as_slice(), b"w");
    }

    #[test]
    fn rmw_on_the_same_item_validates_against_its_own_lock() {
        let mut silo = SiloValidator::<false>::new();
        let leaf = leaf_with(b"v", TransactionId::new(1, 2));

        let (buffer, version) = silo.read(&leaf).unwrap();
        let mut read_set = vec![Snapshot::new("k", "t", None, leaf.clone(), buffer, version)];
        let mut write_set = vec![write_snapshot("k", &leaf, b"v2")];

        assert!(silo.precommit(&mut read_set, &mut write_set, 1, false));
        silo.post_processing(&mut read_set, &mut write_set, TxStatus::Committed, 1);
        assert_eq!(leaf.clone_buffer().as_slice(), b"v2");
    }

    #[test]
    fn checkpoint_cooperation_captures_the_before_image() {
        let mut silo = SiloValidator::<false>::new();
        let leaf = leaf_with(b"before", TransactionId::new(1, 2));
        let mut read_set = Vec::new();
        let mut write_set = vec![write_snapshot("k", &leaf, b"after")];

        assert!(silo.precommit(&mut read_set, &mut write_set, 1, true));
        silo.post_processing(&mut read_set, &mut write_set, TxStatus::Committed, 1);

        assert_eq!(leaf.clone_buffer().as_slice(), b"after");
        assert_eq!(leaf.take_checkpoint_buffer().unwrap().as_slice(), b"before");
    }

    #[test]
    fn nwr_omits_a_blind_write_with_a_same_epoch_pivot() {
        let mut nwr = SiloValidator::<true>::new();
        let leaf = leaf_with(b"v", TransactionId::new(5, 2));
        // Pretend another transaction pinned this item's pivot in epoch 5.
        let mut pivot = PivotObject::default();
        pivot.epoch = 5;
        pivot.target_id = 4;
        leaf.pivot().store(pivot);

        let mut read_set = Vec::new();
        let mut write_set = vec![write_snapshot("k", &leaf, b"omitted")];

        assert!(nwr.precommit(&mut read_set, &mut write_set, 5, false));
        // The write set was cleared and the value never installed.
        assert!(write_set.is_empty());
        assert_eq!(leaf.clone_buffer().as_slice(), b"v");
        assert!(!leaf.tid().is_locked());
        nwr.post_processing(&mut read_set, &mut write_set, TxStatus::Committed, 5);
    }

    #[test]
    fn nwr_falls_back_to_locking_across_epochs() {
        let mut nwr = SiloValidator::<true>::new();
        // Fresh pivot (epoch 0) differs from the transaction's epoch, so
        // omission is rejected for linearizability and the lock path runs.
        let leaf = leaf_with(b"v", TransactionId::new(1, 2));
        let mut read_set = Vec::new();
        let mut write_set = vec![write_snapshot("k", &leaf, b"installed")];

        assert!(nwr.precommit(&mut read_set, &mut write_set, 2, false));
        nwr.post_processing(&mut read_set, &mut write_set, TxStatus::Committed, 2);

        assert_eq!(leaf.clone_buffer().as_slice(), b"installed");
        assert_eq!(leaf.tid(), TransactionId::new(2, 2));
        // The lock path published a pivot for this epoch so concurrent
        // omission attempts can see it.
        assert_eq!(leaf.pivot().load().epoch, 2);
    }
}
