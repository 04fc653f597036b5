//! Index layer: a point index for direct lookups paired with a range index
//! for ordered, phantom-safe scans.

pub mod point_index;
pub mod range_index;
pub mod secondary_index;

use std::sync::Arc;

use crate::config::Config;
use crate::data_item::DataItem;
use crate::epoch::EpochFramework;

use point_index::MpmcConcurrentSet;
use range_index::{PrecisionLockingIndex, TxContext};

/// The index of one table (or one secondary index): an MPMC hash table over
/// stable `DataItem`s plus a precision-locking range index over the same key
/// space.
///
/// The two halves are deliberately decoupled: `get_or_insert` pins a blank
/// data item without making the key scannable, while `insert`/`delete` only
/// register the structural change. A key becomes visible to scans when its
/// insert event drains into the stable container.
pub struct ConcurrentTable {
    point_index: MpmcConcurrentSet<DataItem>,
    range_index: PrecisionLockingIndex,
}

impl ConcurrentTable {
    pub fn new(epochs: Arc<EpochFramework>, config: &Config) -> Self {
        Self {
            point_index: MpmcConcurrentSet::new(config.rehash_threshold),
            range_index: PrecisionLockingIndex::new(epochs),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<DataItem>> {
        self.point_index.get(key)
    }

    /// Returns the data item for `key`, publishing a blank one first if
    /// none exists. Once published, the same item is returned forever.
    pub fn get_or_insert(&self, key: &str) -> Arc<DataItem> {
        loop {
            if let Some(item) = self.point_index.get(key) {
                return item;
            }
            // Concurrent callers race to publish; the loser adopts the
            // winner's item on the next get.
            let _ = self.point_index.put(key, Arc::new(DataItem::default()));
        }
    }

    /// Registers a structural insert for phantom detection. Fails when the
    /// key falls inside another transaction's scan predicate.
    pub fn insert(&self, key: &str, ctx: Option<TxContext>) -> bool {
        self.range_index.insert(key, ctx)
    }

    /// Registers a structural delete. Same failure rule as
    /// [`insert`](Self::insert).
    pub fn delete(&self, key: &str, ctx: Option<TxContext>) -> bool {
        self.range_index.delete(key, ctx)
    }

    /// Publishes a blank entry in both halves unconditionally. Recovery and
    /// forced initialization only.
    pub fn force_put_blank_entry(&self, key: &str) {
        let _ = self.point_index.put(key, Arc::new(DataItem::default()));
        self.range_index.force_insert(key);
    }

    /// Whether the stable range container currently lists `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.range_index.contains(key)
    }

    /// Key-only ordered scan; see
    /// [`PrecisionLockingIndex::scan`](range_index::PrecisionLockingIndex::scan).
    pub fn scan(
        &self,
        begin: &str,
        end: Option<&str>,
        ctx: Option<TxContext>,
        visit: impl FnMut(&str) -> bool,
    ) -> Option<usize> {
        self.range_index.scan(begin, end, ctx, visit)
    }

    pub fn scan_reverse(
        &self,
        begin: &str,
        end: Option<&str>,
        ctx: Option<TxContext>,
        visit: impl FnMut(&str) -> bool,
    ) -> Option<usize> {
        self.range_index.scan_reverse(begin, end, ctx, visit)
    }

    /// Visits every pinned data item. Maintenance-only (checkpointing,
    /// teardown); excludes rehash.
    pub fn for_each(&self, f: impl FnMut(&str, &Arc<DataItem>) -> bool) {
        self.point_index.for_each(f)
    }

    pub fn wait_for_index_is_linearizable(&self) {
        self.range_index.wait_for_index_is_linearizable()
    }
}
