//! Pivot-version metadata for the omission-enabled commit path.
//!
//! Each data item carries a [`PivotObject`]: the version the item is pinned
//! at for the current epoch plus two [`VersionedSet`] bitmaps summarizing
//! which versions concurrent transactions have read (mRS) and written (mWS).
//! Comparing a committing transaction's merged sets against each pivot proves
//! or refutes the existence of a dependency cycle without walking a graph.

use std::cell::UnsafeCell;

use crate::lock::TtasLock;
use crate::types::EpochNumber;

/// Slot width in bits. 32 / 4 = 8 saturating counters per set.
const COUNTER_BITS: u32 = 4;
const SLOT_COUNT: u32 = 32 / COUNTER_BITS;
const SLOT_MAX: u32 = (1 << COUNTER_BITS) - 1;

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// A 32-bit bitmap partitioned into equal-width saturating counters.
///
/// Slot value zero means "unoccupied"; comparisons skip slots that are zero
/// on either side. The slot for a data item is derived from its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionedSet {
    bits: u32,
}

impl VersionedSet {
    fn slot_of(identity: u64) -> u32 {
        // Upper address bits, then FNV-1 over the 4 bytes.
        let seed = (identity >> 4) as u32;
        let mut hash = FNV_OFFSET;
        for byte in seed.to_le_bytes() {
            hash = hash.wrapping_mul(FNV_PRIME) ^ u32::from(byte);
        }
        hash % SLOT_COUNT
    }

    fn mask(slot: u32) -> u32 {
        SLOT_MAX << (COUNTER_BITS * slot)
    }

    fn get_slot(&self, slot: u32) -> u32 {
        (self.bits >> (COUNTER_BITS * slot)) & SLOT_MAX
    }

    fn set_slot(&mut self, slot: u32, version: u32) {
        self.bits &= !Self::mask(slot);
        self.bits |= version.min(SLOT_MAX) << (COUNTER_BITS * slot);
    }

    pub fn get(&self, identity: u64) -> u32 {
        self.get_slot(Self::slot_of(identity))
    }

    pub fn put(&mut self, identity: u64, version: u32) {
        self.set_slot(Self::slot_of(identity), version);
    }

    /// Stores `version` only if it is above the current slot value.
    pub fn put_higher(&mut self, identity: u64, version: u32) {
        if self.get(identity) >= version {
            return;
        }
        self.put(identity, version);
    }

    /// Stores `version` only if it is below the current (non-zero) slot
    /// value.
    pub fn put_lower(&mut self, identity: u64, version: u32) {
        if self.get(identity) <= version {
            return;
        }
        self.put(identity, version);
    }

    /// Slotwise combine: empty slots adopt the other side, occupied slots
    /// keep the lower counter.
    pub fn merge(&self, rhs: &VersionedSet) -> VersionedSet {
        let mut merged = VersionedSet::default();
        for slot in 0..SLOT_COUNT {
            let lhs_slot = self.get_slot(slot);
            let rhs_slot = rhs.get_slot(slot);
            let value = match (lhs_slot, rhs_slot) {
                (0, 0) => continue,
                (0, v) | (v, 0) => v,
                (a, b) => a.min(b),
            };
            merged.set_slot(slot, value);
        }
        merged
    }

    /// Slotwise `>`, skipping slots that are zero on either side. A
    /// saturated slot compares greater than anything.
    pub fn is_greater_than(&self, rhs: &VersionedSet) -> bool {
        self.compare(rhs, |lhs, rhs| rhs < lhs)
    }

    /// Slotwise `>=` with the same zero-slot rule.
    pub fn is_greater_or_equal(&self, rhs: &VersionedSet) -> bool {
        self.compare(rhs, |lhs, rhs| rhs <= lhs)
    }

    fn compare(&self, rhs: &VersionedSet, hit: impl Fn(u32, u32) -> bool) -> bool {
        if self.bits == 0 || rhs.bits == 0 {
            return false;
        }
        for slot in 0..SLOT_COUNT {
            let lhs_slot = self.get_slot(slot);
            if lhs_slot == 0 {
                continue;
            }
            let rhs_slot = rhs.get_slot(slot);
            if rhs_slot == 0 {
                continue;
            }
            if lhs_slot == SLOT_MAX {
                return true;
            }
            if hit(lhs_slot, rhs_slot) {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

/// Outcome of the omission validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NwrValidation {
    /// The generated version order is provably acyclic; the writes may be
    /// omitted.
    Acyclic,
    /// A `T_k <<(rw)-> T_j` path may exist.
    Rw,
    /// A `T_k wr-> T_j` path may exist.
    Wr,
    /// Anti-dependency validation failed; the lock path would fail too, so
    /// the transaction aborts preemptively.
    AntiDependency,
    /// The pivot belongs to another epoch; omitting would order
    /// non-concurrent transactions and break strict serializability.
    Linearizability,
    NotYetValidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PivotObject {
    /// Version this data item is fixed at for `epoch`.
    pub target_id: u32,
    pub epoch: EpochNumber,
    pub merged_read_set: VersionedSet,
    pub merged_write_set: VersionedSet,
}

impl PivotObject {
    /// Whether `T_k` (self, a pivot snapshot) can reach `T_j` (`rhs`, the
    /// committing transaction) in the multi-version serialization graph.
    pub fn is_reachable_into(&self, rhs: &PivotObject) -> NwrValidation {
        if rhs.merged_read_set.is_greater_or_equal(&self.merged_write_set) {
            return NwrValidation::Wr;
        }
        if rhs.merged_write_set.is_greater_than(&self.merged_read_set) {
            return NwrValidation::Rw;
        }
        NwrValidation::Acyclic
    }

    pub fn same_sets(&self, rhs: &PivotObject) -> bool {
        self.merged_read_set == rhs.merged_read_set
            && self.merged_write_set == rhs.merged_write_set
    }
}

/// Atomically accessed pivot object.
///
/// The 128 logical bits are manipulated under a dedicated spinlock embedded
/// next to them; only snapshots, stores, and compare-exchanges touch the
/// cell, so the critical sections are a handful of instructions.
pub struct PivotCell {
    lock: TtasLock,
    value: UnsafeCell<PivotObject>,
}

// All access to `value` goes through `lock`.
unsafe impl Send for PivotCell {}
unsafe impl Sync for PivotCell {}

impl PivotCell {
    pub fn new() -> Self {
        Self {
            lock: TtasLock::new(),
            value: UnsafeCell::new(PivotObject::default()),
        }
    }

    pub fn load(&self) -> PivotObject {
        self.lock.lock();
        let snapshot = unsafe { *self.value.get() };
        self.lock.unlock();
        snapshot
    }

    pub fn store(&self, desired: PivotObject) {
        self.lock.lock();
        unsafe { *self.value.get() = desired };
        self.lock.unlock();
    }

    pub fn compare_exchange(&self, expected: PivotObject, desired: PivotObject) -> bool {
        self.lock.lock();
        let current = unsafe { &mut *self.value.get() };
        let exchanged = *current == expected;
        if exchanged {
            *current = desired;
        }
        self.lock.unlock();
        exchanged
    }
}

impl Default for PivotCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Identities that land in distinct slots for deterministic tests.
    fn distinct_identities(n: usize) -> Vec<u64> {
        let mut picked: Vec<u64> = Vec::new();
        let mut candidate = 0x1000u64;
        while picked.len() < n {
            let slot = VersionedSet::slot_of(candidate);
            if !picked.iter().any(|&p| VersionedSet::slot_of(p) == slot) {
                picked.push(candidate);
            }
            candidate += 64;
        }
        picked
    }

    #[test]
    fn put_and_get_round_trip() {
        let ids = distinct_identities(2);
        let mut set = VersionedSet::default();
        set.put(ids[0], 3);
        set.put(ids[1], 7);
        assert_eq!(set.get(ids[0]), 3);
        assert_eq!(set.get(ids[1]), 7);
    }

    #[test]
    fn counters_saturate() {
        let mut set = VersionedSet::default();
        set.put(0x1000, 1000);
        assert_eq!(set.get(0x1000), 15);
    }

    #[test]
    fn put_higher_keeps_the_maximum() {
        let mut set = VersionedSet::default();
        set.put_higher(0x1000, 5);
        set.put_higher(0x1000, 3);
        assert_eq!(set.get(0x1000), 5);
        set.put_higher(0x1000, 9);
        assert_eq!(set.get(0x1000), 9);
    }

    #[test]
    fn put_lower_never_populates_an_empty_slot() {
        let mut set = VersionedSet::default();
        set.put_lower(0x1000, 5);
        assert!(set.is_empty());
        set.put(0x1000, 9);
        set.put_lower(0x1000, 5);
        assert_eq!(set.get(0x1000), 5);
    }

    #[test]
    fn comparisons_ignore_empty_slots() {
        let ids = distinct_identities(2);
        let mut a = VersionedSet::default();
        let mut b = VersionedSet::default();
        a.put(ids[0], 5);
        b.put(ids[1], 1);
        // Occupied slots never overlap, so neither dominates.
        assert!(!a.is_greater_than(&b));
        assert!(!b.is_greater_than(&a));

        b.put(ids[0], 3);
        assert!(a.is_greater_than(&b));
        assert!(a.is_greater_or_equal(&b));
        assert!(!b.is_greater_than(&a));
    }

    #[test]
    fn greater_or_equal_includes_ties() {
        let mut a = VersionedSet::default();
        let mut b = VersionedSet::default();
        a.put(0x1000, 4);
        b.put(0x1000, 4);
        assert!(a.is_greater_or_equal(&b));
        assert!(!a.is_greater_than(&b));
    }

    #[test]
    fn merge_prefers_the_lower_occupied_counter() {
        let ids = distinct_identities(2);
        let mut a = VersionedSet::default();
        let mut b = VersionedSet::default();
        a.put(ids[0], 6);
        b.put(ids[0], 2);
        b.put(ids[1], 9);
        let merged = a.merge(&b);
        assert_eq!(merged.get(ids[0]), 2);
        assert_eq!(merged.get(ids[1]), 9);
    }

    #[test]
    fn pivot_cell_compare_exchange() {
        let cell = PivotCell::new();
        let original = cell.load();
        let mut desired = original;
        desired.target_id = 42;
        desired.epoch = 3;
        assert!(cell.compare_exchange(original, desired));
        assert_eq!(cell.load().target_id, 42);

        // Stale expectation fails.
        assert!(!cell.compare_exchange(original, desired));
    }

    #[test]
    fn wr_edge_detected_via_merged_sets() {
        let mut pivot = PivotObject::default();
        let mut me = PivotObject::default();
        // The pivot transaction wrote version 4; I read version 5 of the
        // same item: a wr path into me exists.
        pivot.merged_write_set.put(0x1000, 4);
        me.merged_read_set.put(0x1000, 5);
        assert_eq!(pivot.is_reachable_into(&me), NwrValidation::Wr);
    }
}
