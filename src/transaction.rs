//! The transaction object: operation dispatch over the read and write sets.
//!
//! Concurrency-control protocols assume a transaction never issues the same
//! operation twice against one data item. This layer establishes that
//! discipline before anything reaches a protocol:
//! read-your-own-writes (a read after a write observes the private copy) and
//! repeatable read (a second read returns the first read's copy) are both
//! resolved against the local sets first.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::cc::{make_protocol, CcProtocol};
use crate::codec::{decode_pk_list, encode_pk_list};
use crate::data_item::DataBuffer;
use crate::database::DatabaseInner;
use crate::index::range_index::TxContext;
use crate::index::secondary_index::SecondaryKey;
use crate::snapshot::{ReadSet, Snapshot, WriteSet};
use crate::table::Table;
use crate::types::TxStatus;

/// A single serializable unit of work. Obtained from
/// [`Database::begin_transaction`](crate::Database::begin_transaction) or as
/// the argument of
/// [`Database::execute_transaction`](crate::Database::execute_transaction).
///
/// All operations become no-ops once the transaction is aborted; the caller
/// observes the outcome through [`status`](Self::status) and the commit
/// callback.
pub struct Transaction {
    status: TxStatus,
    read_set: ReadSet,
    write_set: WriteSet,
    cc: Box<dyn CcProtocol + Send>,
    inner: Arc<DatabaseInner>,
    current_table: Option<Arc<Table>>,
    ctx: TxContext,
    /// (table, primary key) pairs first created by this transaction.
    new_primary_keys: HashSet<(String, String)>,
    /// (table, primary key) -> secondary indices written for that key.
    secondary_writes: HashMap<(String, String), HashSet<String>>,
    owns_online: bool,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(inner: Arc<DatabaseInner>, owns_online: bool) -> Self {
        let cc = make_protocol(inner.config().concurrency_control_protocol);
        Self {
            status: TxStatus::Running,
            read_set: Vec::new(),
            write_set: Vec::new(),
            cc,
            inner,
            current_table: None,
            ctx: TxContext::allocate(),
            new_primary_keys: HashSet::new(),
            secondary_writes: HashMap::new(),
            owns_online,
            finished: false,
        }
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn is_aborted(&self) -> bool {
        self.status == TxStatus::Aborted
    }

    /// Switches the table the short-form operations act on. Returns false
    /// when no such table exists.
    pub fn set_table(&mut self, table_name: &str) -> bool {
        match self.inner.get_table(table_name) {
            Some(table) => {
                self.current_table = Some(table);
                true
            }
            None => false,
        }
    }

    fn ensure_current_table(&mut self) -> Option<Arc<Table>> {
        if self.current_table.is_none() {
            let anonymous = self.inner.config().anonymous_table_name.clone();
            self.current_table = self.inner.get_table(&anonymous);
            if self.current_table.is_none() {
                self.abort();
                return None;
            }
        }
        self.current_table.clone()
    }

    fn need_checkpoint(&self) -> bool {
        self.inner.config().enable_checkpointing
            && self
                .inner
                .is_need_to_checkpointing(self.inner.epochs().my_thread_local_epoch())
    }

    fn find_write(&self, table: &str, index: Option<&str>, key: &str) -> Option<usize> {
        self.write_set
            .iter()
            .position(|snapshot| snapshot.matches(table, index, key))
    }

    fn find_read(&self, table: &str, index: Option<&str>, key: &str) -> Option<usize> {
        self.read_set
            .iter()
            .position(|snapshot| snapshot.matches(table, index, key))
    }

    /// Marks a prior read of the slot as read-modify-write and reports
    /// whether one existed.
    fn mark_read_modify_write(&mut self, table: &str, index: Option<&str>, key: &str) -> bool {
        match self.find_read(table, index, key) {
            Some(position) => {
                self.read_set[position].is_read_modify_write = true;
                true
            }
            None => false,
        }
    }

    /// Reads `key` from the current table. `None` means the key is absent
    /// (never written, deleted, or the transaction is aborted).
    pub fn read(&mut self, key: &str) -> Option<Vec<u8>> {
        if self.is_aborted() {
            return None;
        }
        let table = self.ensure_current_table()?;
        let table_name = table.name().to_string();

        if let Some(position) = self.find_write(&table_name, None, key) {
            let buffer = &self.write_set[position].buffer;
            return buffer
                .is_initialized()
                .then(|| buffer.as_slice().to_vec());
        }
        if let Some(position) = self.find_read(&table_name, None, key) {
            let buffer = &self.read_set[position].buffer;
            return buffer
                .is_initialized()
                .then(|| buffer.as_slice().to_vec());
        }

        let leaf = table.primary_index().get_or_insert(key);
        let Some((buffer, version)) = self.cc.read(&leaf) else {
            self.abort();
            return None;
        };
        let result = buffer
            .is_initialized()
            .then(|| buffer.as_slice().to_vec());
        self.read_set
            .push(Snapshot::new(key, table_name, None, leaf, buffer, version));
        result
    }

    /// Creates `key` with `value`. Aborts on a phantom conflict or when the
    /// key already exists.
    pub fn insert(&mut self, key: &str, value: &[u8]) {
        if self.is_aborted() {
            return;
        }
        let Some(table) = self.ensure_current_table() else {
            return;
        };
        let table_name = table.name().to_string();

        if !table.primary_index().insert(key, Some(self.ctx)) {
            self.abort();
            return;
        }

        let is_rmw = self.mark_read_modify_write(&table_name, None, key);

        if let Some(position) = self.find_write(&table_name, None, key) {
            let snapshot = &mut self.write_set[position];
            snapshot.buffer.reset(Some(value));
            if is_rmw {
                snapshot.is_read_modify_write = true;
            }
            return;
        }

        let leaf = table.primary_index().get_or_insert(key);
        if leaf.is_initialized() {
            // The key already exists; an insert must not overwrite it.
            self.abort();
            return;
        }
        if !table.secondary_index_names().is_empty() {
            self.new_primary_keys
                .insert((table_name.clone(), key.to_string()));
        }

        let need_checkpoint = self.need_checkpoint();
        if !self.cc.write(
            key,
            &table_name,
            None,
            Some(value),
            &leaf,
            &self.read_set,
            need_checkpoint,
        ) {
            self.abort();
            return;
        }
        let version = leaf.tid();
        let mut snapshot = Snapshot::new(
            key,
            table_name,
            None,
            leaf,
            DataBuffer::from_value(Some(value)),
            version,
        );
        snapshot.is_read_modify_write = is_rmw;
        self.write_set.push(snapshot);
    }

    /// Overwrites an existing `key`. Aborts when the key does not exist.
    pub fn update(&mut self, key: &str, value: &[u8]) {
        self.write_existing(key, Some(value));
    }

    /// Upsert: update when the key exists, insert otherwise.
    pub fn write(&mut self, key: &str, value: &[u8]) {
        if self.is_aborted() {
            return;
        }
        let Some(table) = self.ensure_current_table() else {
            return;
        };
        let table_name = table.name().to_string();

        if self.find_write(&table_name, None, key).is_some() {
            self.write_existing(key, Some(value));
            return;
        }
        let exists = table
            .primary_index()
            .get(key)
            .map_or(false, |leaf| leaf.is_initialized());
        if exists {
            self.write_existing(key, Some(value));
        } else {
            self.insert(key, value);
        }
    }

    /// Deletes `key`: a structural removal from the range index plus a
    /// tombstone write to the data item.
    pub fn delete(&mut self, key: &str) {
        if self.is_aborted() {
            return;
        }
        let Some(table) = self.ensure_current_table() else {
            return;
        };
        let table_name = table.name().to_string();

        if !table.primary_index().delete(key, Some(self.ctx)) {
            self.abort();
            return;
        }
        self.new_primary_keys.remove(&(table_name, key.to_string()));
        self.write_existing(key, None);
    }

    fn write_existing(&mut self, key: &str, value: Option<&[u8]>) {
        if self.is_aborted() {
            return;
        }
        let Some(table) = self.ensure_current_table() else {
            return;
        };
        let table_name = table.name().to_string();

        let is_rmw = self.mark_read_modify_write(&table_name, None, key);

        if let Some(position) = self.find_write(&table_name, None, key) {
            let snapshot = &mut self.write_set[position];
            snapshot.buffer.reset(value);
            if is_rmw {
                snapshot.is_read_modify_write = true;
            }
            return;
        }

        let Some(leaf) = table.primary_index().get(key) else {
            self.abort();
            return;
        };
        if !leaf.is_initialized() {
            self.abort();
            return;
        }

        let need_checkpoint = self.need_checkpoint();
        if !self.cc.write(
            key,
            &table_name,
            None,
            value,
            &leaf,
            &self.read_set,
            need_checkpoint,
        ) {
            self.abort();
            return;
        }
        let version = leaf.tid();
        let mut snapshot = Snapshot::new(
            key,
            table_name,
            None,
            leaf,
            DataBuffer::from_value(value),
            version,
        );
        snapshot.is_read_modify_write = is_rmw;
        self.write_set.push(snapshot);
    }

    /// Ordered scan over `[begin, end]` (or `[begin, +inf)`), ascending.
    /// `visit` receives each key/value pair and may cancel by returning
    /// true. Returns `None` when the scan had to abort.
    pub fn scan(
        &mut self,
        begin: &str,
        end: Option<&str>,
        visit: impl FnMut(&str, &[u8]) -> bool,
    ) -> Option<usize> {
        self.scan_impl(begin, end, false, visit)
    }

    /// Descending variant; with no `end` it runs from the maximum key down
    /// to `begin`.
    pub fn scan_reverse(
        &mut self,
        begin: &str,
        end: Option<&str>,
        visit: impl FnMut(&str, &[u8]) -> bool,
    ) -> Option<usize> {
        self.scan_impl(begin, end, true, visit)
    }

    fn scan_impl(
        &mut self,
        begin: &str,
        end: Option<&str>,
        reverse: bool,
        mut visit: impl FnMut(&str, &[u8]) -> bool,
    ) -> Option<usize> {
        if self.is_aborted() {
            return None;
        }
        let table = self.ensure_current_table()?;
        let table_name = table.name().to_string();

        // Keys currently visible in the stable index...
        let mut keys: BTreeSet<String> = BTreeSet::new();
        let index_scan = if reverse {
            table
                .primary_index()
                .scan_reverse(begin, end, Some(self.ctx), |key| {
                    keys.insert(key.to_string());
                    false
                })
        } else {
            table.primary_index().scan(begin, end, Some(self.ctx), |key| {
                keys.insert(key.to_string());
                false
            })
        };
        if index_scan.is_none() {
            self.abort();
            return None;
        }

        // ...unioned with this transaction's own writes in range.
        for snapshot in &self.write_set {
            if snapshot.table_name != table_name || snapshot.index_name.is_some() {
                continue;
            }
            if snapshot.key.as_str() < begin {
                continue;
            }
            if let Some(end) = end {
                if snapshot.key.as_str() > end {
                    continue;
                }
            }
            keys.insert(snapshot.key.clone());
        }

        let ordered: Vec<String> = if reverse {
            keys.into_iter().rev().collect()
        } else {
            keys.into_iter().collect()
        };

        let mut delivered = 0usize;
        for key in ordered {
            if self.is_aborted() {
                return None;
            }

            if let Some(position) = self.find_write(&table_name, None, &key) {
                let snapshot = &self.write_set[position];
                // A key deleted by this transaction stays invisible.
                if !snapshot.buffer.is_initialized() {
                    continue;
                }
                delivered += 1;
                if visit(&key, snapshot.buffer.as_slice()) {
                    return Some(delivered);
                }
                continue;
            }

            if let Some(value) = self.read(&key) {
                delivered += 1;
                if visit(&key, &value) {
                    return Some(delivered);
                }
            } else if self.is_aborted() {
                return None;
            }
        }
        Some(delivered)
    }

    /// Adds `primary_key` to the list stored under `key` in the named
    /// secondary index. Duplicate additions within one transaction (or of an
    /// already-listed primary key) are idempotent. Violating a UNIQUE
    /// constraint aborts.
    pub fn write_secondary_index(
        &mut self,
        index_name: &str,
        key: &SecondaryKey,
        primary_key: &str,
    ) {
        if self.is_aborted() {
            return;
        }
        let Some(table) = self.ensure_current_table() else {
            return;
        };
        let table_name = table.name().to_string();
        let Some(index) = table.secondary_index(index_name) else {
            self.abort();
            return;
        };
        let serialized = key.serialize();

        let Some(mut pk_list) = self.current_pk_list(&table, index_name, &serialized) else {
            return;
        };

        if pk_list.iter().any(|pk| pk == primary_key) {
            self.record_secondary_write(&table_name, index_name, primary_key);
            return;
        }
        if index.is_unique() && !pk_list.is_empty() {
            self.abort();
            return;
        }

        pk_list.push(primary_key.to_string());
        let encoded = encode_pk_list(&pk_list);
        if self.store_pk_list(&table, index_name, &serialized, &encoded, Some(primary_key)) {
            self.record_secondary_write(&table_name, index_name, primary_key);
        }
    }

    /// Returns the primary keys stored under `key`, or `None` when the
    /// transaction aborted.
    pub fn read_secondary_index(
        &mut self,
        index_name: &str,
        key: &SecondaryKey,
    ) -> Option<Vec<String>> {
        if self.is_aborted() {
            return None;
        }
        let table = self.ensure_current_table()?;
        if table.secondary_index(index_name).is_none() {
            self.abort();
            return None;
        }
        let serialized = key.serialize();
        self.current_pk_list(&table, index_name, &serialized)
    }

    /// Moves `primary_key` from `old_key` to `new_key`.
    pub fn update_secondary_index(
        &mut self,
        index_name: &str,
        old_key: &SecondaryKey,
        new_key: &SecondaryKey,
        primary_key: &str,
    ) {
        self.delete_secondary_index(index_name, old_key, primary_key);
        self.write_secondary_index(index_name, new_key, primary_key);
    }

    /// Removes `primary_key` from the list stored under `key`.
    pub fn delete_secondary_index(
        &mut self,
        index_name: &str,
        key: &SecondaryKey,
        primary_key: &str,
    ) {
        if self.is_aborted() {
            return;
        }
        let Some(table) = self.ensure_current_table() else {
            return;
        };
        if table.secondary_index(index_name).is_none() {
            self.abort();
            return;
        }
        let serialized = key.serialize();

        let Some(mut pk_list) = self.current_pk_list(&table, index_name, &serialized) else {
            return;
        };
        let before = pk_list.len();
        pk_list.retain(|pk| pk != primary_key);
        if pk_list.len() == before {
            return;
        }
        let encoded = encode_pk_list(&pk_list);
        self.store_pk_list(&table, index_name, &serialized, &encoded, None);
    }

    /// The decoded primary-key list as this transaction currently sees it:
    /// its own write first, then its own earlier read, then the committed
    /// state.
    fn current_pk_list(
        &mut self,
        table: &Arc<Table>,
        index_name: &str,
        serialized: &str,
    ) -> Option<Vec<String>> {
        let table_name = table.name().to_string();

        let buffer = if let Some(position) =
            self.find_write(&table_name, Some(index_name), serialized)
        {
            self.write_set[position].buffer.clone()
        } else if let Some(position) = self.find_read(&table_name, Some(index_name), serialized) {
            self.read_set[position].buffer.clone()
        } else {
            let index = table.secondary_index(index_name)?;
            let leaf = index.entries().get_or_insert(serialized);
            let Some((buffer, version)) = self.cc.read(&leaf) else {
                self.abort();
                return None;
            };
            self.read_set.push(Snapshot::new(
                serialized,
                table_name,
                Some(index_name.to_string()),
                leaf,
                buffer.clone(),
                version,
            ));
            buffer
        };

        if !buffer.is_initialized() {
            return Some(Vec::new());
        }
        match decode_pk_list(buffer.as_slice()) {
            Ok(list) => Some(list),
            Err(e) => {
                log::error!(
                    "corrupt primary-key list in index '{}' of table '{}': {}",
                    index_name,
                    table.name(),
                    e
                );
                self.abort();
                None
            }
        }
    }

    /// Writes the re-encoded list through the write set. `added` names the
    /// primary key this write appends, which is what the WAL records.
    fn store_pk_list(
        &mut self,
        table: &Arc<Table>,
        index_name: &str,
        serialized: &str,
        encoded: &[u8],
        added: Option<&str>,
    ) -> bool {
        let table_name = table.name().to_string();
        let is_rmw = self.mark_read_modify_write(&table_name, Some(index_name), serialized);

        if let Some(position) = self.find_write(&table_name, Some(index_name), serialized) {
            let snapshot = &mut self.write_set[position];
            snapshot.buffer.reset(Some(encoded));
            if is_rmw {
                snapshot.is_read_modify_write = true;
            }
            if let Some(added) = added {
                if !snapshot.added_primary_keys.iter().any(|pk| pk == added) {
                    snapshot.added_primary_keys.push(added.to_string());
                }
            }
            return true;
        }

        let Some(index) = table.secondary_index(index_name) else {
            self.abort();
            return false;
        };
        let leaf = index.entries().get_or_insert(serialized);
        let need_checkpoint = self.need_checkpoint();
        if !self.cc.write(
            serialized,
            &table_name,
            Some(index_name),
            Some(encoded),
            &leaf,
            &self.read_set,
            need_checkpoint,
        ) {
            self.abort();
            return false;
        }
        let version = leaf.tid();
        let mut snapshot = Snapshot::new(
            serialized,
            table_name,
            Some(index_name.to_string()),
            leaf,
            DataBuffer::from_value(Some(encoded)),
            version,
        );
        snapshot.is_read_modify_write = is_rmw;
        if let Some(added) = added {
            snapshot.added_primary_keys.push(added.to_string());
        }
        self.write_set.push(snapshot);
        true
    }

    fn record_secondary_write(&mut self, table_name: &str, index_name: &str, primary_key: &str) {
        self.secondary_writes
            .entry((table_name.to_string(), primary_key.to_string()))
            .or_default()
            .insert(index_name.to_string());
    }

    /// Every primary key created by this transaction must have touched each
    /// of its table's secondary indices.
    fn validate_secondary_not_null(&self) -> bool {
        for (table_name, primary_key) in &self.new_primary_keys {
            let Some(table) = self.inner.get_table(table_name) else {
                return false;
            };
            let required = table.secondary_index_names();
            let satisfied = self
                .secondary_writes
                .get(&(table_name.clone(), primary_key.clone()));
            let covered = required.iter().all(|index_name| {
                satisfied.map_or(false, |written| written.contains(index_name))
            });
            if !covered {
                return false;
            }
        }
        true
    }

    /// Voluntarily aborts the transaction. Further operations become
    /// no-ops.
    pub fn abort(&mut self) {
        if self.status != TxStatus::Running {
            return;
        }
        self.status = TxStatus::Aborted;
        self.cc.abort();
        let epoch = self.inner.epochs().my_thread_local_epoch();
        self.cc
            .post_processing(&mut self.read_set, &mut self.write_set, TxStatus::Aborted, epoch);
    }

    pub(crate) fn precommit(&mut self) -> bool {
        if self.is_aborted() {
            return false;
        }
        if !self.validate_secondary_not_null() {
            // Pessimistic writes are already applied; roll them back.
            self.abort();
            return false;
        }
        let epoch = self.inner.epochs().my_thread_local_epoch();
        let need_checkpoint = self.need_checkpoint();
        self.cc
            .precommit(&mut self.read_set, &mut self.write_set, epoch, need_checkpoint)
    }

    /// Must run after [`precommit`](Self::precommit), with its decision.
    pub(crate) fn post_processing(&mut self, status: TxStatus) {
        if status == TxStatus::Aborted {
            self.status = TxStatus::Aborted;
        } else if status == TxStatus::Committed {
            self.status = TxStatus::Committed;
        }
        let epoch = self.inner.epochs().my_thread_local_epoch();
        self.cc
            .post_processing(&mut self.read_set, &mut self.write_set, status, epoch);
    }

    pub(crate) fn write_set(&self) -> &WriteSet {
        &self.write_set
    }

    /// Ends the handler-API lifecycle: releases the online slot taken by
    /// `begin_transaction`.
    pub(crate) fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.owns_online {
            self.owns_online = false;
            self.inner.epochs().make_me_offline();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status == TxStatus::Running {
            // Dropped without a verdict: release protocol locks.
            self.abort();
        }
        self.finish();
    }
}
