//! Read/write-set entries.

use std::sync::Arc;

use crate::data_item::{DataBuffer, DataItem};
use crate::types::TransactionId;

/// One entry of a transaction's read set or write set.
///
/// `index_cache` pins the data item so its address stays valid for the
/// transaction's lifetime; `buffer`/`version` carry the private copy. For
/// secondary-index entries, `index_name` is set and `added_primary_keys`
/// records the delta this transaction appended (the unit the WAL logs).
#[derive(Clone)]
pub struct Snapshot {
    pub key: String,
    pub table_name: String,
    pub index_name: Option<String>,
    pub index_cache: Arc<DataItem>,
    pub buffer: DataBuffer,
    pub version: TransactionId,
    pub is_read_modify_write: bool,
    pub added_primary_keys: Vec<String>,
}

impl Snapshot {
    pub fn new(
        key: impl Into<String>,
        table_name: impl Into<String>,
        index_name: Option<String>,
        index_cache: Arc<DataItem>,
        buffer: DataBuffer,
        version: TransactionId,
    ) -> Self {
        Self {
            key: key.into(),
            table_name: table_name.into(),
            index_name,
            index_cache,
            buffer,
            version,
            is_read_modify_write: false,
            added_primary_keys: Vec::new(),
        }
    }

    /// Whether this entry names the same logical slot as `(table, index,
    /// key)`.
    pub fn matches(&self, table_name: &str, index_name: Option<&str>, key: &str) -> bool {
        self.table_name == table_name && self.index_name.as_deref() == index_name && self.key == key
    }
}

pub type ReadSet = Vec<Snapshot>;
pub type WriteSet = Vec<Snapshot>;
