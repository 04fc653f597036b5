//! Secondary indices: serialized key -> list of primary keys.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BufMut;

use crate::config::Config;
use crate::epoch::EpochFramework;
use crate::index::ConcurrentTable;

/// Declared key type of a secondary index.
///
/// Every kind serializes to a fixed-width string preserving the key's
/// natural order under plain byte-wise comparison, so all index machinery
/// can treat secondary keys as opaque strings. Integers are biased by
/// `i64::MIN` first so that signed ordering matches unsigned digit ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecondaryKey {
    Integer(i64),
    Text(String),
    /// Seconds since the Unix epoch.
    Timestamp(i64),
}

impl SecondaryKey {
    pub fn serialize(&self) -> String {
        match self {
            SecondaryKey::Text(v) => v.clone(),
            SecondaryKey::Integer(v) | SecondaryKey::Timestamp(v) => {
                let biased = (*v as u64) ^ (1u64 << 63);
                format!("{biased:020}")
            }
        }
    }

    /// Raw big-endian form of the biased key, for callers that need the
    /// byte-string representation.
    pub fn serialize_bytes(&self) -> Vec<u8> {
        match self {
            SecondaryKey::Text(v) => v.as_bytes().to_vec(),
            SecondaryKey::Integer(v) | SecondaryKey::Timestamp(v) => {
                let mut out = Vec::with_capacity(8);
                out.put_u64((*v as u64) ^ (1u64 << 63));
                out
            }
        }
    }
}

/// Constraint declared at index creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryIndexConstraint {
    None,
    /// At most one primary key per serialized secondary key.
    Unique,
}

pub struct SecondaryIndex {
    name: String,
    unique: AtomicBool,
    index: ConcurrentTable,
}

impl SecondaryIndex {
    pub fn new(
        name: impl Into<String>,
        constraint: SecondaryIndexConstraint,
        epochs: Arc<EpochFramework>,
        config: &Config,
    ) -> Self {
        Self {
            name: name.into(),
            unique: AtomicBool::new(constraint == SecondaryIndexConstraint::Unique),
            index: ConcurrentTable::new(epochs, config),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unique(&self) -> bool {
        self.unique.load(Ordering::Acquire)
    }

    /// Recovery creates indices before the host re-declares the schema;
    /// re-declaration upgrades the constraint in place.
    pub fn set_constraint(&self, constraint: SecondaryIndexConstraint) {
        self.unique.store(
            constraint == SecondaryIndexConstraint::Unique,
            Ordering::Release,
        );
    }

    /// The underlying table of encoded primary-key lists, keyed by
    /// serialized secondary key.
    pub fn entries(&self) -> &ConcurrentTable {
        &self.index
    }
}
