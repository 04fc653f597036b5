//! Named tables and the dictionary that owns them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Config;
use crate::epoch::EpochFramework;
use crate::index::secondary_index::{SecondaryIndex, SecondaryIndexConstraint};
use crate::index::point_index::MpmcConcurrentSet;
use crate::index::ConcurrentTable;

/// A table owns exactly one primary index and a set of named secondary
/// indices. Tables are created on demand and never destroyed while the
/// database is up.
pub struct Table {
    name: String,
    primary_index: ConcurrentTable,
    secondary_indices: RwLock<HashMap<String, Arc<SecondaryIndex>>>,
    epochs: Arc<EpochFramework>,
    config: Config,
}

impl Table {
    pub fn new(name: impl Into<String>, epochs: Arc<EpochFramework>, config: &Config) -> Self {
        Self {
            name: name.into(),
            primary_index: ConcurrentTable::new(epochs.clone(), config),
            secondary_indices: RwLock::new(HashMap::new()),
            epochs,
            config: config.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_index(&self) -> &ConcurrentTable {
        &self.primary_index
    }

    /// Returns false when an index of this name already exists; in that
    /// case the existing index adopts `constraint` (schema re-declaration
    /// after recovery).
    pub fn create_secondary_index(
        &self,
        index_name: &str,
        constraint: SecondaryIndexConstraint,
    ) -> bool {
        let mut indices = self.secondary_indices.write();
        if let Some(existing) = indices.get(index_name) {
            existing.set_constraint(constraint);
            return false;
        }
        indices.insert(
            index_name.to_string(),
            Arc::new(SecondaryIndex::new(
                index_name,
                constraint,
                self.epochs.clone(),
                &self.config,
            )),
        );
        true
    }

    pub fn secondary_index(&self, index_name: &str) -> Option<Arc<SecondaryIndex>> {
        self.secondary_indices.read().get(index_name).cloned()
    }

    pub fn secondary_index_names(&self) -> Vec<String> {
        self.secondary_indices.read().keys().cloned().collect()
    }

    pub fn for_each_secondary_index(&self, mut f: impl FnMut(&SecondaryIndex)) {
        let indices: Vec<_> = self.secondary_indices.read().values().cloned().collect();
        for index in indices {
            f(&index);
        }
    }

    pub fn wait_for_index_is_linearizable(&self) {
        self.primary_index.wait_for_index_is_linearizable();
        self.for_each_secondary_index(|index| index.entries().wait_for_index_is_linearizable());
    }
}

/// All tables of one database, keyed by name through the same MPMC set the
/// point indices use.
pub struct TableDictionary {
    tables: MpmcConcurrentSet<Table>,
}

impl TableDictionary {
    pub fn new(rehash_threshold: f64) -> Self {
        Self {
            tables: MpmcConcurrentSet::new(rehash_threshold),
        }
    }

    /// Returns false when the table already exists.
    pub fn create_table(
        &self,
        table_name: &str,
        epochs: Arc<EpochFramework>,
        config: &Config,
    ) -> bool {
        if self.tables.get(table_name).is_some() {
            return false;
        }
        self.tables
            .put(table_name, Arc::new(Table::new(table_name, epochs, config)))
    }

    pub fn get_table(&self, table_name: &str) -> Option<Arc<Table>> {
        self.tables.get(table_name)
    }

    pub fn for_each_table(&self, mut f: impl FnMut(&Arc<Table>)) {
        self.tables.for_each(|_, table| {
            f(table);
            true
        });
    }
}
