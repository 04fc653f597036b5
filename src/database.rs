//! The database facade: wiring for the epoch framework, thread pool,
//! callback engine, logger, checkpointer, and table dictionary.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use crate::callback::{CallbackManager, CommitCallback};
use crate::config::Config;
use crate::epoch::EpochFramework;
use crate::error::{Error, Result};
use crate::index::secondary_index::SecondaryIndexConstraint;
use crate::recovery::checkpoint::CheckpointManager;
use crate::recovery::logger::{self, Logger};
use crate::table::{Table, TableDictionary};
use crate::transaction::Transaction;
use crate::types::{EpochNumber, TxStatus};

type TransactionProcedure = Box<dyn FnOnce(&mut Transaction) + Send + 'static>;

/// An embeddable transactional key/value store.
///
/// Dropping the database fences all pending work, flushes what durability
/// requires, and joins every background thread.
pub struct Database {
    inner: Arc<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    config: Config,
    thread_pool: crate::thread_pool::ThreadPool,
    logger: Option<Logger>,
    callbacks: CallbackManager,
    epochs: Arc<EpochFramework>,
    tables: Arc<TableDictionary>,
    checkpointer: CheckpointManager,
    latest_callbacked_epoch: AtomicU32,
    self_ref: std::sync::Weak<DatabaseInner>,
}

impl Database {
    /// Opens a database, replaying logs and the checkpoint when recovery is
    /// enabled, and starts the epoch machinery.
    pub fn open(config: Config) -> Result<Database> {
        if config.anonymous_table_name.is_empty() {
            return Err(Error::Config(
                "anonymous_table_name must not be empty".to_string(),
            ));
        }
        let worker_count = config.max_thread.max(1);

        let logger = if config.enable_logging {
            Some(Logger::new(&config, worker_count)?)
        } else {
            if config.enable_checkpointing || config.enable_recovery {
                std::fs::create_dir_all(&config.work_dir)?;
            }
            None
        };

        let tables = Arc::new(TableDictionary::new(config.rehash_threshold));
        let checkpoint_tables = tables.clone();
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<DatabaseInner>| {
            let hook = weak.clone();
            let epochs = Arc::new(EpochFramework::with_on_advance(
                config.epoch_duration_ms,
                move |closed_epoch| {
                    if let Some(inner) = hook.upgrade() {
                        inner.on_epoch_advance(closed_epoch);
                    }
                },
            ));
            let checkpointer =
                CheckpointManager::new(&config, checkpoint_tables, epochs.clone());
            DatabaseInner {
                thread_pool: crate::thread_pool::ThreadPool::new(worker_count),
                logger,
                callbacks: CallbackManager::new(worker_count),
                epochs,
                tables,
                checkpointer,
                latest_callbacked_epoch: AtomicU32::new(1),
                self_ref: weak.clone(),
                config,
            }
        });

        inner.tables.create_table(
            &inner.config.anonymous_table_name,
            inner.epochs.clone(),
            &inner.config,
        );
        if inner.config.enable_recovery {
            inner.recovery();
        }
        inner.epochs.start();
        log::info!("basalt instance has been constructed");
        Ok(Database { inner })
    }

    /// Creates a table. Returns false when it already exists.
    pub fn create_table(&self, table_name: &str) -> bool {
        self.inner.tables.create_table(
            table_name,
            self.inner.epochs.clone(),
            &self.inner.config,
        )
    }

    /// Declares a secondary index on `table_name`. Returns false when the
    /// table is missing or the index already exists (an existing index
    /// adopts the constraint).
    pub fn create_secondary_index(
        &self,
        table_name: &str,
        index_name: &str,
        constraint: SecondaryIndexConstraint,
    ) -> bool {
        match self.inner.get_table(table_name) {
            Some(table) => table.create_secondary_index(index_name, constraint),
            None => false,
        }
    }

    /// Fire-and-forget execution: `proc` runs on a pool worker and
    /// `on_commit` fires with the terminal status, after durability for
    /// committed transactions.
    pub fn execute_transaction(
        &self,
        proc: impl FnOnce(&mut Transaction) + Send + 'static,
        on_commit: impl FnOnce(TxStatus) + Send + 'static,
    ) {
        self.inner
            .submit(Box::new(proc), Box::new(on_commit), None);
    }

    /// Like [`execute_transaction`](Self::execute_transaction), with an
    /// extra callback fired synchronously with the precommit decision.
    pub fn execute_transaction_with_precommit_callback(
        &self,
        proc: impl FnOnce(&mut Transaction) + Send + 'static,
        on_commit: impl FnOnce(TxStatus) + Send + 'static,
        on_precommit: impl FnOnce(TxStatus) + Send + 'static,
    ) {
        self.inner.submit(
            Box::new(proc),
            Box::new(on_commit),
            Some(Box::new(on_precommit)),
        );
    }

    /// Handler API: runs the transaction on the calling thread. Must be
    /// paired with [`end_transaction`](Self::end_transaction) (or a drop,
    /// which aborts) on the same thread.
    pub fn begin_transaction(&self) -> Transaction {
        self.inner.epochs.make_me_online();
        Transaction::new(self.inner.clone(), true)
    }

    /// Finishes a handler-API transaction and returns the precommit
    /// decision. `on_commit` fires once the commit is durable.
    pub fn end_transaction(
        &self,
        tx: Transaction,
        on_commit: impl FnOnce(TxStatus) + Send + 'static,
    ) -> bool {
        self.inner.end_transaction(tx, Box::new(on_commit))
    }

    /// Blocks until every pending transaction has finished, every commit
    /// callback has fired, and every index update is visible to scans.
    pub fn fence(&self) {
        self.inner.fence();
    }

    /// Blocks until the checkpointer completes one more checkpoint. A no-op
    /// when checkpointing is disabled.
    pub fn wait_for_checkpoint(&self) {
        if !self.inner.config.enable_checkpointing {
            return;
        }
        let start = self.inner.checkpointer.checkpoint_completed_epoch();
        crate::backoff::retry_with_exponential_backoff(|| {
            self.inner.checkpointer.checkpoint_completed_epoch() != start
        });
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl DatabaseInner {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn epochs(&self) -> &Arc<EpochFramework> {
        &self.epochs
    }

    pub(crate) fn get_table(&self, table_name: &str) -> Option<Arc<Table>> {
        self.tables.get_table(table_name)
    }

    pub(crate) fn is_need_to_checkpointing(&self, epoch: EpochNumber) -> bool {
        self.checkpointer.is_need_to_checkpointing(epoch)
    }

    /// Strong handle to this inner; valid for as long as any method can be
    /// called.
    fn arc(&self) -> Arc<DatabaseInner> {
        self.self_ref.upgrade().expect("database inner already released")
    }

    /// Runs on the epoch-writer thread after each advance: flush, publish
    /// durability, fire callbacks, truncate.
    fn on_epoch_advance(&self, closed_epoch: EpochNumber) {
        let durable_epoch = self.logger.as_ref().map(|logger| {
            let durable = logger.flush_durable_epoch();
            logger.flush_shared_slot(closed_epoch);
            durable
        });
        // Commit callbacks fire only once their epoch is safe: durable when
        // logging, merely closed otherwise.
        let safe_epoch = durable_epoch.unwrap_or(closed_epoch);

        let checkpoint_completed = if self.config.enable_logging && self.config.enable_checkpointing
        {
            self.checkpointer.checkpoint_completed_epoch()
        } else {
            0
        };
        if let Some(logger) = &self.logger {
            logger.truncate_shared_slot(checkpoint_completed);
        }

        let job_inner = self.arc();
        self.thread_pool.enqueue_for_all_threads(Arc::new(move || {
            if let Some(logger) = &job_inner.logger {
                logger.flush_logs(closed_epoch);
            }
            job_inner.callbacks.execute_callbacks(safe_epoch);
            job_inner
                .latest_callbacked_epoch
                .fetch_max(closed_epoch, Ordering::AcqRel);
            if let Some(logger) = &job_inner.logger {
                logger.truncate_logs(checkpoint_completed);
            }
        }));
    }

    fn submit(
        &self,
        proc: TransactionProcedure,
        on_commit: CommitCallback,
        on_precommit: Option<CommitCallback>,
    ) {
        let inner = self.arc();
        let accepted = self.thread_pool.enqueue(move || {
            inner.epochs.make_me_online();
            let mut tx = Transaction::new(inner.clone(), false);
            proc(&mut tx);

            if tx.is_aborted() {
                if let Some(callback) = on_precommit {
                    callback(TxStatus::Aborted);
                }
                on_commit(TxStatus::Aborted);
                drop(tx);
                inner.epochs.make_me_offline();
                return;
            }

            let committed = tx.precommit();
            if committed {
                tx.post_processing(TxStatus::Committed);
                if let Some(callback) = on_precommit {
                    callback(TxStatus::Committed);
                }
                let epoch = inner.epochs.my_thread_local_epoch();
                inner.callbacks.enqueue(on_commit, epoch, false);
                if let Some(logger) = &inner.logger {
                    logger.enqueue(tx.write_set(), epoch, false);
                }
            } else {
                tx.post_processing(TxStatus::Aborted);
                if let Some(callback) = on_precommit {
                    callback(TxStatus::Aborted);
                }
                on_commit(TxStatus::Aborted);
            }
            drop(tx);
            inner.epochs.make_me_offline();
        });
        if !accepted {
            log::warn!("transaction rejected: the pool has stopped accepting work");
        }
    }

    fn end_transaction(&self, mut tx: Transaction, on_commit: CommitCallback) -> bool {
        if tx.is_aborted() {
            on_commit(TxStatus::Aborted);
            tx.finish();
            return false;
        }

        let committed = tx.precommit();
        if committed {
            tx.post_processing(TxStatus::Committed);
            let epoch = self.epochs.my_thread_local_epoch();
            self.callbacks.enqueue(on_commit, epoch, true);
            if let Some(logger) = &self.logger {
                logger.enqueue(tx.write_set(), epoch, true);
            }
        } else {
            tx.post_processing(TxStatus::Aborted);
            on_commit(TxStatus::Aborted);
        }
        tx.finish();

        if self.config.enable_checkpointing {
            if let Some(logger) = &self.logger {
                logger.truncate_shared_slot(self.checkpointer.checkpoint_completed_epoch());
            }
        }
        committed
    }

    fn fence(&self) {
        let current_epoch = self.epochs.global_epoch();
        self.epochs.sync();
        self.thread_pool.wait_for_queues_to_become_empty();
        self.callbacks.wait_for_all_callbacks_to_be_executed();
        // Queue emptiness is reported approximately; the epoch published by
        // the drain jobs is the authoritative signal.
        while self.latest_callbacked_epoch.load(Ordering::Acquire) < current_epoch {
            if self.epochs.is_stopped() {
                break;
            }
            thread::yield_now();
        }
        self.tables
            .for_each_table(|table| table.wait_for_index_is_linearizable());
    }

    fn shutdown(&self) {
        self.fence();
        self.thread_pool.stop_accepting_transactions();
        self.epochs.sync();
        self.checkpointer.stop();
        self.epochs.stop();
        while !self.thread_pool.is_empty() {
            thread::yield_now();
        }
        self.thread_pool.shutdown();
        if let Some(logger) = &self.logger {
            log::debug!(
                "epoch and durable epoch ended at {} and {}",
                self.epochs.global_epoch(),
                logger.durable_epoch()
            );
        }
        log::info!("basalt instance has been destructed");
    }

    /// Startup replay: seed the indices from the recovery set and resume
    /// the global epoch.
    fn recovery(&self) {
        log::info!("start recovery process");
        let durable_epoch = logger::read_durable_epoch(&self.config.work_dir);
        if let Some(logger) = &self.logger {
            logger.set_durable_epoch(durable_epoch);
        }

        self.epochs.make_me_online();
        self.epochs
            .set_my_thread_local_epoch(durable_epoch.max(1));

        let recovery_set = logger::read_recovery_set(&self.config.work_dir, durable_epoch);
        let resumed_epoch = recovery_set.highest_epoch.max(durable_epoch).max(1);

        for primary in recovery_set.primaries {
            if primary.value.is_empty() {
                // Tombstone: the key's final state is "absent".
                continue;
            }
            self.tables
                .create_table(&primary.table_name, self.epochs.clone(), &self.config);
            let Some(table) = self.tables.get_table(&primary.table_name) else {
                log::error!(
                    "recovery failed: table '{}' could not be created",
                    primary.table_name
                );
                std::process::exit(1);
            };
            table.primary_index().force_put_blank_entry(&primary.key);
            if let Some(item) = table.primary_index().get(&primary.key) {
                item.reset(Some(&primary.value), Some(primary.tid));
            }
        }

        for secondary in recovery_set.secondaries {
            if secondary.primary_keys.is_empty() {
                continue;
            }
            self.tables
                .create_table(&secondary.table_name, self.epochs.clone(), &self.config);
            let Some(table) = self.tables.get_table(&secondary.table_name) else {
                log::error!(
                    "recovery failed: table '{}' could not be created",
                    secondary.table_name
                );
                std::process::exit(1);
            };
            // The WAL does not carry index DDL; the host re-declares the
            // constraint after open.
            table.create_secondary_index(&secondary.index_name, SecondaryIndexConstraint::None);
            let Some(index) = table.secondary_index(&secondary.index_name) else {
                log::error!(
                    "recovery failed: secondary index '{}' could not be created",
                    secondary.index_name
                );
                std::process::exit(1);
            };
            let leaf = index.entries().get_or_insert(&secondary.key);
            let encoded = crate::codec::encode_pk_list(&secondary.primary_keys);
            leaf.reset(Some(&encoded), Some(secondary.tid));
        }

        self.epochs.make_me_offline();
        self.epochs.set_global_epoch(resumed_epoch);
        log::info!(
            "finish recovery process; global epoch resumed from {}",
            resumed_epoch
        );
    }
}
