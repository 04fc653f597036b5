//! CPR-consistent checkpointing.
//!
//! The checkpointer picks a checkpoint epoch one ahead of the current
//! global epoch, waits for every transaction at or before that epoch to
//! drain, and then walks every index under the dual-protocol exclusive lock.
//! Writers that commit while the checkpoint is in progress save the
//! before-image of every item they overwrite
//! (`copy_live_version_to_stable_version`), so the snapshot reflects exactly
//! the state at the end of the checkpoint epoch.

use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::codec::decode_pk_list;
use crate::config::Config;
use crate::epoch::EpochFramework;
use crate::recovery::logger::{LogEntry, LogRecord, CHECKPOINT_FILE, CHECKPOINT_WORKING_FILE};
use crate::table::TableDictionary;
use crate::types::{EpochNumber, TransactionId};

const PHASE_REST: u8 = 0;
const PHASE_IN_PROGRESS: u8 = 1;
const PHASE_WAIT_FLUSH: u8 = 2;

struct CheckpointShared {
    phase: AtomicU8,
    checkpoint_epoch: AtomicU32,
    checkpoint_completed_epoch: AtomicU32,
    stop: AtomicBool,
}

pub struct CheckpointManager {
    shared: Arc<CheckpointShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointManager {
    pub fn new(
        config: &Config,
        tables: Arc<TableDictionary>,
        epochs: Arc<EpochFramework>,
    ) -> Self {
        let shared = Arc::new(CheckpointShared {
            phase: AtomicU8::new(PHASE_REST),
            checkpoint_epoch: AtomicU32::new(0),
            checkpoint_completed_epoch: AtomicU32::new(0),
            stop: AtomicBool::new(false),
        });

        let thread = if config.enable_checkpointing {
            let job_shared = shared.clone();
            let config = config.clone();
            Some(
                thread::Builder::new()
                    .name("basalt-checkpoint".to_string())
                    .spawn(move || checkpoint_job(job_shared, config, tables, epochs))
                    .expect("failed to spawn the checkpoint thread"),
            )
        } else {
            None
        };

        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    pub fn checkpoint_completed_epoch(&self) -> EpochNumber {
        self.shared.checkpoint_completed_epoch.load(Ordering::Acquire)
    }

    /// Whether a transaction in `epoch` commits across the point of
    /// consistency and must save before-images of what it overwrites.
    pub fn is_need_to_checkpointing(&self, epoch: EpochNumber) -> bool {
        if self.shared.phase.load(Ordering::Acquire) == PHASE_REST {
            return false;
        }
        self.shared.checkpoint_epoch.load(Ordering::Acquire) <= epoch
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn checkpoint_job(
    shared: Arc<CheckpointShared>,
    config: Config,
    tables: Arc<TableDictionary>,
    epochs: Arc<EpochFramework>,
) {
    let period = Duration::from_secs(config.checkpoint_period_secs.max(1));
    loop {
        // REST: sleep out the period in small slices so stop stays
        // responsive.
        let rest_started = Instant::now();
        while rest_started.elapsed() < period {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }

        // Determine the snapshot epoch. Transactions may currently run in
        // the global epoch e or e+1 (the writer may bump concurrently), but
        // none can be in e+2 yet; choosing e+1 makes the end of e+1 the
        // point of consistency.
        epochs.make_me_online();
        let current_epoch = epochs.global_epoch();
        let checkpoint_epoch = current_epoch + 1;
        shared
            .checkpoint_epoch
            .store(checkpoint_epoch, Ordering::Release);
        shared.phase.store(PHASE_IN_PROGRESS, Ordering::Release);
        epochs.make_me_offline();

        // Wait until no transaction still runs at or before the
        // checkpoint epoch.
        epochs.sync();
        if shared.stop.load(Ordering::Acquire) && epochs.is_stopped() {
            return;
        }
        shared.phase.store(PHASE_WAIT_FLUSH, Ordering::Release);

        let record = collect_snapshot(&tables, checkpoint_epoch);
        if let Err(e) = write_checkpoint(&config, &record) {
            log::error!("failed to persist the checkpoint: {}", e);
            std::process::exit(1);
        }
        log::debug!(
            "checkpoint of epoch {} persisted ({} entries)",
            checkpoint_epoch,
            record.key_value_pairs.len()
        );

        shared
            .checkpoint_completed_epoch
            .store(checkpoint_epoch, Ordering::Release);
        shared.phase.store(PHASE_REST, Ordering::Release);
    }
}

/// Walks every table under the dual-protocol exclusive lock, preferring the
/// stable (pre-checkpoint) buffer when a concurrent writer captured one.
fn collect_snapshot(tables: &TableDictionary, checkpoint_epoch: EpochNumber) -> LogRecord {
    let snapshot_tid = TransactionId::new(checkpoint_epoch + 1, 0);
    let mut record = LogRecord {
        epoch: checkpoint_epoch + 1,
        key_value_pairs: Vec::new(),
    };

    tables.for_each_table(|table| {
        table.primary_index().for_each(|key, item| {
            item.exclusive_lock();
            let buffer = item
                .take_checkpoint_buffer()
                .unwrap_or_else(|| item.clone_buffer());
            // Tombstones carry nothing into the snapshot.
            if buffer.is_initialized() {
                record.key_value_pairs.push(LogEntry {
                    table_name: table.name().to_string(),
                    index_name: String::new(),
                    key: key.to_string(),
                    buffer: buffer.as_slice().to_vec(),
                    tid: snapshot_tid,
                    primary_keys: Vec::new(),
                });
            }
            item.exclusive_unlock();
            true
        });

        table.for_each_secondary_index(|index| {
            index.entries().for_each(|key, item| {
                item.exclusive_lock();
                let buffer = item
                    .take_checkpoint_buffer()
                    .unwrap_or_else(|| item.clone_buffer());
                if buffer.is_initialized() {
                    match decode_pk_list(buffer.as_slice()) {
                        Ok(primary_keys) => record.key_value_pairs.push(LogEntry {
                            table_name: table.name().to_string(),
                            index_name: index.name().to_string(),
                            key: key.to_string(),
                            buffer: Vec::new(),
                            tid: snapshot_tid,
                            primary_keys,
                        }),
                        Err(e) => log::error!(
                            "skipping corrupt secondary entry '{}' in checkpoint: {}",
                            key,
                            e
                        ),
                    }
                }
                item.exclusive_unlock();
                true
            });
        });
    });

    record
}

fn write_checkpoint(config: &Config, record: &LogRecord) -> crate::error::Result<()> {
    let working_path = config.work_dir.join(CHECKPOINT_WORKING_FILE);
    let final_path = config.work_dir.join(CHECKPOINT_FILE);

    let encoded = bincode::serialize(record)?;
    let mut file = File::create(&working_path)?;
    file.write_all(&(encoded.len() as u32).to_le_bytes())?;
    file.write_all(&encoded)?;
    file.sync_data()?;
    // Readers see the previous checkpoint or this one, never a partial
    // file.
    std::fs::rename(&working_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::logger::read_recovery_set;
    use crate::types::TransactionId;

    fn dictionary_with_data(epochs: &Arc<EpochFramework>) -> Arc<TableDictionary> {
        let config = Config::volatile();
        let tables = Arc::new(TableDictionary::new(0.75));
        tables.create_table("t", epochs.clone(), &config);
        let table = tables.get_table("t").unwrap();
        for (key, value) in [("alice", b"1" as &[u8]), ("bob", b"2")] {
            table.primary_index().force_put_blank_entry(key);
            let item = table.primary_index().get(key).unwrap();
            item.reset(Some(value), Some(TransactionId::new(2, 2)));
        }
        tables
    }

    #[test]
    fn snapshot_contains_every_live_item() {
        let epochs = Arc::new(EpochFramework::new(1));
        epochs.start();
        epochs.make_me_online();
        let tables = dictionary_with_data(&epochs);
        epochs.make_me_offline();

        let record = collect_snapshot(&tables, 5);
        assert_eq!(record.epoch, 6);
        assert_eq!(record.key_value_pairs.len(), 2);
        assert!(record
            .key_value_pairs
            .iter()
            .all(|entry| entry.tid == TransactionId::new(6, 0)));
        epochs.stop();
    }

    #[test]
    fn stable_buffers_win_over_live_values() {
        let epochs = Arc::new(EpochFramework::new(1));
        epochs.start();
        epochs.make_me_online();
        let tables = dictionary_with_data(&epochs);
        epochs.make_me_offline();

        let table = tables.get_table("t").unwrap();
        let item = table.primary_index().get("alice").unwrap();
        // A concurrent writer crossed the point of consistency.
        item.copy_live_version_to_stable_version();
        item.reset(Some(b"dirty"), None);

        let record = collect_snapshot(&tables, 5);
        let alice = record
            .key_value_pairs
            .iter()
            .find(|entry| entry.key == "alice")
            .unwrap();
        assert_eq!(alice.buffer, b"1");
        epochs.stop();
    }

    #[test]
    fn checkpoint_file_round_trips_through_recovery() {
        let epochs = Arc::new(EpochFramework::new(1));
        epochs.start();
        epochs.make_me_online();
        let tables = dictionary_with_data(&epochs);
        epochs.make_me_offline();

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            work_dir: dir.path().to_path_buf(),
            ..Config::volatile()
        };
        let record = collect_snapshot(&tables, 5);
        write_checkpoint(&config, &record).unwrap();

        // Checkpoint entries are eligible regardless of the durable epoch.
        let set = read_recovery_set(dir.path(), 0);
        assert_eq!(set.primaries.len(), 2);
        assert!(!dir.path().join(CHECKPOINT_WORKING_FILE).exists());
        epochs.stop();
    }
}
