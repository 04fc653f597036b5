//! Write-ahead log with per-thread buffering and epoch-based group commit.
//!
//! Every pool worker owns one log slot (`thread_<id>.log`); one extra shared
//! slot (`thread_<n>.log`, n = worker count) collects records from host
//! threads using the handler API, flushed by the epoch coordinator. Each
//! file therefore has exactly one producer and needs no write-ordering
//! beyond its own mutex.
//!
//! Record framing is a 4-byte little-endian length prefix followed by the
//! bincode-encoded [`LogRecord`]; the stream is self-delimiting so recovery
//! can decode it incrementally and treat a truncated trailing record as the
//! end of the log.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;
use crate::snapshot::WriteSet;
use crate::thread_pool::current_worker_index;
use crate::types::{EpochNumber, TransactionId};

pub const DURABLE_EPOCH_FILE: &str = "durable_epoch.json";
pub const DURABLE_EPOCH_WORKING_FILE: &str = "durable_epoch.working";
pub const CHECKPOINT_FILE: &str = "checkpoint.log";
pub const CHECKPOINT_WORKING_FILE: &str = "checkpoint.working";

/// One logged key/value pair. `index_name` is empty for primary-index
/// writes; secondary-index writes carry only the added primary keys (a
/// delta), never the full list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub table_name: String,
    pub index_name: String,
    pub key: String,
    pub buffer: Vec<u8>,
    pub tid: TransactionId,
    pub primary_keys: Vec<String>,
}

/// The write set of one committed transaction, tagged with its epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub epoch: EpochNumber,
    pub key_value_pairs: Vec<LogEntry>,
}

struct LogFileState {
    file: File,
    /// Smallest record epoch currently in the file; 0 when empty.
    oldest_epoch: EpochNumber,
}

struct LogSlot {
    path: PathBuf,
    records: Mutex<Vec<LogRecord>>,
    file: Mutex<LogFileState>,
    durable_epoch: AtomicU32,
}

pub struct Logger {
    slots: Vec<LogSlot>,
    durable_epoch: AtomicU32,
    durable_epoch_path: PathBuf,
    durable_epoch_working_path: PathBuf,
}

impl Logger {
    /// Opens one append-mode log file per worker plus the shared slot.
    pub fn new(config: &Config, worker_count: usize) -> Result<Self> {
        std::fs::create_dir_all(&config.work_dir)?;
        let mut slots = Vec::with_capacity(worker_count + 1);
        for index in 0..=worker_count {
            let path = config.work_dir.join(format!("thread_{index}.log"));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let oldest_epoch = oldest_epoch_in_file(&path);
            slots.push(LogSlot {
                path,
                records: Mutex::new(Vec::new()),
                file: Mutex::new(LogFileState { file, oldest_epoch }),
                durable_epoch: AtomicU32::new(0),
            });
        }
        Ok(Self {
            slots,
            durable_epoch: AtomicU32::new(0),
            durable_epoch_path: config.work_dir.join(DURABLE_EPOCH_FILE),
            durable_epoch_working_path: config.work_dir.join(DURABLE_EPOCH_WORKING_FILE),
        })
    }

    fn shared_slot_index(&self) -> usize {
        self.slots.len() - 1
    }

    fn my_slot_index(&self, entrusting: bool) -> usize {
        match current_worker_index() {
            Some(worker) if !entrusting => worker,
            _ => self.shared_slot_index(),
        }
    }

    /// Buffers the write set of a freshly committed transaction.
    pub fn enqueue(&self, write_set: &WriteSet, epoch: EpochNumber, entrusting: bool) {
        if write_set.is_empty() {
            return;
        }
        let mut record = LogRecord {
            epoch,
            key_value_pairs: Vec::with_capacity(write_set.len()),
        };
        for snapshot in write_set {
            let is_secondary = snapshot.index_name.is_some();
            record.key_value_pairs.push(LogEntry {
                table_name: snapshot.table_name.clone(),
                index_name: snapshot.index_name.clone().unwrap_or_default(),
                key: snapshot.key.clone(),
                buffer: if is_secondary {
                    Vec::new()
                } else {
                    snapshot.buffer.as_slice().to_vec()
                },
                tid: snapshot.version,
                primary_keys: snapshot.added_primary_keys.clone(),
            });
        }
        let slot = &self.slots[self.my_slot_index(entrusting)];
        slot.records.lock().push(record);
    }

    /// Packs and fsyncs the calling worker's pending records, then marks
    /// the slot durable up to `stable_epoch`.
    pub fn flush_logs(&self, stable_epoch: EpochNumber) {
        self.flush_slot(self.my_slot_index(false), stable_epoch);
    }

    /// Flushes the host-thread slot; the epoch coordinator is its single
    /// producer-side flusher.
    pub fn flush_shared_slot(&self, stable_epoch: EpochNumber) {
        self.flush_slot(self.shared_slot_index(), stable_epoch);
    }

    fn flush_slot(&self, index: usize, stable_epoch: EpochNumber) {
        let slot = &self.slots[index];
        let pending = std::mem::take(&mut *slot.records.lock());
        if !pending.is_empty() {
            let mut state = slot.file.lock();
            for record in &pending {
                if state.oldest_epoch == 0 || record.epoch < state.oldest_epoch {
                    state.oldest_epoch = record.epoch;
                }
                if let Err(e) = write_frame(&mut state.file, record) {
                    log::error!("failed to append to {}: {}", slot.path.display(), e);
                    std::process::exit(1);
                }
            }
            if let Err(e) = state.file.sync_data() {
                log::error!("fsync of {} failed: {}", slot.path.display(), e);
                std::process::exit(1);
            }
        }
        slot.durable_epoch.store(stable_epoch, Ordering::Release);
    }

    /// Publishes `min(slot durable epochs)` to `durable_epoch.json` via an
    /// atomic rename. Returns the published value.
    pub fn flush_durable_epoch(&self) -> EpochNumber {
        let min_durable = self
            .slots
            .iter()
            .map(|slot| slot.durable_epoch.load(Ordering::Acquire))
            .min()
            .unwrap_or(0);
        let current = self.durable_epoch.load(Ordering::Acquire);
        if min_durable == current {
            return current;
        }
        debug_assert!(current < min_durable);

        let serialized = serde_json::to_string(&min_durable).expect("u32 serializes");
        if let Err(e) = std::fs::write(&self.durable_epoch_working_path, serialized) {
            log::error!("failed to write the durable-epoch working file: {}", e);
            std::process::exit(1);
        }
        // POSIX rename gives atomicity: readers see the old integer or the
        // new one, never a torn file.
        if let Err(e) = std::fs::rename(&self.durable_epoch_working_path, &self.durable_epoch_path)
        {
            log::error!(
                "failed to publish durable epoch {}: {}",
                min_durable,
                e
            );
            std::process::exit(1);
        }
        self.durable_epoch.store(min_durable, Ordering::Release);
        min_durable
    }

    pub fn durable_epoch(&self) -> EpochNumber {
        self.durable_epoch.load(Ordering::Acquire)
    }

    /// Seeds every slot's durable epoch after recovery.
    pub fn set_durable_epoch(&self, epoch: EpochNumber) {
        self.durable_epoch.store(epoch, Ordering::Release);
        for slot in &self.slots {
            slot.durable_epoch.store(epoch, Ordering::Release);
        }
    }

    /// Drops log records already covered by the checkpoint from the calling
    /// worker's file.
    pub fn truncate_logs(&self, checkpoint_completed_epoch: EpochNumber) {
        self.truncate_slot(self.my_slot_index(false), checkpoint_completed_epoch);
    }

    pub fn truncate_shared_slot(&self, checkpoint_completed_epoch: EpochNumber) {
        self.truncate_slot(self.shared_slot_index(), checkpoint_completed_epoch);
    }

    fn truncate_slot(&self, index: usize, checkpoint_completed_epoch: EpochNumber) {
        if checkpoint_completed_epoch == 0 {
            return;
        }
        let slot = &self.slots[index];
        let mut state = slot.file.lock();
        if state.oldest_epoch == 0 || checkpoint_completed_epoch < state.oldest_epoch {
            return;
        }

        let surviving: Vec<LogRecord> = decode_frames(&slot.path)
            .into_iter()
            .filter(|record| record.epoch > checkpoint_completed_epoch)
            .collect();

        let rewrite = || -> Result<(File, EpochNumber)> {
            let working_path = slot.path.with_extension("rewrite");
            let mut working = File::create(&working_path)?;
            let mut oldest = 0;
            for record in &surviving {
                if oldest == 0 || record.epoch < oldest {
                    oldest = record.epoch;
                }
                write_frame(&mut working, record)?;
            }
            working.sync_data()?;
            std::fs::rename(&working_path, &slot.path)?;
            let file = OpenOptions::new().append(true).open(&slot.path)?;
            Ok((file, oldest))
        };
        match rewrite() {
            Ok((file, oldest)) => {
                state.file = file;
                state.oldest_epoch = oldest;
            }
            Err(e) => {
                log::error!("log truncation of {} failed: {}", slot.path.display(), e);
                std::process::exit(1);
            }
        }
    }
}

fn write_frame(file: &mut File, record: &LogRecord) -> Result<()> {
    let encoded = bincode::serialize(record)?;
    file.write_all(&(encoded.len() as u32).to_le_bytes())?;
    file.write_all(&encoded)?;
    Ok(())
}

/// Streams every decodable record out of `path`. A truncated or malformed
/// tail ends the stream; it is not an error (the crash may have landed
/// mid-append).
fn decode_frames(path: &Path) -> Vec<LogRecord> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(_) => break,
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            log::warn!(
                "truncated trailing record in {}; treating as end of log",
                path.display()
            );
            break;
        }
        match bincode::deserialize::<LogRecord>(&payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                log::warn!(
                    "undecodable record in {} ({}); treating as end of log",
                    path.display(),
                    e
                );
                break;
            }
        }
    }
    records
}

fn oldest_epoch_in_file(path: &Path) -> EpochNumber {
    decode_frames(path)
        .iter()
        .map(|record| record.epoch)
        .min()
        .unwrap_or(0)
}

/// Reads the published durable epoch; 0 when the file is missing or
/// unreadable.
pub fn read_durable_epoch(work_dir: &Path) -> EpochNumber {
    let path = work_dir.join(DURABLE_EPOCH_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(contents.trim()).unwrap_or(0),
        Err(_) => 0,
    }
}

#[derive(Debug)]
pub struct RecoveredPrimary {
    pub table_name: String,
    pub key: String,
    pub value: Vec<u8>,
    pub tid: TransactionId,
}

#[derive(Debug)]
pub struct RecoveredSecondary {
    pub table_name: String,
    pub index_name: String,
    pub key: String,
    pub primary_keys: Vec<String>,
    pub tid: TransactionId,
}

#[derive(Debug, Default)]
pub struct RecoverySet {
    pub primaries: Vec<RecoveredPrimary>,
    pub secondaries: Vec<RecoveredSecondary>,
    pub highest_epoch: EpochNumber,
}

/// Replays every `thread_*.log` plus `checkpoint.log` under `work_dir`.
///
/// Checkpoint entries are always eligible; log entries only up to the
/// durable epoch. The highest `TransactionId` wins per (table, index, key);
/// secondary records accumulate their primary-key deltas instead.
pub fn read_recovery_set(work_dir: &Path, durable_epoch: EpochNumber) -> RecoverySet {
    use std::collections::HashMap;

    let mut log_files: Vec<PathBuf> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(work_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("thread_") && name.ends_with(".log") {
                log_files.push(entry.path());
            }
        }
    }
    log_files.sort();
    let checkpoint_path = work_dir.join(CHECKPOINT_FILE);

    let mut primaries: HashMap<(String, String), (TransactionId, Vec<u8>)> = HashMap::new();
    let mut secondaries: HashMap<(String, String, String), (TransactionId, Vec<String>)> =
        HashMap::new();
    let mut highest_epoch: EpochNumber = 1;

    let mut apply = |path: &Path, from_checkpoint: bool| {
        for record in decode_frames(path) {
            if !from_checkpoint && record.epoch > durable_epoch {
                continue;
            }
            for entry in record.key_value_pairs {
                highest_epoch = highest_epoch.max(entry.tid.epoch);
                if entry.index_name.is_empty() {
                    let slot = primaries
                        .entry((entry.table_name, entry.key))
                        .or_insert((TransactionId::default(), Vec::new()));
                    if slot.0 < entry.tid || (slot.0.is_empty() && slot.1.is_empty()) {
                        *slot = (entry.tid, entry.buffer);
                    }
                } else {
                    let slot = secondaries
                        .entry((entry.table_name, entry.index_name, entry.key))
                        .or_insert((TransactionId::default(), Vec::new()));
                    slot.0 = slot.0.max(entry.tid);
                    for pk in entry.primary_keys {
                        if !slot.1.contains(&pk) {
                            slot.1.push(pk);
                        }
                    }
                }
            }
        }
    };

    for path in &log_files {
        apply(path, false);
    }
    if checkpoint_path.exists() {
        apply(&checkpoint_path, true);
    }

    let mut set = RecoverySet {
        highest_epoch,
        ..Default::default()
    };
    for ((table_name, key), (tid, value)) in primaries {
        set.primaries.push(RecoveredPrimary {
            table_name,
            key,
            value,
            tid,
        });
    }
    for ((table_name, index_name, key), (tid, primary_keys)) in secondaries {
        set.secondaries.push(RecoveredSecondary {
            table_name,
            index_name,
            key,
            primary_keys,
            tid,
        });
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_item::{DataBuffer, DataItem};
    use crate::snapshot::Snapshot;
    use std::sync::Arc;

    fn config_in(dir: &Path) -> Config {
        Config {
            work_dir: dir.to_path_buf(),
            ..Config::volatile()
        }
    }

    fn primary_write(table: &str, key: &str, value: &[u8], tid: TransactionId) -> Snapshot {
        let mut snapshot = Snapshot::new(
            key,
            table,
            None,
            Arc::new(DataItem::default()),
            DataBuffer::from_value(Some(value)),
            tid,
        );
        snapshot.version = tid;
        snapshot
    }

    #[test]
    fn flush_writes_framed_records() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&config_in(dir.path()), 2).unwrap();

        let write_set = vec![primary_write("t", "alice", b"1", TransactionId::new(2, 4))];
        logger.enqueue(&write_set, 2, false);
        // Not on a pool worker, so this lands in (and flushes from) the
        // shared slot.
        logger.flush_shared_slot(2);

        let records = decode_frames(&dir.path().join("thread_2.log"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].epoch, 2);
        assert_eq!(records[0].key_value_pairs[0].key, "alice");
        assert_eq!(records[0].key_value_pairs[0].buffer, b"1");
    }

    #[test]
    fn durable_epoch_publication_is_the_minimum_over_slots() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&config_in(dir.path()), 1).unwrap();
        // Only the shared slot flushes; the worker slot stays at 0, so
        // nothing is published yet.
        logger.flush_shared_slot(5);
        assert_eq!(logger.flush_durable_epoch(), 0);
        assert_eq!(read_durable_epoch(dir.path()), 0);
    }

    #[test]
    fn durable_epoch_is_published_via_rename() {
        let dir = tempfile::tempdir().unwrap();
        // A single (shared) slot: its flush alone advances the minimum.
        let logger = Logger::new(&config_in(dir.path()), 0).unwrap();
        logger.flush_shared_slot(5);
        assert_eq!(logger.flush_durable_epoch(), 5);
        assert_eq!(read_durable_epoch(dir.path()), 5);
        assert!(!dir.path().join(DURABLE_EPOCH_WORKING_FILE).exists());
    }

    #[test]
    fn recovery_keeps_the_highest_version_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&config_in(dir.path()), 1).unwrap();

        logger.enqueue(
            &vec![primary_write("t", "alice", b"old", TransactionId::new(2, 4))],
            2,
            true,
        );
        logger.enqueue(
            &vec![primary_write("t", "alice", b"new", TransactionId::new(3, 2))],
            3,
            true,
        );
        logger.flush_shared_slot(3);

        let set = read_recovery_set(dir.path(), 3);
        assert_eq!(set.primaries.len(), 1);
        assert_eq!(set.primaries[0].value, b"new");
        assert_eq!(set.highest_epoch, 3);

        // With a lower durable epoch the second write is not recoverable.
        let set = read_recovery_set(dir.path(), 2);
        assert_eq!(set.primaries[0].value, b"old");
    }

    #[test]
    fn secondary_records_replay_as_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&config_in(dir.path()), 1).unwrap();

        let mut first = Snapshot::new(
            "alice@example.com",
            "users",
            Some("email".to_string()),
            Arc::new(DataItem::default()),
            DataBuffer::from_value(Some(b"ignored")),
            TransactionId::new(2, 2),
        );
        first.version = TransactionId::new(2, 2);
        first.added_primary_keys.push("user#1".to_string());
        let mut second = first.clone();
        second.version = TransactionId::new(2, 4);
        second.added_primary_keys = vec!["user#2".to_string()];

        logger.enqueue(&vec![first], 2, true);
        logger.enqueue(&vec![second], 2, true);
        logger.flush_shared_slot(2);

        let set = read_recovery_set(dir.path(), 2);
        assert_eq!(set.secondaries.len(), 1);
        let recovered = &set.secondaries[0];
        assert_eq!(recovered.index_name, "email");
        assert_eq!(recovered.primary_keys, vec!["user#1", "user#2"]);
        // Secondary entries never carry the value buffer.
        assert_eq!(set.primaries.len(), 0);
    }

    #[test]
    fn truncation_drops_checkpointed_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&config_in(dir.path()), 1).unwrap();

        for epoch in 2..=6u32 {
            logger.enqueue(
                &vec![primary_write(
                    "t",
                    &format!("k{epoch}"),
                    b"v",
                    TransactionId::new(epoch, 2),
                )],
                epoch,
                true,
            );
        }
        logger.flush_shared_slot(6);
        let path = dir.path().join("thread_1.log");
        let before = std::fs::metadata(&path).unwrap().len();

        logger.truncate_shared_slot(4);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);

        let surviving = decode_frames(&path);
        assert_eq!(surviving.len(), 2);
        assert!(surviving.iter().all(|record| record.epoch > 4));
    }

    #[test]
    fn truncated_tail_is_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(&config_in(dir.path()), 0).unwrap();
        logger.enqueue(
            &vec![primary_write("t", "alice", b"1", TransactionId::new(2, 2))],
            2,
            true,
        );
        logger.flush_shared_slot(2);

        let path = dir.path().join("thread_0.log");
        let mut bytes = std::fs::read(&path).unwrap();
        let full = bytes.len();
        // Append a frame header promising more than exists.
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(b"partial");
        std::fs::write(&path, &bytes).unwrap();

        let records = decode_frames(&path);
        assert_eq!(records.len(), 1);
        let set = read_recovery_set(dir.path(), 2);
        assert_eq!(set.primaries.len(), 1);
        assert!(full > 0);
    }
}
