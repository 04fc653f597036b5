//! Configuration and options for basalt instances.

use std::path::PathBuf;

/// Concurrency-control protocol selection.
///
/// All three protocols guarantee strict serializability; they differ in how
/// they pay for it. `SiloNwr` is the default: it behaves like `Silo` but may
/// commit write transactions without taking any locks when the omitted writes
/// provably cannot create a dependency cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyControlProtocol {
    Silo,
    SiloNwr,
    TwoPhaseLocking,
}

/// Configuration for a [`Database`](crate::Database) instance.
///
/// The defaults give full durability: write-ahead logging, recovery at open,
/// and periodic checkpointing. Use [`Config::volatile`] for a purely
/// in-memory instance (the common setup for tests and caches).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads in the transaction thread pool.
    /// Default: the hardware concurrency reported by the OS.
    pub max_thread: usize,
    /// Target period of the global epoch advance, in milliseconds.
    /// Larger epochs improve throughput of group commit at the cost of
    /// commit-callback latency. Default: 40.
    pub epoch_duration_ms: u64,
    /// Concurrency-control protocol. Default: `SiloNwr`.
    pub concurrency_control_protocol: ConcurrencyControlProtocol,
    /// Write WAL records on commit. Default: true.
    pub enable_logging: bool,
    /// Replay logs (and the checkpoint) at open. Default: true.
    pub enable_recovery: bool,
    /// Run the background checkpointer. Default: true.
    pub enable_checkpointing: bool,
    /// Checkpoint cadence in seconds. Default: 30.
    pub checkpoint_period_secs: u64,
    /// Directory holding `thread_<id>.log`, `durable_epoch.json`, and
    /// `checkpoint.log`. Default: `./basalt_logs`.
    pub work_dir: PathBuf,
    /// Name of the table used by the short-form API when no table has been
    /// selected. Must be non-empty.
    pub anonymous_table_name: String,
    /// Point-index fill fraction that triggers a rehash. Default: 0.75.
    pub rehash_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_thread: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            epoch_duration_ms: 40,
            concurrency_control_protocol: ConcurrencyControlProtocol::SiloNwr,
            enable_logging: true,
            enable_recovery: true,
            enable_checkpointing: true,
            checkpoint_period_secs: 30,
            work_dir: PathBuf::from("./basalt_logs"),
            anonymous_table_name: "anonymous".to_string(),
            rehash_threshold: 0.75,
        }
    }
}

impl Config {
    /// A purely in-memory configuration: no logging, no recovery, no
    /// checkpointing.
    pub fn volatile() -> Self {
        Self {
            enable_logging: false,
            enable_recovery: false,
            enable_checkpointing: false,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_durable() {
        let config = Config::default();
        assert!(config.enable_logging);
        assert!(config.enable_recovery);
        assert!(config.enable_checkpointing);
        assert_eq!(config.epoch_duration_ms, 40);
        assert_eq!(config.checkpoint_period_secs, 30);
        assert_eq!(config.rehash_threshold, 0.75);
        assert!(!config.anonymous_table_name.is_empty());
    }

    #[test]
    fn volatile_config_disables_durability() {
        let config = Config::volatile();
        assert!(!config.enable_logging);
        assert!(!config.enable_recovery);
        assert!(!config.enable_checkpointing);
    }
}
