//! Shared helpers for the integration tests.
#![allow(dead_code)]

use basalt::{Config, ConcurrencyControlProtocol, Database, Transaction, TxStatus};

/// Installs the logging front-end once per test binary.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fast, purely in-memory configuration.
pub fn volatile_config(protocol: ConcurrencyControlProtocol) -> Config {
    Config {
        max_thread: 4,
        epoch_duration_ms: 5,
        concurrency_control_protocol: protocol,
        ..Config::volatile()
    }
}

pub fn volatile_db(protocol: ConcurrencyControlProtocol) -> Database {
    init_test_logging();
    Database::open(volatile_config(protocol)).expect("failed to open a volatile database")
}

/// Runs one transaction through the handler API and returns the precommit
/// decision as a status.
pub fn run_handler(db: &Database, proc: impl FnOnce(&mut Transaction)) -> TxStatus {
    let mut tx = db.begin_transaction();
    proc(&mut tx);
    if db.end_transaction(tx, |_| {}) {
        TxStatus::Committed
    } else {
        TxStatus::Aborted
    }
}

pub fn encode_i64(value: i64) -> [u8; 8] {
    value.to_le_bytes()
}

pub fn decode_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}
