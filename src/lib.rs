//! basalt: an embeddable, in-memory transactional key/value storage engine.
//!
//! Strict-serializable ACID transactions over reads, writes, inserts,
//! updates, deletes, and ordered range scans, with pluggable concurrency
//! control (optimistic Silo, its omission-enabled variant, and two-phase
//! locking), multi-table schemas with secondary indices, write-ahead
//! logging with epoch-based group commit, periodic CPR-consistent
//! checkpointing, and crash recovery.
//!
//! ## Why "basalt"?
//!
//! Basalt is what you get when something volatile cools into something
//! solid. This engine keeps everything volatile (in memory) while the
//! epoch machinery continuously hardens it onto disk.
//!
//! ```no_run
//! use basalt::{Config, Database, TxStatus};
//!
//! let db = Database::open(Config::default()).unwrap();
//! db.execute_transaction(
//!     |tx| {
//!         tx.write("alice", b"1");
//!     },
//!     |status| assert_eq!(status, TxStatus::Committed),
//! );
//! db.fence();
//! ```

pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod transaction;
pub mod types;

mod backoff;
mod callback;
mod cc;
mod data_item;
mod epoch;
mod index;
mod lock;
mod recovery;
mod snapshot;
mod table;
mod thread_pool;
mod tls;

pub use config::{Config, ConcurrencyControlProtocol};
pub use database::Database;
pub use error::{Error, Result};
pub use index::secondary_index::{SecondaryIndexConstraint, SecondaryKey};
pub use transaction::Transaction;
pub use types::{EpochNumber, TransactionId, TxStatus};
