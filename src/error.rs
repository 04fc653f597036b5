//! Error types for basalt.
//!
//! Transactional failures (validation conflicts, constraint violations, user
//! aborts) never surface here; they are reported as `TxStatus::Aborted`
//! through commit callbacks. `Error` covers the infrastructure paths:
//! filesystem access, serialization, and recovery.

use std::fmt;
use std::io;

/// Unified error type for basalt operations.
#[derive(Debug)]
pub enum Error {
    /// I/O error (log files, checkpoint files, working directory)
    Io(io::Error),
    /// Packing or unpacking a log or checkpoint record failed
    Serialization(String),
    /// Startup replay found something it cannot continue from
    Recovery(String),
    /// Table-related error (not found, invalid name)
    Table(String),
    /// Secondary-index-related error
    Index(String),
    /// Invalid configuration value
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::Serialization(msg) => write!(f, "serialization failure: {}", msg),
            Error::Recovery(msg) => write!(f, "recovery failure: {}", msg),
            Error::Table(msg) => write!(f, "{}", msg),
            Error::Index(msg) => write!(f, "{}", msg),
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for basalt operations.
pub type Result<T> = std::result::Result<T, Error>;
