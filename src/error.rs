//! Error types for the Vitalstream service.

use std::error::Error as StdError;
use std::fmt;
use std::result;

/// A specialized Result type for Vitalstream operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for Vitalstream operations.
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),
    /// I/O errors
    Io(std::io::Error),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Caller supplied an argument the operation cannot accept
    Validation(String),
    /// Permanent storage failures (bad SQL, corrupt data, constraint misuse)
    Storage(String),
    /// Transient storage failures: the store is busy, locked or unreachable
    StoreUnavailable(String),
    /// Broker transport failures
    Broker(String),
    /// A bounded retry loop ran out of attempts
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
    /// Arrow conversion errors
    Arrow(String),
    /// Internal errors
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Broker(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            Error::Broker(msg) => write!(f, "Broker error: {}", msg),
            Error::RetriesExhausted {
                operation,
                attempts,
                last_error,
            } => write!(
                f,
                "{} failed after {} attempts: {}",
                operation, attempts, last_error
            ),
            Error::Arrow(msg) => write!(f, "Arrow error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(err: arrow::error::ArrowError) -> Self {
        Error::Arrow(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Message prefixes DuckDB uses for failures that may clear on retry, such
/// as a file lock held by another process or a missing mount.
const TRANSIENT_DUCKDB_MESSAGES: [&str; 3] = ["IO Error", "Could not set lock", "Connection Error"];

impl From<duckdb::Error> for Error {
    fn from(err: duckdb::Error) -> Self {
        use duckdb::ffi::ErrorCode;

        let message = err.to_string();
        let transient_code = matches!(
            &err,
            duckdb::Error::DuckDBFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                )
        );
        if transient_code
            || TRANSIENT_DUCKDB_MESSAGES
                .iter()
                .any(|prefix| message.contains(prefix))
        {
            Error::StoreUnavailable(message)
        } else {
            Error::Storage(message)
        }
    }
}
