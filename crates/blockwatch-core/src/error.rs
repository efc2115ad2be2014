//! Error types shared by the blockwatch crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by storage, the event bus, and configuration loading.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error from the snapshot store.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// AMQP broker error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker could not be reached or refused the operation.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A snapshot failed validation before being persisted.
    #[error("invalid field '{field}': {reason}")]
    Validation {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Configuration error (bad or missing environment value).
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
