//! Error types for the relay.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Counter store or result log error.
    #[error("Store error: {0}")]
    Store(#[from] sentinel_store::Error),

    /// Record decode or encode error.
    #[error("Record error: {0}")]
    Record(#[from] sentinel_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame or unexpected reply from the broker.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error frame sent by the broker (e.g. `E_BAD_TOPIC`).
    #[error("Broker error: {0}")]
    Broker(String),

    /// Broker did not answer in time.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Connection to the broker is gone.
    #[error("Broker connection closed")]
    Closed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
