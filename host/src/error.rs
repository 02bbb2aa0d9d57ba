//! Error types for the reading store and the api client.

use thiserror::Error;

/// Result type alias for reading store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the persistence adapter.
///
/// Handlers never surface these to HTTP callers; they are logged and
/// replaced with fallback data.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("task join error: {0}")]
    Task(String),
}

/// Errors raised while talking to the telemetry api.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid api url {0}")]
    InvalidUrl(String),
}
