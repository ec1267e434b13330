//! Error types for the relay

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Failures from the external key-value store.
///
/// These never reach producers: durable writes are best-effort and logged.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend unreachable or not connected
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the write for size/quota reasons
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A record could not be encoded for storage
    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Invalid producer input. The only way `publish` can fail.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PublishError {
    #[error("message content must not be empty")]
    EmptyContent,

    #[error("chart id is required")]
    MissingChartId,

    #[error("chart config is required for add/update")]
    MissingConfig,
}

/// Top-level errors for binary wiring
#[derive(Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("publish rejected: {0}")]
    Publish(#[from] PublishError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
