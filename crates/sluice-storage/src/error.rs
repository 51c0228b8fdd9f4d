//! Storage error types.

use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist in the store.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Operation is not supported by this backend.
    #[error("Not implemented")]
    NotImplemented,

    /// Store URI could not be parsed or names an unknown driver.
    #[error("Invalid store URI: {0}")]
    InvalidUri(String),

    /// Object name escapes the store root.
    #[error("Invalid object name: {0}")]
    InvalidName(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive error.
    #[error("Zip error: {0}")]
    Zip(#[from] ::zip::result::ZipError),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
