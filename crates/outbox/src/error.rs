//! Outbox error types.

use store::StoreError;
use thiserror::Error;

/// Errors returned by a search index.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// The index could not be reached.
    #[error("Search index unavailable: {0}")]
    Unavailable(String),

    /// The index refused the document.
    #[error("Document rejected: {0}")]
    Rejected(String),
}

/// Errors that stop a relay pass.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
