use common::Version;
use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write named a version other than the stored one.
    #[error("Concurrency conflict on {entity} {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        entity: &'static str,
        id: String,
        expected: Version,
        actual: Version,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A unique key (idempotency key, payment authority) is already taken.
    #[error("Duplicate {entity} key: {key}")]
    DuplicateKey { entity: &'static str, key: String },

    /// The store cannot be reached right now.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A persisted row could not be decoded into a domain value.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn conflict(
        entity: &'static str,
        id: impl ToString,
        expected: Version,
        actual: Version,
    ) -> Self {
        StoreError::ConcurrencyConflict {
            entity,
            id: id.to_string(),
            expected,
            actual,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns true for optimistic-concurrency failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }

    /// Returns true for infrastructure failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
