use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Key-value engine error.
    #[error("Engine error: {0}")]
    Engine(#[from] rocksdb::Error),

    /// Ordered secondary index error.
    #[error("Index error: {0}")]
    Index(#[from] redb::Error),

    /// Full-text search error.
    #[error("Search error: {0}")]
    Search(#[from] tantivy::TantivyError),

    /// A lookup expected exactly one record but found none.
    #[error("Record not found")]
    NotFound,

    /// An optimistic transaction kept conflicting until the retry budget
    /// was exhausted.
    #[error("Transaction conflict (retries exhausted)")]
    Conflict,

    /// A stored record failed to deserialize.
    #[error("Corrupted record: {0}")]
    Corrupted(#[from] bincode::Error),

    /// A stored record parsed, but violates a structural invariant
    /// (e.g. a pointer entry with the wrong number of fields).
    #[error("Invalid stored data")]
    InvalidData,

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the store directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error for the loosely typed per-peer extras blob.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Index(e.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Index(e.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Index(e.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Index(e.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Index(e.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
