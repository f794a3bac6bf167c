//! Error types for the event cache.

use appevent_db::{is_corruption, DbError};

/// Errors that can occur during event cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No storage directory has been configured, so the store cannot open.
    #[error("event cache storage directory is not set")]
    NoStorageDir,

    /// Creating or removing store files failed.
    #[error("event cache io error: {0}")]
    Io(#[from] std::io::Error),

    /// The store could not be opened or upgraded.
    #[error(transparent)]
    Store(#[from] DbError),

    /// A pooled connection could not be checked out.
    #[error("event cache connection error: {0}")]
    Connection(#[from] r2d2::Error),

    /// A database operation failed.
    #[error("event cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("event cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Adding the parameters would exceed the per-scope key limit.
    #[error("too many custom params: {existing} stored + {added} new exceeds {limit}")]
    TooManyCustomParams {
        existing: usize,
        added: usize,
        limit: usize,
    },

    /// The cache mutex was poisoned by a panicking holder.
    #[error("event cache lock poisoned")]
    LockPoisoned,
}

impl CacheError {
    /// Returns `true` if the store file is damaged and must be rebuilt.
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Database(e) => is_corruption(e),
            Self::Store(e) => e.is_corruption(),
            _ => false,
        }
    }
}
