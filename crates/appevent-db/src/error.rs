use thiserror::Error;

/// Failures opening or upgrading the cache store.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("cache store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache store sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache store pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A schema step failed and was rolled back.
    #[error("schema upgrade to version {version} failed: {source}")]
    Migration {
        version: u32,
        source: rusqlite::Error,
    },
}

impl DbError {
    /// Returns `true` if the store file is damaged and must be rebuilt.
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Sqlite(e) | Self::Migration { source: e, .. } => is_corruption(e),
            Self::Io(_) | Self::Pool(_) => false,
        }
    }
}

/// Returns `true` for the SQLite result codes that mean the file cannot be
/// trusted any more.
pub fn is_corruption(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase)
    )
}
