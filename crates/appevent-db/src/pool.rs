use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// SQLite tunables applied to every pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 3_000,
            pool_max_size: 2,
        }
    }
}

/// Switches the connection to WAL and sets its busy timeout.
fn prepare_connection(conn: &mut Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    // In-memory databases cannot use WAL and report "memory".
    if !mode.eq_ignore_ascii_case("wal") && mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal mode stayed {mode}")),
        ));
    }
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))
}

/// Builds a pool over the database at `path`. The first connection is
/// opened eagerly, so a file that cannot be prepared fails here.
pub(crate) fn open_pool(path: &Path, settings: DbRuntimeSettings) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(path)
        .with_init(move |conn| prepare_connection(conn, settings));
    Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_connections_use_wal_and_the_busy_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 2_500,
            pool_max_size: 3,
        };
        let pool = open_pool(&dir.path().join("wal.db"), settings).expect("pool");
        assert_eq!(pool.max_size(), 3);

        let conn = pool.get().expect("connection");
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode, "wal");
        let timeout: i64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(timeout, 2_500);
    }

    #[test]
    fn in_memory_connections_are_accepted() {
        let mut conn = Connection::open_in_memory().expect("open");
        prepare_connection(&mut conn, DbRuntimeSettings::default()).expect("prepare");
    }
}
