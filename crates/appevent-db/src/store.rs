use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::error::DbError;
use crate::migrations::run_migrations;
use crate::pool::{open_pool, DbPool, DbRuntimeSettings};

/// Directory, relative to the storage root, that holds the database.
pub const DB_DIR_NAME: &str = "databases";

/// File name of the cache database inside [`DB_DIR_NAME`].
pub const DB_FILE_NAME: &str = "appevent.db";

const SIDE_FILE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// Location of the cache database under one storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn under(storage_dir: &Path) -> Self {
        Self {
            path: storage_dir.join(DB_DIR_NAME).join(DB_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// Opens the store, creating it if needed, and upgrades its schema.
    ///
    /// The file is read once through a plain connection before the pool is
    /// built: pool initialisation flattens SQLite errors into strings, and a
    /// damaged file has to surface as [`DbError::is_corruption`].
    pub fn open(&self, settings: DbRuntimeSettings) -> Result<DbPool, DbError> {
        fs::create_dir_all(self.dir())?;
        {
            let conn = Connection::open(&self.path)?;
            conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))?;
        }

        let pool = open_pool(&self.path, settings)?;
        let applied = run_migrations(&*pool.get()?)?;
        tracing::info!(path = %self.path.display(), applied, "cache store opened");
        Ok(pool)
    }

    /// Deletes the database and its WAL side files. Missing files are fine.
    pub fn remove(&self) -> io::Result<()> {
        let main = std::iter::once(self.path.clone());
        let sides = SIDE_FILE_SUFFIXES.iter().map(|suffix| {
            let mut name = self.path.clone().into_os_string();
            name.push(suffix);
            PathBuf::from(name)
        });
        for file in main.chain(sides) {
            match fs::remove_file(&file) {
                Ok(()) => tracing::debug!(file = %file.display(), "store file removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bytes used by the files in the store directory.
    pub fn size(&self) -> u64 {
        let Ok(entries) = fs::read_dir(self.dir()) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_the_databases_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::under(dir.path());
        assert_eq!(store.size(), 0);

        let pool = store.open(DbRuntimeSettings::default()).expect("open");
        drop(pool);
        assert!(store.path().starts_with(dir.path().join(DB_DIR_NAME)));
        assert!(store.path().exists());
        assert!(store.size() > 0);
    }

    #[test]
    fn garbage_files_are_reported_as_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::under(dir.path());
        fs::create_dir_all(store.dir()).expect("mkdir");
        fs::write(store.path(), vec![b'x'; 4096]).expect("write garbage");

        let err = store
            .open(DbRuntimeSettings::default())
            .expect_err("garbage must not open");
        assert!(err.is_corruption(), "unexpected error: {err}");

        store.remove().expect("remove");
        assert!(!store.path().exists());
        store.open(DbRuntimeSettings::default()).expect("fresh store");
    }

    #[test]
    fn removing_a_missing_store_is_fine() {
        let dir = tempfile::tempdir().expect("tempdir");
        CacheStore::under(dir.path()).remove().expect("remove");
    }
}
