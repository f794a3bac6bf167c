//! Storage quota enforcement and full data wipes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use appevent_cache::{EventCache, UserInfoKind};

/// Prefix of the dated event log files.
pub const LOG_FILE_PREFIX: &str = "app_event_";

/// Extension of the dated event log files.
pub const LOG_FILE_SUFFIX: &str = ".log";

/// One kind of stored data that can give back space.
pub trait StorageCleaner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bytes currently used.
    fn storage_size(&self) -> u64;

    /// Frees space while `cur_size` exceeds `max_size` and returns the new
    /// total.
    fn clear_space(&self, cur_size: u64, max_size: u64) -> u64;

    /// Deletes everything this cleaner owns.
    fn clear_data(&self);
}

/// The dated log files in the storage directory.
pub struct LogCleaner {
    dir: PathBuf,
}

impl LogCleaner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Log files sorted by name, which puts the oldest date first.
    fn log_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_log_file(path))
            .collect();
        files.sort();
        files
    }
}

pub(crate) fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX) && n.ends_with(LOG_FILE_SUFFIX))
}

impl StorageCleaner for LogCleaner {
    fn name(&self) -> &'static str {
        "log"
    }

    fn storage_size(&self) -> u64 {
        self.log_files()
            .iter()
            .filter_map(|path| fs::metadata(path).ok())
            .map(|meta| meta.len())
            .sum()
    }

    fn clear_space(&self, cur_size: u64, max_size: u64) -> u64 {
        let mut now = cur_size;
        for file in self.log_files() {
            if now <= max_size {
                break;
            }
            let len = fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&file) {
                Ok(()) => {
                    tracing::info!(file = %file.display(), bytes = len, "removed event log file");
                    now -= len.min(now);
                }
                Err(e) => {
                    tracing::error!(file = %file.display(), error = %e, "failed to remove event log file");
                }
            }
        }
        now
    }

    fn clear_data(&self) {
        for file in self.log_files() {
            if let Err(e) = fs::remove_file(&file) {
                tracing::warn!(file = %file.display(), error = %e, "failed to remove event log file");
            }
        }
    }
}

/// The event database. It can only be emptied as a whole.
pub struct DbCleaner {
    cache: Arc<EventCache>,
}

impl DbCleaner {
    pub fn new(cache: Arc<EventCache>) -> Self {
        Self { cache }
    }

    fn clear_all(&self) {
        if let Err(e) = self.cache.clear_events() {
            tracing::warn!(error = %e, "failed to clear event tables");
        }
        for kind in [UserInfoKind::Id, UserInfoKind::Property] {
            if let Err(e) = self.cache.delete_user_info(kind, None) {
                tracing::warn!(?kind, error = %e, "failed to clear user info table");
            }
        }
    }
}

impl StorageCleaner for DbCleaner {
    fn name(&self) -> &'static str {
        "db"
    }

    fn storage_size(&self) -> u64 {
        self.cache.db_size()
    }

    fn clear_space(&self, cur_size: u64, max_size: u64) -> u64 {
        if cur_size <= max_size {
            return cur_size;
        }
        tracing::info!(cur_size, max_size, "clearing event database to meet quota");
        self.clear_all();
        0
    }

    fn clear_data(&self) {
        self.clear_all();
    }
}

/// The cleaners for one storage directory, in wipe order (database first).
pub fn cleaners(dir: &Path, cache: &Arc<EventCache>) -> Vec<Box<dyn StorageCleaner>> {
    vec![
        Box::new(DbCleaner::new(Arc::clone(cache))),
        Box::new(LogCleaner::new(dir)),
    ]
}

pub fn storage_size(cleaners: &[Box<dyn StorageCleaner>]) -> u64 {
    cleaners.iter().map(|c| c.storage_size()).sum()
}

/// Frees space until the total is within `max_size`, reclaiming log files
/// before touching the database. Returns whether the quota is met.
pub fn release_storage(cleaners: &[Box<dyn StorageCleaner>], max_size: u64) -> bool {
    let mut cur = storage_size(cleaners);
    tracing::info!(cur_size = cur, max_size, "storage quota exceeded, releasing space");
    for cleaner in cleaners.iter().rev() {
        cur = cleaner.clear_space(cur, max_size);
        tracing::debug!(cleaner = cleaner.name(), remaining = cur, "cleaner finished");
        if cur <= max_size {
            return true;
        }
    }
    cur <= max_size
}

/// Deletes all stored data, database first.
pub fn clear_all(cleaners: &[Box<dyn StorageCleaner>]) {
    for cleaner in cleaners {
        cleaner.clear_data();
    }
}
