//! The write path: stamping events, the dated log file, the storage quota
//! and the free-space guard.

use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use appevent_cache::EventCache;
use appevent_types::EventRecord;
use chrono::{Local, Utc};

use crate::clean::{self, LOG_FILE_PREFIX, LOG_FILE_SUFFIX};
use crate::config::RuntimeConfig;
use crate::error::AppEventError;

/// How long a free-space sample stays valid.
pub const DISK_SAMPLE_TTL: Duration = Duration::from_secs(30);

/// Name of today's log file.
pub fn log_file_name() -> String {
    format!("{LOG_FILE_PREFIX}{}{LOG_FILE_SUFFIX}", Local::now().format("%Y%m%d"))
}

/// Fills in the creation metadata of an event that has none yet.
pub fn stamp(event: &mut EventRecord, running_id: &str) {
    if event.time == 0 {
        event.time = Utc::now().timestamp_millis();
    }
    if event.tz.is_empty() {
        event.tz = Local::now().format("%z").to_string();
    }
    if event.pid == 0 {
        event.pid = i32::try_from(std::process::id()).unwrap_or(0);
    }
    if event.tid == 0 {
        event.tid = current_tid();
    }
    event.running_id = running_id.to_string();
}

#[cfg(target_os = "linux")]
fn current_tid() -> i64 {
    // SAFETY: gettid has no preconditions and cannot fail.
    i64::from(unsafe { libc::gettid() })
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> i64 {
    0
}

/// Free bytes available to unprivileged users on the volume holding `dir`.
#[cfg(unix)]
pub fn free_space(dir: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: statvfs is plain old data; an all-zero value is valid.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `path` is NUL-terminated and `stat` is a valid out pointer.
    let result = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::useless_conversion)]
    let bytes = u64::from(stat.f_bavail).saturating_mul(u64::from(stat.f_frsize));
    Ok(bytes)
}

#[cfg(not(unix))]
pub fn free_space(_dir: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space probing is not supported on this platform",
    ))
}

/// Suppresses writes while the storage volume is nearly full.
///
/// Samples are cached for [`DISK_SAMPLE_TTL`]. A floor of 0 disables the
/// check, and a failed probe never blocks writes.
pub struct DiskSpaceGuard {
    min_free: u64,
    ttl: Duration,
    sample: Mutex<Option<(Instant, u64)>>,
}

impl DiskSpaceGuard {
    pub fn new(min_free: u64) -> Self {
        Self::with_ttl(min_free, DISK_SAMPLE_TTL)
    }

    pub fn with_ttl(min_free: u64, ttl: Duration) -> Self {
        Self {
            min_free,
            ttl,
            sample: Mutex::new(None),
        }
    }

    pub fn min_free(&self) -> u64 {
        self.min_free
    }

    pub fn has_space(&self, dir: &Path) -> bool {
        if self.min_free == 0 {
            return true;
        }
        let mut sample = self.sample.lock().unwrap_or_else(PoisonError::into_inner);
        let free = match *sample {
            Some((taken, free)) if taken.elapsed() < self.ttl => free,
            _ => {
                // The directory may not exist yet; probe its nearest ancestor.
                let probe = dir.ancestors().find(|p| p.exists()).unwrap_or(dir);
                match free_space(probe) {
                    Ok(free) => {
                        *sample = Some((Instant::now(), free));
                        free
                    }
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "failed to probe free disk space");
                        return true;
                    }
                }
            }
        };
        if free < self.min_free {
            tracing::warn!(free, min_free = self.min_free, "free disk space is too low, event dropped");
            return false;
        }
        true
    }
}

/// Appends serialised events to the dated log file under the storage quota.
///
/// One mutex serialises directory creation, quota cleanup and the append.
pub struct StorageWriter {
    cache: Arc<EventCache>,
    runtime: Arc<RuntimeConfig>,
    lock: Mutex<()>,
}

impl StorageWriter {
    pub fn new(cache: Arc<EventCache>, runtime: Arc<RuntimeConfig>) -> Self {
        Self {
            cache,
            runtime,
            lock: Mutex::new(()),
        }
    }

    /// Writes one line to today's log file in `dir` and returns the file
    /// path. Old data is released first when the quota is exceeded.
    pub fn append(&self, dir: &Path, line: &str) -> Result<PathBuf, AppEventError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        fs::create_dir_all(dir).map_err(|e| {
            tracing::error!(dir = %dir.display(), error = %e, "failed to create storage directory");
            AppEventError::Io(e)
        })?;
        self.enforce_quota(dir);

        let path = dir.join(log_file_name());
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(path)
    }

    fn enforce_quota(&self, dir: &Path) {
        let max_size = self.runtime.max_storage();
        let cleaners = clean::cleaners(dir, &self.cache);
        if clean::storage_size(&cleaners) <= max_size {
            return;
        }
        if !clean::release_storage(&cleaners, max_size) {
            tracing::warn!(max_size, "storage is still over quota after cleanup");
        }
    }
}
