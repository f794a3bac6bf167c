//! SDK configuration: the startup file, environment overrides and the
//! runtime switches that can be changed through [`RuntimeConfig::configure`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Duration;

use appevent_db::DbRuntimeSettings;
use appevent_observer::RegistrySettings;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Storage quota used until configured otherwise.
pub const DEFAULT_MAX_STORAGE: u64 = 10 * 1024 * 1024;

/// Top-level SDK configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SdkConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Where events are kept and how much space they may use.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the event logs and the `databases/` store.
    #[serde(default)]
    pub dir: Option<String>,

    /// Quota in the same format as the `max_storage` runtime key.
    #[serde(default = "default_max_size")]
    pub max_size: String,

    /// Writes are suppressed while the volume has less free space than this.
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "appevent_observer=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Timing of the observer registry's background work.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_timeout_interval_ms")]
    pub timeout_interval_ms: u64,

    #[serde(default = "default_first_processor_wait_ms")]
    pub first_processor_wait_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    #[serde(default = "default_os_poll_interval_ms")]
    pub os_poll_interval_ms: u64,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// Database settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

fn default_max_size() -> String {
    "10M".to_string()
}

fn default_min_free_space_mb() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_interval_ms() -> u64 {
    1_000
}

fn default_first_processor_wait_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_poll_attempts() -> u32 {
    100
}

fn default_os_poll_interval_ms() -> u64 {
    1_000
}

fn default_worker_threads() -> usize {
    2
}

fn default_busy_timeout_ms() -> u64 {
    3_000
}

fn default_pool_max_size() -> u32 {
    2
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_size: default_max_size(),
            min_free_space_mb: default_min_free_space_mb(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout_interval_ms: default_timeout_interval_ms(),
            first_processor_wait_ms: default_first_processor_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_attempts: default_poll_attempts(),
            os_poll_interval_ms: default_os_poll_interval_ms(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl StorageConfig {
    /// The quota in bytes, or the default when `max_size` is malformed.
    pub fn max_size_bytes(&self) -> u64 {
        parse_storage_size(&self.max_size).unwrap_or(DEFAULT_MAX_STORAGE)
    }

    pub fn min_free_space_bytes(&self) -> u64 {
        self.min_free_space_mb.saturating_mul(1024 * 1024)
    }
}

impl SchedulerConfig {
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            timeout_interval: Duration::from_millis(self.timeout_interval_ms),
            first_processor_wait: Duration::from_millis(self.first_processor_wait_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_attempts: self.poll_attempts,
            os_poll_interval: Duration::from_millis(self.os_poll_interval_ms),
            worker_threads: self.worker_threads,
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The storage quota is not a valid size.
    #[error("invalid storage size: {0:?}")]
    InvalidSize(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `APPEVENT_STORAGE_DIR` overrides `storage.dir`
/// - `APPEVENT_MAX_STORAGE` overrides `storage.max_size`
/// - `APPEVENT_LOG_LEVEL` overrides `logging.level`
/// - `APPEVENT_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting storage quota is malformed.
pub fn load_config(path: Option<&str>) -> Result<SdkConfig, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                SdkConfig::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => SdkConfig::default(),
    };

    if let Ok(dir) = std::env::var("APPEVENT_STORAGE_DIR") {
        config.storage.dir = Some(dir);
    }
    if let Ok(size) = std::env::var("APPEVENT_MAX_STORAGE") {
        config.storage.max_size = size;
    }
    if let Ok(level) = std::env::var("APPEVENT_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("APPEVENT_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    parse_storage_size(&config.storage.max_size)
        .ok_or_else(|| ConfigError::InvalidSize(config.storage.max_size.clone()))?;
    Ok(config)
}

static STORAGE_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)([0-9]+)([kmgt])?(b)?$").expect("storage size pattern is valid")
});

/// Parses a size such as `"512"`, `"10M"` or `"1gb"` into bytes.
/// Suffixes are binary and case-insensitive.
pub fn parse_storage_size(value: &str) -> Option<u64> {
    let caps = STORAGE_SIZE.captures(value.trim())?;
    let number: u64 = caps.get(1)?.as_str().parse().ok()?;
    let shift = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 0,
        Some(unit) => match unit.as_str() {
            "k" => 10,
            "m" => 20,
            "g" => 30,
            "t" => 40,
            _ => return None,
        },
    };
    number.checked_mul(1u64 << shift)
}

/// Turns `maxStorage` into `max_storage`; already snake-cased keys pass
/// through unchanged.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Settings that can change while the SDK runs.
#[derive(Debug)]
pub struct RuntimeConfig {
    disabled: AtomicBool,
    max_storage: AtomicU64,
}

impl RuntimeConfig {
    pub fn new(max_storage: u64) -> Self {
        Self {
            disabled: AtomicBool::new(false),
            max_storage: AtomicU64::new(max_storage),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    pub fn max_storage(&self) -> u64 {
        self.max_storage.load(Ordering::Acquire)
    }

    pub fn set_max_storage(&self, bytes: u64) {
        self.max_storage.store(bytes, Ordering::Release);
    }

    /// Applies one runtime setting. Recognised keys are `disable`
    /// (`"true"`/`"false"`) and `max_storage`. Returns `false` for unknown
    /// keys and malformed values.
    pub fn configure(&self, key: &str, value: &str) -> bool {
        let key = normalize_key(key.trim());
        let value = value.trim().to_ascii_lowercase();
        if key.is_empty() || value.is_empty() {
            tracing::warn!(key, "configuration key and value must not be empty");
            return false;
        }
        match key.as_str() {
            "disable" => match value.as_str() {
                "true" => self.set_disabled(true),
                "false" => self.set_disabled(false),
                _ => {
                    tracing::warn!(value, "invalid value for disable");
                    return false;
                }
            },
            "max_storage" => match parse_storage_size(&value) {
                Some(bytes) => self.set_max_storage(bytes),
                None => {
                    tracing::warn!(value, "invalid value for max_storage");
                    return false;
                }
            },
            _ => {
                tracing::warn!(key, "unrecognized configuration key");
                return false;
            }
        }
        tracing::info!(key, value, "configuration updated");
        true
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STORAGE)
    }
}
