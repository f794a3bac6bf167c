//! On-device app event telemetry.
//!
//! [`AppEvent`] is the entry point binding layers talk to. It validates and
//! stamps events, appends them to the dated log file under the storage
//! quota, stores them in the event cache and fans them out to registered
//! watchers and processors.
//!
//! ```no_run
//! use appevent::{AppEvent, EventRecord, EventType, SdkConfig};
//!
//! let mut config = SdkConfig::default();
//! config.storage.dir = Some("/tmp/appevent".into());
//! let sdk = AppEvent::new(config)?;
//! sdk.write(EventRecord::new("test_domain", "click", EventType::Behavior).with_param("x", 1))?;
//! # Ok::<(), appevent::AppEventError>(())
//! ```

pub mod clean;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod module_loader;
pub mod telemetry;
pub mod user_info;
pub mod verify;
pub mod write;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use appevent_cache::EventCache;
use appevent_observer::{ObserverContext, ObserverRegistry, Processor};
use uuid::Uuid;

pub use appevent_observer::{
    BackendError, EventHolder, Observer, ReceiveCallback, ReportBackend, TriggerCallback,
    UserInfoSource, Watcher,
};
pub use appevent_types::{
    AppEventInfo, ErrorCode, EventConfig, EventPackage, EventParam, EventRecord, EventType, Filter,
    ParamValue, ReportConfig, TriggerCondition, UserId, UserProperty,
};
pub use config::{load_config, RuntimeConfig, SdkConfig};
pub use error::AppEventError;
pub use lifecycle::AppLifecycle;
pub use module_loader::ModuleLoader;
pub use user_info::UserInfo;

use crate::write::{DiskSpaceGuard, StorageWriter};

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOutcome {
    /// The first parameter problem found. The event was still written,
    /// without the offending parameters.
    pub warning: Option<ErrorCode>,
}

impl WriteOutcome {
    pub fn code(&self) -> ErrorCode {
        self.warning.unwrap_or(ErrorCode::Success)
    }
}

/// The SDK service. Construct one per process and share it.
pub struct AppEvent {
    running_id: Arc<str>,
    runtime: Arc<RuntimeConfig>,
    cache: Arc<EventCache>,
    registry: Arc<ObserverRegistry>,
    writer: StorageWriter,
    disk: DiskSpaceGuard,
    user_info: Arc<UserInfo>,
    modules: Arc<ModuleLoader>,
}

impl AppEvent {
    /// Builds the service from `config` with a fresh running id.
    ///
    /// Custom parameters left behind by earlier runs are pruned when a
    /// storage directory is configured.
    pub fn new(config: SdkConfig) -> Result<Self, AppEventError> {
        let max_storage = config::parse_storage_size(&config.storage.max_size)
            .ok_or_else(|| AppEventError::InvalidMaxStorage(config.storage.max_size.clone()))?;
        let runtime = Arc::new(RuntimeConfig::new(max_storage));

        let db_settings = config.database.runtime_settings();
        let cache = Arc::new(match &config.storage.dir {
            Some(dir) => EventCache::with_storage_dir(dir, db_settings),
            None => EventCache::new(db_settings),
        });

        let running_id: Arc<str> = Uuid::new_v4().to_string().into();
        let ctx = ObserverContext::new(Arc::clone(&cache), Arc::clone(&running_id));
        let registry = ObserverRegistry::new(ctx, config.scheduler.registry_settings())?;

        let sdk = Self {
            writer: StorageWriter::new(Arc::clone(&cache), Arc::clone(&runtime)),
            disk: DiskSpaceGuard::new(config.storage.min_free_space_bytes()),
            user_info: Arc::new(UserInfo::new(Arc::clone(&cache))),
            modules: Arc::new(ModuleLoader::new()),
            running_id,
            runtime,
            cache,
            registry,
        };

        if sdk.cache.storage_dir().is_some() {
            sdk.prune_custom_params();
        }
        tracing::info!(
            running_id = %sdk.running_id,
            storage_dir = config.storage.dir.as_deref().unwrap_or("<unset>"),
            max_storage,
            "appevent initialized"
        );
        Ok(sdk)
    }

    fn prune_custom_params(&self) {
        match self.cache.delete_unused_params_except(&self.running_id) {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "pruned custom params of earlier runs"),
            Err(e) => tracing::warn!(error = %e, "failed to prune custom params"),
        }
    }

    pub fn running_id(&self) -> &str {
        &self.running_id
    }

    pub fn storage_dir(&self) -> Option<PathBuf> {
        self.cache.storage_dir()
    }

    /// Points the SDK at a storage directory. The store is opened lazily.
    pub fn set_storage_dir(&self, dir: impl AsRef<Path>) -> Result<(), AppEventError> {
        self.cache.set_storage_dir(dir.as_ref())?;
        Ok(())
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Applies a runtime setting (`disable` or `max_storage`).
    pub fn configure(&self, key: &str, value: &str) -> bool {
        self.runtime.configure(key, value)
    }

    pub fn is_disabled(&self) -> bool {
        self.runtime.is_disabled()
    }

    // ── events ───────────────────────────────────────────────────────

    /// Validates, stamps, logs and stores one event, then hands it to the
    /// observers.
    ///
    /// # Errors
    ///
    /// Fails without storing anything when writing is disabled, the domain or
    /// name is invalid, there are too many parameters, no storage directory
    /// is set, free disk space is low, or the log file cannot be written.
    pub fn write(&self, mut event: EventRecord) -> Result<WriteOutcome, AppEventError> {
        if self.runtime.is_disabled() {
            tracing::warn!(domain = %event.domain, name = %event.name, "event writing is disabled");
            return Err(AppEventError::Disabled);
        }

        let mut warning = verify::verify_event(&mut event)?;
        if !event.custom_params.is_empty() {
            let found =
                verify::verify_custom_params(&event.domain, &event.name, &mut event.custom_params)?;
            warning = warning.or(found);
        }

        let dir = self.cache.storage_dir().ok_or_else(|| {
            tracing::error!("no storage directory, event dropped");
            AppEventError::NoStorageDir
        })?;
        if !self.disk.has_space(&dir) {
            return Err(AppEventError::LowDiskSpace(self.disk.min_free()));
        }

        write::stamp(&mut event, &self.running_id);
        let line = event.event_str();
        tracing::debug!(event = %line, "writing event");
        if let Err(e) = self.writer.append(&dir, &line) {
            tracing::error!(error = %e, "failed to write event to log file");
            return Err(e);
        }

        self.registry.handle_events(vec![event]);
        Ok(WriteOutcome { warning })
    }

    /// Sets custom parameters for every event of `domain`, or only for
    /// events named `name`, written by this process from now on.
    pub fn set_event_param(
        &self,
        mut params: Vec<EventParam>,
        domain: &str,
        name: Option<&str>,
    ) -> Result<WriteOutcome, AppEventError> {
        let name = name.unwrap_or("");
        let warning = verify::verify_custom_params(domain, name, &mut params)?;
        self.cache
            .insert_scoped_custom_params(&self.running_id, domain, name, &params)?;
        Ok(WriteOutcome { warning })
    }

    // ── watchers ─────────────────────────────────────────────────────

    /// Registers a watcher. With `on_receive` set the watcher is real-time;
    /// otherwise it pulls its events through [`Watcher::holder`].
    pub fn add_watcher(
        &self,
        name: &str,
        filters: Vec<Filter>,
        trigger: TriggerCondition,
        on_trigger: Option<TriggerCallback>,
        on_receive: Option<ReceiveCallback>,
    ) -> Result<Arc<Watcher>, AppEventError> {
        verify::verify_watcher(name, &filters, &trigger)?;

        let mut watcher = Watcher::new(name, filters, trigger, self.registry.context().clone());
        if let Some(callback) = on_trigger {
            watcher = watcher.on_trigger(callback);
        }
        if let Some(callback) = on_receive {
            watcher = watcher.on_receive(callback);
        }
        let watcher = Arc::new(watcher);
        self.registry.register_watcher(Arc::clone(&watcher))?;
        Ok(watcher)
    }

    /// Unregisters every watcher called `name`.
    pub fn remove_watcher(&self, name: &str) -> Result<(), AppEventError> {
        if !verify::is_valid_watcher_name(name) {
            return Err(AppEventError::InvalidWatcherName(name.to_string()));
        }
        self.registry.unregister_by_name(name)?;
        Ok(())
    }

    /// A holder that pulls the pending events of the watcher called `name`.
    pub fn holder(&self, name: &str) -> EventHolder {
        EventHolder::by_name(name, self.registry.context().clone())
    }

    // ── processors ───────────────────────────────────────────────────

    pub fn modules(&self) -> &ModuleLoader {
        &self.modules
    }

    /// Registers a processor for the backend named `config.name`, loading
    /// the module of the same name if no such backend is registered yet.
    /// Returns the processor id.
    pub fn add_processor(&self, config: ReportConfig) -> Result<i64, AppEventError> {
        verify::verify_report_config(&config)?;

        let backend = match self.modules.create_processor(&config.name) {
            Some(backend) => backend,
            None => {
                self.modules.load(&config.name)?;
                self.modules
                    .create_processor(&config.name)
                    .ok_or_else(|| AppEventError::UnknownProcessor(config.name.clone()))?
            }
        };

        let user_info: Arc<dyn UserInfoSource> = self.user_info.clone();
        let processor = Processor::new(config, backend, self.registry.context().clone())
            .with_user_info(user_info);
        Ok(self.registry.register_processor(Arc::new(processor))?)
    }

    /// Unregisters a processor. Ids that were never handed out are ignored.
    pub fn remove_processor(&self, id: i64) -> Result<(), AppEventError> {
        if id <= 0 {
            tracing::warn!(id, "ignoring removal of invalid processor id");
            return Ok(());
        }
        self.registry.unregister(id)?;
        Ok(())
    }

    pub fn processor_ids(&self, name: &str) -> Vec<i64> {
        self.registry.processor_seqs(name)
    }

    /// Replaces a processor's configuration. Returns `false` for unknown ids.
    pub fn set_processor_config(&self, id: i64, config: ReportConfig) -> Result<bool, AppEventError> {
        verify::verify_report_config(&config)?;
        Ok(self.registry.set_processor_config(id, config)?)
    }

    pub fn processor_config(&self, id: i64) -> Option<ReportConfig> {
        self.registry.processor_config(id)
    }

    // ── user info ────────────────────────────────────────────────────

    pub fn set_user_id(&self, name: &str, value: &str) -> Result<(), AppEventError> {
        self.user_info.set_user_id(name, value)
    }

    pub fn user_id(&self, name: &str) -> Option<String> {
        self.user_info.user_id(name)
    }

    pub fn set_user_property(&self, name: &str, value: &str) -> Result<(), AppEventError> {
        self.user_info.set_user_property(name, value)
    }

    pub fn user_property(&self, name: &str) -> Option<String> {
        self.user_info.user_property(name)
    }

    // ── housekeeping ─────────────────────────────────────────────────

    /// Deletes all stored events, user info and log files and resets every
    /// observer's accumulated condition.
    pub fn clear_data(&self) {
        self.registry.handle_clear_up();
        self.user_info.clear();
        if let Some(dir) = self.cache.storage_dir() {
            clean::clear_all(&clean::cleaners(&dir, &self.cache));
        }
        tracing::info!("all event data cleared");
    }

    /// Drops mappings whose event no longer exists.
    pub fn delete_unused_event_mappings(&self) -> Result<usize, AppEventError> {
        Ok(self.cache.delete_unused_event_mappings()?)
    }

    /// Keeps only the newest `reserved` regular and `reserved_os` OS events.
    pub fn delete_history_events(&self, reserved: usize, reserved_os: usize) -> Result<usize, AppEventError> {
        Ok(self.cache.delete_history_events(reserved, reserved_os)?)
    }

    pub fn lifecycle(&self) -> AppLifecycle {
        AppLifecycle::new(Arc::clone(&self.registry))
    }

    pub fn registry(&self) -> &Arc<ObserverRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }
}
