//! Processors: observers that report batches to a pluggable backend.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use appevent_types::{
    matches_any, AppEventInfo, EventRecord, ReportConfig, TriggerCondition, UserId, UserProperty,
};
use sha2::{Digest, Sha256};

use crate::error::BackendError;
use crate::observer::{lock, Observer, ObserverContext, ObserverState};

/// The reporting side of a processor.
///
/// Events handed to [`on_report`](Self::on_report) are released from the
/// cache only when it returns `Ok`, so a failed report is retried on the next
/// trigger.
pub trait ReportBackend: Send + Sync {
    fn on_report(
        &self,
        processor_seq: i64,
        user_ids: &[UserId],
        user_properties: &[UserProperty],
        events: &[AppEventInfo],
    ) -> Result<(), BackendError>;

    fn validate_event(&self, _event: &AppEventInfo) -> bool {
        true
    }

    fn validate_user_id(&self, _user_id: &UserId) -> bool {
        true
    }

    fn validate_user_property(&self, _property: &UserProperty) -> bool {
        true
    }
}

/// Versioned user ids and properties that processors attach to reports.
///
/// Versions must change whenever the corresponding set changes.
pub trait UserInfoSource: Send + Sync {
    fn user_ids_version(&self) -> u64;
    fn user_ids(&self) -> Vec<UserId>;
    fn user_properties_version(&self) -> u64;
    fn user_properties(&self) -> Vec<UserProperty>;
}

#[derive(Default)]
struct UserSnapshot {
    ids_version: Option<u64>,
    ids: Vec<UserId>,
    properties_version: Option<u64>,
    properties: Vec<UserProperty>,
}

/// Identity hash of a processor configuration.
///
/// An explicit positive `config_id` is used as is. Otherwise the hash is
/// derived from the serialised configuration, so identical configurations
/// share an identity. The result is always positive, since 0 marks a watcher.
pub fn config_hash(config: &ReportConfig) -> i64 {
    if config.config_id > 0 {
        return i64::from(config.config_id);
    }
    let bytes = serde_json::to_vec(config).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    match i64::from_be_bytes(head) & i64::MAX {
        0 => 1,
        hash => hash,
    }
}

/// Proxy between the registry and a [`ReportBackend`].
pub struct Processor {
    state: ObserverState,
    hash: i64,
    config: RwLock<ReportConfig>,
    backend: Arc<dyn ReportBackend>,
    user_info: Option<Arc<dyn UserInfoSource>>,
    snapshot: Mutex<UserSnapshot>,
    ctx: ObserverContext,
}

impl Processor {
    pub fn new(config: ReportConfig, backend: Arc<dyn ReportBackend>, ctx: ObserverContext) -> Self {
        let state = ObserverState::new(config.name.clone(), config.filters(), config.trigger_cond);
        Self {
            state,
            hash: config_hash(&config),
            config: RwLock::new(config),
            backend,
            user_info: None,
            snapshot: Mutex::new(UserSnapshot::default()),
            ctx,
        }
    }

    pub fn with_user_info(mut self, source: Arc<dyn UserInfoSource>) -> Self {
        self.user_info = Some(source);
        self
    }

    pub fn config(&self) -> ReportConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the configuration. The identity hash is left unchanged.
    pub fn set_config(&self, config: ReportConfig) {
        self.state.set_filters(config.filters());
        self.state.set_trigger(config.trigger_cond);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// User ids and properties selected by the configuration, recomputed only
    /// when the source's versions move.
    fn user_snapshot(&self) -> (Vec<UserId>, Vec<UserProperty>) {
        let Some(source) = &self.user_info else {
            return (Vec::new(), Vec::new());
        };
        let config = self.config();
        let mut snapshot = lock(&self.snapshot);

        let ids_version = source.user_ids_version();
        if snapshot.ids_version != Some(ids_version) {
            snapshot.ids = source
                .user_ids()
                .into_iter()
                .filter(|id| config.user_id_names.contains(&id.name))
                .filter(|id| self.backend.validate_user_id(id))
                .collect();
            snapshot.ids_version = Some(ids_version);
        }

        let properties_version = source.user_properties_version();
        if snapshot.properties_version != Some(properties_version) {
            snapshot.properties = source
                .user_properties()
                .into_iter()
                .filter(|p| config.user_property_names.contains(&p.name))
                .filter(|p| self.backend.validate_user_property(p))
                .collect();
            snapshot.properties_version = Some(properties_version);
        }

        (snapshot.ids.clone(), snapshot.properties.clone())
    }

    /// Reports `events` and releases them on success.
    fn report(&self, events: &[EventRecord]) {
        if events.is_empty() {
            return;
        }
        let infos: Vec<AppEventInfo> = events
            .iter()
            .map(EventRecord::to_info)
            .filter(|info| self.backend.validate_event(info))
            .collect();
        if infos.is_empty() {
            tracing::debug!(processor = self.state.name(), "no events passed validation");
            self.ctx.release(&self.state, events);
            return;
        }

        let (user_ids, user_properties) = self.user_snapshot();
        match self
            .backend
            .on_report(self.state.seq(), &user_ids, &user_properties, &infos)
        {
            Ok(()) => {
                tracing::debug!(processor = self.state.name(), count = infos.len(), "reported events");
                self.ctx.release(&self.state, events);
            }
            Err(e) => {
                tracing::warn!(
                    processor = self.state.name(),
                    error = %e,
                    "report failed, events kept for retry"
                );
            }
        }
    }
}

impl Observer for Processor {
    fn state(&self) -> &ObserverState {
        &self.state
    }

    fn hash(&self) -> i64 {
        self.hash
    }

    /// Processors with no selecting event config receive nothing.
    fn verify_event(&self, event: &EventRecord) -> bool {
        let filters = self.state.filters();
        !filters.is_empty() && matches_any(&filters, event)
    }

    fn is_real_time_event(&self, event: &EventRecord) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .event_configs
            .iter()
            .any(|c| c.is_real_time_event(event))
    }

    fn on_events(&self, events: &[EventRecord]) {
        self.report(events);
    }

    fn on_trigger(&self, condition: TriggerCondition) {
        tracing::debug!(processor = self.state.name(), row = condition.row, "processor triggered");
        match self.ctx.cache.query_events(self.state.seq(), None) {
            Ok(events) => self.report(&events),
            Err(e) => {
                tracing::warn!(processor = self.state.name(), error = %e, "failed to load pending events");
            }
        }
    }
}
