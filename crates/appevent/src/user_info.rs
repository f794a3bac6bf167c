//! User ids and user properties.
//!
//! Entries are persisted in the event cache and mirrored in memory. Every
//! change bumps a per-kind version so processors can tell when their
//! filtered snapshot is stale.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use appevent_cache::{EventCache, UserInfoKind};
use appevent_observer::UserInfoSource;
use appevent_types::{UserId, UserProperty};

use crate::error::AppEventError;
use crate::verify;

#[derive(Default)]
struct Entries {
    values: BTreeMap<String, String>,
    version: u64,
}

#[derive(Default)]
struct Inner {
    loaded: bool,
    ids: Entries,
    properties: Entries,
}

impl Inner {
    fn entries(&mut self, kind: UserInfoKind) -> &mut Entries {
        match kind {
            UserInfoKind::Id => &mut self.ids,
            UserInfoKind::Property => &mut self.properties,
        }
    }
}

pub struct UserInfo {
    cache: Arc<EventCache>,
    inner: Mutex<Inner>,
}

impl UserInfo {
    pub fn new(cache: Arc<EventCache>) -> Self {
        Self {
            cache,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Locks the in-memory state, loading it from the cache the first time
    /// the cache is reachable.
    fn state(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.loaded {
            let ids = self.cache.query_all_user_info(UserInfoKind::Id);
            let properties = self.cache.query_all_user_info(UserInfoKind::Property);
            match (ids, properties) {
                (Ok(ids), Ok(properties)) => {
                    inner.ids.values.extend(ids);
                    inner.properties.values.extend(properties);
                    inner.ids.version += 1;
                    inner.properties.version += 1;
                    inner.loaded = true;
                }
                (Err(e), _) | (_, Err(e)) => {
                    tracing::debug!(error = %e, "user info not loaded yet");
                }
            }
        }
        inner
    }

    fn set(&self, kind: UserInfoKind, name: &str, value: &str) -> Result<(), AppEventError> {
        let mut inner = self.state();
        if value.is_empty() {
            self.cache.delete_user_info(kind, Some(name))?;
            let entries = inner.entries(kind);
            if entries.values.remove(name).is_some() {
                entries.version += 1;
            }
            return Ok(());
        }

        if self.cache.update_user_info(kind, name, value)? == 0 {
            self.cache.insert_user_info(kind, name, value)?;
        }
        let entries = inner.entries(kind);
        entries.values.insert(name.to_string(), value.to_string());
        entries.version += 1;
        Ok(())
    }

    fn get(&self, kind: UserInfoKind, name: &str) -> Option<String> {
        self.state().entries(kind).values.get(name).cloned()
    }

    /// Sets a user id; an empty value removes it.
    pub fn set_user_id(&self, name: &str, value: &str) -> Result<(), AppEventError> {
        if !verify::is_valid_user_info_name(name) {
            return Err(AppEventError::InvalidArgument(format!("user id name {name:?}")));
        }
        if !value.is_empty() && !verify::is_valid_user_id_value(value) {
            return Err(AppEventError::InvalidArgument(format!("user id value for {name:?}")));
        }
        self.set(UserInfoKind::Id, name, value)
    }

    pub fn user_id(&self, name: &str) -> Option<String> {
        self.get(UserInfoKind::Id, name)
    }

    /// Sets a user property; an empty value removes it.
    pub fn set_user_property(&self, name: &str, value: &str) -> Result<(), AppEventError> {
        if !verify::is_valid_user_info_name(name) {
            return Err(AppEventError::InvalidArgument(format!("user property name {name:?}")));
        }
        if !value.is_empty() && !verify::is_valid_user_property_value(value) {
            return Err(AppEventError::InvalidArgument(format!(
                "user property value for {name:?}"
            )));
        }
        self.set(UserInfoKind::Property, name, value)
    }

    pub fn user_property(&self, name: &str) -> Option<String> {
        self.get(UserInfoKind::Property, name)
    }

    /// Forgets all in-memory entries. The tables themselves are emptied by
    /// the database cleaner.
    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;
        for entries in [&mut inner.ids, &mut inner.properties] {
            entries.values.clear();
            entries.version += 1;
        }
    }
}

impl UserInfoSource for UserInfo {
    fn user_ids_version(&self) -> u64 {
        self.state().ids.version
    }

    fn user_ids(&self) -> Vec<UserId> {
        self.state()
            .ids
            .values
            .iter()
            .map(|(name, value)| UserId::new(name.as_str(), value.as_str()))
            .collect()
    }

    fn user_properties_version(&self) -> u64 {
        self.state().properties.version
    }

    fn user_properties(&self) -> Vec<UserProperty> {
        self.state()
            .properties
            .values
            .iter()
            .map(|(name, value)| UserProperty::new(name.as_str(), value.as_str()))
            .collect()
    }
}
