//! The process-wide event cache.
//!
//! [`EventCache`] owns at most one live connection pool, opened lazily under
//! `<storage_dir>/databases/` the first time any operation needs it. Every
//! operation runs under one mutex. If an operation reports that the database
//! is corrupt, the pool is dropped and the files are deleted so the next call
//! starts from an empty store.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use appevent_db::{CacheStore, DbConnection, DbPool, DbRuntimeSettings};
use appevent_types::{EventParam, EventRecord, Filter};
use rusqlite::Connection;

use crate::error::CacheError;
use crate::observers::ObserverRow;
use crate::user_info::UserInfoKind;
use crate::{custom_params, events, mapping, observers, user_info};

/// Maximum number of distinct custom parameter keys per scope.
pub const MAX_CUSTOM_PARAMS: usize = 64;

struct CacheState {
    storage_dir: Option<PathBuf>,
    pool: Option<DbPool>,
}

impl CacheState {
    fn store(&self) -> Result<CacheStore, CacheError> {
        self.storage_dir
            .as_deref()
            .filter(|d| !d.as_os_str().is_empty())
            .map(CacheStore::under)
            .ok_or(CacheError::NoStorageDir)
    }

    fn connection(
        &mut self,
        settings: DbRuntimeSettings,
    ) -> Result<DbConnection, CacheError> {
        let pool = match &self.pool {
            Some(pool) => pool.clone(),
            None => {
                let pool = self.store()?.open(settings)?;
                self.pool = Some(pool.clone());
                pool
            }
        };
        Ok(pool.get()?)
    }

    fn remove_files(&mut self) -> Result<(), CacheError> {
        self.pool = None;
        self.store()?.remove()?;
        Ok(())
    }
}

/// Durable storage for events, observers, their mapping, user info and
/// custom parameters.
pub struct EventCache {
    state: Mutex<CacheState>,
    settings: DbRuntimeSettings,
}

impl EventCache {
    /// Creates a cache with no storage directory; every operation fails with
    /// [`CacheError::NoStorageDir`] until one is set.
    pub fn new(settings: DbRuntimeSettings) -> Self {
        Self {
            state: Mutex::new(CacheState {
                storage_dir: None,
                pool: None,
            }),
            settings,
        }
    }

    pub fn with_storage_dir(dir: impl Into<PathBuf>, settings: DbRuntimeSettings) -> Self {
        let cache = Self::new(settings);
        if let Ok(mut state) = cache.state.lock() {
            state.storage_dir = Some(dir.into());
        }
        cache
    }

    /// Points the cache at a new storage directory, closing any open store.
    pub fn set_storage_dir(&self, dir: impl Into<PathBuf>) -> Result<(), CacheError> {
        let dir = dir.into();
        let mut state = self.state.lock().map_err(|_| CacheError::LockPoisoned)?;
        if state.storage_dir.as_ref() != Some(&dir) {
            state.pool = None;
            state.storage_dir = Some(dir);
        }
        Ok(())
    }

    pub fn storage_dir(&self) -> Option<PathBuf> {
        self.state.lock().ok().and_then(|s| s.storage_dir.clone())
    }

    /// Total size in bytes of the database files.
    pub fn db_size(&self) -> u64 {
        self.storage_dir()
            .map_or(0, |dir| CacheStore::under(&dir).size())
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut state = self.state.lock().map_err(|_| CacheError::LockPoisoned)?;
        let result = state
            .connection(self.settings)
            .and_then(|mut conn| op(&mut conn));
        if let Err(e) = &result {
            if e.is_corruption() {
                tracing::error!(error = %e, "event cache database is corrupt, rebuilding");
                if let Err(remove_err) = state.remove_files() {
                    tracing::error!(error = %remove_err, "failed to remove corrupt database");
                }
            }
        }
        result
    }

    /// Appends one event and returns its sequence number.
    pub fn insert_event(&self, event: &EventRecord) -> Result<i64, CacheError> {
        self.with_conn(|conn| events::insert(conn, event))
    }

    /// Appends one event together with its pending mappings, atomically.
    pub fn insert_event_with_mappings(
        &self,
        event: &EventRecord,
        observer_seqs: &[i64],
    ) -> Result<i64, CacheError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let seq = events::insert(&tx, event)?;
            let pairs: Vec<(i64, i64)> = observer_seqs.iter().map(|o| (seq, *o)).collect();
            mapping::insert_batch(&tx, &pairs)?;
            tx.commit()?;
            Ok(seq)
        })
    }

    pub fn insert_observer(&self, name: &str, hash: i64, filters: &[Filter]) -> Result<i64, CacheError> {
        self.with_conn(|conn| observers::insert(conn, name, hash, filters))
    }

    pub fn update_observer(&self, seq: i64, filters: &[Filter]) -> Result<(), CacheError> {
        self.with_conn(|conn| observers::update_filters(conn, seq, filters))
    }

    /// The latest persisted identity for `(name, hash)`.
    pub fn query_seq_and_filters(
        &self,
        name: &str,
        hash: i64,
    ) -> Result<Option<(i64, Vec<Filter>)>, CacheError> {
        self.with_conn(|conn| observers::query_seq_and_filters(conn, name, hash))
    }

    pub fn query_seqs_by_name(&self, name: &str) -> Result<Vec<i64>, CacheError> {
        self.with_conn(|conn| observers::query_seqs_by_name(conn, name))
    }

    /// All persisted watchers (observers with hash 0).
    pub fn query_all_watchers(&self) -> Result<Vec<ObserverRow>, CacheError> {
        self.with_conn(|conn| observers::query_all_watchers(conn))
    }

    /// Deletes an observer and every mapping that points at it.
    pub fn delete_observer(&self, seq: i64) -> Result<(), CacheError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            // Only this observer's rows; 0 would wipe every mapping.
            if seq != 0 {
                mapping::delete(&tx, seq, &[])?;
            }
            observers::delete(&tx, seq)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn insert_mappings(&self, pairs: &[(i64, i64)]) -> Result<(), CacheError> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            mapping::insert_batch(&tx, pairs)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Deletes mappings; `observer_seq == 0` or an empty list acts as a wildcard.
    pub fn delete_mapping(&self, observer_seq: i64, event_seqs: &[i64]) -> Result<usize, CacheError> {
        self.with_conn(|conn| mapping::delete(conn, observer_seq, event_seqs))
    }

    pub fn query_existing_event_seqs(&self, event_seqs: &[i64]) -> Result<HashSet<i64>, CacheError> {
        self.with_conn(|conn| mapping::query_existing_event_seqs(conn, event_seqs))
    }

    /// Events still pending for `observer_seq`, newest first, with custom
    /// parameters attached.
    pub fn query_events(
        &self,
        observer_seq: i64,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>, CacheError> {
        self.with_conn(|conn| {
            let mut found = events::query_for_observer(conn, observer_seq, limit)?;
            attach_custom_params(conn, &mut found)?;
            Ok(found)
        })
    }

    /// Queries pending events and removes their mappings in one transaction.
    pub fn take_events(
        &self,
        observer_seq: i64,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>, CacheError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut found = events::query_for_observer(&tx, observer_seq, limit)?;
            if !found.is_empty() {
                let seqs: Vec<i64> = found.iter().map(|e| e.seq).collect();
                mapping::delete(&tx, observer_seq, &seqs)?;
                attach_custom_params(&tx, &mut found)?;
            }
            tx.commit()?;
            Ok(found)
        })
    }

    pub fn delete_events(&self, seqs: &[i64]) -> Result<usize, CacheError> {
        self.with_conn(|conn| events::delete_by_seqs(conn, seqs))
    }

    /// Deletes those of `seqs` that no observer still has pending.
    pub fn delete_orphaned_events(&self, seqs: &[i64]) -> Result<usize, CacheError> {
        self.with_conn(|conn| events::delete_orphaned(conn, seqs))
    }

    /// Releases consumed events for one observer: drops its mappings for
    /// `event_seqs`, deletes the events nobody else needs, then prunes custom
    /// parameters of finished runs.
    pub fn delete_data(
        &self,
        observer_seq: i64,
        event_seqs: &[i64],
        cur_running_id: &str,
    ) -> Result<(), CacheError> {
        if event_seqs.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            mapping::delete(&tx, observer_seq, event_seqs)?;
            let deleted = events::delete_orphaned(&tx, event_seqs)?;
            let params = custom_params::delete_unused_except(&tx, cur_running_id)?;
            tx.commit()?;
            tracing::debug!(observer_seq, deleted, params, "released consumed events");
            Ok(())
        })
    }

    /// Stores the record's custom parameters under its
    /// `(running_id, domain, name)` scope.
    pub fn insert_custom_params(&self, event: &EventRecord) -> Result<(), CacheError> {
        self.insert_scoped_custom_params(
            &event.running_id,
            &event.domain,
            &event.name,
            &event.custom_params,
        )
    }

    /// Inserts or updates custom parameters for a scope. Fails without
    /// changing anything if the scope would hold more than
    /// [`MAX_CUSTOM_PARAMS`] distinct keys.
    pub fn insert_scoped_custom_params(
        &self,
        running_id: &str,
        domain: &str,
        name: &str,
        params: &[EventParam],
    ) -> Result<(), CacheError> {
        if params.is_empty() {
            return Ok(());
        }

        // Later entries for the same key win.
        let mut latest: Vec<&EventParam> = Vec::with_capacity(params.len());
        for p in params {
            match latest.iter_mut().find(|q| q.name == p.name) {
                Some(slot) => *slot = p,
                None => latest.push(p),
            }
        }

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing = custom_params::query_keys(&tx, running_id, domain, name)?;
            let (to_update, to_insert): (Vec<&EventParam>, Vec<&EventParam>) =
                latest.iter().copied().partition(|p| existing.contains(&p.name));

            if existing.len() + to_insert.len() > MAX_CUSTOM_PARAMS {
                return Err(CacheError::TooManyCustomParams {
                    existing: existing.len(),
                    added: to_insert.len(),
                    limit: MAX_CUSTOM_PARAMS,
                });
            }

            custom_params::insert(&tx, running_id, domain, name, &to_insert)?;
            custom_params::update(&tx, running_id, domain, name, &to_update)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Custom parameters visible to events named `name` in `domain`.
    pub fn query_custom_params(
        &self,
        running_id: &str,
        domain: &str,
        name: &str,
    ) -> Result<Vec<EventParam>, CacheError> {
        self.with_conn(|conn| custom_params::query_for_event(conn, running_id, domain, name))
    }

    pub fn delete_unused_params_except(&self, cur_running_id: &str) -> Result<usize, CacheError> {
        self.with_conn(|conn| custom_params::delete_unused_except(conn, cur_running_id))
    }

    /// Keeps only the newest `reserved` regular and `reserved_os` OS events,
    /// then drops mappings left pointing at deleted rows.
    pub fn delete_history_events(&self, reserved: usize, reserved_os: usize) -> Result<usize, CacheError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let deleted = events::delete_history(&tx, reserved, reserved_os)?;
            mapping::delete_unused(&tx)?;
            tx.commit()?;
            Ok(deleted)
        })
    }

    /// Removes mappings whose event row no longer exists.
    pub fn delete_unused_event_mappings(&self) -> Result<usize, CacheError> {
        self.with_conn(|conn| mapping::delete_unused(conn))
    }

    pub fn event_count(&self) -> Result<usize, CacheError> {
        self.with_conn(|conn| events::count(conn))
    }

    /// Empties the event, mapping and custom parameter tables.
    pub fn clear_events(&self) -> Result<(), CacheError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            mapping::delete(&tx, 0, &[])?;
            events::delete_all(&tx)?;
            custom_params::delete_all(&tx)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn insert_user_info(&self, kind: UserInfoKind, name: &str, value: &str) -> Result<(), CacheError> {
        self.with_conn(|conn| user_info::insert(conn, kind, name, value))
    }

    /// Returns the number of rows changed (0 if `name` is unknown).
    pub fn update_user_info(&self, kind: UserInfoKind, name: &str, value: &str) -> Result<usize, CacheError> {
        self.with_conn(|conn| user_info::update(conn, kind, name, value))
    }

    /// Deletes one entry, or all entries of `kind` when `name` is `None`.
    pub fn delete_user_info(&self, kind: UserInfoKind, name: Option<&str>) -> Result<usize, CacheError> {
        self.with_conn(|conn| user_info::delete(conn, kind, name))
    }

    pub fn query_user_info(&self, kind: UserInfoKind, name: &str) -> Result<Option<String>, CacheError> {
        self.with_conn(|conn| user_info::query(conn, kind, name))
    }

    pub fn query_all_user_info(&self, kind: UserInfoKind) -> Result<Vec<(String, String)>, CacheError> {
        self.with_conn(|conn| user_info::query_all(conn, kind))
    }

    /// Closes the store and deletes its files. The next operation recreates it.
    pub fn destroy_store(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().map_err(|_| CacheError::LockPoisoned)?;
        state.remove_files()?;
        tracing::info!("event cache store destroyed");
        Ok(())
    }
}

fn attach_custom_params(conn: &Connection, found: &mut [EventRecord]) -> Result<(), CacheError> {
    let mut scopes: HashMap<(String, String, String), Vec<EventParam>> = HashMap::new();
    for event in found.iter_mut() {
        if event.running_id.is_empty() {
            continue;
        }
        let key = (event.running_id.clone(), event.domain.clone(), event.name.clone());
        if !scopes.contains_key(&key) {
            let params = custom_params::query_for_event(conn, &key.0, &key.1, &key.2)?;
            scopes.insert(key.clone(), params);
        }
        if let Some(params) = scopes.get(&key) {
            event.add_custom_params(params.iter().cloned());
        }
    }
    Ok(())
}

