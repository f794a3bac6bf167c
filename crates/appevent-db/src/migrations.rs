//! Schema steps for the cache store.
//!
//! Step `n` (1-based) brings the schema to version `n`, recorded in SQLite's
//! `user_version` inside the same transaction as the step itself. Steps are
//! additive so stores written by older builds upgrade in place.

use rusqlite::Connection;

use crate::error::DbError;

const STEPS: &[&str] = &[
    include_str!("migrations/000_init.sql"),
    include_str!("migrations/001_event_running_id.sql"),
    include_str!("migrations/002_observer_filters.sql"),
    include_str!("migrations/003_custom_event_params.sql"),
];

/// Schema version a fully upgraded store reports.
pub const SCHEMA_VERSION: u32 = STEPS.len() as u32;

pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Applies every step the store has not seen yet and returns how many ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, DbError> {
    apply_steps(conn, STEPS)
}

fn apply_steps(conn: &Connection, steps: &[&str]) -> Result<usize, DbError> {
    let current = schema_version(conn)? as usize;
    if current >= steps.len() {
        if current > steps.len() {
            tracing::warn!(current, known = steps.len(), "store schema is newer than this build");
        }
        return Ok(0);
    }

    for (index, sql) in steps.iter().enumerate().skip(current) {
        let version = index as u32 + 1;
        let failed = |source| DbError::Migration { version, source };
        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(sql).map_err(failed)?;
        tx.pragma_update(None, "user_version", version).map_err(failed)?;
        tx.commit().map_err(failed)?;
        tracing::debug!(version, "schema step applied");
    }

    let applied = steps.len() - current;
    tracing::info!(from = current, to = steps.len(), "cache schema upgraded");
    Ok(applied)
}
