//! Rows of the `event_observer_mapping` table.
//!
//! A row means "event is still pending for observer". Events are only safe to
//! delete once no row references them.

use std::collections::HashSet;

use rusqlite::{params, params_from_iter, Connection};

use crate::error::CacheError;
use crate::{placeholders, SEQ_CHUNK};

pub(crate) fn insert_batch(conn: &Connection, pairs: &[(i64, i64)]) -> Result<(), CacheError> {
    let mut stmt = conn
        .prepare_cached("INSERT INTO event_observer_mapping (event_seq, observer_seq) VALUES (?1, ?2)")?;
    for (event_seq, observer_seq) in pairs {
        stmt.execute(params![event_seq, observer_seq])?;
    }
    Ok(())
}

/// Deletes mappings. `observer_seq == 0` matches every observer and an empty
/// `event_seqs` matches every event.
pub(crate) fn delete(
    conn: &Connection,
    observer_seq: i64,
    event_seqs: &[i64],
) -> Result<usize, CacheError> {
    if event_seqs.is_empty() {
        return if observer_seq == 0 {
            Ok(conn.execute("DELETE FROM event_observer_mapping", [])?)
        } else {
            Ok(conn.execute(
                "DELETE FROM event_observer_mapping WHERE observer_seq = ?1",
                [observer_seq],
            )?)
        };
    }

    let mut deleted = 0;
    for chunk in event_seqs.chunks(SEQ_CHUNK) {
        let list = placeholders(chunk.len());
        deleted += if observer_seq == 0 {
            conn.execute(
                &format!("DELETE FROM event_observer_mapping WHERE event_seq IN ({list})"),
                params_from_iter(chunk.iter()),
            )?
        } else {
            let mut values = Vec::with_capacity(chunk.len() + 1);
            values.push(observer_seq);
            values.extend_from_slice(chunk);
            conn.execute(
                &format!(
                    "DELETE FROM event_observer_mapping WHERE observer_seq = ? AND event_seq IN ({list})"
                ),
                params_from_iter(values.iter()),
            )?
        };
    }
    Ok(deleted)
}

/// Which of `event_seqs` are still referenced by at least one mapping.
pub(crate) fn query_existing_event_seqs(
    conn: &Connection,
    event_seqs: &[i64],
) -> Result<HashSet<i64>, CacheError> {
    let mut existing = HashSet::new();
    for chunk in event_seqs.chunks(SEQ_CHUNK) {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT event_seq FROM event_observer_mapping WHERE event_seq IN ({})",
            placeholders(chunk.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))?;
        for row in rows {
            existing.insert(row?);
        }
    }
    Ok(existing)
}

/// Removes mappings whose event row no longer exists.
pub(crate) fn delete_unused(conn: &Connection) -> Result<usize, CacheError> {
    Ok(conn.execute(
        "DELETE FROM event_observer_mapping WHERE event_seq NOT IN (SELECT seq FROM events)",
        [],
    )?)
}
