//! Rows of the `events` table.

use appevent_types::{EventRecord, EventType, DOMAIN_OS};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Row};

use crate::error::CacheError;
use crate::{placeholders, SEQ_CHUNK};

const COLUMNS: &str = "seq, domain, name, type, time, tz, pid, tid, trace_id, span_id, pspan_id, \
                       trace_flag, params, running_id";

/// Inserts one event and returns its new sequence number.
pub(crate) fn insert(conn: &Connection, event: &EventRecord) -> Result<i64, CacheError> {
    conn.execute(
        "INSERT INTO events
            (domain, name, type, time, tz, pid, tid, trace_id, span_id, pspan_id, trace_flag,
             params, size, running_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            event.domain,
            event.name,
            event.event_type.as_i32(),
            event.time,
            event.tz,
            event.pid,
            event.tid,
            event.trace_id,
            event.span_id,
            event.pspan_id,
            event.trace_flag,
            event.param_str(),
            event.event_size() as i64,
            event.running_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let type_code: i32 = row.get(3)?;
    let event_type = EventType::from_i32(type_code)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, i64::from(type_code)))?;
    let mut event = EventRecord::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?, event_type);
    event.seq = row.get(0)?;
    event.time = row.get(4)?;
    event.tz = row.get(5)?;
    event.pid = row.get(6)?;
    event.tid = row.get(7)?;
    event.trace_id = row.get(8)?;
    event.span_id = row.get(9)?;
    event.pspan_id = row.get(10)?;
    event.trace_flag = row.get(11)?;
    let params: String = row.get(12)?;
    event
        .set_param_str(&params)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e)))?;
    event.running_id = row.get(13)?;
    Ok(event)
}

/// Events still mapped to `observer_seq`, newest first.
pub(crate) fn query_for_observer(
    conn: &Connection,
    observer_seq: i64,
    limit: Option<usize>,
) -> Result<Vec<EventRecord>, CacheError> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM events
         WHERE seq IN (SELECT event_seq FROM event_observer_mapping WHERE observer_seq = ?1)
         ORDER BY seq DESC
         LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![observer_seq, limit], from_row)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}

/// Deletes the given events. Returns the number of rows removed.
pub(crate) fn delete_by_seqs(conn: &Connection, seqs: &[i64]) -> Result<usize, CacheError> {
    let mut deleted = 0;
    for chunk in seqs.chunks(SEQ_CHUNK) {
        deleted += conn.execute(
            &format!("DELETE FROM events WHERE seq IN ({})", placeholders(chunk.len())),
            params_from_iter(chunk.iter()),
        )?;
    }
    Ok(deleted)
}

/// Deletes those of `seqs` that no mapping references any more.
pub(crate) fn delete_orphaned(conn: &Connection, seqs: &[i64]) -> Result<usize, CacheError> {
    let mut deleted = 0;
    for chunk in seqs.chunks(SEQ_CHUNK) {
        deleted += conn.execute(
            &format!(
                "DELETE FROM events WHERE seq IN ({})
                 AND seq NOT IN (SELECT event_seq FROM event_observer_mapping)",
                placeholders(chunk.len())
            ),
            params_from_iter(chunk.iter()),
        )?;
    }
    Ok(deleted)
}

/// Keeps only the newest `reserved` non-OS and `reserved_os` OS events.
pub(crate) fn delete_history(
    conn: &Connection,
    reserved: usize,
    reserved_os: usize,
) -> Result<usize, CacheError> {
    let mut deleted = conn.execute(
        "DELETE FROM events WHERE domain != ?1 AND seq NOT IN
            (SELECT seq FROM events WHERE domain != ?1 ORDER BY seq DESC LIMIT ?2)",
        params![DOMAIN_OS, reserved as i64],
    )?;
    deleted += conn.execute(
        "DELETE FROM events WHERE domain = ?1 AND seq NOT IN
            (SELECT seq FROM events WHERE domain = ?1 ORDER BY seq DESC LIMIT ?2)",
        params![DOMAIN_OS, reserved_os as i64],
    )?;
    Ok(deleted)
}

pub(crate) fn count(conn: &Connection) -> Result<usize, CacheError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    Ok(n as usize)
}

pub(crate) fn delete_all(conn: &Connection) -> Result<usize, CacheError> {
    Ok(conn.execute("DELETE FROM events", [])?)
}
