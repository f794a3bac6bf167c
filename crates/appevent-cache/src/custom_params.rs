//! Rows of the `custom_event_params` table.
//!
//! Parameters are scoped by `(running_id, domain, name)`; an empty name scopes
//! a parameter to every event in the domain.

use std::collections::HashSet;

use appevent_types::{EventParam, ParamValue};
use rusqlite::{params, Connection};

use crate::error::CacheError;

pub(crate) fn query_keys(
    conn: &Connection,
    running_id: &str,
    domain: &str,
    name: &str,
) -> Result<HashSet<String>, CacheError> {
    let mut stmt = conn.prepare(
        "SELECT param_key FROM custom_event_params
         WHERE running_id = ?1 AND domain = ?2 AND name = ?3",
    )?;
    let rows = stmt.query_map(params![running_id, domain, name], |row| row.get(0))?;
    let mut keys = HashSet::new();
    for row in rows {
        keys.insert(row?);
    }
    Ok(keys)
}

pub(crate) fn insert(
    conn: &Connection,
    running_id: &str,
    domain: &str,
    name: &str,
    params: &[&EventParam],
) -> Result<(), CacheError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO custom_event_params
            (running_id, domain, name, param_key, param_value, param_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for p in params {
        stmt.execute(params![
            running_id,
            domain,
            name,
            p.name,
            p.value.to_stored(),
            p.value.type_code()
        ])?;
    }
    Ok(())
}

pub(crate) fn update(
    conn: &Connection,
    running_id: &str,
    domain: &str,
    name: &str,
    params: &[&EventParam],
) -> Result<(), CacheError> {
    let mut stmt = conn.prepare_cached(
        "UPDATE custom_event_params SET param_value = ?1, param_type = ?2
         WHERE running_id = ?3 AND domain = ?4 AND name = ?5 AND param_key = ?6",
    )?;
    for p in params {
        stmt.execute(params![
            p.value.to_stored(),
            p.value.type_code(),
            running_id,
            domain,
            name,
            p.name
        ])?;
    }
    Ok(())
}

/// Parameters that apply to an event: name-scoped entries first, then
/// domain-scoped ones.
pub(crate) fn query_for_event(
    conn: &Connection,
    running_id: &str,
    domain: &str,
    name: &str,
) -> Result<Vec<EventParam>, CacheError> {
    let mut stmt = conn.prepare_cached(
        "SELECT param_key, param_value, param_type FROM custom_event_params
         WHERE running_id = ?1 AND domain = ?2 AND (name = ?3 OR name = '')
         ORDER BY name = '' ASC, seq ASC",
    )?;
    let rows = stmt.query_map(params![running_id, domain, name], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i32>(2)?,
        ))
    })?;

    let mut found = Vec::new();
    for row in rows {
        let (key, value, type_code) = row?;
        match ParamValue::from_stored(&value, type_code) {
            Some(value) => found.push(EventParam { name: key, value }),
            None => tracing::warn!(param = %key, type_code, "skipping undecodable custom param"),
        }
    }
    Ok(found)
}

/// Deletes params whose running id no event references, keeping `cur_running_id`.
pub(crate) fn delete_unused_except(
    conn: &Connection,
    cur_running_id: &str,
) -> Result<usize, CacheError> {
    Ok(conn.execute(
        "DELETE FROM custom_event_params
         WHERE running_id != ?1 AND running_id NOT IN (SELECT DISTINCT running_id FROM events)",
        [cur_running_id],
    )?)
}

pub(crate) fn delete_all(conn: &Connection) -> Result<usize, CacheError> {
    Ok(conn.execute("DELETE FROM custom_event_params", [])?)
}
