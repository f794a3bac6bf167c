//! Rows of the `observers` table.
//!
//! Watchers are stored with hash 0; processors carry their configuration hash.

use appevent_types::Filter;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::CacheError;

/// A persisted observer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverRow {
    pub seq: i64,
    pub name: String,
    pub hash: i64,
    pub filters: Vec<Filter>,
}

fn parse_filters(json: &str) -> Result<Vec<Filter>, serde_json::Error> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ObserverRow> {
    let filters: String = row.get(3)?;
    Ok(ObserverRow {
        seq: row.get(0)?,
        name: row.get(1)?,
        hash: row.get(2)?,
        filters: parse_filters(&filters)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
    })
}

pub(crate) fn insert(
    conn: &Connection,
    name: &str,
    hash: i64,
    filters: &[Filter],
) -> Result<i64, CacheError> {
    conn.execute(
        "INSERT INTO observers (name, hash, filters) VALUES (?1, ?2, ?3)",
        params![name, hash, serde_json::to_string(filters)?],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_filters(
    conn: &Connection,
    seq: i64,
    filters: &[Filter],
) -> Result<(), CacheError> {
    conn.execute(
        "UPDATE observers SET filters = ?1 WHERE seq = ?2",
        params![serde_json::to_string(filters)?, seq],
    )?;
    Ok(())
}

/// Latest row registered under `(name, hash)`.
pub(crate) fn query_seq_and_filters(
    conn: &Connection,
    name: &str,
    hash: i64,
) -> Result<Option<(i64, Vec<Filter>)>, CacheError> {
    let row = conn
        .query_row(
            "SELECT seq, name, hash, filters FROM observers
             WHERE name = ?1 AND hash = ?2
             ORDER BY seq DESC LIMIT 1",
            params![name, hash],
            from_row,
        )
        .optional()?;
    Ok(row.map(|r| (r.seq, r.filters)))
}

pub(crate) fn query_seqs_by_name(conn: &Connection, name: &str) -> Result<Vec<i64>, CacheError> {
    let mut stmt = conn.prepare("SELECT seq FROM observers WHERE name = ?1 ORDER BY seq")?;
    let rows = stmt.query_map([name], |row| row.get(0))?;
    let mut seqs = Vec::new();
    for row in rows {
        seqs.push(row?);
    }
    Ok(seqs)
}

pub(crate) fn query_all_watchers(conn: &Connection) -> Result<Vec<ObserverRow>, CacheError> {
    let mut stmt =
        conn.prepare("SELECT seq, name, hash, filters FROM observers WHERE hash = 0 ORDER BY seq")?;
    let rows = stmt.query_map([], from_row)?;
    let mut watchers = Vec::new();
    for row in rows {
        watchers.push(row?);
    }
    Ok(watchers)
}

pub(crate) fn delete(conn: &Connection, seq: i64) -> Result<(), CacheError> {
    conn.execute("DELETE FROM observers WHERE seq = ?1", [seq])?;
    Ok(())
}
