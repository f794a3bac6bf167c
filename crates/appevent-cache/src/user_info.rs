//! Rows of the `user_ids` and `user_properties` tables.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CacheError;

/// Which user info table an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserInfoKind {
    Id,
    Property,
}

impl UserInfoKind {
    fn table(self) -> &'static str {
        match self {
            Self::Id => "user_ids",
            Self::Property => "user_properties",
        }
    }
}

pub(crate) fn insert(
    conn: &Connection,
    kind: UserInfoKind,
    name: &str,
    value: &str,
) -> Result<(), CacheError> {
    conn.execute(
        &format!("INSERT INTO {} (name, value) VALUES (?1, ?2)", kind.table()),
        params![name, value],
    )?;
    Ok(())
}

pub(crate) fn update(
    conn: &Connection,
    kind: UserInfoKind,
    name: &str,
    value: &str,
) -> Result<usize, CacheError> {
    Ok(conn.execute(
        &format!("UPDATE {} SET value = ?1 WHERE name = ?2", kind.table()),
        params![value, name],
    )?)
}

/// Deletes one entry, or every entry when `name` is `None`.
pub(crate) fn delete(
    conn: &Connection,
    kind: UserInfoKind,
    name: Option<&str>,
) -> Result<usize, CacheError> {
    let deleted = match name {
        Some(name) => conn.execute(
            &format!("DELETE FROM {} WHERE name = ?1", kind.table()),
            [name],
        )?,
        None => conn.execute(&format!("DELETE FROM {}", kind.table()), [])?,
    };
    Ok(deleted)
}

pub(crate) fn query(
    conn: &Connection,
    kind: UserInfoKind,
    name: &str,
) -> Result<Option<String>, CacheError> {
    Ok(conn
        .query_row(
            &format!("SELECT value FROM {} WHERE name = ?1", kind.table()),
            [name],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn query_all(
    conn: &Connection,
    kind: UserInfoKind,
) -> Result<Vec<(String, String)>, CacheError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT name, value FROM {} ORDER BY seq",
        kind.table()
    ))?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}
