use appevent_db::{schema_version, CacheStore, DbRuntimeSettings, SCHEMA_VERSION};

#[test]
fn opened_store_has_every_cache_table() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = CacheStore::under(dir.path())
        .open(DbRuntimeSettings::default())
        .expect("open store");
    let conn = pool.get().expect("connection");

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .expect("prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("table query")
        .map(|r| r.expect("table name"))
        .collect();

    assert_eq!(
        tables,
        vec![
            "custom_event_params",
            "event_observer_mapping",
            "events",
            "observers",
            "user_ids",
            "user_properties",
        ]
    );
    assert_eq!(schema_version(&conn).expect("version"), SCHEMA_VERSION);
}

#[test]
fn reopening_keeps_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::under(dir.path());
    {
        let pool = store.open(DbRuntimeSettings::default()).expect("first open");
        pool.get()
            .expect("connection")
            .execute(
                "INSERT INTO events (domain, name, type, time) VALUES ('d', 'n', 1, 0)",
                [],
            )
            .expect("insert event");
    }

    let pool = store.open(DbRuntimeSettings::default()).expect("second open");
    let count: i64 = pool
        .get()
        .expect("connection")
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .expect("count events");
    assert_eq!(count, 1);
}
