//! Unit tests for the per-table helpers.

use appevent_types::{EventParam, EventRecord, EventType, Filter, ParamValue};
use rusqlite::Connection;

use crate::user_info::UserInfoKind;
use crate::{custom_params, events, mapping, observers, user_info};

/// Creates an in-memory SQLite database with migrations applied.
fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    appevent_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

fn sample_event(domain: &str, name: &str) -> EventRecord {
    let mut event = EventRecord::new(domain, name, EventType::Behavior).with_param("k", 1);
    event.time = 1_700_000_000_000;
    event.running_id = "run-1".into();
    event
}

// ── events ───────────────────────────────────────────────────────────

#[test]
fn inserted_event_round_trips_through_mapping_query() {
    let conn = test_db();
    let mut event = sample_event("test_domain", "n1");
    event.trace_id = 0x1234;
    event.add_param("s", "text");

    let seq = events::insert(&conn, &event).expect("insert event");
    assert!(seq > 0);
    mapping::insert_batch(&conn, &[(seq, 7)]).expect("insert mapping");

    let found = events::query_for_observer(&conn, 7, None).expect("query events");
    assert_eq!(found.len(), 1);
    let got = &found[0];
    assert_eq!(got.seq, seq);
    assert_eq!(got.domain, "test_domain");
    assert_eq!(got.event_type, EventType::Behavior);
    assert_eq!(got.trace_id, 0x1234);
    assert_eq!(got.running_id, "run-1");
    assert_eq!(got.param("s"), Some(&ParamValue::from("text")));
}

#[test]
fn query_for_observer_is_newest_first_and_limited() {
    let conn = test_db();
    let mut seqs = Vec::new();
    for i in 0..5 {
        let seq = events::insert(&conn, &sample_event("d1", &format!("n{i}"))).expect("insert");
        mapping::insert_batch(&conn, &[(seq, 1)]).expect("mapping");
        seqs.push(seq);
    }

    let found = events::query_for_observer(&conn, 1, Some(2)).expect("query");
    let got: Vec<i64> = found.iter().map(|e| e.seq).collect();
    assert_eq!(got, vec![seqs[4], seqs[3]]);

    let none = events::query_for_observer(&conn, 2, None).expect("query other observer");
    assert!(none.is_empty());
}

#[test]
fn delete_orphaned_keeps_events_with_mappings() {
    let conn = test_db();
    let a = events::insert(&conn, &sample_event("d1", "a")).expect("insert a");
    let b = events::insert(&conn, &sample_event("d1", "b")).expect("insert b");
    mapping::insert_batch(&conn, &[(a, 1)]).expect("mapping");

    let deleted = events::delete_orphaned(&conn, &[a, b]).expect("delete orphaned");
    assert_eq!(deleted, 1);
    assert_eq!(events::count(&conn).expect("count"), 1);
}

#[test]
fn delete_history_keeps_newest_per_partition() {
    let conn = test_db();
    for i in 0..4 {
        events::insert(&conn, &sample_event("d1", &format!("n{i}"))).expect("insert");
    }
    for i in 0..3 {
        events::insert(&conn, &sample_event("OS", &format!("os{i}"))).expect("insert os");
    }

    let deleted = events::delete_history(&conn, 2, 1).expect("delete history");
    assert_eq!(deleted, 4);

    let names: Vec<String> = conn
        .prepare("SELECT name FROM events ORDER BY seq")
        .expect("prepare")
        .query_map([], |row| row.get(0))
        .expect("query")
        .map(|r| r.expect("row"))
        .collect();
    assert_eq!(names, vec!["n2", "n3", "os2"]);
}

// ── mapping ──────────────────────────────────────────────────────────

#[test]
fn mapping_delete_wildcards() {
    let conn = test_db();
    mapping::insert_batch(&conn, &[(1, 10), (2, 10), (1, 20), (3, 30)]).expect("mapping");

    assert_eq!(mapping::delete(&conn, 10, &[1]).expect("targeted"), 1);
    assert_eq!(mapping::delete(&conn, 0, &[1]).expect("all observers"), 1);
    assert_eq!(mapping::delete(&conn, 10, &[]).expect("all events"), 1);

    let left = mapping::query_existing_event_seqs(&conn, &[1, 2, 3]).expect("existing");
    assert_eq!(left.into_iter().collect::<Vec<_>>(), vec![3]);

    assert_eq!(mapping::delete(&conn, 0, &[]).expect("wipe"), 1);
}

#[test]
fn delete_unused_mappings_drops_dangling_rows() {
    let conn = test_db();
    let seq = events::insert(&conn, &sample_event("d1", "a")).expect("insert");
    mapping::insert_batch(&conn, &[(seq, 1), (seq + 100, 1)]).expect("mapping");

    assert_eq!(mapping::delete_unused(&conn).expect("cleanup"), 1);
    let left = mapping::query_existing_event_seqs(&conn, &[seq, seq + 100]).expect("existing");
    assert!(left.contains(&seq));
    assert!(!left.contains(&(seq + 100)));
}

// ── observers ────────────────────────────────────────────────────────

#[test]
fn observer_identity_and_filters_persist() {
    let conn = test_db();
    let filters = vec![Filter::domain("test_domain").with_names(["n1"])];
    let w = observers::insert(&conn, "w1", 0, &filters).expect("insert watcher");
    let p = observers::insert(&conn, "p1", 42, &[]).expect("insert processor");

    let (seq, stored) = observers::query_seq_and_filters(&conn, "w1", 0)
        .expect("query")
        .expect("watcher should exist");
    assert_eq!(seq, w);
    assert_eq!(stored, filters);

    assert!(observers::query_seq_and_filters(&conn, "p1", 0)
        .expect("query")
        .is_none());

    let watchers = observers::query_all_watchers(&conn).expect("watchers");
    assert_eq!(watchers.len(), 1);
    assert_eq!(watchers[0].name, "w1");

    observers::update_filters(&conn, w, &[]).expect("update");
    let (_, stored) = observers::query_seq_and_filters(&conn, "w1", 0)
        .expect("query")
        .expect("watcher should exist");
    assert!(stored.is_empty());

    observers::delete(&conn, p).expect("delete");
    assert!(observers::query_seqs_by_name(&conn, "p1").expect("seqs").is_empty());
}

// ── user info ────────────────────────────────────────────────────────

#[test]
fn user_info_tables_are_independent() {
    let conn = test_db();
    user_info::insert(&conn, UserInfoKind::Id, "uid", "1").expect("insert id");
    user_info::insert(&conn, UserInfoKind::Property, "uid", "prop").expect("insert prop");

    assert_eq!(
        user_info::update(&conn, UserInfoKind::Id, "uid", "2").expect("update"),
        1
    );
    assert_eq!(
        user_info::query(&conn, UserInfoKind::Id, "uid").expect("query"),
        Some("2".to_string())
    );
    assert_eq!(
        user_info::query(&conn, UserInfoKind::Property, "uid").expect("query"),
        Some("prop".to_string())
    );

    user_info::delete(&conn, UserInfoKind::Id, None).expect("delete all ids");
    assert!(user_info::query_all(&conn, UserInfoKind::Id).expect("all").is_empty());
    assert_eq!(
        user_info::query_all(&conn, UserInfoKind::Property)
            .expect("all")
            .len(),
        1
    );
}

// ── custom params ────────────────────────────────────────────────────

#[test]
fn name_scoped_custom_params_come_first() {
    let conn = test_db();
    let domain_level = EventParam::new("shared", "domain");
    let name_level = EventParam::new("shared", "name");
    custom_params::insert(&conn, "run-1", "d1", "", &[&domain_level]).expect("domain insert");
    custom_params::insert(&conn, "run-1", "d1", "n1", &[&name_level]).expect("name insert");

    let found = custom_params::query_for_event(&conn, "run-1", "d1", "n1").expect("query");
    assert_eq!(found.len(), 2);
    assert_eq!(found[0], name_level);

    let mut event = sample_event("d1", "n1");
    event.add_custom_params(found);
    assert_eq!(event.param("shared"), Some(&ParamValue::from("name")));
}

#[test]
fn unused_custom_params_are_pruned_except_current_run() {
    let conn = test_db();
    let p = EventParam::new("k", 1);
    custom_params::insert(&conn, "old-run", "d1", "", &[&p]).expect("old");
    custom_params::insert(&conn, "live-run", "d1", "", &[&p]).expect("live");
    custom_params::insert(&conn, "cur-run", "d1", "", &[&p]).expect("cur");

    let mut event = sample_event("d1", "n1");
    event.running_id = "live-run".into();
    events::insert(&conn, &event).expect("insert event");

    let deleted = custom_params::delete_unused_except(&conn, "cur-run").expect("prune");
    assert_eq!(deleted, 1);
    assert!(custom_params::query_keys(&conn, "old-run", "d1", "")
        .expect("keys")
        .is_empty());
    assert_eq!(
        custom_params::query_keys(&conn, "cur-run", "d1", "")
            .expect("keys")
            .len(),
        1
    );
}
