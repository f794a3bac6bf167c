use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use appevent_cache::EventCache;
use appevent_db::DbRuntimeSettings;
use appevent_observer::{
    BackendError, Observer, ObserverContext, ObserverRegistry, Processor, RegistrySettings,
    ReportBackend, UserInfoSource, Watcher, OS_EVENTS_DIR,
};
use appevent_types::{
    AppEventInfo, EventConfig, EventRecord, EventType, Filter, ReportConfig, TriggerCondition,
    UserId, UserProperty, DOMAIN_OS,
};

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    _dir: tempfile::TempDir,
    cache: Arc<EventCache>,
    ctx: ObserverContext,
    registry: Arc<ObserverRegistry>,
}

fn fixture_with(settings: RegistrySettings) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(EventCache::with_storage_dir(
        dir.path(),
        DbRuntimeSettings::default(),
    ));
    // Open the store up front so registration never waits on its creation.
    cache.event_count().expect("open cache");
    let ctx = ObserverContext::new(Arc::clone(&cache), "run-1");
    let registry = ObserverRegistry::new(ctx.clone(), settings).expect("registry");
    Fixture {
        _dir: dir,
        cache,
        ctx,
        registry,
    }
}

fn fixture() -> Fixture {
    fixture_with(RegistrySettings::default())
}

fn event(domain: &str, name: &str) -> EventRecord {
    let mut e = EventRecord::new(domain, name, EventType::Statistic).with_param("k", 1);
    e.time = 1_700_000_000_000;
    e.running_id = "run-1".into();
    e
}

#[derive(Default)]
struct RecordingBackend {
    reports: Mutex<Vec<(usize, usize)>>,
    fail: bool,
}

impl ReportBackend for RecordingBackend {
    fn on_report(
        &self,
        _processor_seq: i64,
        user_ids: &[UserId],
        _user_properties: &[UserProperty],
        events: &[AppEventInfo],
    ) -> Result<(), BackendError> {
        self.reports
            .lock()
            .expect("lock")
            .push((events.len(), user_ids.len()));
        if self.fail {
            return Err(BackendError("offline".into()));
        }
        Ok(())
    }
}

struct StaticUsers;

impl UserInfoSource for StaticUsers {
    fn user_ids_version(&self) -> u64 {
        1
    }
    fn user_ids(&self) -> Vec<UserId> {
        vec![UserId::new("uid", "1"), UserId::new("other", "2")]
    }
    fn user_properties_version(&self) -> u64 {
        1
    }
    fn user_properties(&self) -> Vec<UserProperty> {
        Vec::new()
    }
}

fn report_config(name: &str) -> ReportConfig {
    let mut config = ReportConfig::new(name);
    config.event_configs.push(EventConfig::new("test_domain", "", false));
    config
}

// ── watchers ─────────────────────────────────────────────────────────

#[test]
fn row_one_watcher_fires_and_holder_takes_once() {
    let fx = fixture();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let watcher = Arc::new(
        Watcher::new(
            "w1",
            vec![Filter::domain("test_domain")],
            TriggerCondition::rows(1),
            fx.ctx.clone(),
        )
        .on_trigger(move |cond, _| {
            tx.lock().expect("lock").send(cond.row).expect("send");
        }),
    );
    let seq = fx.registry.register_watcher(Arc::clone(&watcher)).expect("register");

    fx.registry.handle_events(vec![event("test_domain", "n1")]);
    assert_eq!(rx.recv_timeout(WAIT).expect("trigger"), 1);
    assert!(rx.try_recv().is_err(), "trigger must fire exactly once");

    let taken = fx.cache.take_events(seq, None).expect("take");
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].name, "n1");
    assert!(fx.cache.take_events(seq, None).expect("take again").is_empty());
}

#[test]
fn unmatched_events_are_not_mapped() {
    let fx = fixture();
    let watcher = Arc::new(Watcher::new(
        "w1",
        vec![Filter::domain("test_domain")],
        TriggerCondition::default(),
        fx.ctx.clone(),
    ));
    let seq = fx.registry.register_watcher(watcher).expect("register");

    fx.registry.handle_events(vec![event("other_domain", "n1")]);
    assert!(fx.cache.query_events(seq, None).expect("query").is_empty());
    assert_eq!(fx.cache.event_count().expect("count"), 1);
}

#[test]
fn real_time_watcher_receives_batch_and_releases_it() {
    let fx = fixture();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let watcher = Arc::new(
        Watcher::new("rt", vec![], TriggerCondition::default(), fx.ctx.clone()).on_receive(
            move |domain, events| {
                sink.lock()
                    .expect("lock")
                    .push((domain.to_string(), events.len()));
            },
        ),
    );
    let seq = fx.registry.register_watcher(watcher).expect("register");

    fx.registry.handle_events(vec![
        event("a", "n1"),
        event("b", "n2"),
        event("a", "n3"),
    ]);

    let got = received.lock().expect("lock").clone();
    assert_eq!(got, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
    assert!(fx.cache.query_events(seq, None).expect("query").is_empty());
    assert_eq!(fx.cache.event_count().expect("count"), 0);
}

#[test]
fn holder_packages_pending_events() {
    let fx = fixture();
    let watcher = Arc::new(Watcher::new(
        "w1",
        vec![],
        TriggerCondition::default(),
        fx.ctx.clone(),
    ));
    fx.registry.register_watcher(Arc::clone(&watcher)).expect("register");
    fx.registry
        .handle_events((0..3).map(|i| event("d", &format!("n{i}"))).collect());

    let holder = watcher.holder();
    assert!(holder.set_row(0).is_err());
    holder.set_row(2).expect("row");

    let first = holder.take_next().expect("take").expect("package");
    assert_eq!(first.package_id, 0);
    assert_eq!(first.row, 2);
    assert_eq!(first.size, first.data.iter().map(String::len).sum::<usize>());

    let second = holder.take_next().expect("take").expect("package");
    assert_eq!(second.package_id, 1);
    assert_eq!(second.row, 1);

    assert!(holder.take_next().expect("take").is_none());
    assert_eq!(fx.cache.event_count().expect("count"), 0);
}

#[test]
fn reregistering_watcher_keeps_identity_and_replays() {
    let fx = fixture();
    let first = Arc::new(Watcher::new(
        "w1",
        vec![],
        TriggerCondition::default(),
        fx.ctx.clone(),
    ));
    let seq = fx.registry.register_watcher(first).expect("register");
    fx.registry.handle_events(vec![event("d", "n1"), event("d", "n2")]);

    // A fresh registry sees the pending events as preloaded accumulator state.
    let registry = ObserverRegistry::new(fx.ctx.clone(), RegistrySettings::default())
        .expect("second registry");
    let again = Arc::new(Watcher::new(
        "w1",
        vec![],
        TriggerCondition::rows(5),
        fx.ctx.clone(),
    ));
    let seq_again = registry.register_watcher(Arc::clone(&again)).expect("re-register");
    assert_eq!(seq, seq_again);
    assert_eq!(again.state().current().row, 2);
}

#[test]
fn unregister_by_name_removes_every_identity() {
    let fx = fixture();
    let w = Arc::new(Watcher::new("dup", vec![], TriggerCondition::default(), fx.ctx.clone()));
    let seq = fx.registry.register_watcher(w).expect("register");
    fx.registry.handle_events(vec![event("d", "n1")]);

    fx.registry.unregister_by_name("dup").expect("unregister");
    assert!(fx.registry.watcher(seq).is_none());
    assert!(fx.cache.query_seqs_by_name("dup").expect("seqs").is_empty());
    assert!(fx.cache.query_events(seq, None).expect("query").is_empty());
}

#[test]
fn timeout_fires_buffered_watcher() {
    let fx = fixture_with(RegistrySettings {
        timeout_interval: Duration::from_millis(20),
        ..RegistrySettings::default()
    });
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let trigger = TriggerCondition {
        timeout: 1,
        ..TriggerCondition::default()
    };
    let watcher = Arc::new(
        Watcher::new("w1", vec![], trigger, fx.ctx.clone()).on_trigger(move |cond, _| {
            tx.lock().expect("lock").send(cond.row).expect("send");
        }),
    );
    fx.registry.register_watcher(watcher).expect("register");
    fx.registry.handle_events(vec![event("d", "n1")]);

    assert_eq!(rx.recv_timeout(WAIT).expect("timeout trigger"), 1);
}

#[test]
fn background_signal_is_delivered_off_thread() {
    let fx = fixture();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let trigger = TriggerCondition {
        on_background: true,
        ..TriggerCondition::default()
    };
    let watcher = Arc::new(
        Watcher::new("w1", vec![], trigger, fx.ctx.clone()).on_trigger(move |cond, _| {
            tx.lock().expect("lock").send(cond.row).expect("send");
        }),
    );
    fx.registry.register_watcher(watcher).expect("register");
    fx.registry.handle_events(vec![event("d", "n1")]);

    fx.registry.handle_background();
    assert_eq!(rx.recv_timeout(WAIT).expect("background trigger"), 1);
}

#[test]
fn clear_up_resets_accumulators() {
    let fx = fixture();
    let watcher = Arc::new(Watcher::new(
        "w1",
        vec![],
        TriggerCondition::rows(10),
        fx.ctx.clone(),
    ));
    fx.registry.register_watcher(Arc::clone(&watcher)).expect("register");
    fx.registry.handle_events(vec![event("d", "n1")]);
    assert_eq!(watcher.state().current().row, 1);

    fx.registry.handle_clear_up();
    assert_eq!(watcher.state().current().row, 0);
}

#[test]
fn os_listener_follows_os_watchers() {
    let fx = fixture_with(RegistrySettings {
        os_poll_interval: Duration::from_millis(20),
        ..RegistrySettings::default()
    });
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let watcher = Arc::new(
        Watcher::new(
            "os_watcher",
            vec![Filter::domain(DOMAIN_OS).with_types(&[EventType::Fault])],
            TriggerCondition::default(),
            fx.ctx.clone(),
        )
        .on_receive(move |_, events| {
            sink.lock()
                .expect("lock")
                .extend(events.iter().map(|e| e.name.clone()));
        }),
    );
    let seq = fx.registry.register_watcher(watcher).expect("register");
    assert_eq!(fx.registry.os_listener_mask(), 1 << 1);

    let storage = fx.cache.storage_dir().expect("dir");
    let os_dir = storage.join(OS_EVENTS_DIR);
    std::fs::create_dir_all(&os_dir).expect("os dir");
    let line = EventRecord::new(DOMAIN_OS, "APP_CRASH", EventType::Fault).event_str();
    let staged = storage.join("staged.json");
    std::fs::write(&staged, format!("{line}\n")).expect("write");
    std::fs::rename(&staged, os_dir.join("0001.json")).expect("publish");

    let deadline = std::time::Instant::now() + WAIT;
    while received.lock().expect("lock").is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(received.lock().expect("lock").clone(), vec!["APP_CRASH".to_string()]);

    fx.registry.unregister(seq).expect("unregister");
    assert_eq!(fx.registry.os_listener_mask(), 0);
}

// ── processors ───────────────────────────────────────────────────────

#[test]
fn identical_processor_configs_share_identity() {
    let fx = fixture();
    let backend = Arc::new(RecordingBackend::default());
    let p1 = Arc::new(Processor::new(report_config("proc"), backend.clone(), fx.ctx.clone()));
    let p2 = Arc::new(Processor::new(report_config("proc"), backend.clone(), fx.ctx.clone()));
    let s1 = fx.registry.register_processor(p1).expect("first");
    let s2 = fx.registry.register_processor(p2).expect("second");
    assert_eq!(s1, s2);

    let mut changed = report_config("proc");
    changed.route_info = "elsewhere".into();
    let p3 = Arc::new(Processor::new(changed, backend, fx.ctx.clone()));
    let s3 = fx.registry.register_processor(p3).expect("third");
    assert_ne!(s1, s3);
    assert_eq!(fx.registry.processor_seqs("proc"), {
        let mut v = vec![s1, s3];
        v.sort_unstable();
        v
    });
}

#[test]
fn explicit_config_ids_pick_the_identity() {
    let fx = fixture();
    let backend = Arc::new(RecordingBackend::default());
    let with_id = |config_id: i32| {
        let mut config = report_config("proc");
        config.config_id = config_id;
        Arc::new(Processor::new(config, backend.clone(), fx.ctx.clone()))
    };

    let first = fx.registry.register_processor(with_id(7)).expect("id 7");
    let again = fx.registry.register_processor(with_id(7)).expect("id 7 again");
    let other = fx.registry.register_processor(with_id(8)).expect("id 8");
    assert_eq!(first, again);
    assert_ne!(first, other);

    let mut persisted = fx.cache.query_seqs_by_name("proc").expect("persisted rows");
    persisted.sort_unstable();
    let mut expected = vec![first, other];
    expected.sort_unstable();
    assert_eq!(persisted, expected);
}

#[test]
fn processor_reports_on_trigger_and_releases_on_success() {
    let fx = fixture();
    let backend = Arc::new(RecordingBackend::default());
    let mut config = report_config("proc");
    config.trigger_cond = TriggerCondition::rows(2);
    config.user_id_names.insert("uid".into());
    let processor = Arc::new(
        Processor::new(config, backend.clone(), fx.ctx.clone()).with_user_info(Arc::new(StaticUsers)),
    );
    let seq = fx.registry.register_processor(processor).expect("register");

    fx.registry.handle_events(vec![event("test_domain", "n1")]);
    assert!(backend.reports.lock().expect("lock").is_empty());

    fx.registry.handle_events(vec![event("test_domain", "n2")]);
    assert_eq!(backend.reports.lock().expect("lock").clone(), vec![(2, 1)]);
    assert!(fx.cache.query_events(seq, None).expect("query").is_empty());
}

#[test]
fn failed_report_keeps_events_for_retry() {
    let fx = fixture();
    let backend = Arc::new(RecordingBackend {
        fail: true,
        ..RecordingBackend::default()
    });
    let mut config = report_config("proc");
    config.trigger_cond = TriggerCondition::rows(1);
    let processor = Arc::new(Processor::new(config, backend.clone(), fx.ctx.clone()));
    let seq = fx.registry.register_processor(processor).expect("register");

    fx.registry.handle_events(vec![event("test_domain", "n1")]);
    assert_eq!(backend.reports.lock().expect("lock").len(), 1);
    assert_eq!(fx.cache.query_events(seq, None).expect("query").len(), 1);
}

#[test]
fn processor_without_event_configs_matches_nothing() {
    let fx = fixture();
    let backend = Arc::new(RecordingBackend::default());
    let processor = Arc::new(Processor::new(ReportConfig::new("empty"), backend, fx.ctx.clone()));
    let seq = fx.registry.register_processor(processor).expect("register");

    fx.registry.handle_events(vec![event("test_domain", "n1")]);
    assert!(fx.cache.query_events(seq, None).expect("query").is_empty());
}

#[test]
fn processor_config_can_be_replaced() {
    let fx = fixture();
    let backend = Arc::new(RecordingBackend::default());
    let processor = Arc::new(Processor::new(report_config("proc"), backend, fx.ctx.clone()));
    let seq = fx.registry.register_processor(processor).expect("register");

    let mut updated = report_config("proc");
    updated.event_configs.push(EventConfig::new("second", "", true));
    assert!(fx
        .registry
        .set_processor_config(seq, updated.clone())
        .expect("set config"));
    assert_eq!(fx.registry.processor_config(seq), Some(updated));
    assert!(!fx
        .registry
        .set_processor_config(seq + 1000, ReportConfig::new("x"))
        .expect("unknown seq"));
}
