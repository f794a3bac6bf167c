//! Forwarding of operating-system events to watchers.
//!
//! The system drops JSON-line files into `<storage>/os_events/`. While any
//! watcher subscribes to the `OS` domain, one shared task polls that directory,
//! turns each line into an [`EventRecord`] and hands the batch to the registry.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::Duration;

use appevent_types::{EventRecord, EventType, DOMAIN_OS};
use serde_json::{Map, Value};

use crate::registry::ObserverRegistry;

pub const OS_EVENTS_DIR: &str = "os_events";

/// Parses one line in the log-file event format.
pub fn parse_event_line(line: &str) -> Option<EventRecord> {
    let obj: Map<String, Value> = serde_json::from_str(line).ok()?;
    let name = obj.get("name_")?.as_str()?;
    let event_type = obj
        .get("type_")
        .and_then(Value::as_i64)
        .and_then(|t| i32::try_from(t).ok())
        .and_then(EventType::from_i32)?;
    let domain = obj
        .get("domain_")
        .and_then(Value::as_str)
        .unwrap_or(DOMAIN_OS);

    let mut event = EventRecord::new(domain, name, event_type);
    event.time = obj.get("time_").and_then(Value::as_i64).unwrap_or_default();
    event.tz = obj
        .get("tz_")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    event.pid = obj
        .get("pid_")
        .and_then(Value::as_i64)
        .and_then(|p| i32::try_from(p).ok())
        .unwrap_or_default();
    event.tid = obj.get("tid_").and_then(Value::as_i64).unwrap_or_default();
    if let Some(params) = obj.get("params") {
        if event.set_param_str(&params.to_string()).is_err() {
            tracing::debug!(name, "dropping malformed OS event params");
        }
    }
    Some(event)
}

/// Reads and deletes every file in `dir`, returning the parsed events in file
/// name order.
pub(crate) fn drain_dir(dir: &Path) -> std::io::Result<Vec<EventRecord>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut events = Vec::new();
    for file in files {
        let content = fs::read_to_string(&file)?;
        let before = events.len();
        events.extend(content.lines().filter(|l| !l.trim().is_empty()).filter_map(parse_event_line));
        fs::remove_file(&file)?;
        tracing::debug!(file = %file.display(), count = events.len() - before, "consumed OS event file");
    }
    Ok(events)
}

/// Polls `dir` until the task is aborted or the registry is dropped.
pub(crate) async fn run(dir: PathBuf, interval: Duration, registry: Weak<ObserverRegistry>) {
    tracing::info!(dir = %dir.display(), "starting OS event listener");
    loop {
        tokio::time::sleep(interval).await;
        if registry.strong_count() == 0 {
            break;
        }

        let poll_dir = dir.clone();
        let weak = registry.clone();
        let res = tokio::task::spawn_blocking(move || {
            let events = drain_dir(&poll_dir)?;
            if !events.is_empty() {
                if let Some(registry) = weak.upgrade() {
                    registry.handle_events(events);
                }
            }
            Ok::<_, std::io::Error>(())
        })
        .await;

        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to read OS events"),
            Err(e) => tracing::error!(error = %e, "OS event listener join error"),
        }
    }
    tracing::info!("OS event listener stopped");
}
