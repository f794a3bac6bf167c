//! In-process watchers.

use std::fmt;
use std::sync::Arc;

use appevent_types::{EventRecord, Filter, TriggerCondition};

use crate::holder::EventHolder;
use crate::observer::{Observer, ObserverContext, ObserverState};

/// Called when a watcher's trigger condition fires. The holder gives access
/// to the pending events.
pub type TriggerCallback = Box<dyn Fn(TriggerCondition, &EventHolder) + Send + Sync>;

/// Called with real-time events, grouped by domain.
pub type ReceiveCallback = Box<dyn Fn(&str, &[EventRecord]) + Send + Sync>;

/// An observer identified by name that hands events to in-process callbacks.
///
/// A watcher with a receive callback gets every matching event as soon as it
/// is written. Otherwise events stay buffered in the cache until the watcher
/// pulls them through its [`EventHolder`].
pub struct Watcher {
    state: Arc<ObserverState>,
    ctx: ObserverContext,
    holder: EventHolder,
    on_trigger: Option<TriggerCallback>,
    on_receive: Option<ReceiveCallback>,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("name", &self.state.name())
            .field("seq", &self.state.seq())
            .field("real_time", &self.on_receive.is_some())
            .finish_non_exhaustive()
    }
}

impl Watcher {
    pub fn new(
        name: impl Into<String>,
        filters: Vec<Filter>,
        trigger: TriggerCondition,
        ctx: ObserverContext,
    ) -> Self {
        let state = Arc::new(ObserverState::new(name, filters, trigger));
        let holder = EventHolder::for_observer(Arc::clone(&state), ctx.clone());
        Self {
            state,
            ctx,
            holder,
            on_trigger: None,
            on_receive: None,
        }
    }

    pub fn on_trigger<F>(mut self, f: F) -> Self
    where
        F: Fn(TriggerCondition, &EventHolder) + Send + Sync + 'static,
    {
        self.on_trigger = Some(Box::new(f));
        self
    }

    pub fn on_receive<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[EventRecord]) + Send + Sync + 'static,
    {
        self.on_receive = Some(Box::new(f));
        self
    }

    pub fn holder(&self) -> &EventHolder {
        &self.holder
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.state.filters()
    }
}

impl Observer for Watcher {
    fn state(&self) -> &ObserverState {
        &self.state
    }

    fn is_real_time_event(&self, _event: &EventRecord) -> bool {
        self.on_receive.is_some()
    }

    fn on_events(&self, events: &[EventRecord]) {
        let Some(on_receive) = &self.on_receive else {
            return;
        };
        for (domain, group) in group_by_domain(events) {
            on_receive(domain, &group);
        }
        self.ctx.release(&self.state, events);
    }

    fn on_trigger(&self, condition: TriggerCondition) {
        tracing::debug!(
            watcher = self.state.name(),
            row = condition.row,
            size = condition.size,
            "watcher triggered"
        );
        if let Some(on_trigger) = &self.on_trigger {
            on_trigger(condition, &self.holder);
        }
    }
}

/// Groups events by domain, keeping first-seen domain order and event order.
fn group_by_domain(events: &[EventRecord]) -> Vec<(&str, Vec<EventRecord>)> {
    let mut groups: Vec<(&str, Vec<EventRecord>)> = Vec::new();
    for event in events {
        match groups.iter_mut().find(|(d, _)| *d == event.domain) {
            Some((_, group)) => group.push(event.clone()),
            None => groups.push((event.domain.as_str(), vec![event.clone()])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use appevent_types::EventType;

    #[test]
    fn debug_shows_identity_only() {
        let cache = std::sync::Arc::new(appevent_cache::EventCache::new(
            appevent_db::DbRuntimeSettings::default(),
        ));
        let watcher = Watcher::new(
            "w1",
            vec![],
            TriggerCondition::default(),
            ObserverContext::new(cache, "run-1"),
        );
        let shown = format!("{watcher:?}");
        assert!(shown.contains("\"w1\""));
        assert!(shown.contains("seq"));
    }

    #[test]
    fn groups_preserve_domain_and_event_order() {
        let events = vec![
            EventRecord::new("b", "1", EventType::Fault),
            EventRecord::new("a", "2", EventType::Fault),
            EventRecord::new("b", "3", EventType::Fault),
        ];
        let groups = group_by_domain(&events);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "b");
        let names: Vec<&str> = groups[0].1.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["1", "3"]);
        assert_eq!(groups[1].0, "a");
    }
}
