//! The observer capability set and its shared trigger accumulator.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use appevent_cache::EventCache;
use appevent_types::{matches_any, EventRecord, Filter, TriggerCondition};

/// Storage handles every observer kind needs to consume events.
#[derive(Clone)]
pub struct ObserverContext {
    pub cache: Arc<EventCache>,
    /// Identifier of this process instance, used to prune custom parameters.
    pub running_id: Arc<str>,
}

impl ObserverContext {
    pub fn new(cache: Arc<EventCache>, running_id: impl Into<Arc<str>>) -> Self {
        Self {
            cache,
            running_id: running_id.into(),
        }
    }

    /// Releases events an observer has consumed. Failures are logged.
    pub(crate) fn release(&self, observer: &ObserverState, events: &[EventRecord]) {
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).filter(|s| *s > 0).collect();
        if let Err(e) = self
            .cache
            .delete_data(observer.seq(), &seqs, &self.running_id)
        {
            tracing::warn!(
                observer = observer.name(),
                seq = observer.seq(),
                error = %e,
                "failed to release consumed events"
            );
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn meets(current: i32, threshold: i32) -> bool {
    threshold > 0 && current >= threshold
}

/// Identity, interest and accumulated trigger state of one observer.
///
/// The accumulator is a saturating counter: rows and bytes grow with each
/// buffered event and drop back to zero whenever the observer fires.
#[derive(Debug)]
pub struct ObserverState {
    name: String,
    seq: AtomicI64,
    filters: RwLock<Vec<Filter>>,
    trigger: RwLock<TriggerCondition>,
    current: Mutex<TriggerCondition>,
}

impl ObserverState {
    pub fn new(name: impl Into<String>, filters: Vec<Filter>, trigger: TriggerCondition) -> Self {
        Self {
            name: name.into(),
            seq: AtomicI64::new(0),
            filters: RwLock::new(filters),
            trigger: RwLock::new(trigger),
            current: Mutex::new(TriggerCondition::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database sequence number; 0 until registered.
    pub fn seq(&self) -> i64 {
        self.seq.load(Ordering::Acquire)
    }

    pub(crate) fn set_seq(&self, seq: i64) {
        self.seq.store(seq, Ordering::Release);
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_filters(&self, filters: Vec<Filter>) {
        *self.filters.write().unwrap_or_else(PoisonError::into_inner) = filters;
    }

    pub fn trigger(&self) -> TriggerCondition {
        *self.trigger.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_trigger(&self, trigger: TriggerCondition) {
        *self.trigger.write().unwrap_or_else(PoisonError::into_inner) = trigger;
    }

    /// Rows, bytes and timeout ticks accumulated since the last fire.
    pub fn current(&self) -> TriggerCondition {
        *lock(&self.current)
    }

    /// True iff no filter is set or any filter accepts the event.
    pub fn matches(&self, event: &EventRecord) -> bool {
        let filters = self.filters.read().unwrap_or_else(PoisonError::into_inner);
        matches_any(&filters, event)
    }

    /// Whether periodic timeout ticks matter to this observer.
    pub fn needs_timeout(&self) -> bool {
        self.trigger().timeout > 0
    }

    pub fn os_events_mask(&self) -> u32 {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .fold(0, |mask, f| mask | f.os_events_mask())
    }

    fn take(current: &mut TriggerCondition) -> TriggerCondition {
        std::mem::take(current)
    }

    /// Adds one buffered event. Returns the accumulated condition, and resets
    /// it, when a row or size threshold is met.
    pub fn accumulate(&self, size: usize) -> Option<TriggerCondition> {
        let trigger = self.trigger();
        let mut current = lock(&self.current);
        current.row = current.row.saturating_add(1);
        current.size = current
            .size
            .saturating_add(i32::try_from(size).unwrap_or(i32::MAX));
        if meets(current.row, trigger.row) || meets(current.size, trigger.size) {
            return Some(Self::take(&mut current));
        }
        None
    }

    /// Seeds the accumulator with events already pending in the cache, firing
    /// at once if that alone meets a threshold.
    pub fn preload(&self, row: i32, size: i32) -> Option<TriggerCondition> {
        let trigger = self.trigger();
        let mut current = lock(&self.current);
        current.row = row;
        current.size = size;
        if meets(current.row, trigger.row) || meets(current.size, trigger.size) {
            return Some(Self::take(&mut current));
        }
        None
    }

    /// Counts one timeout tick; fires once the configured number of ticks
    /// has elapsed with at least one buffered event.
    pub fn tick(&self) -> Option<TriggerCondition> {
        let trigger = self.trigger();
        let mut current = lock(&self.current);
        current.timeout = current.timeout.saturating_add(1);
        if meets(current.timeout, trigger.timeout) && current.row > 0 {
            return Some(Self::take(&mut current));
        }
        None
    }

    /// Fires if `flag` is set and anything is buffered.
    fn fire_on(&self, flag: bool) -> Option<TriggerCondition> {
        let mut current = lock(&self.current);
        if flag && current.row > 0 {
            return Some(Self::take(&mut current));
        }
        None
    }

    pub fn on_startup(&self) -> Option<TriggerCondition> {
        self.fire_on(self.trigger().on_startup)
    }

    pub fn on_background(&self) -> Option<TriggerCondition> {
        self.fire_on(self.trigger().on_background)
    }

    pub fn reset(&self) {
        *lock(&self.current) = TriggerCondition::default();
    }
}

/// A unit of interest in written events.
///
/// Implementors supply their [`ObserverState`] and the two delivery hooks;
/// the trigger state machine is provided.
pub trait Observer: Send + Sync {
    fn state(&self) -> &ObserverState;

    /// Identity hash; 0 marks a watcher.
    fn hash(&self) -> i64 {
        0
    }

    /// Delivers events directly, bypassing the trigger accumulator.
    fn on_events(&self, events: &[EventRecord]);

    /// Called when the accumulated condition fires.
    fn on_trigger(&self, condition: TriggerCondition);

    fn name(&self) -> &str {
        self.state().name()
    }

    fn seq(&self) -> i64 {
        self.state().seq()
    }

    fn verify_event(&self, event: &EventRecord) -> bool {
        self.state().matches(event)
    }

    fn is_real_time_event(&self, _event: &EventRecord) -> bool {
        false
    }

    fn process_event(&self, event: &EventRecord) {
        if let Some(condition) = self.state().accumulate(event.event_size()) {
            self.on_trigger(condition);
        }
    }

    fn process_timeout(&self) {
        if let Some(condition) = self.state().tick() {
            self.on_trigger(condition);
        }
    }

    fn process_startup(&self) {
        if let Some(condition) = self.state().on_startup() {
            self.on_trigger(condition);
        }
    }

    fn process_background(&self) {
        if let Some(condition) = self.state().on_background() {
            self.on_trigger(condition);
        }
    }

    fn reset_curr_condition(&self) {
        self.state().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appevent_types::EventType;

    #[test]
    fn row_threshold_saturates_and_resets() {
        let state = ObserverState::new("w", vec![], TriggerCondition::rows(2));
        assert_eq!(state.accumulate(10), None);
        assert_eq!(state.current().row, 1);

        let fired = state.accumulate(10).expect("second event should fire");
        assert_eq!(fired.row, 2);
        assert_eq!(fired.size, 20);
        assert_eq!(state.current(), TriggerCondition::default());
    }

    #[test]
    fn size_threshold_fires_independently() {
        let trigger = TriggerCondition {
            size: 100,
            ..TriggerCondition::default()
        };
        let state = ObserverState::new("w", vec![], trigger);
        assert_eq!(state.accumulate(60), None);
        assert!(state.accumulate(60).is_some());
    }

    #[test]
    fn zero_thresholds_never_fire() {
        let state = ObserverState::new("w", vec![], TriggerCondition::default());
        for _ in 0..10 {
            assert_eq!(state.accumulate(1_000), None);
        }
        assert_eq!(state.current().row, 10);
    }

    #[test]
    fn timeout_needs_ticks_and_buffered_rows() {
        let trigger = TriggerCondition {
            timeout: 2,
            ..TriggerCondition::default()
        };
        let state = ObserverState::new("w", vec![], trigger);
        assert_eq!(state.tick(), None);
        assert_eq!(state.tick(), None, "nothing buffered yet");

        state.accumulate(5);
        let fired = state.tick().expect("timeout with buffered row should fire");
        assert_eq!(fired.row, 1);
        assert_eq!(state.current().timeout, 0);
    }

    #[test]
    fn lifecycle_flags_fire_only_when_set() {
        let trigger = TriggerCondition {
            on_background: true,
            ..TriggerCondition::default()
        };
        let state = ObserverState::new("w", vec![], trigger);
        state.accumulate(5);
        assert_eq!(state.on_startup(), None);
        assert_eq!(state.on_background().map(|c| c.row), Some(1));
        assert_eq!(state.on_background(), None);
    }

    #[test]
    fn preload_fires_when_backlog_meets_threshold() {
        let state = ObserverState::new("w", vec![], TriggerCondition::rows(3));
        assert_eq!(state.preload(2, 40), None);
        assert_eq!(state.current().row, 2);
        assert_eq!(state.preload(5, 40).map(|c| c.row), Some(5));
    }

    #[test]
    fn empty_filter_list_matches_everything() {
        let state = ObserverState::new("w", vec![], TriggerCondition::default());
        assert!(state.matches(&EventRecord::new("d", "n", EventType::Fault)));

        state.set_filters(vec![Filter::domain("other")]);
        assert!(!state.matches(&EventRecord::new("d", "n", EventType::Fault)));
    }
}
