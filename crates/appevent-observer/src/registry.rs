//! The observer registry.
//!
//! [`ObserverRegistry`] owns the live watchers and processors, reconciles
//! their identities with the event cache, fans written events out to every
//! matching observer and drives timeout and app-lifecycle triggers.
//!
//! Three mutexes guard the watcher map, the processor map and the "timeout
//! task outstanding" flag. None of them is held while another is taken or
//! while the cache is called.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::Duration;

use appevent_cache::ObserverRow;
use appevent_types::{matches_any, EventRecord, Filter, ReportConfig};
use tokio::task::JoinHandle;

use crate::error::ObserverError;
use crate::observer::{lock, Observer, ObserverContext};
use crate::os_listener::{self, OS_EVENTS_DIR};
use crate::processor::Processor;
use crate::scheduler::TaskQueue;
use crate::watcher::Watcher;

/// Timing knobs of the registry.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Period of one timeout tick. Trigger timeouts count these ticks.
    pub timeout_interval: Duration,
    /// Bounded wait for the first processor registration.
    pub first_processor_wait: Duration,
    /// Poll interval once that wait has elapsed.
    pub poll_interval: Duration,
    /// Number of polls before giving up.
    pub poll_attempts: u32,
    /// How often the OS event directory is checked.
    pub os_poll_interval: Duration,
    pub worker_threads: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            timeout_interval: Duration::from_secs(1),
            first_processor_wait: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1),
            poll_attempts: 100,
            os_poll_interval: Duration::from_secs(1),
            worker_threads: 2,
        }
    }
}

struct OsListener {
    mask: u32,
    handle: JoinHandle<()>,
}

pub struct ObserverRegistry {
    ctx: ObserverContext,
    settings: RegistrySettings,
    watchers: Mutex<HashMap<i64, Arc<Watcher>>>,
    processors: Mutex<HashMap<i64, Arc<Processor>>>,
    timeout_armed: Mutex<bool>,
    first_processor_done: AtomicBool,
    os_listener: Mutex<Option<OsListener>>,
    queue: TaskQueue,
    this: Weak<ObserverRegistry>,
}

impl ObserverRegistry {
    pub fn new(ctx: ObserverContext, settings: RegistrySettings) -> Result<Arc<Self>, ObserverError> {
        let queue = TaskQueue::new(settings.worker_threads)?;
        Ok(Arc::new_cyclic(|this| Self {
            ctx,
            settings,
            watchers: Mutex::new(HashMap::new()),
            processors: Mutex::new(HashMap::new()),
            timeout_armed: Mutex::new(false),
            first_processor_done: AtomicBool::new(false),
            os_listener: Mutex::new(None),
            queue,
            this: this.clone(),
        }))
    }

    pub fn context(&self) -> &ObserverContext {
        &self.ctx
    }

    fn observers(&self) -> Vec<Arc<dyn Observer>> {
        let mut all: Vec<Arc<dyn Observer>> = lock(&self.watchers)
            .values()
            .map(|w| Arc::clone(w) as Arc<dyn Observer>)
            .collect();
        all.extend(
            lock(&self.processors)
                .values()
                .map(|p| Arc::clone(p) as Arc<dyn Observer>),
        );
        all
    }

    // ── registration ─────────────────────────────────────────────────

    /// Registers a watcher and returns its sequence number.
    ///
    /// A watcher with the same name as one registered earlier in this process
    /// takes over that identity. Otherwise the identity is looked up in (or
    /// added to) the cache, and events already pending for it are replayed.
    pub fn register_watcher(&self, watcher: Arc<Watcher>) -> Result<i64, ObserverError> {
        let name = watcher.name().to_string();
        let filters = watcher.filters();

        let previous = lock(&self.watchers)
            .iter()
            .find(|(_, w)| w.name() == name)
            .map(|(seq, w)| (*seq, w.filters()));

        let seq = match previous {
            Some((seq, old_filters)) => {
                if old_filters != filters {
                    self.ctx.cache.update_observer(seq, &filters)?;
                }
                watcher.state().set_seq(seq);
                lock(&self.watchers).insert(seq, Arc::clone(&watcher));
                seq
            }
            None => {
                let seq = self.resolve_identity(&name, 0, &filters)?;
                watcher.state().set_seq(seq);
                lock(&self.watchers).insert(seq, Arc::clone(&watcher));
                self.replay(watcher.as_ref());
                seq
            }
        };

        tracing::info!(watcher = %name, seq, "watcher registered");
        self.update_os_listener();
        self.arm_timeout();
        Ok(seq)
    }

    /// Registers a processor and returns its sequence number.
    ///
    /// The first processor of the process resolves its identity on a worker
    /// with a bounded wait, falling back to a short poll; later processors
    /// resolve inline.
    pub fn register_processor(&self, processor: Arc<Processor>) -> Result<i64, ObserverError> {
        if self.first_processor_done.load(Ordering::Acquire) {
            return self.add_processor(processor);
        }

        let registry = self.this.upgrade().ok_or(ObserverError::ShutDown)?;
        let (tx, rx) = mpsc::channel();
        self.queue.run_detached(move || {
            let result = registry.add_processor(processor);
            if result.is_ok() {
                registry.first_processor_done.store(true, Ordering::Release);
            }
            // The receiver may have given up already.
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.settings.first_processor_wait) {
            Ok(result) => return result,
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(ObserverError::ShutDown),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!("first processor registration is slow, polling");
            }
        }
        for _ in 0..self.settings.poll_attempts {
            match rx.try_recv() {
                Ok(result) => return result,
                Err(mpsc::TryRecvError::Disconnected) => return Err(ObserverError::ShutDown),
                Err(mpsc::TryRecvError::Empty) => std::thread::sleep(self.settings.poll_interval),
            }
        }
        Err(ObserverError::RegistrationTimeout)
    }

    fn add_processor(&self, processor: Arc<Processor>) -> Result<i64, ObserverError> {
        let name = processor.name().to_string();
        let seq = self.resolve_identity(&name, processor.hash(), &processor.state().filters())?;
        processor.state().set_seq(seq);
        lock(&self.processors).insert(seq, Arc::clone(&processor));
        self.replay(processor.as_ref());
        tracing::info!(processor = %name, seq, "processor registered");
        self.arm_timeout();
        Ok(seq)
    }

    /// Finds the persisted identity for `(name, hash)`, updating its filters
    /// if they changed, or inserts a new one.
    fn resolve_identity(
        &self,
        name: &str,
        hash: i64,
        filters: &[Filter],
    ) -> Result<i64, ObserverError> {
        match self.ctx.cache.query_seq_and_filters(name, hash)? {
            Some((seq, stored)) => {
                if stored != filters {
                    self.ctx.cache.update_observer(seq, filters)?;
                }
                Ok(seq)
            }
            None => Ok(self.ctx.cache.insert_observer(name, hash, filters)?),
        }
    }

    /// Feeds events already pending in the cache to a newly registered
    /// observer: in one batch if it takes them in real time, otherwise as its
    /// starting accumulator state.
    fn replay(&self, observer: &dyn Observer) {
        let pending = match self.ctx.cache.query_events(observer.seq(), None) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(observer = observer.name(), error = %e, "failed to load pending events");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        tracing::debug!(observer = observer.name(), count = pending.len(), "replaying pending events");
        let (real_time, buffered): (Vec<EventRecord>, Vec<EventRecord>) = pending
            .into_iter()
            .partition(|e| observer.is_real_time_event(e));
        if !real_time.is_empty() {
            observer.on_events(&real_time);
        }
        if !buffered.is_empty() {
            let row = i32::try_from(buffered.len()).unwrap_or(i32::MAX);
            let size = buffered.iter().map(EventRecord::event_size).sum::<usize>();
            let size = i32::try_from(size).unwrap_or(i32::MAX);
            if let Some(condition) = observer.state().preload(row, size) {
                observer.on_trigger(condition);
            }
        }
    }

    /// Removes one observer from memory and from the cache.
    pub fn unregister(&self, seq: i64) -> Result<(), ObserverError> {
        let watcher = lock(&self.watchers).remove(&seq);
        let processor = lock(&self.processors).remove(&seq);
        self.ctx.cache.delete_observer(seq)?;
        if watcher.is_some() {
            self.update_os_listener();
        }
        tracing::info!(
            seq,
            in_memory = watcher.is_some() || processor.is_some(),
            "observer unregistered"
        );
        Ok(())
    }

    /// Removes every observer called `name`. Keeps going past individual
    /// failures and returns the first one.
    pub fn unregister_by_name(&self, name: &str) -> Result<(), ObserverError> {
        let mut seqs: HashSet<i64> = self.ctx.cache.query_seqs_by_name(name)?.into_iter().collect();
        seqs.extend(
            lock(&self.watchers)
                .iter()
                .filter(|(_, w)| w.name() == name)
                .map(|(seq, _)| *seq),
        );
        seqs.extend(
            lock(&self.processors)
                .iter()
                .filter(|(_, p)| p.name() == name)
                .map(|(seq, _)| *seq),
        );

        let mut first_err = None;
        for seq in seqs {
            if let Err(e) = self.unregister(seq) {
                tracing::warn!(observer = name, seq, error = %e, "failed to unregister observer");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn watcher(&self, seq: i64) -> Option<Arc<Watcher>> {
        lock(&self.watchers).get(&seq).cloned()
    }

    pub fn processor(&self, seq: i64) -> Option<Arc<Processor>> {
        lock(&self.processors).get(&seq).cloned()
    }

    /// Sequence numbers of the live processors called `name`, ascending.
    pub fn processor_seqs(&self, name: &str) -> Vec<i64> {
        let mut seqs: Vec<i64> = lock(&self.processors)
            .iter()
            .filter(|(_, p)| p.name() == name)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.sort_unstable();
        seqs
    }

    /// Replaces a live processor's configuration and persists its new
    /// filters. Returns `false` if no such processor is registered.
    pub fn set_processor_config(&self, seq: i64, config: ReportConfig) -> Result<bool, ObserverError> {
        let Some(processor) = self.processor(seq) else {
            return Ok(false);
        };
        let filters = config.filters();
        processor.set_config(config);
        self.ctx.cache.update_observer(seq, &filters)?;
        self.arm_timeout();
        Ok(true)
    }

    pub fn processor_config(&self, seq: i64) -> Option<ReportConfig> {
        self.processor(seq).map(|p| p.config())
    }

    // ── dispatch ─────────────────────────────────────────────────────

    /// Persists `events` with a mapping for every interested observer, then
    /// delivers them. Events that fail to persist are skipped.
    pub fn handle_events(&self, events: Vec<EventRecord>) {
        let observers = self.observers();
        let live: HashSet<i64> = observers.iter().map(|o| o.seq()).collect();
        let persisted_watchers: Vec<ObserverRow> = match self.ctx.cache.query_all_watchers() {
            Ok(rows) => rows.into_iter().filter(|r| !live.contains(&r.seq)).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load persisted watchers");
                Vec::new()
            }
        };

        let mut stored = Vec::with_capacity(events.len());
        for mut event in events {
            let mut seqs: Vec<i64> = observers
                .iter()
                .filter(|o| o.verify_event(&event))
                .map(|o| o.seq())
                .collect();
            seqs.extend(
                persisted_watchers
                    .iter()
                    .filter(|w| matches_any(&w.filters, &event))
                    .map(|w| w.seq),
            );

            match self.ctx.cache.insert_event_with_mappings(&event, &seqs) {
                Ok(seq) => event.seq = seq,
                Err(e) => {
                    tracing::error!(domain = %event.domain, name = %event.name, error = %e, "failed to store event");
                    continue;
                }
            }
            if !event.custom_params.is_empty() {
                if let Err(e) = self.ctx.cache.insert_custom_params(&event) {
                    tracing::warn!(domain = %event.domain, name = %event.name, error = %e, "failed to store custom params");
                }
            }
            if !event.running_id.is_empty() {
                match self
                    .ctx
                    .cache
                    .query_custom_params(&event.running_id, &event.domain, &event.name)
                {
                    Ok(custom) => event.add_custom_params(custom),
                    Err(e) => tracing::warn!(error = %e, "failed to load custom params"),
                }
            }
            stored.push(event);
        }
        if stored.is_empty() {
            return;
        }

        for observer in &observers {
            let mut real_time = Vec::new();
            for event in &stored {
                if !observer.verify_event(event) {
                    continue;
                }
                if observer.is_real_time_event(event) {
                    real_time.push(event.clone());
                } else {
                    observer.process_event(event);
                }
            }
            if !real_time.is_empty() {
                observer.on_events(&real_time);
            }
        }

        self.arm_timeout();
    }

    fn needs_timeout(&self) -> bool {
        let watchers = lock(&self.watchers)
            .values()
            .any(|w| w.state().needs_timeout());
        watchers
            || lock(&self.processors)
                .values()
                .any(|p| p.state().needs_timeout())
    }

    /// Schedules the next timeout tick unless one is outstanding or no
    /// observer has a timeout.
    fn arm_timeout(&self) {
        if !self.needs_timeout() {
            return;
        }
        {
            let mut armed = lock(&self.timeout_armed);
            if *armed {
                return;
            }
            *armed = true;
        }
        let weak = self.this.clone();
        self.queue
            .submit_delayed("observer_timeout", self.settings.timeout_interval, move || {
                if let Some(registry) = weak.upgrade() {
                    registry.handle_timeout();
                }
            });
    }

    /// Runs one timeout tick on every observer and re-arms while needed.
    pub fn handle_timeout(&self) {
        for observer in self.observers() {
            observer.process_timeout();
        }
        *lock(&self.timeout_armed) = false;
        self.arm_timeout();
    }

    /// Queues the background hook of every observer.
    pub fn handle_background(&self) {
        let weak = self.this.clone();
        self.queue.submit("app_background", move || {
            if let Some(registry) = weak.upgrade() {
                for observer in registry.observers() {
                    observer.process_background();
                }
            }
        });
    }

    /// Queues the startup hook of every observer.
    pub fn handle_startup(&self) {
        let weak = self.this.clone();
        self.queue.submit("app_startup", move || {
            if let Some(registry) = weak.upgrade() {
                for observer in registry.observers() {
                    observer.process_startup();
                }
            }
        });
    }

    /// Resets every accumulator after the stored data has been wiped.
    pub fn handle_clear_up(&self) {
        for observer in self.observers() {
            observer.reset_curr_condition();
        }
    }

    // ── OS events ────────────────────────────────────────────────────

    fn os_events_mask(&self) -> u32 {
        lock(&self.watchers)
            .values()
            .fold(0, |mask, w| mask | w.state().os_events_mask())
    }

    /// Starts, keeps or stops the OS event listener to match the watchers'
    /// combined OS filter mask.
    fn update_os_listener(&self) {
        let mask = self.os_events_mask();
        let dir = self.ctx.cache.storage_dir();
        let mut listener = lock(&self.os_listener);
        if mask == 0 {
            if let Some(old) = listener.take() {
                old.handle.abort();
                tracing::info!("no OS watchers left, stopping OS event listener");
            }
            return;
        }
        if let Some(current) = listener.as_mut() {
            current.mask = mask;
            return;
        }
        let Some(dir) = dir else {
            tracing::warn!("no storage directory, OS events unavailable");
            return;
        };
        let task = os_listener::run(
            dir.join(OS_EVENTS_DIR),
            self.settings.os_poll_interval,
            self.this.clone(),
        );
        if let Some(handle) = self.queue.spawn(task) {
            *listener = Some(OsListener { mask, handle });
        }
    }

    /// Combined OS event type mask of the running listener, 0 when stopped.
    pub fn os_listener_mask(&self) -> u32 {
        lock(&self.os_listener).as_ref().map_or(0, |l| l.mask)
    }
}

impl Drop for ObserverRegistry {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.os_listener).take() {
            listener.handle.abort();
        }
    }
}
