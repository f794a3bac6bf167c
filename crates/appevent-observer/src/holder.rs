//! Pull-style retrieval of pending events.

use std::sync::{Arc, Mutex};

use appevent_types::{EventPackage, EventRecord};

use crate::error::ObserverError;
use crate::observer::{lock, ObserverContext, ObserverState};

/// Default byte budget of one package when taking by size.
pub const DEFAULT_TAKE_SIZE: usize = 512 * 1024;

/// Default number of events per package.
pub const DEFAULT_TAKE_ROW: usize = 1;

enum Target {
    Observer(Arc<ObserverState>),
    Name(String),
}

#[derive(Debug)]
struct TakeSettings {
    row: Option<usize>,
    size: Option<usize>,
    next_package_id: i32,
}

impl TakeSettings {
    /// Size mode applies only when a size was set and a row count was not.
    fn size_budget(&self) -> Option<usize> {
        match (self.row, self.size) {
            (None, Some(size)) => Some(size),
            _ => None,
        }
    }
}

/// Hands out the events still pending for one watcher in packages, and
/// releases each package from the cache once it has been taken.
pub struct EventHolder {
    target: Target,
    ctx: ObserverContext,
    settings: Mutex<TakeSettings>,
}

impl EventHolder {
    pub(crate) fn for_observer(state: Arc<ObserverState>, ctx: ObserverContext) -> Self {
        Self::with_target(Target::Observer(state), ctx)
    }

    /// A holder that looks its watcher up by name on every take.
    pub fn by_name(name: impl Into<String>, ctx: ObserverContext) -> Self {
        Self::with_target(Target::Name(name.into()), ctx)
    }

    fn with_target(target: Target, ctx: ObserverContext) -> Self {
        Self {
            target,
            ctx,
            settings: Mutex::new(TakeSettings {
                row: None,
                size: None,
                next_package_id: 0,
            }),
        }
    }

    /// Sets the number of events per package. Must be positive.
    pub fn set_row(&self, row: i64) -> Result<(), ObserverError> {
        let row = usize::try_from(row)
            .ok()
            .filter(|r| *r > 0)
            .ok_or(ObserverError::InvalidTakeSize(row))?;
        lock(&self.settings).row = Some(row);
        Ok(())
    }

    /// Sets the byte budget per package. Must not be negative.
    pub fn set_size(&self, size: i64) -> Result<(), ObserverError> {
        let size = usize::try_from(size).map_err(|_| ObserverError::InvalidTakeSize(size))?;
        lock(&self.settings).size = Some(size);
        Ok(())
    }

    fn resolve(&self) -> Result<Option<(i64, String)>, ObserverError> {
        match &self.target {
            Target::Observer(state) => {
                let seq = state.seq();
                Ok((seq > 0).then(|| (seq, state.name().to_string())))
            }
            Target::Name(name) => {
                let seqs = self.ctx.cache.query_seqs_by_name(name)?;
                Ok(seqs.into_iter().max().map(|seq| (seq, name.clone())))
            }
        }
    }

    /// Takes the next package of pending events, or `None` if there are none.
    ///
    /// Taken events are released from the cache before returning, so each
    /// event is handed out once per watcher.
    pub fn take_next(&self) -> Result<Option<EventPackage>, ObserverError> {
        let Some((seq, name)) = self.resolve()? else {
            tracing::warn!("event holder has no registered watcher");
            return Ok(None);
        };

        let (row, size_budget) = {
            let settings = lock(&self.settings);
            (settings.row.unwrap_or(DEFAULT_TAKE_ROW), settings.size_budget())
        };

        let events = match size_budget {
            Some(budget) => {
                let pending = self.ctx.cache.query_events(seq, None)?;
                fit_to_budget(pending, budget)
            }
            None => self.ctx.cache.query_events(seq, Some(row))?,
        };
        if events.is_empty() {
            return Ok(None);
        }

        let data: Vec<String> = events.iter().map(EventRecord::event_str).collect();
        let size = data.iter().map(String::len).sum();
        let package_id = {
            let mut settings = lock(&self.settings);
            let id = settings.next_package_id;
            settings.next_package_id = id.wrapping_add(1);
            id
        };

        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        self.ctx
            .cache
            .delete_data(seq, &seqs, &self.ctx.running_id)?;
        tracing::debug!(watcher = %name, package_id, row = events.len(), size, "took event package");

        Ok(Some(EventPackage {
            package_id,
            row: events.len(),
            size,
            data,
            events,
        }))
    }
}

/// Keeps the leading events whose serialised sizes fit in `budget`. The first
/// event is always kept so an oversized event cannot block the holder.
fn fit_to_budget(pending: Vec<EventRecord>, budget: usize) -> Vec<EventRecord> {
    let mut total = 0usize;
    let mut kept = Vec::new();
    for event in pending {
        let size = event.event_size();
        if !kept.is_empty() && total + size > budget {
            break;
        }
        total += size;
        kept.push(event);
    }
    kept
}
