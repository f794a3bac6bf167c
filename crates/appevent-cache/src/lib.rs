//! Embedded relational cache backing at-least-once event delivery.
//!
//! Events written by the application are stored in the `events` table and
//! linked to every interested observer through `event_observer_mapping`. An
//! event stays retrievable for an observer until that observer consumes it,
//! and the row is reclaimed once no mapping references it.
//!
//! Table access lives in small per-table modules that take a plain
//! [`rusqlite::Connection`]; [`EventCache`] composes them under a single
//! mutex and owns store lifetime and corruption recovery.

mod custom_params;
mod error;
mod events;
mod mapping;
mod observers;
mod store;
mod user_info;

#[cfg(test)]
mod tests;

pub use error::CacheError;
pub use observers::ObserverRow;
pub use store::{EventCache, MAX_CUSTOM_PARAMS};
pub use user_info::UserInfoKind;

/// Upper bound on bound parameters per `IN (...)` statement.
pub(crate) const SEQ_CHUNK: usize = 500;

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
