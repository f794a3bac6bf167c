//! Observers and the registry that dispatches written events to them.
//!
//! An observer declares which events it wants ([`Filter`](appevent_types::Filter)s)
//! and when it wants to hear about them
//! ([`TriggerCondition`](appevent_types::TriggerCondition)). Two kinds exist:
//!
//! - [`Watcher`]: in-process callbacks, either real-time (`on_receive`) or
//!   pull-style through an [`EventHolder`].
//! - [`Processor`]: a proxy to a [`ReportBackend`] that reports buffered
//!   batches and releases them only after a successful report.
//!
//! [`ObserverRegistry`] persists observer identities in the event cache,
//! records which stored events are pending for which observer, and runs the
//! timeout, background and startup triggers on its own runtime.

mod error;
mod holder;
mod observer;
mod os_listener;
mod processor;
mod registry;
mod scheduler;
mod watcher;

pub use error::{BackendError, ObserverError};
pub use holder::{EventHolder, DEFAULT_TAKE_ROW, DEFAULT_TAKE_SIZE};
pub use observer::{Observer, ObserverContext, ObserverState};
pub use os_listener::{parse_event_line, OS_EVENTS_DIR};
pub use processor::{config_hash, Processor, ReportBackend, UserInfoSource};
pub use registry::{ObserverRegistry, RegistrySettings};
pub use watcher::{ReceiveCallback, TriggerCallback, Watcher};
