//! Error types for observer registration and dispatch.

use appevent_cache::CacheError;

/// Errors that can occur while registering or driving observers.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// The event cache rejected the operation.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The first processor registration did not finish in time.
    #[error("timed out waiting for processor registration")]
    RegistrationTimeout,

    /// The background runtime could not be started.
    #[error("failed to start observer runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// A holder was configured with a non-positive row or negative size.
    #[error("invalid take size: {0}")]
    InvalidTakeSize(i64),

    /// The registry has been dropped.
    #[error("observer registry is shut down")]
    ShutDown,
}

/// Failure reported by a [`ReportBackend`](crate::ReportBackend).
#[derive(Debug, thiserror::Error)]
#[error("report backend failed: {0}")]
pub struct BackendError(pub String);
