//! The facade error type and its mapping to public error codes.

use appevent_cache::CacheError;
use appevent_observer::ObserverError;
use appevent_types::ErrorCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by the binding-facing API.
#[derive(Debug, Error)]
pub enum AppEventError {
    #[error("event writing is disabled")]
    Disabled,

    #[error("invalid event domain: {0:?}")]
    InvalidDomain(String),

    #[error("invalid event name: {0:?}")]
    InvalidName(String),

    #[error("too many parameters: {0}")]
    TooManyParams(usize),

    #[error("too many custom parameters: {0}")]
    TooManyCustomParams(usize),

    #[error("invalid parameter name: {0:?}")]
    InvalidParamName(String),

    #[error("string value of parameter {0:?} is too long")]
    StringTooLong(String),

    #[error("invalid watcher name: {0:?}")]
    InvalidWatcherName(String),

    #[error("invalid filter domain: {0:?}")]
    InvalidFilterDomain(String),

    #[error("invalid trigger row: {0}")]
    InvalidTriggerRow(i32),

    #[error("invalid trigger size: {0}")]
    InvalidTriggerSize(i32),

    #[error("invalid trigger timeout: {0}")]
    InvalidTriggerTimeout(i32),

    #[error("invalid max storage value: {0:?}")]
    InvalidMaxStorage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown module: {0:?}")]
    UnknownModule(String),

    #[error("no report backend registered as {0:?}")]
    UnknownProcessor(String),

    #[error("no storage directory configured")]
    NoStorageDir,

    #[error("free disk space is below {0} bytes")]
    LowDiskSpace(u64),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Observer(#[from] ObserverError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppEventError {
    /// The public code binding layers report for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Disabled => ErrorCode::Disabled,
            Self::InvalidDomain(_) => ErrorCode::InvalidDomain,
            Self::InvalidName(_) => ErrorCode::InvalidName,
            Self::TooManyParams(_) => ErrorCode::InvalidParamNum,
            Self::TooManyCustomParams(_) => ErrorCode::InvalidCustomParamNum,
            Self::InvalidParamName(_) => ErrorCode::InvalidParamName,
            Self::StringTooLong(_) => ErrorCode::InvalidStrLen,
            Self::InvalidWatcherName(_) => ErrorCode::InvalidWatcherName,
            Self::InvalidFilterDomain(_) => ErrorCode::InvalidFilterDomain,
            Self::InvalidTriggerRow(_) => ErrorCode::InvalidCondRow,
            Self::InvalidTriggerSize(_) => ErrorCode::InvalidCondSize,
            Self::InvalidTriggerTimeout(_) => ErrorCode::InvalidCondTimeout,
            Self::InvalidMaxStorage(_) => ErrorCode::InvalidMaxStorage,
            Self::InvalidArgument(_) | Self::UnknownModule(_) | Self::UnknownProcessor(_) => {
                ErrorCode::InvalidParam
            }
            Self::Cache(CacheError::TooManyCustomParams { .. }) => ErrorCode::InvalidCustomParamNum,
            Self::Observer(ObserverError::InvalidTakeSize(_)) => ErrorCode::InvalidSize,
            Self::Observer(ObserverError::Cache(CacheError::TooManyCustomParams { .. })) => {
                ErrorCode::InvalidCustomParamNum
            }
            Self::NoStorageDir
            | Self::LowDiskSpace(_)
            | Self::Cache(_)
            | Self::Observer(_)
            | Self::Config(_)
            | Self::Io(_) => ErrorCode::StorageFailure,
        }
    }
}
