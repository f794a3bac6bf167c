//! Shared types and error codes for the appevent SDK.
//!
//! This crate holds the plain value types every other crate in the workspace
//! passes around: event records and their parameters, observer filters and
//! trigger conditions, processor report configuration, and user info entries.
//! It has no storage or runtime dependencies so that binding layers can depend
//! on it alone.

mod event;
mod observer;
mod user;

pub use event::{
    AppEventInfo, EventPackage, EventParam, EventRecord, EventType, ParamValue, DOMAIN_OS,
};
pub use observer::{matches_any, EventConfig, Filter, ReportConfig, TriggerCondition};
pub use user::{UserId, UserProperty};

use serde::{Deserialize, Serialize};

/// Public error codes surfaced through the binding-facing contract.
///
/// Binding layers translate these into their own convention (exceptions,
/// error objects or negative return codes); the core only ever returns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    Disabled,
    InvalidDomain,
    InvalidName,
    InvalidParamNum,
    InvalidStrLen,
    InvalidParamName,
    InvalidArrLen,
    InvalidCustomParamNum,
    InvalidWatcherName,
    InvalidFilterDomain,
    InvalidCondRow,
    InvalidCondSize,
    InvalidCondTimeout,
    InvalidMaxStorage,
    InvalidSize,
    InvalidParam,
    StorageFailure,
}

impl ErrorCode {
    /// Returns the numeric code for this error.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Disabled => 11_100_001,
            Self::InvalidDomain => 11_101_001,
            Self::InvalidName => 11_101_002,
            Self::InvalidParamNum => 11_101_003,
            Self::InvalidStrLen => 11_101_004,
            Self::InvalidParamName => 11_101_005,
            Self::InvalidArrLen => 11_101_006,
            Self::InvalidCustomParamNum => 11_101_007,
            Self::InvalidWatcherName => 11_102_001,
            Self::InvalidFilterDomain => 11_102_002,
            Self::InvalidCondRow => 11_102_003,
            Self::InvalidCondSize => 11_102_004,
            Self::InvalidCondTimeout => 11_102_005,
            Self::InvalidMaxStorage => 11_103_001,
            Self::InvalidSize => 11_104_001,
            Self::InvalidParam => 401,
            Self::StorageFailure => -1,
        }
    }

    /// Attempts to convert a numeric code back to an `ErrorCode`.
    pub fn from_i32(code: i32) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| c.as_i32() == code)
    }
}

const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::Success,
    ErrorCode::Disabled,
    ErrorCode::InvalidDomain,
    ErrorCode::InvalidName,
    ErrorCode::InvalidParamNum,
    ErrorCode::InvalidStrLen,
    ErrorCode::InvalidParamName,
    ErrorCode::InvalidArrLen,
    ErrorCode::InvalidCustomParamNum,
    ErrorCode::InvalidWatcherName,
    ErrorCode::InvalidFilterDomain,
    ErrorCode::InvalidCondRow,
    ErrorCode::InvalidCondSize,
    ErrorCode::InvalidCondTimeout,
    ErrorCode::InvalidMaxStorage,
    ErrorCode::InvalidSize,
    ErrorCode::InvalidParam,
    ErrorCode::StorageFailure,
];

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}
