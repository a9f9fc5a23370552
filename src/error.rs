//! Crate-wide error taxonomy.

use thiserror::Error;

/// Every fallible operation in the engine returns this error type.
///
/// Variants mirror the small taxonomy a block-device/control surface needs:
/// callers see aggregated, volume-level failures, never raw per-extent
/// errors (see [`crate::volume::state`] for how sub-I/O failures get folded
/// into extent state before a client ever observes them).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaidError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not found")]
    NotFound,
    #[error("resource busy")]
    Busy,
    #[error("limit exceeded")]
    Limit,
    #[error("operation not supported")]
    NotSupported,
    #[error("already exists")]
    AlreadyExists,
    #[error("I/O failure")]
    IoFailure,
    #[error("address range out of bounds")]
    RangeError,
    /// Internal-only: tells a planner to re-plan the current stripe under
    /// freshly observed extent state. Never returned to a client directly;
    /// if retries are exhausted the planner turns this into `IoFailure`.
    #[error("retry")]
    Retry,
}

pub type Result<T> = core::result::Result<T, RaidError>;

impl RaidError {
    /// Maps a sub-I/O failure to the extent state it should produce, per the
    /// extent-state callback contract: `NotFound` extents are missing
    /// hardware, anything else is a live failure.
    pub fn to_extent_state(&self) -> crate::volume::ExtentState {
        match self {
            RaidError::NotFound => crate::volume::ExtentState::Missing,
            _ => crate::volume::ExtentState::Failed,
        }
    }
}
