//! Error types for the bloomcal engine.

use thiserror::Error;

use crate::item::ItemId;

/// Errors that can occur in engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Item {0} has not been persisted yet")]
    NotPersisted(ItemId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Ignored feed notification: {0}")]
    ConflictIgnored(String),

    #[error("Item not found: {0}")]
    NotFound(ItemId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Item {0} is claimed by another surface")]
    Claimed(ItemId),

    #[error("Calendar session is closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

/// Rejections raised before any optimistic change is applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("title must not be empty")]
    EmptyTitle,

    #[error("end must not be earlier than start")]
    EndBeforeStart,

    #[error("all-day items cannot have an end")]
    AllDayWithEnd,

    #[error("start and end must both be timestamps or both be dates")]
    MixedTimeKinds,
}

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;
