use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::item::CalendarItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOperation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for FeedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedOperation::Insert => write!(f, "+"),
            FeedOperation::Update => write!(f, "~"),
            FeedOperation::Delete => write!(f, "-"),
        }
    }
}

/// A change pushed by the backing store. `record.id` is always permanent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedNotification {
    pub operation: FeedOperation,
    pub record: CalendarItem,
}

impl FeedNotification {
    pub fn insert(record: CalendarItem) -> Self {
        FeedNotification {
            operation: FeedOperation::Insert,
            record,
        }
    }

    pub fn update(record: CalendarItem) -> Self {
        FeedNotification {
            operation: FeedOperation::Update,
            record,
        }
    }

    pub fn delete(record: CalendarItem) -> Self {
        FeedNotification {
            operation: FeedOperation::Delete,
            record,
        }
    }
}

impl fmt::Display for FeedNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation, self.record)
    }
}

/// Shared change feed covering both categories and every session.
///
/// Delivery is at-least-once and unordered. Dropping the receiver is the
/// unsubscribe.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<FeedNotification>;
}
