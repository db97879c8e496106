//! Persistence boundaries and the change feed.
//!
//! Plain events and bloom tasks are owned by different stores; the engine
//! routes every call by the item's category and never talks to storage in
//! any other way.

mod feed;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::item::{CalendarItem, Category, ItemId, ItemPatch};

pub use feed::{ChangeFeed, FeedNotification, FeedOperation};

/// One persistence boundary.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Existing records, for hydrating a freshly mounted view.
    async fn list(&self) -> SyncResult<Vec<CalendarItem>>;

    /// Persist a new item. The returned record carries the permanent id.
    async fn create(&self, item: &CalendarItem) -> SyncResult<CalendarItem>;

    async fn update(&self, id: &ItemId, patch: &ItemPatch) -> SyncResult<()>;

    async fn delete(&self, id: &ItemId) -> SyncResult<()>;

    async fn complete(&self, id: &ItemId) -> SyncResult<()> {
        Err(SyncError::InvalidOperation(format!(
            "store does not support completing {id}"
        )))
    }
}

/// The two boundaries, keyed by category.
#[derive(Clone)]
pub struct Stores {
    plain: Arc<dyn ItemStore>,
    bloom: Arc<dyn ItemStore>,
}

impl Stores {
    pub fn new(plain: Arc<dyn ItemStore>, bloom: Arc<dyn ItemStore>) -> Self {
        Stores { plain, bloom }
    }

    pub fn for_category(&self, category: Category) -> Arc<dyn ItemStore> {
        match category {
            Category::PlainEvent => self.plain.clone(),
            Category::BloomTask => self.bloom.clone(),
        }
    }

    pub fn all(&self) -> [(Category, Arc<dyn ItemStore>); 2] {
        [
            (Category::PlainEvent, self.plain.clone()),
            (Category::BloomTask, self.bloom.clone()),
        ]
    }
}
