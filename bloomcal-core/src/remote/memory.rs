//! In-memory stores and feed.
//!
//! Backs the CLI replays and the tests. Both categories share one record
//! table and one feed, so several sessions built on the same backend see
//! each other's changes the way they would with a real server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::constants::DEFAULT_FEED_BUFFER;
use crate::error::{SyncError, SyncResult};
use crate::item::{CalendarItem, Category, ItemId, ItemPatch};
use crate::remote::{ChangeFeed, FeedNotification, ItemStore, Stores};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    List,
    Create,
    Update,
    Delete,
    Complete,
}

/// One call received by a store, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreCall {
    pub kind: CallKind,
    pub category: Category,
    pub id: Option<ItemId>,
    pub patch: Option<ItemPatch>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_all: bool,
    fail_next: HashMap<CallKind, usize>,
}

impl Faults {
    fn should_fail(&mut self, kind: CallKind) -> bool {
        if self.fail_all {
            return true;
        }
        match self.fail_next.get_mut(&kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

struct Inner {
    records: Mutex<Vec<CalendarItem>>,
    calls: Mutex<Vec<StoreCall>>,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    next_id: AtomicU64,
    feed: broadcast::Sender<FeedNotification>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_BUFFER)
    }
}

impl MemoryBackend {
    pub fn new(feed_buffer: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_buffer.max(1));
        MemoryBackend {
            inner: Arc::new(Inner {
                records: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                latency: Mutex::new(Duration::ZERO),
                next_id: AtomicU64::new(1),
                feed,
            }),
        }
    }

    pub fn store(&self, category: Category) -> Arc<dyn ItemStore> {
        Arc::new(MemoryStore {
            backend: self.clone(),
            category,
        })
    }

    pub fn stores(&self) -> Stores {
        Stores::new(
            self.store(Category::PlainEvent),
            self.store(Category::BloomTask),
        )
    }

    /// Delay every response by `latency`. Feed notifications for successful
    /// writes go out before the delay, so the feed can beat the response.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    pub fn fail_next(&self, kind: CallKind) {
        *lock(&self.inner.faults)
            .fail_next
            .entry(kind)
            .or_insert(0) += 1;
    }

    pub fn set_fail_all(&self, fail: bool) {
        lock(&self.inner.faults).fail_all = fail;
    }

    /// Insert a record directly, as if it predated the session. No feed event.
    pub fn seed(&self, item: CalendarItem) -> CalendarItem {
        let record = item.with_id(self.mint_id());
        lock(&self.inner.records).push(record.clone());
        record
    }

    /// Push a raw notification, as another client of the store would.
    pub fn publish(&self, notification: FeedNotification) {
        // No subscribers is not an error.
        let _ = self.inner.feed.send(notification);
    }

    pub fn records(&self) -> Vec<CalendarItem> {
        lock(&self.inner.records).clone()
    }

    pub fn record(&self, id: &ItemId) -> Option<CalendarItem> {
        lock(&self.inner.records).iter().find(|r| &r.id == id).cloned()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.inner.calls).clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<StoreCall> {
        lock(&self.inner.calls)
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.feed.receiver_count()
    }

    fn mint_id(&self) -> ItemId {
        ItemId::permanent(self.inner.next_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    fn latency(&self) -> Duration {
        *lock(&self.inner.latency)
    }

    async fn delay(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Log the call and decide whether it fails.
    fn admit(&self, call: StoreCall) -> bool {
        let kind = call.kind;
        lock(&self.inner.calls).push(call);
        lock(&self.inner.faults).should_fail(kind)
    }

    async fn fail(&self, kind: CallKind) -> SyncError {
        self.delay().await;
        SyncError::Transport(format!("injected {kind:?} failure"))
    }

    fn modify<F>(&self, id: &ItemId, f: F) -> SyncResult<CalendarItem>
    where
        F: FnOnce(&mut CalendarItem),
    {
        let mut records = lock(&self.inner.records);
        let record = records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| SyncError::Transport(format!("record {id} does not exist")))?;
        f(record);
        Ok(record.clone())
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(&self) -> broadcast::Receiver<FeedNotification> {
        self.inner.feed.subscribe()
    }
}

/// The view of a [`MemoryBackend`] owning one category.
struct MemoryStore {
    backend: MemoryBackend,
    category: Category,
}

impl MemoryStore {
    fn call(&self, kind: CallKind, id: Option<&ItemId>, patch: Option<&ItemPatch>) -> StoreCall {
        StoreCall {
            kind,
            category: self.category,
            id: id.cloned(),
            patch: patch.cloned(),
        }
    }

    fn owns(&self, id: &ItemId) -> SyncResult<()> {
        match self.backend.record(id) {
            Some(r) if r.category != self.category => Err(SyncError::Transport(format!(
                "record {id} belongs to the {} store",
                r.category
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn list(&self) -> SyncResult<Vec<CalendarItem>> {
        if self.backend.admit(self.call(CallKind::List, None, None)) {
            return Err(self.backend.fail(CallKind::List).await);
        }
        let records = self
            .backend
            .records()
            .into_iter()
            .filter(|r| r.category == self.category)
            .collect();
        self.backend.delay().await;
        Ok(records)
    }

    async fn create(&self, item: &CalendarItem) -> SyncResult<CalendarItem> {
        if self.backend.admit(self.call(CallKind::Create, Some(&item.id), None)) {
            return Err(self.backend.fail(CallKind::Create).await);
        }
        if item.category != self.category {
            return Err(SyncError::InvalidOperation(format!(
                "{} item sent to the {} store",
                item.category, self.category
            )));
        }
        item.validate()?;

        let record = item.with_id(self.backend.mint_id());
        lock(&self.backend.inner.records).push(record.clone());
        self.backend.publish(FeedNotification::insert(record.clone()));
        self.backend.delay().await;
        Ok(record)
    }

    async fn update(&self, id: &ItemId, patch: &ItemPatch) -> SyncResult<()> {
        if self.backend.admit(self.call(CallKind::Update, Some(id), Some(patch))) {
            return Err(self.backend.fail(CallKind::Update).await);
        }
        self.owns(id)?;
        let record = self.backend.modify(id, |r| r.apply_patch(patch))?;
        self.backend.publish(FeedNotification::update(record));
        self.backend.delay().await;
        Ok(())
    }

    async fn delete(&self, id: &ItemId) -> SyncResult<()> {
        if self.backend.admit(self.call(CallKind::Delete, Some(id), None)) {
            return Err(self.backend.fail(CallKind::Delete).await);
        }
        self.owns(id)?;
        let removed = {
            let mut records = lock(&self.backend.inner.records);
            let index = records
                .iter()
                .position(|r| &r.id == id)
                .ok_or_else(|| SyncError::Transport(format!("record {id} does not exist")))?;
            records.remove(index)
        };
        self.backend.publish(FeedNotification::delete(removed));
        self.backend.delay().await;
        Ok(())
    }

    async fn complete(&self, id: &ItemId) -> SyncResult<()> {
        if self.backend.admit(self.call(CallKind::Complete, Some(id), None)) {
            return Err(self.backend.fail(CallKind::Complete).await);
        }
        if self.category != Category::BloomTask {
            return Err(SyncError::InvalidOperation(
                "only bloom tasks can be completed".into(),
            ));
        }
        self.owns(id)?;
        let record = self.backend.modify(id, |r| r.extended.completed = true)?;
        self.backend.publish(FeedNotification::update(record));
        self.backend.delay().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemDraft, ItemTime};
    use crate::remote::FeedOperation;

    fn draft(title: &str, category: Category) -> CalendarItem {
        ItemDraft::new(title, ItemTime::parse("2025-03-20").unwrap(), category).into_item()
    }

    #[tokio::test]
    async fn test_create_assigns_permanent_id_and_publishes() {
        let backend = MemoryBackend::default();
        let mut feed = backend.subscribe();
        let store = backend.store(Category::PlainEvent);

        let local = draft("Buy groceries", Category::PlainEvent);
        let created = store.create(&local).await.unwrap();
        assert!(created.id.is_permanent());
        assert!(created.same_content(&local));

        let note = feed.recv().await.unwrap();
        assert_eq!(note.operation, FeedOperation::Insert);
        assert_eq!(note.record, created);
        assert_eq!(backend.calls_of(CallKind::Create).len(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_fails_once() {
        let backend = MemoryBackend::default();
        let store = backend.store(Category::PlainEvent);
        backend.fail_next(CallKind::Create);

        let local = draft("x", Category::PlainEvent);
        assert!(matches!(store.create(&local).await, Err(SyncError::Transport(_))));
        assert!(store.create(&local).await.is_ok());
        assert_eq!(backend.records().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_only_for_bloom_store() {
        let backend = MemoryBackend::default();
        let plain = backend.store(Category::PlainEvent);
        let bloom = backend.store(Category::BloomTask);

        let task = bloom.create(&draft("Meditate", Category::BloomTask)).await.unwrap();
        assert!(bloom.complete(&task.id).await.is_ok());
        assert!(backend.record(&task.id).unwrap().extended.completed);

        let event = plain.create(&draft("Lunch", Category::PlainEvent)).await.unwrap();
        assert!(matches!(
            plain.complete(&event.id).await,
            Err(SyncError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_record_fails() {
        let backend = MemoryBackend::default();
        let store = backend.store(Category::PlainEvent);
        assert!(store.delete(&ItemId::permanent("404")).await.is_err());
    }
}
