//! The event cache: the ordered collection of items behind the calendar view.
//!
//! Invariants:
//! - at most one entry per id,
//! - an ephemeral entry is replaced in place by its permanent counterpart,
//!   never duplicated.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::item::{CalendarItem, ItemId};

/// Sync state of a cache entry, for UI affordances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Ephemeral, create in flight.
    PendingCreate,
    Synced,
    /// A mutation is debouncing or in flight.
    Saving,
    /// Re-creation after undo failed; the item is only local.
    Unsynced,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::PendingCreate => write!(f, "pending"),
            EntryStatus::Synced => write!(f, "synced"),
            EntryStatus::Saving => write!(f, "saving"),
            EntryStatus::Unsynced => write!(f, "unsynced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub item: CalendarItem,
    pub status: EntryStatus,
}

impl CacheEntry {
    pub fn new(item: CalendarItem, status: EntryStatus) -> Self {
        CacheEntry { item, status }
    }

    pub fn synced(item: CalendarItem) -> Self {
        Self::new(item, EntryStatus::Synced)
    }

    pub fn id(&self) -> &ItemId {
        &self.item.id
    }
}

#[derive(Debug, Default)]
pub struct EventCache {
    entries: Vec<CacheEntry>,
    revision: u64,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn index_of(&self, id: &ItemId) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    /// Append an entry.
    pub fn insert(&mut self, entry: CacheEntry) -> SyncResult<()> {
        let index = self.entries.len();
        self.insert_at(index, entry)
    }

    /// Insert at `index`, clamped to the end of the collection.
    pub fn insert_at(&mut self, index: usize, entry: CacheEntry) -> SyncResult<()> {
        if self.contains(entry.id()) {
            return Err(SyncError::InvalidOperation(format!(
                "item {} is already cached",
                entry.id()
            )));
        }
        let index = index.min(self.entries.len());
        self.entries.insert(index, entry);
        self.revision += 1;
        Ok(())
    }

    /// Replace the entry for `id`. The replacement may carry a different id;
    /// if that id is already cached elsewhere, the entry for `id` is dropped
    /// instead so the collection never holds the same id twice.
    ///
    /// Returns the entry that was replaced, or `None` if `id` was not cached.
    pub fn replace(&mut self, id: &ItemId, entry: CacheEntry) -> Option<CacheEntry> {
        let index = self.index_of(id)?;
        if entry.id() != id && self.contains(entry.id()) {
            let removed = self.entries.remove(index);
            self.revision += 1;
            return Some(removed);
        }
        let old = std::mem::replace(&mut self.entries[index], entry);
        if old != self.entries[index] {
            self.revision += 1;
        }
        Some(old)
    }

    /// Mutate the entry for `id` in place. Returns `false` if not cached.
    pub fn update<F>(&mut self, id: &ItemId, f: F) -> bool
    where
        F: FnOnce(&mut CacheEntry),
    {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        let before = self.entries[index].clone();
        f(&mut self.entries[index]);
        debug_assert_eq!(self.entries[index].id(), id, "update must not change ids");
        if self.entries[index] != before {
            self.revision += 1;
        }
        true
    }

    pub fn set_status(&mut self, id: &ItemId, status: EntryStatus) -> bool {
        self.update(id, |e| e.status = status)
    }

    /// Remove the entry for `id`, returning it with its former index.
    pub fn remove(&mut self, id: &ItemId) -> Option<(usize, CacheEntry)> {
        let index = self.index_of(id)?;
        let entry = self.entries.remove(index);
        self.revision += 1;
        Some((index, entry))
    }

    /// Replace everything, dropping duplicate ids after their first occurrence.
    pub fn snapshot(&self) -> CalendarSnapshot {
        CalendarSnapshot {
            revision: self.revision,
            entries: Arc::from(self.entries.clone()),
        }
    }
}

/// Immutable view of the cache handed to the rendering layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CalendarSnapshot {
    #[serde(skip)]
    revision: u64,
    entries: Arc<[CacheEntry]>,
}

impl CalendarSnapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn items(&self) -> impl Iterator<Item = &CalendarItem> {
        self.entries.iter().map(|e| &e.item)
    }

    pub fn get(&self, id: &ItemId) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.entries.iter().map(|e| e.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Snapshots compare by content; the revision is bookkeeping.
impl PartialEq for CalendarSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for CalendarSnapshot {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Category, ItemDraft, ItemTime};

    fn item(title: &str) -> CalendarItem {
        ItemDraft::new(
            title,
            ItemTime::parse("2025-03-20").unwrap(),
            Category::PlainEvent,
        )
        .into_item()
    }

    #[test]
    fn test_insert_rejects_duplicate_ids() {
        let mut cache = EventCache::new();
        let a = item("a");
        cache.insert(CacheEntry::synced(a.clone())).unwrap();
        assert!(cache.insert(CacheEntry::synced(a)).is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_replace_rekeys_in_place() {
        let mut cache = EventCache::new();
        let a = item("a");
        let b = item("b");
        cache.insert(CacheEntry::synced(a.clone())).unwrap();
        cache.insert(CacheEntry::synced(b.clone())).unwrap();

        let confirmed = a.with_id(ItemId::permanent("42"));
        let old = cache.replace(&a.id, CacheEntry::synced(confirmed.clone()));
        assert_eq!(old.unwrap().item, a);
        assert_eq!(cache.index_of(&confirmed.id), Some(0));
        assert!(!cache.contains(&a.id));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replace_into_existing_id_drops_instead_of_duplicating() {
        let mut cache = EventCache::new();
        let a = item("a");
        let confirmed = a.with_id(ItemId::permanent("42"));
        cache.insert(CacheEntry::synced(a.clone())).unwrap();
        cache.insert(CacheEntry::synced(confirmed.clone())).unwrap();

        cache.replace(&a.id, CacheEntry::synced(confirmed.clone()));
        assert_eq!(cache.ids_for_test(), vec![confirmed.id]);
    }

    #[test]
    fn test_remove_and_reinsert_restores_order() {
        let mut cache = EventCache::new();
        let items: Vec<_> = ["a", "b", "c"].into_iter().map(item).collect();
        for i in &items {
            cache.insert(CacheEntry::synced(i.clone())).unwrap();
        }
        let before = cache.snapshot();

        let (index, entry) = cache.remove(&items[1].id).unwrap();
        assert_eq!(index, 1);
        cache.insert_at(index, entry).unwrap();
        assert_eq!(cache.snapshot(), before);
        assert!(cache.snapshot().revision() > before.revision());
    }

    #[test]
    fn test_noop_update_keeps_revision() {
        let mut cache = EventCache::new();
        let a = item("a");
        cache.insert(CacheEntry::synced(a.clone())).unwrap();
        let rev = cache.revision();
        cache.set_status(&a.id, EntryStatus::Synced);
        assert_eq!(cache.revision(), rev);
        cache.set_status(&a.id, EntryStatus::Saving);
        assert_eq!(cache.revision(), rev + 1);
    }

    #[test]
    fn test_snapshot_is_detached_from_cache() {
        let mut cache = EventCache::new();
        let a = item("a");
        cache.insert(CacheEntry::synced(a.clone())).unwrap();
        let snap = cache.snapshot();
        cache.remove(&a.id);
        assert_eq!(snap.len(), 1);
        assert!(cache.is_empty());
    }

    impl EventCache {
        fn ids_for_test(&self) -> Vec<ItemId> {
            self.entries.iter().map(|e| e.id().clone()).collect()
        }
    }
}
