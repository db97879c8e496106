//! Merging change feed notifications into the cache.
//!
//! Every rule is idempotent: applying the same notification twice leaves the
//! cache as applying it once. Notifications that change nothing come back as
//! [`SyncError::ConflictIgnored`] and are only logged.

use tracing::{debug, trace, warn};

use super::{CalendarEngine, settle_all};
use crate::cache::CacheEntry;
use crate::error::{SyncError, SyncResult};
use crate::item::{CalendarItem, Category, ItemId};
use crate::remote::{FeedNotification, FeedOperation};

/// What a notification did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Merge {
    /// A record from another session was appended.
    Inserted,
    /// A local create was matched to its record before its response returned.
    Claimed { ephemeral: ItemId },
    Replaced,
    Removed,
}

fn ignored(reason: impl Into<String>) -> SyncError {
    SyncError::ConflictIgnored(reason.into())
}

impl CalendarEngine {
    pub(super) fn on_feed(&mut self, notification: FeedNotification) {
        let summary = notification.to_string();
        match self.merge(notification) {
            Ok(merge) => debug!(notification = %summary, ?merge, "feed merged"),
            Err(SyncError::ConflictIgnored(reason)) => {
                debug!(notification = %summary, %reason, "feed notification ignored")
            }
            Err(err) => warn!(notification = %summary, error = %err, "feed merge failed"),
        }
    }

    pub(super) fn merge(&mut self, notification: FeedNotification) -> SyncResult<Merge> {
        let record = notification.record;
        if record.id.is_ephemeral() {
            return Err(ignored(format!("record {} has no permanent id", record.id)));
        }
        match notification.operation {
            FeedOperation::Insert => self.merge_insert(record),
            FeedOperation::Update => self.merge_update(record),
            FeedOperation::Delete => self.merge_delete(&record.id),
        }
    }

    fn merge_insert(&mut self, record: CalendarItem) -> SyncResult<Merge> {
        if self.retired.contains(&record.id) {
            return Err(ignored(format!("{} was deleted locally", record.id)));
        }
        if self.is_known(&record.id) {
            return Err(ignored(format!("{} is already present", record.id)));
        }

        self.place(record, true)
    }

    /// Shows a record the session has not seen yet, claiming a pending
    /// create for it when one matches.
    ///
    /// `fallback` also lets a visible create with different content match;
    /// without it only identical content claims.
    pub(super) fn place(&mut self, record: CalendarItem, fallback: bool) -> SyncResult<Merge> {
        let Some(ephemeral) = self.claim_candidate(&record, fallback) else {
            self.cache.insert(CacheEntry::synced(record))?;
            return Ok(Merge::Inserted);
        };

        trace!(item = %ephemeral, confirmed = %record.id, "record claimed pending create");
        self.bindings.insert(ephemeral.clone(), record.clone());
        if self.cache.contains(&ephemeral) {
            self.cache
                .replace(&ephemeral, CacheEntry::synced(record));
        } else {
            // Deleted while its create was out: keep it out of view.
            self.retired.insert(record.id.clone());
            self.undo.rebind(&ephemeral, record.id);
        }
        Ok(Merge::Claimed { ephemeral })
    }

    /// The pending create an inserted record most likely belongs to.
    ///
    /// Only creates of the record's category are considered, and only those
    /// the feed has not matched yet. Identical content wins; failing that,
    /// and only with `fallback`, the oldest create still visible in the
    /// cache. A create the user has since deleted only ever matches on
    /// identical content.
    fn claim_candidate(&self, record: &CalendarItem, fallback: bool) -> Option<ItemId> {
        let mut oldest = None;
        for create in self
            .creates
            .iter()
            .filter(|c| c.item.category == record.category)
            .filter(|c| !self.bindings.contains_key(&c.ephemeral))
        {
            let visible = self.cache.get(&create.ephemeral).map(|e| &e.item);
            let content = visible.unwrap_or(&create.item);
            if content.same_content(record) {
                return Some(create.ephemeral.clone());
            }
            if fallback && visible.is_some() && oldest.is_none() {
                oldest = Some(create.ephemeral.clone());
            }
        }
        oldest
    }

    fn merge_update(&mut self, record: CalendarItem) -> SyncResult<Merge> {
        let id = record.id.clone();
        if self.retired.contains(&id) {
            return Err(ignored(format!("{id} was deleted locally")));
        }
        let Some(current) = self.cache.get(&id).map(|e| e.item.clone()) else {
            return Err(ignored(format!("{id} is not in view")));
        };

        let mut merged = record;
        // Category never changes after creation.
        merged.category = current.category;

        if self.gate.is_active(&id) {
            // Local drag wins until it settles; failures now revert to the
            // pushed position.
            self.gate.rebase(&id, merged.position());
            merged.set_position(current.position());
        }

        if let Some(complete) = self.completes.get_mut(&id) {
            complete.confirmed_remotely |= merged.extended.completed;
            merged.extended.completed = true;
        } else if current.category == Category::BloomTask && current.extended.completed {
            merged.extended.completed = true;
        }

        if let Some(edits) = self.edits.get_mut(&id) {
            if let Some(oldest) = edits.iter_mut().find(|e| e.touched.title.is_some()) {
                oldest.before.title = Some(merged.title.clone());
                merged.title = current.title.clone();
            }
            if let Some(oldest) = edits.iter_mut().find(|e| e.touched.description.is_some()) {
                oldest.before.description = Some(merged.extended.description.clone());
                merged.extended.description = current.extended.description.clone();
            }
        }

        if merged == current {
            return Err(ignored(format!("{id} is unchanged")));
        }
        self.cache.update(&id, |e| e.item = merged);
        Ok(Merge::Replaced)
    }

    fn merge_delete(&mut self, id: &ItemId) -> SyncResult<Merge> {
        if self.deletes.get(id).is_some_and(|pd| pd.undone.is_some()) {
            return Err(ignored(format!("{id} was restored locally")));
        }
        if self.cache.remove(id).is_none() {
            // Someone else deleted the record behind a local orphan; a
            // restore has to create it again.
            if self.undo.disown(id) {
                return Ok(Merge::Removed);
            }
            return Err(ignored(format!("{id} is not in view")));
        }

        settle_all(self.gate.discard(id), Err(SyncError::NotFound(id.clone())));
        self.claims.forget(id);
        self.retired.insert(id.clone());
        Ok(Merge::Removed)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::cache::{CalendarSnapshot, EntryStatus};
    use crate::config::SyncConfig;
    use crate::engine::Msg;
    use crate::item::{ItemDraft, ItemTime, Position};
    use crate::remote::memory::MemoryBackend;

    fn engine() -> (CalendarEngine, mpsc::UnboundedReceiver<Msg>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(CalendarSnapshot::default());
        let backend = MemoryBackend::default();
        let engine = CalendarEngine::new(&SyncConfig::default(), backend.stores(), inbox, snapshots);
        (engine, rx)
    }

    fn record(id: &str, title: &str) -> CalendarItem {
        ItemDraft::new(title, ItemTime::parse("2025-03-20").unwrap(), Category::PlainEvent)
            .into_item()
            .with_id(ItemId::permanent(id))
    }

    fn items(engine: &CalendarEngine) -> Vec<CalendarItem> {
        engine.cache.iter().map(|e| e.item.clone()).collect()
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let (mut engine, _rx) = engine();
        let note = FeedNotification::insert(record("1", "Lunch"));

        assert_eq!(engine.merge(note.clone()), Ok(Merge::Inserted));
        let once = items(&engine);
        assert!(matches!(engine.merge(note), Err(SyncError::ConflictIgnored(_))));
        assert_eq!(items(&engine), once);
    }

    #[tokio::test]
    async fn test_update_is_idempotent_and_ignores_absent_ids() {
        let (mut engine, _rx) = engine();
        engine.merge(FeedNotification::insert(record("1", "Lunch"))).unwrap();

        let renamed = FeedNotification::update(record("1", "Late lunch"));
        assert_eq!(engine.merge(renamed.clone()), Ok(Merge::Replaced));
        let once = items(&engine);
        assert!(engine.merge(renamed).is_err());
        assert_eq!(items(&engine), once);

        let stray = FeedNotification::update(record("9", "Elsewhere"));
        assert!(matches!(engine.merge(stray), Err(SyncError::ConflictIgnored(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_retires() {
        let (mut engine, _rx) = engine();
        let lunch = record("1", "Lunch");
        engine.merge(FeedNotification::insert(lunch.clone())).unwrap();

        let gone = FeedNotification::delete(lunch.clone());
        assert_eq!(engine.merge(gone.clone()), Ok(Merge::Removed));
        assert!(engine.merge(gone).is_err());
        assert!(engine.cache.is_empty());
        // A late duplicate insert cannot bring it back.
        assert!(engine.merge(FeedNotification::insert(lunch)).is_err());
    }

    #[tokio::test]
    async fn test_insert_claims_pending_create_in_place() {
        let (mut engine, _rx) = engine();
        engine.merge(FeedNotification::insert(record("1", "Existing"))).unwrap();
        let draft = ItemDraft::new(
            "Buy groceries",
            ItemTime::parse("2025-03-21").unwrap(),
            Category::PlainEvent,
        );
        let pending = engine.create(draft).unwrap();
        let ephemeral = pending.id().unwrap().clone();
        let local = engine.cache.get(&ephemeral).unwrap().item.clone();

        let confirmed = local.with_id(ItemId::permanent("2"));
        let merge = engine.merge(FeedNotification::insert(confirmed.clone()));
        assert_eq!(merge, Ok(Merge::Claimed { ephemeral: ephemeral.clone() }));

        let entry = engine.cache.get(&confirmed.id).unwrap();
        assert_eq!(engine.cache.index_of(&confirmed.id), Some(1));
        assert_eq!(entry.status, EntryStatus::Synced);
        assert!(entry.item.same_content(&local));
        assert!(!engine.cache.contains(&ephemeral));
    }

    #[tokio::test]
    async fn test_insert_prefers_content_match_and_category() {
        let (mut engine, _rx) = engine();
        let day = ItemTime::parse("2025-03-21").unwrap();
        let first = engine
            .create(ItemDraft::new("Stretch", day, Category::BloomTask))
            .unwrap();
        let second = engine
            .create(ItemDraft::new("Dentist", day, Category::PlainEvent))
            .unwrap();
        let third = engine
            .create(ItemDraft::new("Groceries", day, Category::PlainEvent))
            .unwrap();

        let groceries = engine.cache.get(third.id().unwrap()).unwrap().item.clone();
        let merge = engine.merge(FeedNotification::insert(groceries.with_id(ItemId::permanent("7"))));
        assert_eq!(
            merge,
            Ok(Merge::Claimed {
                ephemeral: third.id().unwrap().clone()
            })
        );
        assert!(engine.cache.contains(first.id().unwrap()));
        assert!(engine.cache.contains(second.id().unwrap()));
    }

    #[tokio::test]
    async fn test_listed_record_claims_only_identical_create() {
        let (mut engine, _rx) = engine();
        let day = ItemTime::parse("2025-03-21").unwrap();
        let pending = engine
            .create(ItemDraft::new("Groceries", day, Category::PlainEvent))
            .unwrap();
        let ephemeral = pending.id().unwrap().clone();

        let unrelated = record("3", "Dentist");
        assert_eq!(engine.place(unrelated, false), Ok(Merge::Inserted));
        assert!(engine.cache.contains(&ephemeral));

        let ours = engine.cache.get(&ephemeral).unwrap().item.with_id(ItemId::permanent("4"));
        assert_eq!(
            engine.place(ours.clone(), false),
            Ok(Merge::Claimed { ephemeral: ephemeral.clone() })
        );
        assert_eq!(engine.cache.len(), 2);
        assert!(engine.cache.contains(&ours.id));
        assert!(engine.is_known(&ours.id));
    }

    #[tokio::test]
    async fn test_update_keeps_local_drag_position() {
        let (mut engine, _rx) = engine();
        let lunch = record("1", "Lunch");
        engine.merge(FeedNotification::insert(lunch.clone())).unwrap();

        let dragged = Position::new(ItemTime::parse("2025-03-25").unwrap(), None);
        let _pending = engine.reposition(lunch.id.clone(), dragged).unwrap();

        let mut remote = lunch.clone();
        remote.title = "Team lunch".into();
        engine.merge(FeedNotification::update(remote.clone())).unwrap();

        let item = &engine.cache.get(&lunch.id).unwrap().item;
        assert_eq!(item.title, "Team lunch");
        assert_eq!(item.position(), dragged);
        assert_eq!(engine.gate.baseline(&lunch.id), Some(remote.position()));
    }

    #[tokio::test]
    async fn test_remote_delete_discards_pending_drag() {
        let (mut engine, _rx) = engine();
        let lunch = record("1", "Lunch");
        engine.merge(FeedNotification::insert(lunch.clone())).unwrap();
        let dragged = Position::new(ItemTime::parse("2025-03-25").unwrap(), None);
        let pending = engine.reposition(lunch.id.clone(), dragged).unwrap();

        engine.merge(FeedNotification::delete(lunch.clone())).unwrap();
        assert!(!engine.gate.is_active(&lunch.id));
        assert_eq!(pending.settled().await, Err(SyncError::NotFound(lunch.id)));
    }

    #[tokio::test]
    async fn test_ephemeral_feed_record_is_ignored() {
        let (mut engine, _rx) = engine();
        let local = ItemDraft::new("x", ItemTime::parse("2025-03-20").unwrap(), Category::PlainEvent)
            .into_item();
        assert!(matches!(
            engine.merge(FeedNotification::insert(local)),
            Err(SyncError::ConflictIgnored(_))
        ));
        assert!(engine.cache.is_empty());
    }
}
