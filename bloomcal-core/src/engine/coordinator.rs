//! User operations: optimistic apply, persist, then reconcile the outcome.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::reconciler::Merge;
use super::{
    CalendarEngine, Msg, PendingComplete, PendingCreate, PendingDelete, PendingEdit,
    PendingHydrate, Reply, pending_pair, settle_all,
};
use crate::cache::{CacheEntry, EntryStatus};
use crate::claims::SurfaceToken;
use crate::debounce::Launch;
use crate::error::{SyncError, SyncResult};
use crate::item::{CalendarItem, Category, DetailsEdit, ItemDraft, ItemId, ItemPatch, Position};
use crate::session::{CompletionOutcome, Pending};
use crate::undo::Tombstone;

impl CalendarEngine {
    pub(super) fn create(&mut self, draft: ItemDraft) -> SyncResult<Pending<CalendarItem>> {
        draft.validate()?;
        let item = draft.into_item();
        let id = item.id.clone();
        self.cache
            .insert(CacheEntry::new(item.clone(), EntryStatus::PendingCreate))?;
        debug!(item = %id, category = %item.category, "create applied");

        let (reply, pending) = pending_pair(Some(id));
        self.issue_create(item, reply, false);
        Ok(pending)
    }

    fn issue_create(&mut self, item: CalendarItem, reply: Reply<CalendarItem>, restoring: bool) {
        let store = self.stores.for_category(item.category);
        let ephemeral = item.id.clone();
        self.creates.push(PendingCreate {
            ephemeral: ephemeral.clone(),
            item: item.clone(),
            reply,
            restoring,
        });
        self.spawn(
            async move { store.create(&item).await },
            move |result| Msg::Created { ephemeral, result },
        );
    }

    pub(super) fn on_created(&mut self, ephemeral: ItemId, result: SyncResult<CalendarItem>) {
        let Some(index) = self.creates.iter().position(|c| c.ephemeral == ephemeral) else {
            return;
        };
        let create = self.creates.remove(index);
        let bound = self.bindings.remove(&ephemeral);
        match result {
            Ok(record) => self.confirm_create(create, record, bound),
            Err(err) => self.fail_create(create, err, bound),
        }
    }

    fn confirm_create(
        &mut self,
        create: PendingCreate,
        record: CalendarItem,
        bound: Option<CalendarItem>,
    ) {
        let ephemeral = create.ephemeral;
        info!(item = %ephemeral, confirmed = %record.id, "create confirmed");

        if let Some(claimed) = bound
            && claimed.id != record.id
        {
            // The feed matched someone else's record to this create.
            warn!(item = %ephemeral, claimed = %claimed.id, confirmed = %record.id, "feed claim mismatch");
            self.retired.remove(&claimed.id);
            if self.cache.contains(&claimed.id) {
                // Our ephemeral entry already became the other record.
                if !self.cache.contains(&record.id) {
                    let _ = self.cache.insert(CacheEntry::synced(record.clone()));
                }
                let _ = create.reply.send(Ok(record));
                return;
            }
            self.undo.rebind(&claimed.id, ephemeral.clone());
            let _ = self.cache.insert(CacheEntry::synced(claimed));
        }

        if self.cache.contains(&record.id) {
            // Already shown by the feed or a hydrate.
            if self.cache.remove(&ephemeral).is_some() {
                debug!(item = %ephemeral, "dropped duplicate ephemeral entry");
            }
        } else if self.cache.contains(&ephemeral) {
            self.cache
                .replace(&ephemeral, CacheEntry::synced(record.clone()));
        } else if self.undo.holds(&ephemeral) {
            // Deleted while the create was in flight; the undo can still
            // bring back the real record.
            self.undo.rebind(&ephemeral, record.id.clone());
            self.retired.insert(record.id.clone());
        } else if !self.undo.holds(&record.id) {
            // Deleted and no longer restorable.
            self.retired.insert(record.id.clone());
            self.purge(&record);
        }
        let _ = create.reply.send(Ok(record));
    }

    fn fail_create(&mut self, create: PendingCreate, err: SyncError, bound: Option<CalendarItem>) {
        let ephemeral = create.ephemeral;
        if let Some(claimed) = bound {
            // The feed saw the record, so the store did create it.
            warn!(item = %ephemeral, confirmed = %claimed.id, error = %err, "create reported failure after the feed confirmed it");
            let _ = create.reply.send(Ok(claimed));
            return;
        }

        warn!(item = %ephemeral, error = %err, "create failed");
        if create.restoring && self.cache.contains(&ephemeral) {
            self.cache.set_status(&ephemeral, EntryStatus::Unsynced);
        } else {
            self.cache.remove(&ephemeral);
            // Nothing left that an undo could restore.
            self.undo.clear_if(&ephemeral);
        }
        let _ = create.reply.send(Err(err));
    }

    /// An item restored while its delete call is still out accepts no edits
    /// until that call settles.
    fn ensure_editable(&self, id: &ItemId) -> SyncResult<()> {
        if self.deletes.get(id).is_some_and(|pd| pd.undone.is_some()) {
            return Err(SyncError::InvalidOperation(format!(
                "item {id} is being restored"
            )));
        }
        Ok(())
    }

    pub(super) fn reposition(&mut self, id: ItemId, position: Position) -> SyncResult<Pending<()>> {
        position.validate()?;
        if id.is_ephemeral() {
            return Err(SyncError::NotPersisted(id));
        }
        self.ensure_editable(&id)?;
        let current = self
            .cache
            .get(&id)
            .map(|e| e.item.position())
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;

        self.cache.update(&id, |e| {
            e.item.set_position(position);
            e.status = EntryStatus::Saving;
        });
        let (reply, pending) = pending_pair(Some(id.clone()));
        let generation = self.gate.push(&id, current, position, reply);
        self.arm_debounce(&id, generation);
        debug!(item = %id, generation, "reposition applied");
        Ok(pending)
    }

    fn arm_debounce(&mut self, id: &ItemId, generation: u64) {
        let timer = self.schedule(
            self.gate.quiet_period(),
            Msg::DebounceFired {
                id: id.clone(),
                generation,
            },
        );
        self.gate.arm(id, timer);
    }

    pub(super) fn on_debounce_fired(&mut self, id: &ItemId, generation: u64) {
        if let Some(launch) = self.gate.fire(id, generation) {
            self.launch_move(id, launch);
        }
    }

    fn launch_move(&mut self, id: &ItemId, launch: Launch) {
        let Some(category) = self.cache.get(id).map(|e| e.item.category) else {
            settle_all(self.gate.discard(id), Err(SyncError::NotFound(id.clone())));
            return;
        };
        debug!(item = %id, seq = launch.seq, "persisting position");
        let store = self.stores.for_category(category);
        let patch = ItemPatch::position(launch.position);
        let seq = launch.seq;
        let target = id.clone();
        let id = id.clone();
        self.spawn(
            async move { store.update(&target, &patch).await },
            move |result| Msg::Moved { id, seq, result },
        );
    }

    pub(super) fn on_moved(&mut self, id: ItemId, seq: u64, result: SyncResult<()>) {
        let succeeded = result.is_ok();
        if let Err(err) = &result {
            warn!(item = %id, seq, error = %err, "reposition failed");
        }

        if let Some(settled) = self.gate.settle(&id, seq, succeeded) {
            if let Some(position) = settled.revert_to {
                self.cache.update(&id, |e| e.item.set_position(position));
            }
            if let Some(next) = settled.next {
                self.launch_move(&id, next);
            }
            self.refresh_status(&id);
            settle_all(settled.waiters, result);
            return;
        }

        // The item was deleted while its flight was out.
        let Some(pd) = self.deletes.get_mut(&id) else {
            return;
        };
        let Some(settled) = pd.lane.as_mut().and_then(|lane| lane.settle_detached(seq, succeeded))
        else {
            return;
        };
        if let Some(position) = settled.revert_to {
            pd.entry.item.set_position(position);
            self.undo.update_item(&id, |item| item.set_position(position));
            self.cache.update(&id, |e| e.item.set_position(position));
        }
        if settled.idle {
            pd.lane = None;
        }
        settle_all(settled.waiters, result);
    }

    pub(super) fn edit_details(&mut self, id: ItemId, edit: DetailsEdit) -> SyncResult<Pending<()>> {
        edit.validate()?;
        if edit.is_empty() {
            return Err(SyncError::InvalidOperation("nothing to edit".into()));
        }
        if id.is_ephemeral() {
            return Err(SyncError::NotPersisted(id));
        }
        self.ensure_editable(&id)?;
        let entry = self
            .cache
            .get(&id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        let category = entry.item.category;
        let before = edit.capture(&entry.item);

        self.cache.update(&id, |e| {
            edit.apply(&mut e.item);
            e.status = EntryStatus::Saving;
        });
        let seq = self.next_seq();
        let (reply, pending) = pending_pair(Some(id.clone()));
        let patch = ItemPatch::details(&edit);
        self.edits.entry(id.clone()).or_default().push(PendingEdit {
            seq,
            before,
            touched: edit,
            reply,
        });

        debug!(item = %id, seq, "edit applied");
        let store = self.stores.for_category(category);
        let target = id.clone();
        self.spawn(
            async move { store.update(&target, &patch).await },
            move |result| Msg::Edited { id, seq, result },
        );
        Ok(pending)
    }

    pub(super) fn on_edited(&mut self, id: ItemId, seq: u64, result: SyncResult<()>) {
        let Some(edits) = self.edits.get_mut(&id) else {
            return;
        };
        let Some(index) = edits.iter().position(|e| e.seq == seq) else {
            return;
        };
        let edit = edits.remove(index);

        let mut revert = DetailsEdit::default();
        match &result {
            Ok(()) => {
                // Older edits still out must not undo fields this one confirmed.
                for older in edits.iter_mut().filter(|e| e.seq < seq) {
                    if edit.touched.title.is_some() {
                        older.before.title = None;
                    }
                    if edit.touched.description.is_some() {
                        older.before.description = None;
                    }
                }
            }
            Err(err) => {
                warn!(item = %id, seq, error = %err, "edit failed");
                // A newer edit of the same field takes over the fallback value.
                let newer = edits.iter_mut().find(|e| e.seq > seq && e.touched.title.is_some());
                match (edit.before.title, newer) {
                    (Some(title), Some(newer)) => newer.before.title = Some(title),
                    (title, _) => revert.title = title,
                }
                let newer = edits
                    .iter_mut()
                    .find(|e| e.seq > seq && e.touched.description.is_some());
                match (edit.before.description, newer) {
                    (Some(description), Some(newer)) => {
                        newer.before.description = Some(description)
                    }
                    (description, _) => revert.description = description,
                }
            }
        }
        if edits.is_empty() {
            self.edits.remove(&id);
        }

        if !revert.is_empty() {
            self.touch_item(&id, |item| revert.apply(item));
        }
        self.refresh_status(&id);
        let _ = edit.reply.send(result);
    }

    pub(super) fn complete(
        &mut self,
        id: ItemId,
        surface: SurfaceToken,
    ) -> SyncResult<Pending<CompletionOutcome>> {
        if id.is_ephemeral() {
            return Err(SyncError::NotPersisted(id));
        }
        self.ensure_editable(&id)?;
        let entry = self
            .cache
            .get(&id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        if entry.item.category != Category::BloomTask {
            return Err(SyncError::InvalidOperation(format!(
                "only bloom tasks can be completed, {id} is a plain event"
            )));
        }
        let fresh_claim = self.claims.owner(&id).is_none();
        if let Err(owner) = self.claims.try_claim(&id, surface) {
            debug!(item = %id, %owner, %surface, "completion prompt already claimed");
            return Err(SyncError::Claimed(id));
        }
        if entry.item.extended.completed || self.completes.contains_key(&id) {
            if fresh_claim {
                self.claims.release(&id, surface);
            }
            return Err(SyncError::InvalidOperation(format!(
                "item {id} is already completed"
            )));
        }

        self.cache.update(&id, |e| {
            e.item.extended.completed = true;
            e.status = EntryStatus::Saving;
        });
        let (reply, pending) = pending_pair(Some(id.clone()));
        self.completes.insert(
            id.clone(),
            PendingComplete {
                surface,
                reply,
                confirmed_remotely: false,
            },
        );

        debug!(item = %id, %surface, "complete applied");
        let store = self.stores.for_category(Category::BloomTask);
        let target = id.clone();
        self.spawn(
            async move { store.complete(&target).await },
            move |result| Msg::Completed { id, result },
        );
        Ok(pending)
    }

    pub(super) fn on_completed(&mut self, id: ItemId, result: SyncResult<()>) {
        let Some(complete) = self.completes.remove(&id) else {
            return;
        };
        self.claims.release(&id, complete.surface);

        let outcome = match result {
            Ok(()) => {
                let celebrate = self.prompts.record(&id);
                info!(item = %id, celebrate, "completion confirmed");
                Ok(CompletionOutcome { celebrate })
            }
            Err(err) => {
                warn!(item = %id, error = %err, "complete failed");
                if !complete.confirmed_remotely {
                    self.touch_item(&id, |item| item.extended.completed = false);
                }
                Err(err)
            }
        };
        self.refresh_status(&id);
        let _ = complete.reply.send(outcome);
    }

    pub(super) fn delete(&mut self, id: ItemId) -> SyncResult<Pending<()>> {
        self.ensure_editable(&id)?;
        let (index, entry) = self
            .cache
            .remove(&id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        let lane = self.gate.detach(&id);

        let (generation, evicted) = self.undo.put(entry.item.clone(), index, Instant::now());
        self.schedule(self.undo.window(), Msg::UndoExpired { generation });
        if let Some(tombstone) = evicted {
            self.retire_tombstone(tombstone);
        }

        let (reply, pending) = pending_pair(Some(id.clone()));
        if id.is_ephemeral() {
            // Nothing exists server-side yet.
            debug!(item = %id, "ephemeral delete applied locally");
            if let Some(lane) = lane {
                settle_all(lane.into_waiters(), Err(SyncError::NotFound(id.clone())));
            }
            let _ = reply.send(Ok(()));
            return Ok(pending);
        }

        debug!(item = %id, index, "delete applied");
        self.retired.insert(id.clone());
        let store = self.stores.for_category(entry.item.category);
        self.deletes.insert(
            id.clone(),
            PendingDelete {
                entry,
                index,
                reply,
                lane,
                undone: None,
            },
        );
        let target = id.clone();
        self.spawn(
            async move { store.delete(&target).await },
            move |result| Msg::Deleted { id, result },
        );
        Ok(pending)
    }

    pub(super) fn on_deleted(&mut self, id: ItemId, result: SyncResult<()>) {
        let Some(pd) = self.deletes.remove(&id) else {
            return;
        };
        match result {
            Ok(()) => {
                info!(item = %id, "delete confirmed");
                if let Some(lane) = pd.lane {
                    settle_all(lane.into_waiters(), Err(SyncError::NotFound(id.clone())));
                }
                if let Some(undo_reply) = pd.undone {
                    // Restored while the call was out; the record is gone now.
                    self.recreate_restored(&id, undo_reply);
                }
                let _ = pd.reply.send(Ok(()));
            }
            Err(err) => {
                warn!(item = %id, error = %err, "delete failed, restoring");
                self.retired.remove(&id);
                match pd.undone {
                    Some(undo_reply) => {
                        let item = self.cache.get(&id).map(|e| e.item.clone());
                        let _ = undo_reply.send(item.ok_or_else(|| SyncError::NotFound(id.clone())));
                    }
                    None => {
                        if !self.cache.contains(&id) {
                            let _ = self.cache.insert_at(pd.index, pd.entry);
                        }
                        self.undo.clear_if(&id);
                    }
                }
                if let Some(lane) = pd.lane
                    && let Some(generation) = self.gate.attach(&id, lane)
                {
                    self.arm_debounce(&id, generation);
                }
                self.refresh_status(&id);
                let _ = pd.reply.send(Err(err));
            }
        }
    }

    /// Swap a restored entry onto a fresh ephemeral id and create it again.
    fn recreate_restored(&mut self, id: &ItemId, reply: Reply<CalendarItem>) {
        let Some(entry) = self.cache.get(id) else {
            let _ = reply.send(Err(SyncError::NotFound(id.clone())));
            return;
        };
        let item = entry.item.with_id(ItemId::ephemeral());
        debug!(item = %id, restored = %item.id, "re-creating restored item");
        self.cache.replace(
            id,
            CacheEntry::new(item.clone(), EntryStatus::PendingCreate),
        );
        self.issue_create(item, reply, true);
    }

    pub(super) fn undo_delete(&mut self) -> SyncResult<Option<Pending<CalendarItem>>> {
        let (tombstone, expired) = self.undo.take(Instant::now());
        if let Some(expired) = expired {
            debug!(item = %expired.item.id, "undo window already passed");
            self.retire_tombstone(expired);
        }
        let Some(tombstone) = tombstone else {
            return Ok(None);
        };

        let id = tombstone.item.id.clone();
        // A record already gone from its store comes back under a new id.
        let recreate = id.is_permanent() && !tombstone.orphan && !self.deletes.contains_key(&id);
        let restored = if recreate {
            ItemId::ephemeral()
        } else {
            id.clone()
        };
        let (reply, pending) = pending_pair(Some(restored.clone()));
        info!(item = %id, restored = %restored, index = tombstone.index, "restoring deleted item");

        if id.is_ephemeral() {
            let status = if self.creates.iter().any(|c| c.ephemeral == id) {
                EntryStatus::PendingCreate
            } else {
                EntryStatus::Unsynced
            };
            self.cache
                .insert_at(tombstone.index, CacheEntry::new(tombstone.item.clone(), status))?;
            let _ = reply.send(Ok(tombstone.item));
        } else if tombstone.orphan {
            self.retired.remove(&id);
            self.cache
                .insert_at(tombstone.index, CacheEntry::synced(tombstone.item.clone()))?;
            let _ = reply.send(Ok(tombstone.item));
        } else if self.deletes.contains_key(&id) {
            self.cache.insert_at(
                tombstone.index,
                CacheEntry::new(tombstone.item, EntryStatus::Saving),
            )?;
            if let Some(pd) = self.deletes.get_mut(&id) {
                pd.undone = Some(reply);
            }
        } else {
            let item = tombstone.item.with_id(restored);
            self.cache.insert_at(
                tombstone.index,
                CacheEntry::new(item.clone(), EntryStatus::PendingCreate),
            )?;
            self.issue_create(item, reply, true);
        }
        Ok(Some(pending))
    }

    pub(super) fn on_undo_expired(&mut self, generation: u64) {
        if let Some(tombstone) = self.undo.expire(generation) {
            debug!(item = %tombstone.item.id, "undo window closed");
            self.retire_tombstone(tombstone);
        }
    }

    /// A tombstone left the slot for good.
    fn retire_tombstone(&mut self, tombstone: Tombstone) {
        if tombstone.orphan {
            self.purge(&tombstone.item);
        }
    }

    /// Best-effort delete of a record nobody can see any more.
    fn purge(&mut self, item: &CalendarItem) {
        debug!(item = %item.id, "purging orphan record");
        let store = self.stores.for_category(item.category);
        let id = item.id.clone();
        let target = id.clone();
        self.spawn(
            async move { store.delete(&target).await },
            move |result| Msg::Purged { id, result },
        );
    }

    pub(super) fn hydrate(&mut self, reply: Reply<usize>) {
        let seq = self.next_seq();
        let stores = self.stores.all();
        self.hydrations.insert(
            seq,
            PendingHydrate {
                remaining: stores.len(),
                added: 0,
                error: None,
                reply,
            },
        );
        for (category, store) in stores {
            self.spawn(
                async move { store.list().await },
                move |result| Msg::Hydrated {
                    seq,
                    category,
                    result,
                },
            );
        }
    }

    pub(super) fn on_hydrated(
        &mut self,
        seq: u64,
        category: Category,
        result: SyncResult<Vec<CalendarItem>>,
    ) {
        let mut added = 0;
        let mut error = None;
        match result {
            Ok(records) => {
                for record in records {
                    if self.is_known(&record.id) {
                        continue;
                    }
                    // A create still in flight may already be listed.
                    if let Ok(Merge::Inserted) = self.place(record, false) {
                        added += 1;
                    }
                }
                debug!(%category, added, "hydrated");
            }
            Err(err) => {
                warn!(%category, error = %err, "hydrate failed");
                error = Some(err);
            }
        }

        let Some(hydration) = self.hydrations.get_mut(&seq) else {
            return;
        };
        hydration.remaining -= 1;
        hydration.added += added;
        if hydration.error.is_none() {
            hydration.error = error;
        }
        if hydration.remaining == 0
            && let Some(hydration) = self.hydrations.remove(&seq)
        {
            let outcome = match hydration.error {
                Some(err) => Err(err),
                None => Ok(hydration.added),
            };
            let _ = hydration.reply.send(outcome);
        }
    }

    /// Whether a permanent id is already accounted for locally.
    pub(super) fn is_known(&self, id: &ItemId) -> bool {
        self.cache.contains(id)
            || self.retired.contains(id)
            || self.undo.holds(id)
            || self.deletes.contains_key(id)
            || self.bindings.values().any(|b| &b.id == id)
    }
}
