//! Single-slot undo for deletes.

use std::time::Duration;

use tokio::time::Instant;

use crate::item::{CalendarItem, ItemId};

/// A deleted item kept around for the undo window.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub item: CalendarItem,
    /// Where the item sat in the cache when it was deleted.
    pub index: usize,
    pub deleted_at: Instant,
    /// The item was deleted while ephemeral and its create has since been
    /// confirmed: the record still exists server-side under `item.id`.
    pub orphan: bool,
    generation: u64,
}

impl Tombstone {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
pub struct UndoBuffer {
    window: Duration,
    slot: Option<Tombstone>,
    next_generation: u64,
}

impl UndoBuffer {
    pub fn new(window: Duration) -> Self {
        UndoBuffer {
            window,
            slot: None,
            next_generation: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Store a freshly deleted item. Returns the slot generation (for the
    /// expiry timer) and whatever tombstone it displaced.
    pub fn put(&mut self, item: CalendarItem, index: usize, now: Instant) -> (u64, Option<Tombstone>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let evicted = self.slot.replace(Tombstone {
            item,
            index,
            deleted_at: now,
            orphan: false,
            generation,
        });
        (generation, evicted)
    }

    /// Take the tombstone for restoring. An expired tombstone is cleared and
    /// returned as the second element so the caller can finish it off.
    pub fn take(&mut self, now: Instant) -> (Option<Tombstone>, Option<Tombstone>) {
        match self.slot.take() {
            Some(t) if now.duration_since(t.deleted_at) < self.window => (Some(t), None),
            Some(t) => (None, Some(t)),
            None => (None, None),
        }
    }

    /// Expiry timer for `generation` fired.
    pub fn expire(&mut self, generation: u64) -> Option<Tombstone> {
        if self.slot.as_ref().map(|t| t.generation) == Some(generation) {
            return self.slot.take();
        }
        None
    }

    pub fn holds(&self, id: &ItemId) -> bool {
        self.slot.as_ref().is_some_and(|t| &t.item.id == id)
    }

    pub fn peek(&self) -> Option<&Tombstone> {
        self.slot.as_ref()
    }

    /// Clear the slot if it holds `id`.
    pub fn clear_if(&mut self, id: &ItemId) -> Option<Tombstone> {
        if self.holds(id) {
            return self.slot.take();
        }
        None
    }

    /// Move the tombstone to another id. Binding an ephemeral tombstone to a
    /// permanent id marks it as an orphan; binding it back clears that.
    pub fn rebind(&mut self, from: &ItemId, to: ItemId) -> bool {
        match self.slot.as_mut() {
            Some(t) if &t.item.id == from => {
                t.orphan = to.is_permanent() && from.is_ephemeral();
                t.item.id = to;
                true
            }
            _ => false,
        }
    }

    /// The orphaned record was deleted by someone else; restoring must re-create it.
    pub fn disown(&mut self, id: &ItemId) -> bool {
        match self.slot.as_mut() {
            Some(t) if &t.item.id == id && t.orphan => {
                t.orphan = false;
                true
            }
            _ => false,
        }
    }

    /// Let a field-level revert reach an item that is currently tombstoned.
    pub fn update_item<F>(&mut self, id: &ItemId, f: F) -> bool
    where
        F: FnOnce(&mut CalendarItem),
    {
        match self.slot.as_mut() {
            Some(t) if &t.item.id == id => {
                f(&mut t.item);
                true
            }
            _ => false,
        }
    }
}
