//! Ownership of completion prompts.
//!
//! More than one UI surface can show an item (the calendar grid, a task
//! drawer, a day summary). Whichever surface starts a completion claims the
//! item's prompt for the duration of that completion, and the session
//! remembers which items already got their celebration.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::ItemId;
use crate::ledger::BoundedSet;

/// Identity of a UI surface that can own a completion prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceToken(Uuid);

impl SurfaceToken {
    pub fn new() -> Self {
        SurfaceToken(Uuid::new_v4())
    }
}

impl Default for SurfaceToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SurfaceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

/// Map from item id to the surface currently owning its prompt.
#[derive(Debug, Default)]
pub struct ClaimRegistry {
    owners: HashMap<ItemId, SurfaceToken>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for `surface`. Re-claiming by the current owner succeeds.
    /// On conflict the current owner is returned.
    pub fn try_claim(&mut self, id: &ItemId, surface: SurfaceToken) -> Result<(), SurfaceToken> {
        match self.owners.get(id) {
            Some(owner) if *owner != surface => Err(*owner),
            _ => {
                self.owners.insert(id.clone(), surface);
                Ok(())
            }
        }
    }

    /// Release a claim. Only the owner can release.
    pub fn release(&mut self, id: &ItemId, surface: SurfaceToken) -> bool {
        if self.owners.get(id) == Some(&surface) {
            self.owners.remove(id);
            return true;
        }
        false
    }

    /// Drop whatever claim exists, e.g. when the item disappears.
    pub fn forget(&mut self, id: &ItemId) {
        self.owners.remove(id);
    }

    pub fn owner(&self, id: &ItemId) -> Option<SurfaceToken> {
        self.owners.get(id).copied()
    }
}

/// Items whose completion celebration has already been shown.
#[derive(Debug)]
pub struct PromptLedger {
    prompted: BoundedSet<ItemId>,
}

impl PromptLedger {
    pub fn new(capacity: usize) -> Self {
        PromptLedger {
            prompted: BoundedSet::new(capacity),
        }
    }

    /// Record that a prompt is being shown. `false` if it already was.
    pub fn record(&mut self, id: &ItemId) -> bool {
        self.prompted.insert(id.clone())
    }

    pub fn was_prompted(&self, id: &ItemId) -> bool {
        self.prompted.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_conflict_reports_owner() {
        let mut claims = ClaimRegistry::new();
        let grid = SurfaceToken::new();
        let drawer = SurfaceToken::new();
        let id = ItemId::permanent("7");

        assert!(claims.try_claim(&id, grid).is_ok());
        assert!(claims.try_claim(&id, grid).is_ok());
        assert_eq!(claims.try_claim(&id, drawer), Err(grid));
    }

    #[test]
    fn test_only_owner_releases() {
        let mut claims = ClaimRegistry::new();
        let grid = SurfaceToken::new();
        let drawer = SurfaceToken::new();
        let id = ItemId::permanent("7");

        claims.try_claim(&id, grid).unwrap();
        assert!(!claims.release(&id, drawer));
        assert_eq!(claims.owner(&id), Some(grid));
        assert!(claims.release(&id, grid));
        assert_eq!(claims.owner(&id), None);
        assert!(claims.try_claim(&id, drawer).is_ok());
    }

    #[test]
    fn test_ledger_prompts_once() {
        let mut ledger = PromptLedger::new(8);
        let id = ItemId::permanent("7");
        assert!(!ledger.was_prompted(&id));
        assert!(ledger.record(&id));
        assert!(!ledger.record(&id));
        assert!(ledger.was_prompted(&id));
    }
}
