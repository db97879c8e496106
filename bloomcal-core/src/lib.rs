//! Optimistic synchronization engine for a calendar of plain events and
//! bloom tasks.
//!
//! Changes are applied to an in-memory cache at once, persisted in the
//! background, and rolled back if persistence fails. A shared change feed
//! keeps several sessions on the same stores in agreement.

pub mod cache;
pub mod claims;
pub mod config;
pub mod constants;
pub mod debounce;
mod engine;
pub mod error;
pub mod item;
pub mod ledger;
mod realtime;
pub mod remote;
pub mod session;
pub mod undo;

pub use cache::{CacheEntry, CalendarSnapshot, EntryStatus, EventCache};
pub use claims::{ClaimRegistry, PromptLedger, SurfaceToken};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult, ValidationError};
pub use item::{
    CalendarItem, Category, DetailsEdit, Extended, ItemDraft, ItemId, ItemPatch, ItemTime,
    Position,
};
pub use remote::memory::{CallKind, MemoryBackend, StoreCall};
pub use remote::{ChangeFeed, FeedNotification, FeedOperation, ItemStore, Stores};
pub use session::{CalendarSession, CompletionOutcome, Pending, SessionHandle};
