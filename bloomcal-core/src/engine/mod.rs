//! The calendar engine.
//!
//! One task owns the cache and every piece of bookkeeping around it. User
//! commands, persistence results, feed notifications and timers all arrive
//! through a single inbox and are handled one at a time, so nothing here
//! needs a lock. Persistence calls run in spawned tasks that post their
//! result back to the inbox.

mod coordinator;
mod reconciler;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CalendarSnapshot, EntryStatus, EventCache};
use crate::claims::{ClaimRegistry, PromptLedger, SurfaceToken};
use crate::config::SyncConfig;
use crate::debounce::{DebounceGate, Lane};
use crate::error::{SyncError, SyncResult};
use crate::item::{CalendarItem, Category, DetailsEdit, ItemDraft, ItemId, Position};
use crate::ledger::BoundedSet;
use crate::realtime::RealtimeSubscription;
use crate::remote::{ChangeFeed, FeedNotification, Stores};
use crate::session::{CompletionOutcome, Pending};
use crate::undo::UndoBuffer;

/// Where the engine sends an operation's final outcome.
pub(crate) type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// Where the engine sends an operation's acknowledgment.
pub(crate) type Ack<T> = oneshot::Sender<SyncResult<T>>;

/// Requests from a [`crate::session::SessionHandle`].
pub(crate) enum Command {
    Create {
        draft: ItemDraft,
        ack: Ack<Pending<CalendarItem>>,
    },
    Reposition {
        id: ItemId,
        position: Position,
        ack: Ack<Pending<()>>,
    },
    EditDetails {
        id: ItemId,
        edit: DetailsEdit,
        ack: Ack<Pending<()>>,
    },
    Complete {
        id: ItemId,
        surface: SurfaceToken,
        ack: Ack<Pending<CompletionOutcome>>,
    },
    Delete {
        id: ItemId,
        ack: Ack<Pending<()>>,
    },
    UndoDelete {
        ack: Ack<Option<Pending<CalendarItem>>>,
    },
    PeekUndo {
        ack: oneshot::Sender<Option<CalendarItem>>,
    },
    Hydrate {
        ack: Ack<Pending<usize>>,
    },
    StartRealtime {
        feed: Arc<dyn ChangeFeed>,
        ack: oneshot::Sender<()>,
    },
    StopRealtime {
        ack: oneshot::Sender<()>,
    },
    Flush {
        ack: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Everything that can wake the engine.
pub(crate) enum Msg {
    Command(Command),
    Feed(FeedNotification),
    FeedLagged(u64),
    DebounceFired {
        id: ItemId,
        generation: u64,
    },
    UndoExpired {
        generation: u64,
    },
    Created {
        ephemeral: ItemId,
        result: SyncResult<CalendarItem>,
    },
    Moved {
        id: ItemId,
        seq: u64,
        result: SyncResult<()>,
    },
    Edited {
        id: ItemId,
        seq: u64,
        result: SyncResult<()>,
    },
    Completed {
        id: ItemId,
        result: SyncResult<()>,
    },
    Deleted {
        id: ItemId,
        result: SyncResult<()>,
    },
    Purged {
        id: ItemId,
        result: SyncResult<()>,
    },
    Hydrated {
        seq: u64,
        category: Category,
        result: SyncResult<Vec<CalendarItem>>,
    },
}

/// A create call in flight, in issue order.
struct PendingCreate {
    ephemeral: ItemId,
    /// Content at issue time, for matching feed inserts once the item
    /// has left the cache.
    item: CalendarItem,
    reply: Reply<CalendarItem>,
    /// Re-creation after an undo: failure keeps the item as `Unsynced`.
    restoring: bool,
}

/// A delete call in flight for a permanent id.
struct PendingDelete {
    entry: CacheEntry,
    index: usize,
    reply: Reply<()>,
    /// Positional edits that were debouncing or in flight at delete time.
    lane: Option<Lane<Reply<()>>>,
    /// Set when the user restored the item before the call settled.
    undone: Option<Reply<CalendarItem>>,
}

struct PendingComplete {
    surface: SurfaceToken,
    reply: Reply<CompletionOutcome>,
    /// Another session reported the item completed while ours was in flight.
    confirmed_remotely: bool,
}

struct PendingEdit {
    seq: u64,
    /// Values the touched fields had before this edit.
    before: DetailsEdit,
    touched: DetailsEdit,
    reply: Reply<()>,
}

struct PendingHydrate {
    remaining: usize,
    added: usize,
    error: Option<SyncError>,
    reply: Reply<usize>,
}

pub(crate) struct CalendarEngine {
    cache: EventCache,
    gate: DebounceGate<Reply<()>>,
    undo: UndoBuffer,
    claims: ClaimRegistry,
    prompts: PromptLedger,
    /// Permanent ids deleted by this session.
    retired: BoundedSet<ItemId>,
    creates: Vec<PendingCreate>,
    /// Feed records that claimed an ephemeral id before its create returned.
    bindings: HashMap<ItemId, CalendarItem>,
    deletes: HashMap<ItemId, PendingDelete>,
    completes: HashMap<ItemId, PendingComplete>,
    edits: HashMap<ItemId, Vec<PendingEdit>>,
    hydrations: HashMap<u64, PendingHydrate>,
    next_seq: u64,
    stores: Stores,
    realtime: RealtimeSubscription,
    inbox: mpsc::UnboundedSender<Msg>,
    snapshots: watch::Sender<CalendarSnapshot>,
    published: u64,
}

impl CalendarEngine {
    pub(crate) fn new(
        config: &SyncConfig,
        stores: Stores,
        inbox: mpsc::UnboundedSender<Msg>,
        snapshots: watch::Sender<CalendarSnapshot>,
    ) -> Self {
        CalendarEngine {
            cache: EventCache::new(),
            gate: DebounceGate::new(config.debounce_quiet_period),
            undo: UndoBuffer::new(config.undo_window),
            claims: ClaimRegistry::new(),
            prompts: PromptLedger::new(config.prompt_ledger_capacity),
            retired: BoundedSet::new(config.retired_capacity),
            creates: Vec::new(),
            bindings: HashMap::new(),
            deletes: HashMap::new(),
            completes: HashMap::new(),
            edits: HashMap::new(),
            hydrations: HashMap::new(),
            next_seq: 0,
            stores,
            realtime: RealtimeSubscription::new(),
            inbox,
            snapshots,
            published: 0,
        }
    }

    pub(crate) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Msg>) {
        info!("calendar session started");
        while let Some(msg) = inbox.recv().await {
            if matches!(msg, Msg::Command(Command::Shutdown)) {
                break;
            }
            self.handle(msg).await;
            self.publish();
        }
        self.realtime.stop().await;
        info!(
            in_flight = self.creates.len() + self.deletes.len() + self.completes.len(),
            "calendar session stopped"
        );
        // Dropping the engine drops every reply sender; their pendings
        // settle with `SessionClosed`.
    }

    async fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Command(command) => self.handle_command(command).await,
            Msg::Feed(notification) => self.on_feed(notification),
            Msg::FeedLagged(skipped) => {
                warn!(skipped, "change feed lagged, re-hydrating");
                let (reply, _pending) = pending_pair(None);
                self.hydrate(reply);
            }
            Msg::DebounceFired { id, generation } => self.on_debounce_fired(&id, generation),
            Msg::UndoExpired { generation } => self.on_undo_expired(generation),
            Msg::Created { ephemeral, result } => self.on_created(ephemeral, result),
            Msg::Moved { id, seq, result } => self.on_moved(id, seq, result),
            Msg::Edited { id, seq, result } => self.on_edited(id, seq, result),
            Msg::Completed { id, result } => self.on_completed(id, result),
            Msg::Deleted { id, result } => self.on_deleted(id, result),
            Msg::Purged { id, result } => match result {
                Ok(()) => debug!(item = %id, "orphan purged"),
                Err(err) => warn!(item = %id, error = %err, "orphan purge failed"),
            },
            Msg::Hydrated {
                seq,
                category,
                result,
            } => self.on_hydrated(seq, category, result),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Create { draft, ack } => {
                let _ = ack.send(self.create(draft));
            }
            Command::Reposition { id, position, ack } => {
                let _ = ack.send(self.reposition(id, position));
            }
            Command::EditDetails { id, edit, ack } => {
                let _ = ack.send(self.edit_details(id, edit));
            }
            Command::Complete { id, surface, ack } => {
                let _ = ack.send(self.complete(id, surface));
            }
            Command::Delete { id, ack } => {
                let _ = ack.send(self.delete(id));
            }
            Command::UndoDelete { ack } => {
                let _ = ack.send(self.undo_delete());
            }
            Command::PeekUndo { ack } => {
                let item = self
                    .undo
                    .peek()
                    .filter(|t| t.deleted_at.elapsed() < self.undo.window())
                    .map(|t| t.item.clone());
                let _ = ack.send(item);
            }
            Command::Hydrate { ack } => {
                let (reply, pending) = pending_pair(None);
                self.hydrate(reply);
                let _ = ack.send(Ok(pending));
            }
            Command::StartRealtime { feed, ack } => {
                if self.realtime.is_running() {
                    debug!("replacing realtime subscription");
                }
                self.realtime.start(feed.as_ref(), self.inbox.clone()).await;
                let _ = ack.send(());
            }
            Command::StopRealtime { ack } => {
                self.realtime.stop().await;
                let _ = ack.send(());
            }
            Command::Flush { ack } => {
                let _ = ack.send(());
            }
            Command::Shutdown => {}
        }
    }

    /// Push a snapshot to watchers if the cache changed.
    fn publish(&mut self) {
        let revision = self.cache.revision();
        if revision != self.published {
            self.published = revision;
            self.snapshots.send_replace(self.cache.snapshot());
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Run `work` off the engine task and post its result back.
    fn spawn<T, F, W>(&self, work: F, wrap: W)
    where
        T: Send + 'static,
        F: Future<Output = SyncResult<T>> + Send + 'static,
        W: FnOnce(SyncResult<T>) -> Msg + Send + 'static,
    {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = work.await;
            // The session may have shut down meanwhile.
            let _ = inbox.send(wrap(result));
        });
    }

    /// Post `msg` after `delay`.
    fn schedule(&self, delay: std::time::Duration, msg: Msg) -> tokio::task::JoinHandle<()> {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(msg);
        })
    }

    /// Recompute the status of a confirmed entry from what is still pending.
    fn refresh_status(&mut self, id: &ItemId) {
        let busy = self.gate.is_active(id)
            || self.edits.contains_key(id)
            || self.completes.contains_key(id)
            || self.deletes.get(id).is_some_and(|pd| pd.undone.is_some());
        let status = if busy {
            EntryStatus::Saving
        } else {
            EntryStatus::Synced
        };
        self.cache.update(id, |e| {
            if matches!(e.status, EntryStatus::Saving | EntryStatus::Synced) {
                e.status = status;
            }
        });
    }

    /// Apply a field-level change to `id` wherever it currently lives: the
    /// cache, the undo slot, or a pending delete.
    fn touch_item<F>(&mut self, id: &ItemId, f: F)
    where
        F: Fn(&mut CalendarItem),
    {
        if self.cache.update(id, |e| f(&mut e.item)) {
            return;
        }
        self.undo.update_item(id, &f);
        if let Some(pd) = self.deletes.get_mut(id) {
            f(&mut pd.entry.item);
        }
    }
}

/// A reply sender and the caller's half of it.
pub(crate) fn pending_pair<T>(id: Option<ItemId>) -> (Reply<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, Pending::new(id, rx))
}

/// Settle every waiter of a dropped lane.
fn settle_all(waiters: Vec<Reply<()>>, result: SyncResult<()>) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}
