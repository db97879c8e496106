//! The calendar session and its handles.
//!
//! A [`CalendarSession`] owns the engine task. UI code talks to it through
//! cloneable [`SessionHandle`]s. Every operation returns in two stages: the
//! call itself resolves once the optimistic change is in the cache (or has
//! been rejected), and the returned [`Pending`] resolves once persistence
//! has settled.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::CalendarSnapshot;
use crate::claims::SurfaceToken;
use crate::config::SyncConfig;
use crate::engine::{CalendarEngine, Command, Msg};
use crate::error::{SyncError, SyncResult};
use crate::item::{CalendarItem, DetailsEdit, ItemDraft, ItemId, Position};
use crate::remote::{ChangeFeed, Stores};

/// Final outcome of an operation that was applied optimistically.
#[derive(Debug)]
#[must_use = "a pending operation reports its failure only through `settled`"]
pub struct Pending<T> {
    id: Option<ItemId>,
    rx: oneshot::Receiver<SyncResult<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn new(id: Option<ItemId>, rx: oneshot::Receiver<SyncResult<T>>) -> Self {
        Pending { id, rx }
    }

    /// The item the operation applies to, as it was when the call returned.
    /// For a create this is the ephemeral id.
    pub fn id(&self) -> Option<&ItemId> {
        self.id.as_ref()
    }

    pub async fn settled(self) -> SyncResult<T> {
        self.rx.await.map_err(|_| SyncError::SessionClosed)?
    }
}

/// Result of a confirmed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionOutcome {
    /// This surface should show the completion celebration. Only ever true
    /// once per item.
    pub celebrate: bool,
}

/// Cheap handle for issuing operations against a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<Msg>,
    snapshots: watch::Receiver<CalendarSnapshot>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> Command,
    ) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Msg::Command(make(tx)))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    async fn notify(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Msg::Command(make(tx)))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> CalendarSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<CalendarSnapshot> {
        self.snapshots.clone()
    }

    pub async fn create(&self, draft: ItemDraft) -> SyncResult<Pending<CalendarItem>> {
        self.request(|ack| Command::Create { draft, ack }).await
    }

    /// Drag or resize. Bursts on the same item are persisted once, after the
    /// quiet period; every call in a burst settles with that one outcome.
    pub async fn reposition(&self, id: &ItemId, position: Position) -> SyncResult<Pending<()>> {
        let id = id.clone();
        self.request(|ack| Command::Reposition { id, position, ack })
            .await
    }

    pub async fn edit_details(&self, id: &ItemId, edit: DetailsEdit) -> SyncResult<Pending<()>> {
        let id = id.clone();
        self.request(|ack| Command::EditDetails { id, edit, ack })
            .await
    }

    /// Complete a bloom task on behalf of `surface`.
    pub async fn complete(
        &self,
        id: &ItemId,
        surface: SurfaceToken,
    ) -> SyncResult<Pending<CompletionOutcome>> {
        let id = id.clone();
        self.request(|ack| Command::Complete { id, surface, ack })
            .await
    }

    pub async fn delete(&self, id: &ItemId) -> SyncResult<Pending<()>> {
        let id = id.clone();
        self.request(|ack| Command::Delete { id, ack }).await
    }

    /// Restore the most recently deleted item. `None` if there is nothing
    /// to restore or the undo window has passed.
    pub async fn undo_delete(&self) -> SyncResult<Option<Pending<CalendarItem>>> {
        self.request(|ack| Command::UndoDelete { ack }).await
    }

    /// The item an undo would restore right now.
    pub async fn undo_candidate(&self) -> SyncResult<Option<CalendarItem>> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Msg::Command(Command::PeekUndo { ack: tx }))
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Load records that already exist in both stores. Settles with the
    /// number of entries added.
    pub async fn hydrate(&self) -> SyncResult<Pending<usize>> {
        self.request(|ack| Command::Hydrate { ack }).await
    }

    pub async fn start_realtime(&self, feed: Arc<dyn ChangeFeed>) -> SyncResult<()> {
        self.notify(|ack| Command::StartRealtime { feed, ack }).await
    }

    /// Returns once the feed receiver has been dropped.
    pub async fn stop_realtime(&self) -> SyncResult<()> {
        self.notify(|ack| Command::StopRealtime { ack }).await
    }

    /// Returns once every message queued before this call has been handled.
    pub async fn flush(&self) -> SyncResult<()> {
        self.notify(|ack| Command::Flush { ack }).await
    }
}

/// A running calendar session. Dropping it shuts the engine down.
pub struct CalendarSession {
    handle: SessionHandle,
    task: Option<JoinHandle<()>>,
}

impl CalendarSession {
    /// Spawn the engine on the current tokio runtime.
    pub fn start(config: &SyncConfig, stores: Stores) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots) = watch::channel(CalendarSnapshot::default());
        let engine = CalendarEngine::new(config, stores, inbox.clone(), snapshots_tx);
        let task = tokio::spawn(engine.run(rx));
        debug!(
            debounce = ?config.debounce_quiet_period,
            undo_window = ?config.undo_window,
            "calendar session spawned"
        );
        CalendarSession {
            handle: SessionHandle { inbox, snapshots },
            task: Some(task),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stop the engine and wait for it. Operations still in flight settle
    /// with [`SyncError::SessionClosed`].
    pub async fn stop(mut self) {
        let _ = self.handle.inbox.send(Msg::Command(Command::Shutdown));
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl std::ops::Deref for CalendarSession {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for CalendarSession {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.handle.inbox.send(Msg::Command(Command::Shutdown));
        }
    }
}
