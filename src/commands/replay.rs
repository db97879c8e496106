use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bloomcal_core::{
    CalendarItem, CalendarSession, CalendarSnapshot, CompletionOutcome, DetailsEdit, ItemId,
    ItemPatch, MemoryBackend, Pending, Position, StoreCall, SurfaceToken, SyncConfig,
    SyncResult,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::render::Render;
use crate::script::{Script, Step};
use crate::utils::tui::StepProgress;

/// Lets feed notifications from the last writes reach every session
/// before the final snapshots are taken.
const FEED_GRACE: Duration = Duration::from_millis(20);

const DEFAULT_SURFACE: &str = "grid";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The optimistic change is in the session's cache.
    Applied {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<ItemId>,
    },
    Rejected {
        error: String,
    },
    Settled {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<ItemId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Failed {
        error: String,
    },
    /// A step with no pending part: backend knobs, remote changes, waits.
    Done {
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayEvent {
    pub step: usize,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub name: String,
    pub calendar: CalendarSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub events: Vec<ReplayEvent>,
    pub sessions: Vec<SessionView>,
    /// What the stores hold at the end.
    pub records: Vec<CalendarItem>,
    pub calls: Vec<StoreCall>,
}

pub async fn run(path: &Path, json: bool) -> Result<()> {
    let script = Script::load(path)?;
    let config = match &script.config {
        Some(config) => config.clone(),
        None => SyncConfig::load().context("Could not load config")?,
    };

    let progress = if json {
        StepProgress::hidden()
    } else {
        StepProgress::new(format!("Replaying {}", path.display()), script.steps.len())
    };
    let report = replay(&script, &config, &progress).await;
    progress.finish();
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.render());
    }
    Ok(())
}

/// Mount the script's sessions, run every step, and wait for everything
/// still pending to settle.
pub async fn replay(
    script: &Script,
    config: &SyncConfig,
    progress: &StepProgress,
) -> Result<ReplayReport> {
    let mut replay = Replay::mount(script, config).await?;
    for (i, step) in script.steps.iter().enumerate() {
        progress.step(i + 1, step.name());
        replay.step(i + 1, step).await?;
        replay.drain();
    }
    progress.settling(replay.in_flight);
    replay.finish().await
}

#[derive(Debug, Clone)]
struct StepContext {
    step: usize,
    action: &'static str,
    session: Option<String>,
    key: Option<String>,
}

impl StepContext {
    fn event(&self, outcome: Outcome) -> ReplayEvent {
        ReplayEvent {
            step: self.step,
            action: self.action,
            session: self.session.clone(),
            key: self.key.clone(),
            outcome,
        }
    }

    fn keyed(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }
}

/// Id to point the step's key at, and a note for the report.
type Settled = (Option<ItemId>, Option<String>);

struct Settlement {
    ctx: StepContext,
    result: SyncResult<Settled>,
}

struct Replay<'a> {
    script: &'a Script,
    backend: MemoryBackend,
    sessions: Vec<(String, CalendarSession)>,
    keys: HashMap<String, ItemId>,
    surfaces: HashMap<String, SurfaceToken>,
    /// Per session, the key of the most recent delete.
    last_deleted: HashMap<String, String>,
    events: Vec<ReplayEvent>,
    settlements_tx: mpsc::UnboundedSender<Settlement>,
    settlements: mpsc::UnboundedReceiver<Settlement>,
    in_flight: usize,
}

impl<'a> Replay<'a> {
    async fn mount(script: &'a Script, config: &SyncConfig) -> Result<Self> {
        let backend = MemoryBackend::new(config.feed_buffer);
        let mut keys = HashMap::new();
        for seed in &script.seed {
            let record = backend.seed(seed.draft().into_item());
            keys.insert(seed.key.clone(), record.id);
        }
        if let Some(latency) = script.latency {
            backend.set_latency(latency);
        }

        let mut sessions = Vec::with_capacity(script.sessions.len());
        for name in &script.sessions {
            let session = CalendarSession::start(config, backend.stores());
            session.start_realtime(Arc::new(backend.clone())).await?;
            let added = session.hydrate().await?.settled().await?;
            debug!(session = %name, added, "session mounted");
            sessions.push((name.clone(), session));
        }

        let (settlements_tx, settlements) = mpsc::unbounded_channel();
        Ok(Replay {
            script,
            backend,
            sessions,
            keys,
            surfaces: HashMap::new(),
            last_deleted: HashMap::new(),
            events: Vec::new(),
            settlements_tx,
            settlements,
            in_flight: 0,
        })
    }

    fn session(&self, name: Option<&str>) -> Result<&CalendarSession> {
        let name = self.script.session_name(name);
        self.sessions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, session)| session)
            .ok_or_else(|| anyhow!("unknown session '{name}'"))
    }

    fn id_of(&self, key: &str) -> Result<ItemId> {
        self.keys
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("key '{key}' does not name an item yet"))
    }

    async fn step(&mut self, n: usize, step: &Step) -> Result<()> {
        let session = step
            .session()
            .map(|name| self.script.session_name(name).to_string());
        let ctx = StepContext {
            step: n,
            action: step.name(),
            session,
            key: None,
        };
        info!(step = n, action = ctx.action, session = ?ctx.session, "replay step");

        match step {
            Step::Create { session, item } => {
                let ctx = ctx.keyed(Some(item.key.clone()));
                let result = self.session(session.as_deref())?.create(item.draft()).await;
                if let Some(id) = result.as_ref().ok().and_then(|p| p.id()) {
                    self.keys.insert(item.key.clone(), id.clone());
                }
                self.accept(&ctx, result, |item: CalendarItem| (Some(item.id), None));
            }
            Step::Move {
                session,
                key,
                start,
                end,
            } => {
                let ctx = ctx.keyed(Some(key.clone()));
                let id = self.id_of(key)?;
                let position = Position::new(*start, *end);
                let result = self
                    .session(session.as_deref())?
                    .reposition(&id, position)
                    .await;
                self.accept(&ctx, result, |()| (None, None));
            }
            Step::Edit {
                session,
                key,
                title,
                description,
            } => {
                let ctx = ctx.keyed(Some(key.clone()));
                let id = self.id_of(key)?;
                let edit = DetailsEdit {
                    title: title.clone(),
                    description: description.clone(),
                };
                let result = self.session(session.as_deref())?.edit_details(&id, edit).await;
                self.accept(&ctx, result, |()| (None, None));
            }
            Step::Complete {
                session,
                key,
                surface,
            } => {
                let ctx = ctx.keyed(Some(key.clone()));
                let id = self.id_of(key)?;
                let surface = *self
                    .surfaces
                    .entry(surface.clone().unwrap_or_else(|| DEFAULT_SURFACE.into()))
                    .or_insert_with(SurfaceToken::new);
                let result = self.session(session.as_deref())?.complete(&id, surface).await;
                self.accept(&ctx, result, |outcome: CompletionOutcome| {
                    let note = if outcome.celebrate {
                        "celebrate"
                    } else {
                        "already celebrated"
                    };
                    (None, Some(note.to_string()))
                });
            }
            Step::Delete { session, key } => {
                let ctx = ctx.keyed(Some(key.clone()));
                let id = self.id_of(key)?;
                let result = self.session(session.as_deref())?.delete(&id).await;
                if result.is_ok()
                    && let Some(name) = &ctx.session
                {
                    self.last_deleted.insert(name.clone(), key.clone());
                }
                self.accept(&ctx, result, |()| (None, None));
            }
            Step::Undo { session } => {
                let key = ctx
                    .session
                    .as_ref()
                    .and_then(|name| self.last_deleted.get(name))
                    .cloned();
                let ctx = ctx.keyed(key);
                let result = self.session(session.as_deref())?.undo_delete().await;
                match result {
                    Ok(Some(pending)) => {
                        if let (Some(key), Some(id)) = (&ctx.key, pending.id()) {
                            self.keys.insert(key.clone(), id.clone());
                        }
                        self.accept(&ctx, Ok(pending), |item: CalendarItem| {
                            (Some(item.id), None)
                        });
                    }
                    Ok(None) => self.events.push(ctx.event(Outcome::Done {
                        detail: "nothing to restore".into(),
                    })),
                    Err(e) => self.events.push(ctx.event(Outcome::Rejected {
                        error: e.to_string(),
                    })),
                }
            }
            Step::Hydrate { session } => {
                let result = self.session(session.as_deref())?.hydrate().await;
                self.accept(&ctx, result, |added: usize| {
                    (None, Some(format!("{added} added")))
                });
            }
            Step::StartRealtime { session } => {
                let feed = Arc::new(self.backend.clone());
                let result = self.session(session.as_deref())?.start_realtime(feed).await;
                self.done(&ctx, result.map(|()| "subscribed".to_string()));
            }
            Step::StopRealtime { session } => {
                let result = self.session(session.as_deref())?.stop_realtime().await;
                self.done(&ctx, result.map(|()| "unsubscribed".to_string()));
            }
            Step::RemoteEdit {
                key,
                title,
                description,
            } => {
                let ctx = ctx.keyed(Some(key.clone()));
                let id = self.id_of(key)?;
                let edit = DetailsEdit {
                    title: title.clone(),
                    description: description.clone(),
                };
                let result = match self.backend.record(&id) {
                    Some(record) => self
                        .backend
                        .store(record.category)
                        .update(&id, &ItemPatch::details(&edit))
                        .await
                        .map(|()| format!("edited {id}")),
                    None => Ok(format!("{id} is not in the store")),
                };
                self.done(&ctx, result);
            }
            Step::RemoteDelete { key } => {
                let ctx = ctx.keyed(Some(key.clone()));
                let id = self.id_of(key)?;
                let result = match self.backend.record(&id) {
                    Some(record) => self
                        .backend
                        .store(record.category)
                        .delete(&id)
                        .await
                        .map(|()| format!("deleted {id}")),
                    None => Ok(format!("{id} is not in the store")),
                };
                self.done(&ctx, result);
            }
            Step::Wait { duration } => {
                tokio::time::sleep(*duration).await;
                self.drain();
                let detail = humantime::format_duration(*duration).to_string();
                self.done(&ctx, Ok(detail));
            }
            Step::Latency { duration } => {
                self.backend.set_latency(*duration);
                let detail = humantime::format_duration(*duration).to_string();
                self.done(&ctx, Ok(detail));
            }
            Step::FailNext { call, times } => {
                for _ in 0..*times {
                    self.backend.fail_next(*call);
                }
                self.done(&ctx, Ok(format!("next {times} {call:?} call(s) fail")));
            }
            Step::FailAll { enabled } => {
                self.backend.set_fail_all(*enabled);
                let detail = if *enabled {
                    "every call fails"
                } else {
                    "calls succeed"
                };
                self.done(&ctx, Ok(detail.to_string()));
            }
        }
        Ok(())
    }

    fn done(&mut self, ctx: &StepContext, result: SyncResult<String>) {
        let outcome = match result {
            Ok(detail) => Outcome::Done { detail },
            Err(e) => Outcome::Failed {
                error: e.to_string(),
            },
        };
        self.events.push(ctx.event(outcome));
    }

    /// Record the acknowledgement and follow the pending part in the background.
    fn accept<T: Send + 'static>(
        &mut self,
        ctx: &StepContext,
        result: SyncResult<Pending<T>>,
        describe: fn(T) -> Settled,
    ) {
        let pending = match result {
            Ok(pending) => pending,
            Err(e) => {
                debug!(step = ctx.step, error = %e, "step rejected");
                self.events.push(ctx.event(Outcome::Rejected {
                    error: e.to_string(),
                }));
                return;
            }
        };
        self.events.push(ctx.event(Outcome::Applied {
            id: pending.id().cloned(),
        }));

        let tx = self.settlements_tx.clone();
        let ctx = ctx.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = pending.settled().await.map(describe);
            // The receiver lives as long as the replay.
            let _ = tx.send(Settlement { ctx, result });
        });
    }

    fn settle(&mut self, settlement: Settlement) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Settlement { ctx, result } = settlement;
        let outcome = match result {
            Ok((id, detail)) => {
                if let (Some(key), Some(id)) = (&ctx.key, &id) {
                    self.keys.insert(key.clone(), id.clone());
                }
                Outcome::Settled { id, detail }
            }
            Err(e) => Outcome::Failed {
                error: e.to_string(),
            },
        };
        self.events.push(ctx.event(outcome));
    }

    fn drain(&mut self) {
        while let Ok(settlement) = self.settlements.try_recv() {
            self.settle(settlement);
        }
    }

    async fn finish(mut self) -> Result<ReplayReport> {
        while self.in_flight > 0 {
            match self.settlements.recv().await {
                Some(settlement) => self.settle(settlement),
                None => break,
            }
        }

        tokio::time::sleep(FEED_GRACE).await;
        let mut views = Vec::with_capacity(self.sessions.len());
        for (name, session) in self.sessions {
            session.flush().await?;
            views.push(SessionView {
                name,
                calendar: session.snapshot(),
            });
            session.stop().await;
        }

        Ok(ReplayReport {
            events: self.events,
            sessions: views,
            records: self.backend.records(),
            calls: self.backend.calls(),
        })
    }
}
