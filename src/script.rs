//! Replay scripts.
//!
//! A script seeds the in-memory stores, mounts one or more sessions on
//! them, and walks through a list of steps: user actions against a
//! session, changes made by another client, and knobs on the backend.
//!
//! ```toml
//! sessions = ["phone", "laptop"]
//! latency = "40ms"
//!
//! [[seed]]
//! key = "dentist"
//! title = "Dentist"
//! start = "2025-03-19T09:00"
//! end = "2025-03-19T10:00"
//! category = "event"
//!
//! [[step]]
//! action = "delete"
//! session = "laptop"
//! key = "dentist"
//! ```
//!
//! Items are referred to by `key`; the replay keeps each key pointed at
//! the item's current id as creates and undos are confirmed.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bloomcal_core::{CallKind, Category, ItemDraft, ItemTime, SyncConfig};
use serde::{Deserialize, Deserializer};

const DEFAULT_SESSION: &str = "main";

fn default_sessions() -> Vec<String> {
    vec![DEFAULT_SESSION.to_string()]
}

fn default_times() -> usize {
    1
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

fn de_opt_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

fn de_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ItemTime, D::Error> {
    let s = String::deserialize(deserializer)?;
    ItemTime::parse(&s).map_err(serde::de::Error::custom)
}

fn de_opt_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<ItemTime>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|s| ItemTime::parse(&s).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(default = "default_sessions")]
    pub sessions: Vec<String>,

    /// Initial response latency of the stores.
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub latency: Option<Duration>,

    /// Engine settings for this replay. The user config is used when absent.
    #[serde(default)]
    pub config: Option<SyncConfig>,

    #[serde(default)]
    pub seed: Vec<ItemSpec>,

    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

/// An item as written in a script.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemSpec {
    pub key: String,
    pub title: String,
    #[serde(deserialize_with = "de_time")]
    pub start: ItemTime,
    #[serde(default, deserialize_with = "de_opt_time")]
    pub end: Option<ItemTime>,
    #[serde(default)]
    pub description: String,
    pub category: Category,
}

impl ItemSpec {
    pub fn draft(&self) -> ItemDraft {
        let mut draft = ItemDraft::new(&self.title, self.start, self.category)
            .described(&self.description);
        if let Some(end) = self.end {
            draft = draft.ending(end);
        }
        draft
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Create {
        #[serde(default)]
        session: Option<String>,
        #[serde(flatten)]
        item: ItemSpec,
    },
    Move {
        #[serde(default)]
        session: Option<String>,
        key: String,
        #[serde(deserialize_with = "de_time")]
        start: ItemTime,
        #[serde(default, deserialize_with = "de_opt_time")]
        end: Option<ItemTime>,
    },
    Edit {
        #[serde(default)]
        session: Option<String>,
        key: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Complete {
        #[serde(default)]
        session: Option<String>,
        key: String,
        /// Name of the surface claiming the completion prompt.
        #[serde(default)]
        surface: Option<String>,
    },
    Delete {
        #[serde(default)]
        session: Option<String>,
        key: String,
    },
    Undo {
        #[serde(default)]
        session: Option<String>,
    },
    Hydrate {
        #[serde(default)]
        session: Option<String>,
    },
    StartRealtime {
        #[serde(default)]
        session: Option<String>,
    },
    StopRealtime {
        #[serde(default)]
        session: Option<String>,
    },
    /// Another client edits the record directly in its store.
    RemoteEdit {
        key: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    /// Another client deletes the record.
    RemoteDelete { key: String },
    Wait {
        #[serde(deserialize_with = "de_duration")]
        duration: Duration,
    },
    Latency {
        #[serde(deserialize_with = "de_duration")]
        duration: Duration,
    },
    FailNext {
        call: CallKind,
        #[serde(default = "default_times")]
        times: usize,
    },
    FailAll { enabled: bool },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Create { .. } => "create",
            Step::Move { .. } => "move",
            Step::Edit { .. } => "edit",
            Step::Complete { .. } => "complete",
            Step::Delete { .. } => "delete",
            Step::Undo { .. } => "undo",
            Step::Hydrate { .. } => "hydrate",
            Step::StartRealtime { .. } => "start_realtime",
            Step::StopRealtime { .. } => "stop_realtime",
            Step::RemoteEdit { .. } => "remote_edit",
            Step::RemoteDelete { .. } => "remote_delete",
            Step::Wait { .. } => "wait",
            Step::Latency { .. } => "latency",
            Step::FailNext { .. } => "fail_next",
            Step::FailAll { .. } => "fail_all",
        }
    }

    /// The session the step runs against, if it targets one.
    pub fn session(&self) -> Option<Option<&str>> {
        match self {
            Step::Create { session, .. }
            | Step::Move { session, .. }
            | Step::Edit { session, .. }
            | Step::Complete { session, .. }
            | Step::Delete { session, .. }
            | Step::Undo { session }
            | Step::Hydrate { session }
            | Step::StartRealtime { session }
            | Step::StopRealtime { session } => Some(session.as_deref()),
            _ => None,
        }
    }
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read script {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid script {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let script: Script = toml::from_str(content)?;
        script.validate()?;
        Ok(script)
    }

    /// Sessions must be unique, and every step must name a session and a
    /// key that exist by the time it runs.
    fn validate(&self) -> Result<()> {
        if self.sessions.is_empty() {
            bail!("at least one session is required");
        }
        for (i, name) in self.sessions.iter().enumerate() {
            if self.sessions[..i].contains(name) {
                bail!("session '{name}' is listed twice");
            }
        }

        let mut keys: Vec<&str> = Vec::new();
        for seed in &self.seed {
            if keys.contains(&seed.key.as_str()) {
                bail!("key '{}' is used twice", seed.key);
            }
            keys.push(&seed.key);
        }

        for (n, step) in self.steps.iter().enumerate() {
            let n = n + 1;
            if let Some(Some(session)) = step.session()
                && !self.sessions.iter().any(|s| s == session)
            {
                bail!("step {n}: unknown session '{session}'");
            }
            match step {
                Step::Create { item, .. } => {
                    if keys.contains(&item.key.as_str()) {
                        bail!("step {n}: key '{}' is used twice", item.key);
                    }
                    keys.push(&item.key);
                }
                Step::Move { key, .. }
                | Step::Edit { key, .. }
                | Step::Complete { key, .. }
                | Step::Delete { key, .. }
                | Step::RemoteEdit { key, .. }
                | Step::RemoteDelete { key } => {
                    if !keys.contains(&key.as_str()) {
                        bail!("step {n}: unknown key '{key}'");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// `None` selects the first session.
    pub fn session_name<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.unwrap_or_else(|| {
            self.sessions
                .first()
                .map(String::as_str)
                .unwrap_or(DEFAULT_SESSION)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
sessions = ["phone", "laptop"]
latency = "40ms"

[config]
debounce_quiet_period = "200ms"

[[seed]]
key = "dentist"
title = "Dentist"
start = "2025-03-19T09:00"
end = "2025-03-19T10:00"
category = "event"

[[step]]
action = "create"
session = "laptop"
key = "stretch"
title = "Stretch"
start = "2025-03-20"
category = "bloom"

[[step]]
action = "move"
key = "dentist"
start = "2025-03-19T11:00"
end = "2025-03-19T12:00"

[[step]]
action = "wait"
duration = "1s"

[[step]]
action = "fail_next"
call = "delete"
"#;

    #[test]
    fn test_parse_sample() {
        let script = Script::parse(SAMPLE).unwrap();
        assert_eq!(script.sessions, vec!["phone", "laptop"]);
        assert_eq!(script.latency, Some(Duration::from_millis(40)));
        assert_eq!(
            script.config.unwrap().debounce_quiet_period,
            Duration::from_millis(200)
        );
        assert_eq!(script.seed.len(), 1);
        assert_eq!(script.seed[0].category, Category::PlainEvent);
        assert_eq!(script.steps.len(), 4);

        match &script.steps[0] {
            Step::Create { session, item } => {
                assert_eq!(session.as_deref(), Some("laptop"));
                assert_eq!(item.key, "stretch");
                assert_eq!(item.category, Category::BloomTask);
                assert!(item.start.is_date());
            }
            other => panic!("expected create, got {other:?}"),
        }
        match &script.steps[3] {
            Step::FailNext { call, times } => {
                assert_eq!(*call, CallKind::Delete);
                assert_eq!(*times, 1);
            }
            other => panic!("expected fail_next, got {other:?}"),
        }
    }

    #[test]
    fn test_default_session() {
        let script = Script::parse("").unwrap();
        assert_eq!(script.sessions, vec![DEFAULT_SESSION]);
        assert_eq!(script.session_name(None), DEFAULT_SESSION);
        assert!(script.steps.is_empty());
    }

    #[test]
    fn test_rejects_unknown_key() {
        let err = Script::parse(
            r#"
[[step]]
action = "delete"
key = "nothing"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown key 'nothing'"));
    }

    #[test]
    fn test_rejects_unknown_session() {
        let err = Script::parse(
            r#"
[[step]]
action = "undo"
session = "tablet"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown session 'tablet'"));
    }

    #[test]
    fn test_rejects_bad_time() {
        let result = Script::parse(
            r#"
[[seed]]
key = "x"
title = "X"
start = "tomorrow"
category = "event"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_draft_carries_every_field() {
        let script = Script::parse(SAMPLE).unwrap();
        let item = script.seed[0].draft().into_item();
        assert_eq!(item.title, "Dentist");
        assert_eq!(item.category, Category::PlainEvent);
        assert_eq!(item.end, Some(ItemTime::parse("2025-03-19T10:00").unwrap()));
    }
}
