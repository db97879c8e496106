//! Terminal rendering for replay output.
//!
//! Extension traits that add colored rendering to bloomcal types using
//! owo_colors.

use bloomcal_core::{CacheEntry, CallKind, EntryStatus, StoreCall};
use owo_colors::OwoColorize;

use crate::commands::replay::{Outcome, ReplayEvent, ReplayReport, SessionView};

pub trait Render {
    fn render(&self) -> String;
}

impl Render for EntryStatus {
    fn render(&self) -> String {
        match self {
            EntryStatus::Synced => "✓".green().to_string(),
            EntryStatus::PendingCreate => "+".cyan().to_string(),
            EntryStatus::Saving => "~".yellow().to_string(),
            EntryStatus::Unsynced => "!".red().to_string(),
        }
    }
}

impl Render for CacheEntry {
    fn render(&self) -> String {
        let item = &self.item;
        let time = match item.end {
            Some(end) => format!("{} → {}", item.start, end),
            None => item.start.to_string(),
        };
        let title = if item.extended.completed {
            item.title.strikethrough().to_string()
        } else {
            item.title.clone()
        };
        format!(
            "{} {} {} {} {}",
            self.status.render(),
            title,
            time.dimmed(),
            format!("[{}]", item.category).dimmed(),
            item.id.dimmed()
        )
    }
}

impl Render for Outcome {
    fn render(&self) -> String {
        match self {
            Outcome::Applied { id } => match id {
                Some(id) => format!("{} {}", "applied".cyan(), id.dimmed()),
                None => "applied".cyan().to_string(),
            },
            Outcome::Rejected { error } => format!("{} {}", "rejected".red(), error),
            Outcome::Settled { id, detail } => {
                let mut line = "settled".green().to_string();
                if let Some(id) = id {
                    line.push_str(&format!(" {}", id.dimmed()));
                }
                if let Some(detail) = detail {
                    line.push_str(&format!(" ({detail})"));
                }
                line
            }
            Outcome::Failed { error } => format!("{} {}", "failed".red().bold(), error),
            Outcome::Done { detail } => detail.dimmed().to_string(),
        }
    }
}

impl Render for ReplayEvent {
    fn render(&self) -> String {
        let mut target = String::new();
        if let Some(session) = &self.session {
            target.push_str(&format!("@{session} "));
        }
        if let Some(key) = &self.key {
            target.push_str(key);
        }
        format!(
            "{:>3} {:<14} {:<20} {}",
            self.step.dimmed(),
            self.action.bold(),
            target.trim_end(),
            self.outcome.render()
        )
    }
}

impl Render for SessionView {
    fn render(&self) -> String {
        let mut lines = vec![format!("📅 {}", self.name.bold())];
        if self.calendar.is_empty() {
            lines.push("   No items".dimmed().to_string());
        }
        for entry in self.calendar.entries() {
            lines.push(format!("   {}", entry.render()));
        }
        lines.join("\n")
    }
}

/// "3 create, 1 update" style summary of the store call log.
fn summarize_calls(calls: &[StoreCall]) -> String {
    let kinds = [
        (CallKind::List, "list"),
        (CallKind::Create, "create"),
        (CallKind::Update, "update"),
        (CallKind::Delete, "delete"),
        (CallKind::Complete, "complete"),
    ];
    let parts: Vec<String> = kinds
        .iter()
        .filter_map(|(kind, label)| {
            let count = calls.iter().filter(|c| c.kind == *kind).count();
            (count > 0).then(|| format!("{count} {label}"))
        })
        .collect();
    if parts.is_empty() {
        "no calls".to_string()
    } else {
        parts.join(", ")
    }
}

impl Render for ReplayReport {
    fn render(&self) -> String {
        let mut lines = vec!["Steps".bold().to_string()];
        if self.events.is_empty() {
            lines.push("   No steps".dimmed().to_string());
        }
        lines.extend(self.events.iter().map(|e| e.render()));

        for session in &self.sessions {
            lines.push(String::new());
            lines.push(session.render());
        }

        lines.push(String::new());
        lines.push("Store".bold().to_string());
        lines.push(format!(
            "   {} {}, {}",
            self.records.len(),
            if self.records.len() == 1 { "record" } else { "records" },
            summarize_calls(&self.calls).dimmed()
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloomcal_core::{Category, ItemDraft, ItemId, ItemTime};

    fn call(kind: CallKind) -> StoreCall {
        StoreCall {
            kind,
            category: Category::PlainEvent,
            id: None,
            patch: None,
        }
    }

    #[test]
    fn test_summarize_calls() {
        assert_eq!(summarize_calls(&[]), "no calls");
        let calls = [
            call(CallKind::List),
            call(CallKind::Create),
            call(CallKind::Create),
            call(CallKind::Delete),
        ];
        assert_eq!(summarize_calls(&calls), "1 list, 2 create, 1 delete");
    }

    #[test]
    fn test_entry_render_mentions_title_and_id() {
        let item = ItemDraft::new(
            "Dentist",
            ItemTime::parse("2025-03-19").unwrap(),
            Category::PlainEvent,
        )
        .into_item()
        .with_id(ItemId::permanent("42"));
        let rendered = CacheEntry::synced(item).render();
        assert!(rendered.contains("Dentist"));
        assert!(rendered.contains("42"));
        assert!(rendered.contains("2025-03-19"));
    }
}
