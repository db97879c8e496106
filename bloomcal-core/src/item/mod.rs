//! Calendar item types shared by the cache, the stores and the feed.
//!
//! Two categories of record live on one calendar: plain scheduled events and
//! externally-managed bloom tasks. They share one shape and differ only in
//! which store owns them and whether they can be completed.

mod id;
mod time;

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use id::ItemId;
pub use time::ItemTime;

/// Which persistence boundary owns a record. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[serde(alias = "event")]
    PlainEvent,
    #[serde(alias = "bloom")]
    BloomTask,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::PlainEvent => write!(f, "event"),
            Category::BloomTask => write!(f, "bloom"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extended {
    #[serde(default)]
    pub description: String,
    /// Only ever moves false -> true, and only for bloom tasks.
    #[serde(default)]
    pub completed: bool,
}

/// Where an item sits on the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub start: ItemTime,
    pub end: Option<ItemTime>,
}

impl Position {
    pub fn new(start: ItemTime, end: Option<ItemTime>) -> Self {
        Position { start, end }
    }

    /// All-day iff the start is a date.
    pub fn all_day(&self) -> bool {
        self.start.is_date()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let Some(end) = &self.end else {
            return Ok(());
        };
        if self.start.is_date() {
            return Err(ValidationError::AllDayWithEnd);
        }
        match self.start.partial_cmp_same_kind(end) {
            None => Err(ValidationError::MixedTimeKinds),
            Some(Ordering::Greater) => Err(ValidationError::EndBeforeStart),
            Some(_) => Ok(()),
        }
    }
}

/// The unit of scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarItem {
    pub id: ItemId,
    pub title: String,
    pub start: ItemTime,
    pub end: Option<ItemTime>,
    pub all_day: bool,
    pub category: Category,
    #[serde(default)]
    pub extended: Extended,
}

impl CalendarItem {
    pub fn position(&self) -> Position {
        Position::new(self.start, self.end)
    }

    pub fn set_position(&mut self, position: Position) {
        self.start = position.start;
        self.end = position.end;
        self.all_day = position.all_day();
    }

    /// Same record content, ignoring identity.
    pub fn same_content(&self, other: &CalendarItem) -> bool {
        self.title == other.title
            && self.start == other.start
            && self.end == other.end
            && self.all_day == other.all_day
            && self.category == other.category
            && self.extended == other.extended
    }

    /// Copy of this item under a different id.
    pub fn with_id(&self, id: ItemId) -> CalendarItem {
        CalendarItem {
            id,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        if self.all_day != self.start.is_date() {
            return Err(ValidationError::MixedTimeKinds);
        }
        self.position().validate()
    }

    pub fn apply_patch(&mut self, patch: &ItemPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(start) = patch.start {
            self.start = start;
        }
        if let Some(end) = patch.end {
            self.end = end;
        }
        if let Some(all_day) = patch.all_day {
            self.all_day = all_day;
        }
        if let Some(description) = &patch.description {
            self.extended.description = description.clone();
        }
    }
}

impl fmt::Display for CalendarItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.id, self.category, self.title)
    }
}

pub(crate) fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    Ok(())
}

/// Input to a create operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub title: String,
    pub start: ItemTime,
    #[serde(default)]
    pub end: Option<ItemTime>,
    pub category: Category,
    #[serde(default)]
    pub description: String,
}

impl ItemDraft {
    pub fn new(title: impl Into<String>, start: ItemTime, category: Category) -> Self {
        ItemDraft {
            title: title.into(),
            start,
            end: None,
            category,
            description: String::new(),
        }
    }

    pub fn ending(mut self, end: ItemTime) -> Self {
        self.end = Some(end);
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        Position::new(self.start, self.end).validate()
    }

    /// Build the optimistic item under a fresh ephemeral id.
    pub fn into_item(self) -> CalendarItem {
        let all_day = self.start.is_date();
        CalendarItem {
            id: ItemId::ephemeral(),
            title: self.title,
            start: self.start,
            end: self.end,
            all_day,
            category: self.category,
            extended: Extended {
                description: self.description,
                completed: false,
            },
        }
    }
}

/// Partial fields sent to a store's `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<ItemTime>,
    /// `Some(None)` clears the end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<Option<ItemTime>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_day: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ItemPatch {
    pub fn position(position: Position) -> Self {
        ItemPatch {
            start: Some(position.start),
            end: Some(position.end),
            all_day: Some(position.all_day()),
            ..Default::default()
        }
    }

    pub fn details(details: &DetailsEdit) -> Self {
        ItemPatch {
            title: details.title.clone(),
            description: details.description.clone(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ItemPatch::default()
    }
}

/// A content edit: any field left `None` is unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsEdit {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DetailsEdit {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.title {
            Some(title) => validate_title(title),
            None => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }

    /// The current values of the fields this edit touches.
    pub fn capture(&self, item: &CalendarItem) -> DetailsEdit {
        DetailsEdit {
            title: self.title.as_ref().map(|_| item.title.clone()),
            description: self
                .description
                .as_ref()
                .map(|_| item.extended.description.clone()),
        }
    }

    pub fn apply(&self, item: &mut CalendarItem) {
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        if let Some(description) = &self.description {
            item.extended.description = description.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> ItemTime {
        ItemTime::parse(s).unwrap()
    }

    #[test]
    fn test_draft_validation() {
        let ok = ItemDraft::new("Buy groceries", t("2025-03-20T10:00"), Category::PlainEvent)
            .ending(t("2025-03-20T11:00"));
        assert!(ok.validate().is_ok());

        let blank = ItemDraft::new("   ", t("2025-03-20T10:00"), Category::PlainEvent);
        assert_eq!(blank.validate(), Err(ValidationError::EmptyTitle));

        let backwards = ItemDraft::new("x", t("2025-03-20T10:00"), Category::PlainEvent)
            .ending(t("2025-03-20T09:00"));
        assert_eq!(backwards.validate(), Err(ValidationError::EndBeforeStart));

        let all_day_end = ItemDraft::new("x", t("2025-03-20"), Category::BloomTask)
            .ending(t("2025-03-21"));
        assert_eq!(all_day_end.validate(), Err(ValidationError::AllDayWithEnd));

        let mixed = ItemDraft::new("x", t("2025-03-20T10:00"), Category::PlainEvent)
            .ending(t("2025-03-21"));
        assert_eq!(mixed.validate(), Err(ValidationError::MixedTimeKinds));
    }

    #[test]
    fn test_into_item_derives_all_day_and_ephemeral_id() {
        let item = ItemDraft::new("Stretch", t("2025-03-20"), Category::BloomTask).into_item();
        assert!(item.all_day);
        assert!(item.end.is_none());
        assert!(item.id.is_ephemeral());
        assert!(!item.extended.completed);
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_set_position_switches_all_day() {
        let mut item = ItemDraft::new("Run", t("2025-03-20T07:00"), Category::PlainEvent)
            .ending(t("2025-03-20T08:00"))
            .into_item();
        item.set_position(Position::new(t("2025-03-21"), None));
        assert!(item.all_day);
        assert!(item.end.is_none());
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_position_patch_clears_end() {
        let mut item = ItemDraft::new("Run", t("2025-03-20T07:00"), Category::PlainEvent)
            .ending(t("2025-03-20T08:00"))
            .into_item();
        let patch = ItemPatch::position(Position::new(t("2025-03-22"), None));
        item.apply_patch(&patch);
        assert_eq!(item.end, None);
        assert!(item.all_day);
        assert_eq!(item.start, t("2025-03-22"));
    }

    #[test]
    fn test_details_capture_only_touched_fields() {
        let item = ItemDraft::new("Read", t("2025-03-20"), Category::BloomTask)
            .described("chapter 3")
            .into_item();
        let edit = DetailsEdit {
            title: Some("Read more".into()),
            description: None,
        };
        let before = edit.capture(&item);
        assert_eq!(before.title.as_deref(), Some("Read"));
        assert_eq!(before.description, None);

        let mut edited = item.clone();
        edit.apply(&mut edited);
        before.apply(&mut edited);
        assert_eq!(edited, item);
    }

    #[test]
    fn test_patch_serializes_only_set_fields() {
        let patch = ItemPatch {
            title: Some("New".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "title": "New" }));
    }
}
