use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const EPHEMERAL_PREFIX: &str = "tmp-";

/// Identity of a calendar item.
///
/// Ephemeral ids are minted locally before the store has acknowledged the
/// item; permanent ids are assigned by the store on first successful create.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemId {
    Ephemeral(Uuid),
    Permanent(String),
}

impl ItemId {
    pub fn ephemeral() -> Self {
        ItemId::Ephemeral(Uuid::new_v4())
    }

    pub fn permanent(id: impl Into<String>) -> Self {
        ItemId::Permanent(id.into())
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ItemId::Ephemeral(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ItemId::Permanent(_))
    }

    /// Parse the display form back into an id (`tmp-<uuid>` is ephemeral).
    pub fn parse(s: &str) -> Self {
        s.strip_prefix(EPHEMERAL_PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map(ItemId::Ephemeral)
            .unwrap_or_else(|| ItemId::Permanent(s.to_string()))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Ephemeral(uuid) => write!(f, "{EPHEMERAL_PREFIX}{uuid}"),
            ItemId::Permanent(id) => write!(f, "{id}"),
        }
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_ids_are_unique() {
        assert_ne!(ItemId::ephemeral(), ItemId::ephemeral());
    }

    #[test]
    fn test_display_parse_preserves_kind() {
        let eph = ItemId::ephemeral();
        assert!(eph.to_string().starts_with("tmp-"));
        assert_eq!(ItemId::parse(&eph.to_string()), eph);
        assert_eq!(ItemId::parse("42"), ItemId::permanent("42"));
        // Not a uuid after the prefix, so the store owns it.
        assert!(ItemId::parse("tmp-1").is_permanent());
    }
}
