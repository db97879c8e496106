use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Start or end of a calendar item: a UTC timestamp, or a date for all-day items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemTime {
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
}

impl ItemTime {
    pub fn is_date(&self) -> bool {
        matches!(self, ItemTime::Date(_))
    }

    /// The instant this time starts at (midnight UTC for dates).
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            ItemTime::DateTime(dt) => *dt,
            ItemTime::Date(d) => d.and_time(chrono::NaiveTime::MIN).and_utc(),
        }
    }

    /// Compare two times of the same kind; `None` when kinds differ.
    pub fn partial_cmp_same_kind(&self, other: &ItemTime) -> Option<Ordering> {
        match (self, other) {
            (ItemTime::DateTime(a), ItemTime::DateTime(b)) => Some(a.cmp(b)),
            (ItemTime::Date(a), ItemTime::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Parse `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM` (UTC) or a full RFC 3339 timestamp.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(ItemTime::Date(d));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(ItemTime::DateTime(dt.with_timezone(&Utc)));
        }
        for fmt in ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(ItemTime::DateTime(naive.and_utc()));
            }
        }
        Err(format!(
            "Invalid time '{}'. Expected YYYY-MM-DD or YYYY-MM-DDTHH:MM",
            s
        ))
    }
}

impl fmt::Display for ItemTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemTime::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M")),
            ItemTime::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_date_and_datetime() {
        assert_eq!(
            ItemTime::parse("2025-03-20").unwrap(),
            ItemTime::Date(NaiveDate::from_ymd_opt(2025, 3, 20).unwrap())
        );
        assert_eq!(
            ItemTime::parse("2025-03-20T15:00").unwrap(),
            ItemTime::DateTime(Utc.with_ymd_and_hms(2025, 3, 20, 15, 0, 0).unwrap())
        );
        assert_eq!(
            ItemTime::parse("2025-03-20T15:00:00+01:00").unwrap(),
            ItemTime::DateTime(Utc.with_ymd_and_hms(2025, 3, 20, 14, 0, 0).unwrap())
        );
        assert!(ItemTime::parse("next tuesday").is_err());
    }

    #[test]
    fn test_compare_only_same_kind() {
        let a = ItemTime::parse("2025-03-20").unwrap();
        let b = ItemTime::parse("2025-03-21").unwrap();
        let c = ItemTime::parse("2025-03-20T10:00").unwrap();
        assert_eq!(a.partial_cmp_same_kind(&b), Some(Ordering::Less));
        assert_eq!(a.partial_cmp_same_kind(&c), None);
    }
}
