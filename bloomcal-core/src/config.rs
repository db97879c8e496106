//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_DEBOUNCE_QUIET_PERIOD, DEFAULT_FEED_BUFFER, DEFAULT_PROMPT_LEDGER_CAPACITY,
    DEFAULT_RETIRED_CAPACITY, DEFAULT_UNDO_WINDOW,
};
use crate::error::{SyncError, SyncResult};

fn default_debounce() -> Duration {
    DEFAULT_DEBOUNCE_QUIET_PERIOD
}

fn default_undo_window() -> Duration {
    DEFAULT_UNDO_WINDOW
}

fn default_prompt_ledger_capacity() -> usize {
    DEFAULT_PROMPT_LEDGER_CAPACITY
}

fn default_retired_capacity() -> usize {
    DEFAULT_RETIRED_CAPACITY
}

fn default_feed_buffer() -> usize {
    DEFAULT_FEED_BUFFER
}

/// Configuration at ~/.config/bloomcal/config.toml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_debounce", with = "human_duration")]
    pub debounce_quiet_period: Duration,

    #[serde(default = "default_undo_window", with = "human_duration")]
    pub undo_window: Duration,

    #[serde(default = "default_prompt_ledger_capacity")]
    pub prompt_ledger_capacity: usize,

    #[serde(default = "default_retired_capacity")]
    pub retired_capacity: usize,

    #[serde(default = "default_feed_buffer")]
    pub feed_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            debounce_quiet_period: default_debounce(),
            undo_window: default_undo_window(),
            prompt_ledger_capacity: default_prompt_ledger_capacity(),
            retired_capacity: default_retired_capacity(),
            feed_buffer: default_feed_buffer(),
        }
    }
}

impl SyncConfig {
    pub fn config_path() -> SyncResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SyncError::Config("Could not determine config directory".into()))?
            .join("bloomcal");

        Ok(config_dir.join("config.toml"))
    }

    /// Load from the default location. A missing file means defaults.
    pub fn load() -> SyncResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> SyncResult<Self> {
        if !path.exists() {
            return Ok(SyncConfig::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> SyncResult<Self> {
        let config: SyncConfig =
            toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> SyncResult<()> {
        if self.undo_window.is_zero() {
            return Err(SyncError::Config("undo_window must be greater than zero".into()));
        }
        if self.feed_buffer == 0 {
            return Err(SyncError::Config("feed_buffer must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> SyncResult<String> {
        toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &Path) -> SyncResult<()> {
        let contents = format!(
            "\
# bloomcal configuration

# Quiet period before a drag/resize burst is saved:
# debounce_quiet_period = \"{}\"

# How long a deleted item can be restored:
# undo_window = \"{}\"

# Completed items remembered so a celebration shows once:
# prompt_ledger_capacity = {}

# Deleted ids remembered so the change feed cannot bring them back:
# retired_capacity = {}

# Change feed notifications buffered per session:
# feed_buffer = {}
",
            humantime::format_duration(DEFAULT_DEBOUNCE_QUIET_PERIOD),
            humantime::format_duration(DEFAULT_UNDO_WINDOW),
            DEFAULT_PROMPT_LEDGER_CAPACITY,
            DEFAULT_RETIRED_CAPACITY,
            DEFAULT_FEED_BUFFER,
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| SyncError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }
}

/// Durations as humantime strings ("300ms", "6s").
mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = SyncConfig::parse("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.debounce_quiet_period, Duration::from_millis(300));
        assert_eq!(config.undo_window, Duration::from_secs(6));
    }

    #[test]
    fn test_parse_human_durations() {
        let config = SyncConfig::parse(
            r#"
debounce_quiet_period = "150ms"
undo_window = "10s"
feed_buffer = 16
"#,
        )
        .unwrap();
        assert_eq!(config.debounce_quiet_period, Duration::from_millis(150));
        assert_eq!(config.undo_window, Duration::from_secs(10));
        assert_eq!(config.feed_buffer, 16);
        assert_eq!(config.retired_capacity, DEFAULT_RETIRED_CAPACITY);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(SyncConfig::parse("undo_window = \"soon\"").is_err());
        assert!(SyncConfig::parse("undo_window = \"0s\"").is_err());
        assert!(SyncConfig::parse("feed_buffer = 0").is_err());
    }

    #[test]
    fn test_default_template_parses_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        SyncConfig::create_default_config(&path).unwrap();
        assert_eq!(SyncConfig::load_from(&path).unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_toml_roundtrip_keeps_durations_readable() {
        let toml = SyncConfig::default().to_toml().unwrap();
        assert!(toml.contains("debounce_quiet_period = \"300ms\""));
        assert!(toml.contains("undo_window = \"6s\""));
    }
}
