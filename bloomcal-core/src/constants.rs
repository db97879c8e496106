use std::time::Duration;

/// Quiet period before a burst of drag/resize edits is persisted.
pub const DEFAULT_DEBOUNCE_QUIET_PERIOD: Duration = Duration::from_millis(300);

/// How long a deleted item stays restorable.
pub const DEFAULT_UNDO_WINDOW: Duration = Duration::from_secs(6);

/// Completed-item ids remembered so a celebration is shown only once.
pub const DEFAULT_PROMPT_LEDGER_CAPACITY: usize = 256;

/// Locally-deleted permanent ids remembered so the feed cannot resurrect them.
pub const DEFAULT_RETIRED_CAPACITY: usize = 1024;

/// Buffered notifications per feed subscriber before it lags.
pub const DEFAULT_FEED_BUFFER: usize = 256;
