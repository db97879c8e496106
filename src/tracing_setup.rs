//! Tracing subscriber for the bloomcal binary.
//!
//! Priority, highest first:
//!
//! 1. `BLOOMCAL_LOG` (directives, e.g. `bloomcal_core=debug,warn`)
//! 2. `RUST_LOG`
//! 3. `-v` (debug) / `-q` (errors only)
//! 4. `warn`
//!
//! Logs go to stderr so `--json` output on stdout stays parseable.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const LOG_ENV: &str = "BLOOMCAL_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// `-v` wins over `-q` when both are given.
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_subscriber(verbosity: Verbosity) {
    let filter = build_env_filter(verbosity, std::env::var(LOG_ENV).ok());
    let use_ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(true)
        .with_level(true);

    if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.with_timer(fmt::time::uptime()))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.without_time().compact())
            .init();
    }
}

/// Unparseable directives fall through to the next source instead of failing.
fn build_env_filter(verbosity: Verbosity, project_directives: Option<String>) -> EnvFilter {
    if let Some(directives) = project_directives
        && let Ok(filter) = EnvFilter::try_new(&directives)
    {
        return filter;
    }

    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = verbosity.default_level();
    let directive = match verbosity {
        // The engine's own events are the interesting part of a replay.
        Verbosity::Verbose => format!("{level},bloomcal_core=debug,bloomcal=debug"),
        _ => level.to_string(),
    };

    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
