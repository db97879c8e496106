use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Spinner showing which replay step is running.
pub struct StepProgress {
    bar: ProgressBar,
    label: String,
    total: usize,
}

impl StepProgress {
    pub fn new(label: String, total: usize) -> Self {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .tick_strings(&["-", "\\", "|", "/", " "])
            .template("{msg} {spinner}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_message(label.clone());
        bar.enable_steady_tick(Duration::from_millis(80));
        StepProgress { bar, label, total }
    }

    /// For `--json` runs and tests.
    pub fn hidden() -> Self {
        StepProgress {
            bar: ProgressBar::hidden(),
            label: String::new(),
            total: 0,
        }
    }

    pub fn step(&self, n: usize, action: &str) {
        self.bar
            .set_message(format!("{} [{n}/{}] {action}", self.label, self.total));
    }

    pub fn settling(&self, in_flight: usize) {
        self.bar
            .set_message(format!("{} waiting on {in_flight} pending", self.label));
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
