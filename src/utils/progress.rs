//! Terminal progress bars for the CLI.
//!
//! [`TerminalProgress`] renders engine [`ProgressEvent`]s with `indicatif`. A
//! step with a known size gets a byte bar; an unknown size shows a spinner with
//! the byte count. Set `UPDATER_NO_PROGRESS` to hide all bars, which keeps
//! output clean in CI and scripted runs.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

use crate::upgrade::progress::{ProgressEvent, ProgressSink};

/// Environment variable that disables progress rendering.
pub const NO_PROGRESS_ENV: &str = "UPDATER_NO_PROGRESS";

fn is_progress_disabled() -> bool {
    std::env::var_os(NO_PROGRESS_ENV).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarMode {
    Bytes(u64),
    Spinner,
}

/// Progress sink drawing to the terminal.
pub struct TerminalProgress {
    bar: ProgressBar,
    mode: Mutex<Option<BarMode>>,
}

impl TerminalProgress {
    /// Creates a bar labelled with `prefix`, hidden when progress is disabled.
    pub fn new(prefix: impl Into<String>) -> Self {
        let bar = if is_progress_disabled() {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        bar.set_prefix(prefix.into());
        Self {
            bar,
            mode: Mutex::new(None),
        }
    }

    /// Creates a bar that never draws.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            mode: Mutex::new(None),
        }
    }

    /// Changes the label, for example between download and extraction.
    pub fn set_prefix(&self, prefix: impl Into<String>) {
        self.bar.set_prefix(prefix.into());
    }

    /// Removes the bar from the terminal.
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }

    fn switch_mode(&self, wanted: BarMode) {
        let Ok(mut mode) = self.mode.lock() else {
            return;
        };
        if *mode == Some(wanted) {
            return;
        }

        match wanted {
            BarMode::Bytes(total) => {
                self.bar.disable_steady_tick();
                self.bar.set_length(total);
                self.bar.set_style(download_style());
            }
            BarMode::Spinner => {
                self.bar.set_style(spinner_style());
                self.bar.enable_steady_tick(Duration::from_millis(100));
            }
        }
        *mode = Some(wanted);
    }
}

impl ProgressSink for TerminalProgress {
    fn on_progress(&self, event: ProgressEvent) {
        match event.bytes_total {
            Some(total) => self.switch_mode(BarMode::Bytes(total)),
            None => self.switch_mode(BarMode::Spinner),
        }
        self.bar.set_position(event.bytes_done);
    }
}

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸━")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} {spinner:.cyan} {bytes}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
}
