//! Terminal progress for update sessions.
//!
//! A spinner is shown while checking, verifying, backing up and applying; a byte
//! bar while the artifact downloads. Progress output is hidden when the CLI runs
//! with `--no-progress`, when `ARCPRESS_NO_PROGRESS` is set, or when stderr is
//! not a terminal.

use indicatif::{ProgressBar as IndicatifBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Environment variable disabling progress output.
pub const NO_PROGRESS_ENV: &str = "ARCPRESS_NO_PROGRESS";

fn is_progress_disabled() -> bool {
    std::env::var_os(NO_PROGRESS_ENV).is_some() || !std::io::stderr().is_terminal()
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold} {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"])
}

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸━")
}

/// One progress line that switches between a spinner and a download bar.
#[derive(Clone)]
pub struct SessionProgress {
    bar: IndicatifBar,
    enabled: bool,
    downloading: Arc<AtomicBool>,
}

impl SessionProgress {
    /// `enabled = false` draws nothing; the environment can disable it too.
    pub fn new(enabled: bool) -> Self {
        let enabled = enabled && !is_progress_disabled();
        let bar = IndicatifBar::new_spinner();
        if enabled {
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(100));
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self {
            bar,
            enabled,
            downloading: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Show a spinner with `msg`.
    pub fn stage(&self, msg: impl Into<String>) {
        if self.downloading.swap(false, Ordering::Relaxed) {
            self.bar.set_style(spinner_style());
        }
        self.bar.set_prefix("");
        self.bar.set_message(msg.into());
    }

    /// Switch to the byte bar and show `received` of `total`.
    pub fn download(&self, received: u64, total: Option<u64>) {
        if !self.downloading.swap(true, Ordering::Relaxed) {
            self.bar.set_style(download_style());
            self.bar.set_prefix("Downloading");
        }
        // Without a known size the bar tracks what arrived so far.
        self.bar.set_length(total.unwrap_or(received).max(received));
        self.bar.set_position(received);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
