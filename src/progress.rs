//! # Progress Bar Module
//!
//! Feedback visuale con `indicatif` durante l'elaborazione dei gruppi di risorse.
//!
//! ## Componenti:
//! - `ProgressManager::new()`: barra con percentuale, tempo trascorso e messaggio
//! - `ProgressManager::hidden()`: nessun output (quiet, JSON, test)
//! - `ProgressManager::spinner()`: per fasi senza totale noto (estrazione, scrittura)
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:00:04] [========>-------------] 12/30 (40%) [OK] OEBPS/images/cover.jpg: 38.1% saved
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TICK: Duration = Duration::from_millis(100);

/// Manages progress reporting for one resource group
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    /// Create a new progress bar
    pub fn new(total: u64, prefix: &str) -> Self {
        let bar = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        bar.set_prefix(prefix.to_string());
        bar.enable_steady_tick(TICK);

        Self { bar }
    }

    /// A bar that draws nothing
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Update progress with a message
    pub fn update(&self, message: &str) {
        self.bar.inc(1);
        self.bar.set_message(message.to_string());
    }

    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Finish with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Create a spinner for indeterminate progress
    pub fn spinner(message: &str, visible: bool) -> ProgressBar {
        if !visible {
            return ProgressBar::hidden();
        }
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(TICK);
        spinner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_bar_counts() {
        let progress = ProgressManager::hidden();
        progress.update("one");
        progress.update("two");
        assert_eq!(progress.position(), 2);
        progress.finish("done");
    }
}
