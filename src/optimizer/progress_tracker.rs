//! # Progress Tracking Module
//!
//! Tracker thread-safe condiviso dai worker di un gruppo di risorse.
//! Gestisce sia la progress bar che gli eventi JSON.

use crate::json_output::JsonMessage;
use crate::progress::ProgressManager;
use crate::resource::{ResourceCategory, ResourceOutcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    current: AtomicUsize,
    optimized: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Clone)]
pub struct ProgressTracker {
    pub category: ResourceCategory,
    pub total: usize,
    json_output: bool,
    counters: Arc<Counters>,
    progress: ProgressManager,
}

impl ProgressTracker {
    pub fn new(category: ResourceCategory, total: usize, show_bar: bool, json_output: bool) -> Self {
        let progress = if show_bar && !json_output {
            ProgressManager::new(total as u64, &category.to_string())
        } else {
            ProgressManager::hidden()
        };
        Self {
            category,
            total,
            json_output,
            counters: Arc::new(Counters::default()),
            progress,
        }
    }

    pub fn hidden(category: ResourceCategory, total: usize) -> Self {
        Self::new(category, total, false, false)
    }

    /// Record one finished resource
    pub fn record(&self, name: &str, outcome: &ResourceOutcome) {
        let current = self.counters.current.fetch_add(1, Ordering::SeqCst) + 1;

        let message = match outcome {
            ResourceOutcome::Optimized {
                original_size,
                optimized_size,
                ..
            } => {
                self.counters.optimized.fetch_add(1, Ordering::SeqCst);
                let saved = crate::file_manager::FileManager::calculate_reduction(*original_size, *optimized_size);
                format!("[OK] {}: {:.1}% saved", name, saved)
            }
            ResourceOutcome::Failed { reason } => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                format!("[ERROR] {}: {}", name, reason)
            }
            ResourceOutcome::Deduplicated { canonical } => {
                self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                format!("[DUP] {} → {}", name, canonical)
            }
            ResourceOutcome::Skipped { .. } | ResourceOutcome::Unprocessed => {
                self.counters.skipped.fetch_add(1, Ordering::SeqCst);
                format!("[SKIP] {}", name)
            }
        };
        self.progress.update(&message);

        if self.json_output {
            JsonMessage::resource_complete(name, outcome).emit();
            JsonMessage::progress(self.category, current, self.total).emit();
        }
    }

    pub fn finish(&self) {
        self.progress.finish(&format!(
            "{}: {} optimized, {} skipped, {} failed",
            self.category,
            self.optimized(),
            self.counters.skipped.load(Ordering::SeqCst),
            self.failed()
        ));
    }

    pub fn completed(&self) -> usize {
        self.counters.current.load(Ordering::SeqCst)
    }

    pub fn optimized(&self) -> usize {
        self.counters.optimized.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.counters.failed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SkipReason;

    #[test]
    fn test_record_counts_across_clones() {
        let tracker = ProgressTracker::hidden(ResourceCategory::Image, 3);
        let clone = tracker.clone();

        tracker.record(
            "a.png",
            &ResourceOutcome::Optimized {
                original_size: 100,
                optimized_size: 50,
                method: "png lossless".into(),
            },
        );
        clone.record("b.png", &ResourceOutcome::skipped(SkipReason::NoGain));
        clone.record("c.png", &ResourceOutcome::failed("boom"));

        assert_eq!(tracker.completed(), 3);
        assert_eq!(tracker.optimized(), 1);
        assert_eq!(tracker.failed(), 1);
        tracker.finish();
    }
}
