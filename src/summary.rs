//! # Run Summary Module
//!
//! Risultato finale di una run, costruito incrementalmente dall'orchestratore
//! e immutabile una volta restituito.
//!
//! ## Contenuto:
//! - Esito (`success`) e motivo di fallimento (`FailureReason`)
//! - Dimensioni input/output, byte risparmiati (negativi se l'output cresce), tempo trascorso
//! - Conteggi per esito e statistiche per categoria
//! - Un `ResourceReport` per ogni risorsa, in ordine di nome

use crate::error::{FailureReason, OptimizeError};
use crate::file_manager::FileManager;
use crate::resource::{Resource, ResourceCategory, ResourceOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Statistiche per categoria di risorsa
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub resources: usize,
    pub optimized: usize,
    pub skipped: usize,
    pub deduplicated: usize,
    pub failed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CategoryStats {
    pub fn add(&mut self, report: &ResourceReport) {
        self.resources += 1;
        self.bytes_before += report.original_size;
        self.bytes_after += report.final_size;
        match report.outcome {
            ResourceOutcome::Optimized { .. } => self.optimized += 1,
            ResourceOutcome::Deduplicated { .. } => self.deduplicated += 1,
            ResourceOutcome::Failed { .. } => self.failed += 1,
            ResourceOutcome::Skipped { .. } | ResourceOutcome::Unprocessed => self.skipped += 1,
        }
    }

    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub name: String,
    pub category: ResourceCategory,
    pub original_size: u64,
    /// Bytes this entry contributes to the output payload (0 for duplicates)
    pub final_size: u64,
    pub outcome: ResourceOutcome,
}

impl ResourceReport {
    pub fn from_resource(resource: &Resource, original_size: u64) -> Self {
        let final_size = match resource.outcome {
            ResourceOutcome::Optimized { optimized_size, .. } => optimized_size,
            ResourceOutcome::Deduplicated { .. } => 0,
            _ => original_size,
        };
        Self {
            name: resource.name.clone(),
            category: resource.kind.category(),
            original_size,
            final_size,
            outcome: resource.outcome.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub success: bool,
    pub dry_run: bool,
    pub input_size: u64,
    pub output_size: u64,
    pub bytes_saved: i64,
    pub elapsed_seconds: f64,
    pub failure: Option<FailureReason>,
    pub message: Option<String>,
    pub optimized: usize,
    pub skipped: usize,
    pub deduplicated: usize,
    pub failed: usize,
    /// Archive entries dropped on extraction (unsafe or unreadable)
    pub entries_skipped: usize,
    pub categories: BTreeMap<ResourceCategory, CategoryStats>,
    pub resources: Vec<ResourceReport>,
}

impl RunSummary {
    /// Summary of a run that ended with a run-level error
    pub fn from_error(error: &OptimizeError, input_size: u64, elapsed: Duration, dry_run: bool) -> Self {
        Self {
            success: false,
            dry_run,
            input_size,
            output_size: 0,
            bytes_saved: 0,
            elapsed_seconds: elapsed.as_secs_f64(),
            failure: Some(error.reason()),
            message: Some(error.to_string()),
            optimized: 0,
            skipped: 0,
            deduplicated: 0,
            failed: 0,
            entries_skipped: 0,
            categories: BTreeMap::new(),
            resources: Vec::new(),
        }
    }

    pub fn reduction_percent(&self) -> f64 {
        FileManager::calculate_reduction(self.input_size, self.output_size)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceReport> {
        self.resources
            .iter()
            .filter(|r| matches!(r.outcome, ResourceOutcome::Failed { .. }))
    }

    pub fn format_summary(&self) -> String {
        if !self.success {
            return format!(
                "Failed ({}): {}",
                self.failure.map(|r| r.as_str()).unwrap_or("processing_error"),
                self.message.as_deref().unwrap_or("unknown error")
            );
        }
        format!(
            "{}Optimized: {} | Skipped: {} | Deduplicated: {} | Failed: {} | {} → {} ({:.2}% saved) in {:.1}s",
            if self.dry_run { "[DRY RUN] " } else { "" },
            self.optimized,
            self.skipped,
            self.deduplicated,
            self.failed,
            FileManager::format_size(self.input_size),
            FileManager::format_size(self.output_size),
            self.reduction_percent(),
            self.elapsed_seconds
        )
    }
}

/// Accumulates per-resource results while the run progresses
#[derive(Debug)]
pub struct SummaryBuilder {
    start: Instant,
    input_size: u64,
    dry_run: bool,
    entries_skipped: usize,
    original_sizes: BTreeMap<String, u64>,
}

impl SummaryBuilder {
    pub fn new(start: Instant, input_size: u64, dry_run: bool) -> Self {
        Self {
            start,
            input_size,
            dry_run,
            entries_skipped: 0,
            original_sizes: BTreeMap::new(),
        }
    }

    pub fn entries_skipped(&mut self, count: usize) {
        self.entries_skipped = count;
    }

    /// Remember sizes before any resource is rewritten
    pub fn record_original_sizes(&mut self, resources: &[Resource]) {
        for resource in resources {
            self.original_sizes
                .entry(resource.name.clone())
                .or_insert_with(|| resource.size_or_zero());
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self, resources: &[Resource], output_size: u64) -> RunSummary {
        let mut summary = RunSummary {
            success: true,
            dry_run: self.dry_run,
            input_size: self.input_size,
            output_size,
            bytes_saved: self.input_size as i64 - output_size as i64,
            elapsed_seconds: self.start.elapsed().as_secs_f64(),
            failure: None,
            message: None,
            optimized: 0,
            skipped: 0,
            deduplicated: 0,
            failed: 0,
            entries_skipped: self.entries_skipped,
            categories: BTreeMap::new(),
            resources: Vec::with_capacity(resources.len()),
        };

        for resource in resources {
            let original = self
                .original_sizes
                .get(&resource.name)
                .copied()
                .unwrap_or_else(|| resource.size_or_zero());
            let report = ResourceReport::from_resource(resource, original);
            match report.outcome {
                ResourceOutcome::Optimized { .. } => summary.optimized += 1,
                ResourceOutcome::Deduplicated { .. } => summary.deduplicated += 1,
                ResourceOutcome::Failed { .. } => summary.failed += 1,
                ResourceOutcome::Skipped { .. } | ResourceOutcome::Unprocessed => summary.skipped += 1,
            }
            summary.categories.entry(report.category).or_default().add(&report);
            summary.resources.push(report);
        }
        summary
    }
}
