//! # Task Optimizer Module
//!
//! Worker pool per un gruppo di risorse della stessa categoria.
//!
//! ## Concorrenza:
//! - Un `Semaphore` con `workers` permessi limita le risorse in elaborazione
//! - Le risorse oltre la soglia `exclusive` prendono tutti i permessi: nessun
//!   altro worker gira mentre vengono elaborate
//! - I task vivono in un `JoinSet`: se la run viene interrotta (timeout) il set
//!   viene droppato e i task rimasti abortiti
//! - L'attesa dei permessi e ogni task competono con `cancelled()` del token
//!
//! Gli esiti vengono riassociati alle risorse per indice, indipendentemente
//! dall'ordine di completamento.

use crate::cancel::CancellationToken;
use crate::classifier::ResourceSet;
use crate::config::Config;
use crate::error::OptimizeError;
use crate::font_processor::FontProcessor;
use crate::image_processor::ImageProcessor;
use crate::optimizer::progress_tracker::ProgressTracker;
use crate::resource::{Resource, ResourceCategory, ResourceKind, ResourceOutcome, SkipReason};
use crate::text_processor::TextProcessor;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Dispatches each resource to the processor of its kind
pub struct TaskOptimizer {
    config: Arc<Config>,
    images: ImageProcessor,
    text: TextProcessor,
    fonts: FontProcessor,
    workers: usize,
}

impl TaskOptimizer {
    pub fn new(
        config: Arc<Config>,
        images: ImageProcessor,
        text: TextProcessor,
        fonts: FontProcessor,
        workers: usize,
    ) -> Self {
        Self {
            config,
            images,
            text,
            fonts,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Optimize a single resource in place
    pub async fn process_resource(&self, resource: &Resource, cancel: &CancellationToken) -> ResourceOutcome {
        match resource.kind {
            ResourceKind::Image(format) => self.images.optimize(resource, format, cancel).await,
            ResourceKind::MarkupStyle(format) => self.text.optimize(resource, format, cancel).await,
            ResourceKind::Font(format) => self.fonts.optimize(resource, format, cancel).await,
            ResourceKind::Other => ResourceOutcome::skipped(SkipReason::Passthrough),
        }
    }

    /// Process every pending resource of `category`, at most `workers` at a time
    pub async fn run_group(
        self: &Arc<Self>,
        set: &mut ResourceSet,
        category: ResourceCategory,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(), OptimizeError> {
        let indices: Vec<usize> = set
            .indices(category)
            .into_iter()
            .filter(|&i| set.resources[i].outcome == ResourceOutcome::Unprocessed)
            .collect();
        if indices.is_empty() {
            return Ok(());
        }

        if category == ResourceCategory::Other {
            for index in indices {
                let resource = &mut set.resources[index];
                resource.outcome = ResourceOutcome::skipped(SkipReason::Passthrough);
                tracker.record(&resource.name, &resource.outcome);
            }
            return Ok(());
        }

        info!("Processing {} {} resources with {} workers", indices.len(), category, self.workers);
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<(usize, ResourceOutcome)> = JoinSet::new();
        let exclusive_threshold = self.config.thresholds.exclusive;

        for &index in &indices {
            let resource = set.resources[index].clone();
            let size = resource.size_or_zero();

            let acquire = if size > exclusive_threshold {
                info!("Large resource {} ({} bytes), processing exclusively", resource.name, size);
                semaphore.clone().acquire_many_owned(self.workers as u32)
            } else {
                semaphore.clone().acquire_many_owned(1)
            };
            let permits = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(crate::archive::cancelled_error().into()),
                acquired = acquire => acquired.map_err(|e| OptimizeError::ResourceProcessingFailed {
                    path: resource.name.clone(),
                    reason: e.to_string(),
                })?,
            };

            let worker = Arc::clone(self);
            let token = cancel.clone();
            let progress = tracker.clone();
            tasks.spawn(async move {
                let _permits = permits;
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => ResourceOutcome::failed("cancelled"),
                    outcome = worker.process_resource(&resource, &token) => outcome,
                };
                debug!("{} → {}", resource.name, outcome.label());
                progress.record(&resource.name, &outcome);
                (index, outcome)
            });
        }

        let mut outcomes: HashMap<usize, ResourceOutcome> = HashMap::with_capacity(indices.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    outcomes.insert(index, outcome);
                }
                Err(e) => error!("Worker task failed: {}", e),
            }
        }

        for index in indices {
            let resource = &mut set.resources[index];
            resource.outcome = outcomes
                .remove(&index)
                .unwrap_or_else(|| ResourceOutcome::failed("worker task aborted"));
            if matches!(resource.outcome, ResourceOutcome::Optimized { .. }) {
                resource.refresh();
            }
        }
        Ok(())
    }
}
