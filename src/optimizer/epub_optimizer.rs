//! # EPUB Optimizer Main Orchestrator
//!
//! Coordina le fasi della pipeline in ordine stretto:
//! Archive Reader → Classifier → Deduplicator → Resource Optimizer → Archive Writer.
//!
//! ## Responsabilità:
//! - Guardie sull'input (`max_input_size`) prima di leggere qualsiasi entry
//! - Working directory creata all'inizio e rimossa su ogni percorso d'uscita (`TempDir`)
//! - Budget wall-clock per l'intera run: allo scadere la run viene cancellata e
//!   un eventuale output già pubblicato viene rimosso
//! - Gruppi di risorse elaborati in sequenza (markup/stili, immagini, font, altro)
//! - Controllo strutturale dell'output e guardia sulla dimensione finale
//! - Costruzione del `RunSummary`
//!
//! ## Dry run:
//! Estrazione, classificazione e fingerprint soltanto; i risparmi vengono stimati
//! e la destinazione non viene mai scritta.

use crate::archive::{
    extract_archive, plan_entries, validate_structure, write_archive, ExtractOptions, StructureReport, WriteOptions,
};
use crate::cancel::CancellationToken;
use crate::classifier::{Classifier, ResourceSet};
use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::error::OptimizeError;
use crate::file_manager::FileManager;
use crate::fingerprint::FingerprintSettings;
use crate::font_processor::FontProcessor;
use crate::image_processor::ImageProcessor;
use crate::optimizer::encoder::Encoder;
use crate::optimizer::progress_tracker::ProgressTracker;
use crate::optimizer::task_optimizer::TaskOptimizer;
use crate::progress::ProgressManager;
use crate::resource::{ResourceCategory, ResourceKind};
use crate::state::RunState;
use crate::summary::{RunSummary, SummaryBuilder};
use crate::text_processor::TextProcessor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

/// Order in which resource groups are processed
const GROUP_ORDER: [ResourceCategory; 4] = [
    ResourceCategory::MarkupStyle,
    ResourceCategory::Image,
    ResourceCategory::Font,
    ResourceCategory::Other,
];

/// Expected gains used by the dry-run estimate
const ESTIMATE_IMAGE: f64 = 0.25;
const ESTIMATE_MARKUP: f64 = 0.15;
const ESTIMATE_FONT: f64 = 0.30;

pub struct EpubOptimizer {
    config: Arc<Config>,
    encoder: Arc<dyn Encoder>,
}

impl EpubOptimizer {
    pub fn new(config: Config, encoder: Arc<dyn Encoder>) -> Self {
        Self {
            config: Arc::new(config),
            encoder,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Like `optimize`, but run-level failures are folded into the summary
    pub async fn run(&self, source: &Path, dest: &Path) -> RunSummary {
        let start = Instant::now();
        match self.optimize(source, dest).await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Optimization of {} failed: {}", source.display(), e);
                let input_size = std::fs::metadata(source).map(|m| m.len()).unwrap_or(0);
                RunSummary::from_error(&e, input_size, start.elapsed(), self.config.dry_run)
            }
        }
    }

    /// Optimize `source` into `dest`
    pub async fn optimize(&self, source: &Path, dest: &Path) -> Result<RunSummary, OptimizeError> {
        let start = Instant::now();
        let input_size = tokio::fs::metadata(source)
            .await
            .map_err(|e| OptimizeError::unreadable(source, e))?
            .len();

        if let Some(limit) = self.config.max_input_size {
            if input_size > limit {
                return Err(OptimizeError::TooLarge {
                    size: input_size,
                    limit,
                });
            }
        }

        info!(
            "Optimizing {} ({}) → {}",
            source.display(),
            FileManager::format_size(input_size),
            dest.display()
        );

        let cancel = CancellationToken::new();
        let budget = self.config.timeout();
        match tokio::time::timeout(budget, self.pipeline(source, dest, input_size, start, &cancel)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Time budget of {:?} exceeded, cancelling", budget);
                if cancel.cancel() {
                    if let Err(e) = tokio::fs::remove_file(dest).await {
                        warn!("Could not remove {}: {}", dest.display(), e);
                    }
                }
                Err(OptimizeError::Timeout(budget))
            }
        }
    }

    async fn pipeline(
        &self,
        source: &Path,
        dest: &Path,
        input_size: u64,
        start: Instant,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, OptimizeError> {
        let config = &self.config;
        let mut summary = SummaryBuilder::new(start, input_size, config.dry_run);
        let show_progress = !config.quiet && !config.json_output;

        let work = self.work_dir()?;
        let content = work.path().join("content");
        let scratch = work.path().join("scratch");
        tokio::fs::create_dir_all(&scratch).await?;
        debug!("Working directory: {}", work.path().display());

        let source_structure = {
            let source = source.to_path_buf();
            blocking(move || validate_structure(&source)).await?
        };
        if !source_structure.is_valid() {
            warn!(
                "{} is not a well-formed EPUB: {}",
                source.display(),
                source_structure.problems().join(", ")
            );
        }

        let spinner = ProgressManager::spinner("Extracting...", show_progress);
        let extracted = {
            let (source, content, token) = (source.to_path_buf(), content.clone(), cancel.clone());
            let options = ExtractOptions {
                stream_threshold: config.thresholds.archive_stream,
            };
            blocking(move || extract_archive(&source, &content, &options, &token)).await??
        };
        spinner.finish_and_clear();
        for skipped in &extracted.skipped {
            warn!("Skipped entry {}: {}", skipped.name, skipped.reason);
        }
        summary.entries_skipped(extracted.skipped.len());
        info!(
            "Extracted {} entries ({})",
            extracted.entries.len(),
            FileManager::format_size(extracted.total_bytes())
        );

        let mut set = {
            let root = content.clone();
            blocking(move || Classifier::classify(&root)).await?.map_err(|e| {
                OptimizeError::ResourceProcessingFailed {
                    path: content.display().to_string(),
                    reason: format!("{:#}", e),
                }
            })?
        };
        summary.record_original_sizes(&set.resources);
        for (category, count) in set.counts() {
            info!("  {}: {} resources", category, count);
        }

        let workers = config.effective_workers();
        let dedup = Deduplicator::new(FingerprintSettings::from(config.as_ref()), workers)
            .run(&mut set, cancel)
            .await?;
        if dedup.duplicates > 0 {
            info!(
                "Deduplicated {} resources in {} groups ({} saved)",
                dedup.duplicates,
                dedup.groups,
                FileManager::format_size(dedup.bytes_saved)
            );
        }

        if config.dry_run {
            let estimate = estimate_savings(&set, config, input_size);
            info!("Dry run: estimated savings {}", FileManager::format_size(estimate));
            return Ok(summary.finish(&set.resources, input_size.saturating_sub(estimate)));
        }

        let task = Arc::new(self.task_optimizer(&set, scratch, workers));
        for category in GROUP_ORDER {
            let pending = set
                .indices(category)
                .into_iter()
                .filter(|&i| !set.resources[i].is_deduplicated())
                .count();
            if pending == 0 {
                continue;
            }
            let tracker = ProgressTracker::new(category, pending, show_progress, config.json_output);
            task.run_group(&mut set, category, &tracker, cancel).await?;
            tracker.finish();
        }

        let output_size = self.write_output(&set, dest, &source_structure, input_size, cancel).await?;
        let summary = summary.finish(&set.resources, output_size);
        info!("{}", summary.format_summary());
        Ok(summary)
    }

    fn work_dir(&self) -> Result<TempDir, OptimizeError> {
        let parent = match &self.config.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => std::env::temp_dir(),
        };
        Ok(FileManager::scratch_dir(&parent, "epub-optimizer-")?)
    }

    fn task_optimizer(&self, set: &ResourceSet, scratch: PathBuf, workers: usize) -> TaskOptimizer {
        let state = Arc::new(RunState::new());
        let text_sources: Vec<(PathBuf, _)> = set
            .resources
            .iter()
            .filter_map(|r| match r.kind {
                ResourceKind::MarkupStyle(format) => Some((r.path.clone(), format)),
                _ => None,
            })
            .collect();

        TaskOptimizer::new(
            self.config.clone(),
            ImageProcessor::new(self.config.clone(), self.encoder.clone(), state.clone(), scratch.clone()),
            TextProcessor::new(self.config.clone()),
            FontProcessor::new(
                self.config.clone(),
                self.encoder.clone(),
                state,
                scratch,
                Arc::new(text_sources),
            ),
            workers,
        )
    }

    /// Write, verify and publish the output archive. Returns its size.
    async fn write_output(
        &self,
        set: &ResourceSet,
        dest: &Path,
        source_structure: &StructureReport,
        input_size: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, OptimizeError> {
        let config = &self.config;
        let planned = plan_entries(&set.resources);
        let options = WriteOptions {
            stream_threshold: config.thresholds.archive_stream,
            share_duplicate_payloads: config.share_duplicate_payloads,
        };

        let spinner = ProgressManager::spinner("Writing archive...", !config.quiet && !config.json_output);
        let staged = {
            let (dest, token) = (dest.to_path_buf(), cancel.clone());
            blocking(move || write_archive(&dest, &planned, &options, &token)).await??
        };
        spinner.finish_and_clear();

        if source_structure.is_valid() {
            let report = validate_structure(staged.path());
            if !report.is_valid() {
                return Err(OptimizeError::ResourceProcessingFailed {
                    path: dest.display().to_string(),
                    reason: format!("output failed structural check: {}", report.problems().join(", ")),
                });
            }
        }

        let output_size = staged.size;
        if output_size > input_size {
            let increase = output_size - input_size;
            if !config.force {
                return Err(OptimizeError::SizeIncreased {
                    input_size,
                    output_size,
                    increase,
                });
            }
            warn!("Output is {} bytes larger than the input, kept because of --force", increase);
        }

        if !staged.commit(dest, cancel)? {
            return Err(OptimizeError::Timeout(config.timeout()));
        }
        info!("Wrote {} ({})", dest.display(), FileManager::format_size(output_size));
        Ok(output_size)
    }
}

async fn blocking<T, F>(work: F) -> Result<T, OptimizeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| OptimizeError::Io(std::io::Error::other(e)))
}

/// Estimated bytes saved, scaled from payload bytes to archive bytes
fn estimate_savings(set: &ResourceSet, config: &Config, input_size: u64) -> u64 {
    let thresholds = &config.thresholds;
    let payload: u64 = set.total_size();
    let saved: f64 = set
        .resources
        .iter()
        .map(|r| {
            let size = r.size_or_zero();
            if r.is_deduplicated() {
                return size as f64;
            }
            let (floor, ratio) = match r.kind.category() {
                ResourceCategory::Image => (thresholds.image_floor, ESTIMATE_IMAGE),
                ResourceCategory::MarkupStyle => (thresholds.markup_floor, ESTIMATE_MARKUP),
                ResourceCategory::Font => (thresholds.font_floor, ESTIMATE_FONT),
                ResourceCategory::Other => return 0.0,
            };
            if size < floor {
                0.0
            } else {
                size as f64 * ratio
            }
        })
        .sum();

    let scale = if payload > 0 {
        (input_size as f64 / payload as f64).min(1.0)
    } else {
        0.0
    };
    ((saved * scale) as u64).min(input_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::optimizer::encoder::fake::FakeEncoder;
    use crate::resource::{ResourceOutcome, SkipReason};
    use crate::summary::ResourceReport;
    use crate::test_support::{build_epub, entry_names, noise, read_entry};
    use std::time::Duration;

    fn quiet_config() -> Config {
        Config {
            quiet: true,
            max_threads: Some(2),
            ..Config::default()
        }
    }

    fn optimizer(config: Config, encoder: FakeEncoder) -> EpubOptimizer {
        EpubOptimizer::new(config, Arc::new(encoder))
    }

    fn report<'a>(summary: &'a RunSummary, name: &str) -> &'a ResourceReport {
        summary.resources.iter().find(|r| r.name == name).unwrap()
    }

    fn chapter() -> Vec<u8> {
        let mut body = String::from("<?xml version=\"1.0\"?>\n<html>\n  <head>\n    <title>One</title>\n  </head>\n  <body>\n");
        for i in 0..60 {
            body.push_str(&format!("    <p class=\"\">Paragraph   number {}   of the chapter.</p>\n", i));
        }
        body.push_str("  </body>\n</html>\n");
        body.into_bytes()
    }

    #[tokio::test]
    async fn test_identical_images_share_one_payload() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        let dest = dir.path().join("book_optimized.epub");
        let image = noise(500_000, 7);
        build_epub(
            &source,
            &[
                ("OEBPS/images/a.png", image.as_slice()),
                ("OEBPS/images/copy/b.png", image.as_slice()),
            ],
        );

        let summary = optimizer(quiet_config(), FakeEncoder::default())
            .optimize(&source, &dest)
            .await
            .unwrap();

        assert!(summary.success);
        assert_eq!(summary.deduplicated, 1);
        assert!(matches!(
            report(&summary, "OEBPS/images/a.png").outcome,
            ResourceOutcome::Optimized { .. }
        ));
        assert_eq!(
            report(&summary, "OEBPS/images/copy/b.png").outcome.canonical(),
            Some("OEBPS/images/a.png")
        );

        let names = entry_names(&dest);
        assert!(names.contains(&"OEBPS/images/a.png".to_string()));
        assert!(names.contains(&"OEBPS/images/copy/b.png".to_string()));
        assert_eq!(
            read_entry(&dest, "OEBPS/images/a.png"),
            read_entry(&dest, "OEBPS/images/copy/b.png")
        );
        assert!(summary.output_size < summary.input_size);
        assert!(summary.output_size < 500_000);
    }

    #[tokio::test]
    async fn test_round_trip_keeps_every_entry() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        let dest = dir.path().join("out.epub");
        let chapter = chapter();
        let small_image = noise(2_000, 3);
        build_epub(
            &source,
            &[
                ("OEBPS/", b"".as_slice()),
                ("OEBPS/content.opf", b"<package/>".as_slice()),
                ("OEBPS/text/ch1.xhtml", chapter.as_slice()),
                ("OEBPS/images/icon.png", small_image.as_slice()),
                ("OEBPS/fonts/tiny.ttf", b"not really a font".as_slice()),
            ],
        );

        let config = Config {
            force: true,
            ..quiet_config()
        };
        let summary = optimizer(config, FakeEncoder::default())
            .optimize(&source, &dest)
            .await
            .unwrap();

        let mut expected: Vec<String> = entry_names(&source)
            .into_iter()
            .filter(|n| !n.ends_with('/'))
            .collect();
        let mut actual = entry_names(&dest);
        assert_eq!(actual[0], "mimetype");
        expected.sort();
        actual.sort();
        assert_eq!(actual, expected);
        assert!(validate_structure(&dest).is_valid());

        // below the image floor: untouched, byte for byte
        assert_eq!(
            report(&summary, "OEBPS/images/icon.png").outcome,
            ResourceOutcome::skipped(SkipReason::BelowFloor)
        );
        assert_eq!(read_entry(&dest, "OEBPS/images/icon.png"), small_image);

        assert!(matches!(
            report(&summary, "OEBPS/text/ch1.xhtml").outcome,
            ResourceOutcome::Optimized { .. }
        ));
        assert!(read_entry(&dest, "OEBPS/text/ch1.xhtml").len() < chapter.len());
        assert_eq!(read_entry(&dest, "OEBPS/content.opf"), b"<package/>");
    }

    #[tokio::test]
    async fn test_minimal_markup_left_unmodified() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        let dest = dir.path().join("out.epub");
        let minimal = format!("<html><body><p>{}</p></body></html>", "x".repeat(2_000));
        build_epub(&source, &[("OEBPS/ch.xhtml", minimal.as_bytes())]);

        let summary = optimizer(
            Config {
                force: true,
                ..quiet_config()
            },
            FakeEncoder::default(),
        )
        .optimize(&source, &dest)
        .await
        .unwrap();

        assert_eq!(
            report(&summary, "OEBPS/ch.xhtml").outcome,
            ResourceOutcome::skipped(SkipReason::NoGain)
        );
        assert_eq!(read_entry(&dest, "OEBPS/ch.xhtml"), minimal.as_bytes());
    }

    #[tokio::test]
    async fn test_other_entry_identical_to_markup_passes_through() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        let dest = dir.path().join("out.epub");
        let chapter = chapter();
        build_epub(
            &source,
            &[
                ("OEBPS/ch.xhtml", chapter.as_slice()),
                ("OEBPS/zz_notes.txt", chapter.as_slice()),
            ],
        );

        let config = Config {
            force: true,
            ..quiet_config()
        };
        let summary = optimizer(config, FakeEncoder::default())
            .optimize(&source, &dest)
            .await
            .unwrap();

        assert_eq!(summary.deduplicated, 0);
        assert_eq!(
            report(&summary, "OEBPS/zz_notes.txt").outcome,
            ResourceOutcome::skipped(SkipReason::Passthrough)
        );
        assert_eq!(read_entry(&dest, "OEBPS/zz_notes.txt"), chapter);
        assert!(read_entry(&dest, "OEBPS/ch.xhtml").len() < chapter.len());
    }

    #[tokio::test]
    async fn test_output_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        let chapter = chapter();
        let image = noise(40_000, 11);
        build_epub(
            &source,
            &[
                ("OEBPS/text/ch1.xhtml", chapter.as_slice()),
                ("OEBPS/text/ch2.xhtml", chapter.as_slice()),
                ("OEBPS/images/cover.png", image.as_slice()),
                ("OEBPS/content.opf", b"<package/>".as_slice()),
            ],
        );

        let first = dir.path().join("first.epub");
        let second = dir.path().join("second.epub");
        optimizer(quiet_config(), FakeEncoder::default())
            .optimize(&source, &first)
            .await
            .unwrap();
        optimizer(
            Config {
                max_threads: Some(1),
                ..quiet_config()
            },
            FakeEncoder::default(),
        )
        .optimize(&source, &second)
        .await
        .unwrap();

        assert_eq!(entry_names(&first), entry_names(&second));
        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_destination() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        let dest = dir.path().join("out.epub");
        let image = noise(50_000, 5);
        build_epub(&source, &[("OEBPS/images/big.png", image.as_slice())]);

        let config = Config {
            timeout_secs: 1,
            ..quiet_config()
        };
        let started = Instant::now();
        let result = optimizer(config, FakeEncoder::slow(Duration::from_secs(30)))
            .optimize(&source, &dest)
            .await;

        assert!(matches!(result, Err(OptimizeError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!dest.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_never_writes() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        let dest = dir.path().join("out.epub");
        let image = noise(60_000, 9);
        build_epub(
            &source,
            &[
                ("OEBPS/images/a.png", image.as_slice()),
                ("OEBPS/images/b.png", image.as_slice()),
            ],
        );

        let summary = optimizer(
            Config {
                dry_run: true,
                ..quiet_config()
            },
            FakeEncoder::default(),
        )
        .run(&source, &dest)
        .await;

        assert!(summary.success);
        assert!(summary.dry_run);
        assert_eq!(summary.deduplicated, 1);
        assert!(summary.output_size < summary.input_size);
        assert!(!dest.exists());
    }

    #[test]
    fn test_input_guards() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("book.epub");
        let dest = dir.path().join("out.epub");
        build_epub(&source, &[("OEBPS/a.txt", b"hello".as_slice())]);

        let limited = optimizer(
            Config {
                max_input_size: Some(10),
                ..quiet_config()
            },
            FakeEncoder::default(),
        );
        let summary = tokio_test::block_on(limited.run(&source, &dest));
        assert_eq!(summary.failure, Some(FailureReason::TooLarge));
        assert_eq!(summary.failure.map(|r| r.exit_code()), Some(3));
        assert!(!dest.exists());

        let garbage = dir.path().join("garbage.epub");
        std::fs::write(&garbage, b"this is not a zip file").unwrap();
        let err = tokio_test::block_on(optimizer(quiet_config(), FakeEncoder::default()).optimize(&garbage, &dest))
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::ArchiveUnreadable);

        let missing = dir.path().join("missing.epub");
        let summary = tokio_test::block_on(optimizer(quiet_config(), FakeEncoder::default()).run(&missing, &dest));
        assert_eq!(summary.failure, Some(FailureReason::ArchiveUnreadable));
    }

    #[test]
    fn test_estimate_respects_floors_and_scale() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.png"), vec![0u8; 100_000]).unwrap();
        std::fs::write(dir.path().join("small.png"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("data.bin"), vec![0u8; 1_000]).unwrap();
        let set = Classifier::classify(dir.path()).unwrap();
        let config = Config::default();

        assert_eq!(estimate_savings(&set, &config, 101_100), 25_000);
        assert_eq!(estimate_savings(&set, &config, 50_550), 12_500);
    }
}
