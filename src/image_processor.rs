//! # Image Processing Module
//!
//! Ottimizza una singola immagine usando gli encoder esterni dietro il trait `Encoder`.
//! La crate `image` serve solo a sondare dimensioni e statistiche: nessun codec in-process.
//!
//! ## Pipeline per immagine:
//! 1. **Size guard**: sotto `image_floor` → `Skipped(BelowFloor)`
//! 2. **Marker**: JPEG già progressivo (SOF2) → `Skipped(AlreadyOptimized)`
//! 3. **Probe**: dimensioni, dinamica di luminanza, colori distinti (cache per fingerprint)
//! 4. **Policy**: qualità, bounding box, candidati ordinati (vedi `policy`)
//! 5. **Prepare**: strip + resize con ImageMagick, solo se l'immagine supera il box
//! 6. **Candidati**: ogni encoding viene provato, vince il più piccolo
//! 7. **Decisione**: sostituisce l'originale solo se guadagna almeno `min_improvement`,
//!    altrimenti prova una riscrittura lossless nello stesso formato, accettata solo
//!    se strettamente più piccola
//!
//! ## Fallback encoder:
//! Un candidato senza tool disponibile viene saltato. Se nessun encoder è disponibile
//! per nessun candidato la risorsa è `Failed`, e mantiene il contenuto originale.

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::OptimizeError;
use crate::file_manager::FileManager;
use crate::fingerprint::FingerprintSettings;
use crate::optimizer::encoder::{EncodeJob, EncodeOp, Encoder};
use crate::policy::{self, ImageSignal};
use crate::resource::{ImageFormat, Resource, ResourceOutcome, SkipReason};
use crate::state::RunState;
use anyhow::Result;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Longest JPEG header scanned for a frame marker
const MARKER_SCAN_LIMIT: u64 = 512 * 1024;
/// Side of the thumbnail used for content statistics
const STATS_SIDE: u32 = 64;

pub struct ImageProcessor {
    config: Arc<Config>,
    encoder: Arc<dyn Encoder>,
    state: Arc<RunState>,
    scratch: PathBuf,
}

impl ImageProcessor {
    pub fn new(config: Arc<Config>, encoder: Arc<dyn Encoder>, state: Arc<RunState>, scratch: PathBuf) -> Self {
        Self {
            config,
            encoder,
            state,
            scratch,
        }
    }

    /// Optimize one image in place and report its outcome
    pub async fn optimize(&self, resource: &Resource, format: ImageFormat, cancel: &CancellationToken) -> ResourceOutcome {
        match self.try_optimize(resource, format, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Image {} failed: {:#}", resource.name, e);
                ResourceOutcome::failed(format!("{:#}", e))
            }
        }
    }

    async fn try_optimize(
        &self,
        resource: &Resource,
        format: ImageFormat,
        cancel: &CancellationToken,
    ) -> Result<ResourceOutcome> {
        let original_size = resource.size()?;
        if original_size < self.config.thresholds.image_floor {
            return Ok(ResourceOutcome::skipped(SkipReason::BelowFloor));
        }

        if format == ImageFormat::Jpeg {
            let path = resource.path.clone();
            if tokio::task::spawn_blocking(move || is_progressive_jpeg(&path)).await?? {
                debug!("{} is already progressive", resource.name);
                return Ok(ResourceOutcome::skipped(SkipReason::AlreadyOptimized));
            }
        }

        let signal = self.probe(resource).await;
        let plan = policy::plan_image(original_size, format, &signal, &self.config.images);
        debug!(
            "{}: {:?} q{} resize={:?} candidates={}",
            resource.name,
            plan.class,
            plan.quality,
            plan.resize,
            plan.candidates.len()
        );

        let scratch = FileManager::scratch_dir(&self.scratch, "img-")?;
        let ext = extension_of(&resource.path);

        let mut input = resource.path.clone();
        let mut resized = false;
        if let Some(bound) = plan.resize {
            let prepare = EncodeOp::Prepare {
                bound: Some(bound),
                memory_mb: self.config.max_memory_mb,
            };
            if self.encoder.supports(&prepare) {
                let job = EncodeJob::new(prepare, &input, scratch.path().join(format!("prepared.{}", ext)));
                match self.encoder.encode(&job).await {
                    Ok(path) => {
                        input = path;
                        resized = true;
                    }
                    Err(e) => warn!("Resize of {} failed, encoding original: {}", resource.name, e),
                }
            }
        }

        let mut best: Option<(u64, PathBuf, EncodeOp)> = None;
        let mut attempted = 0usize;
        let mut succeeded = 0usize;
        let mut last_error: Option<String> = None;
        let mut lossless_on_original: Option<(u64, PathBuf)> = None;
        let lossless = policy::lossless_op(format);

        for (index, op) in plan.candidates.iter().enumerate() {
            if !self.encoder.supports(op) {
                debug!("No encoder for {} on {}", op.label(), resource.name);
                continue;
            }
            attempted += 1;

            let output = scratch.path().join(format!("candidate-{}.{}", index, ext));
            let job = EncodeJob::new(op.clone(), &input, &output);
            let encoded = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(anyhow::anyhow!("cancelled")),
                encoded = self.encoder.encode(&job) => encoded,
            };
            match encoded {
                Ok(path) => {
                    succeeded += 1;
                    let size = tokio::fs::metadata(&path).await?.len();
                    debug!("{} {} -> {} bytes", resource.name, op.label(), size);
                    if !resized && *op == lossless {
                        lossless_on_original = Some((size, path.clone()));
                    }
                    if best.as_ref().map_or(true, |(best_size, _, _)| size < *best_size) {
                        best = Some((size, path, op.clone()));
                    }
                }
                Err(e) if e.is_unavailable() => {
                    attempted -= 1;
                }
                Err(e) => {
                    warn!("{} on {} failed: {}", op.label(), resource.name, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if let Some((size, path, op)) = best {
            if policy::meets_improvement(original_size, size, self.config.min_improvement) {
                FileManager::replace_file(&resource.path, &path).await?;
                let method = if resized {
                    format!("{} + resize", op.label())
                } else {
                    op.label()
                };
                return Ok(ResourceOutcome::Optimized {
                    original_size,
                    optimized_size: size,
                    method,
                });
            }
        }

        // same-format lossless rewrite of the original, kept only if smaller
        let fallback = match lossless_on_original {
            Some(result) => Some(result),
            None if self.encoder.supports(&lossless) => {
                attempted += 1;
                let output = scratch.path().join(format!("fallback.{}", ext));
                let job = EncodeJob::new(lossless.clone(), &resource.path, &output);
                match self.encoder.encode(&job).await {
                    Ok(path) => {
                        succeeded += 1;
                        Some((tokio::fs::metadata(&path).await?.len(), path))
                    }
                    Err(e) => {
                        last_error = Some(e.to_string());
                        None
                    }
                }
            }
            None => None,
        };

        if let Some((size, path)) = fallback {
            if size < original_size {
                FileManager::replace_file(&resource.path, &path).await?;
                return Ok(ResourceOutcome::Optimized {
                    original_size,
                    optimized_size: size,
                    method: format!("{} (fallback)", lossless.label()),
                });
            }
        }

        if attempted == 0 {
            return Ok(ResourceOutcome::failed(OptimizeError::EncoderUnavailable(format!(
                "{:?} images",
                format
            ))));
        }
        if succeeded == 0 {
            return Ok(ResourceOutcome::failed(
                last_error.unwrap_or_else(|| "every encoder failed".to_string()),
            ));
        }
        Ok(ResourceOutcome::skipped(SkipReason::NoGain))
    }

    /// Dimensions and statistics, cached per fingerprint for the run
    async fn probe(&self, resource: &Resource) -> ImageSignal {
        let settings = FingerprintSettings::from(self.config.as_ref());
        let fingerprint = resource.fingerprint(&settings).ok();
        if let Some(signal) = fingerprint.as_ref().and_then(|fp| self.state.cached_probe(fp)) {
            return signal;
        }

        let path = resource.path.clone();
        let max_pixels = self.config.images.max_probe_pixels;
        let signal = match tokio::task::spawn_blocking(move || probe_image(&path, max_pixels)).await {
            Ok(Ok(signal)) => signal,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", resource.name, e);
                ImageSignal::default()
            }
            Err(e) => {
                debug!("Probe task for {} failed: {}", resource.name, e);
                ImageSignal::default()
            }
        };

        if let Some(fp) = fingerprint {
            self.state.store_probe(fp, signal);
        }
        signal
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "img".to_string())
}

/// Decode header and, within the pixel budget, a small thumbnail for statistics
pub fn probe_image(path: &Path, max_pixels: u64) -> image::ImageResult<ImageSignal> {
    let (width, height) = image::io::Reader::open(path)?
        .with_guessed_format()?
        .into_dimensions()?;

    let mut signal = ImageSignal {
        width,
        height,
        ..ImageSignal::default()
    };
    if (width as u64) * (height as u64) > max_pixels {
        return Ok(signal);
    }

    let image = image::io::Reader::open(path)?.with_guessed_format()?.decode()?;
    let thumb = image.thumbnail(STATS_SIDE, STATS_SIDE);

    let luma = thumb.to_luma8();
    let (min, max) = luma
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if min <= max {
        signal.dynamic_range = Some(max - min);
    }

    let colors: HashSet<[u8; 4]> = thumb.to_rgba8().pixels().map(|p| p.0).collect();
    signal.distinct_colors = Some(colors.len());
    Ok(signal)
}

/// True if the first frame header of a JPEG is SOF2 (progressive)
pub fn is_progressive_jpeg(path: &Path) -> std::io::Result<bool> {
    let mut head = Vec::new();
    File::open(path)?.take(MARKER_SCAN_LIMIT).read_to_end(&mut head)?;
    Ok(progressive_marker(&head))
}

fn progressive_marker(data: &[u8]) -> bool {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return false;
    }

    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return false;
        }
        let marker = data[pos + 1];
        match marker {
            0xFF => {
                pos += 1;
                continue;
            }
            0xC2 => return true,
            0xC0 | 0xC1 | 0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => return false,
            0xDA | 0xD9 => return false,
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            _ => {}
        }
        let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if length < 2 {
            return false;
        }
        pos += 2 + length;
    }
    false
}
