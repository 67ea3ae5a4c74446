//! # Optimization Policy Module
//!
//! Funzioni pure che traducono gli attributi di una risorsa (dimensione, pixel,
//! segnali statistici) nei parametri per gli encoder.
//!
//! ## Immagini:
//! - Qualità base a fasce di dimensione (`quality_tiers`), poi corretta dalla
//!   dinamica di luminanza: dinamica ampia → -5, dinamica stretta → +5, clamp finale
//! - Classe di contenuto: fotografico (molti colori) o piatto (pochi colori, testo, line art)
//! - Candidati nello stesso formato del container, ordinati in base alla classe
//!
//! ## Font:
//! - Subset se i caratteri usati coprono meno di `font_subset_ratio` dell'inventario,
//!   altrimenti repack lossless
//!
//! Nessuno stato condiviso: ogni valutazione dipende solo dai suoi argomenti.

use crate::config::ImageSettings;
use crate::optimizer::encoder::{EncodeOp, FontFlavor};
use crate::resize;
use crate::resource::{FontFormat, ImageFormat};
use serde::{Deserialize, Serialize};

/// Luma spread above which the image is treated as more compressible
const WIDE_DYNAMIC_RANGE: u8 = 200;
/// Luma spread below which quality is raised to protect smooth gradients
const NARROW_DYNAMIC_RANGE: u8 = 64;
const QUALITY_STEP: i16 = 5;
/// Sampled colour count at or below which content is considered flat
const FLAT_COLOR_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    Photographic,
    Flat,
}

/// What the probe learned about an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageSignal {
    pub width: u32,
    pub height: u32,
    /// max - min luma over sampled pixels
    pub dynamic_range: Option<u8>,
    /// Distinct colours over sampled pixels
    pub distinct_colors: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlan {
    pub class: ContentClass,
    pub quality: u8,
    /// Bounding box to shrink into, if the image exceeds it
    pub resize: Option<(u32, u32)>,
    /// Candidate encodings in preference order
    pub candidates: Vec<EncodeOp>,
}

/// Base quality from the size tier
pub fn base_quality(size: u64, settings: &ImageSettings) -> u8 {
    settings
        .quality_tiers
        .iter()
        .find(|(limit, _)| size < *limit)
        .map(|(_, quality)| *quality)
        .unwrap_or(settings.fallback_quality)
}

/// Base quality adjusted by the content signal, clamped to the configured range
pub fn adjusted_quality(base: u8, dynamic_range: Option<u8>, settings: &ImageSettings) -> u8 {
    let delta = match dynamic_range {
        Some(range) if range > WIDE_DYNAMIC_RANGE => -QUALITY_STEP,
        Some(range) if range < NARROW_DYNAMIC_RANGE => QUALITY_STEP,
        _ => 0,
    };
    let quality = (base as i16 + delta).clamp(settings.min_quality as i16, settings.max_quality as i16);
    quality as u8
}

/// Photographic vs flat guess; falls back to the format's usual content
pub fn classify_content(format: ImageFormat, signal: &ImageSignal) -> ContentClass {
    match signal.distinct_colors {
        Some(colors) if colors <= FLAT_COLOR_LIMIT => ContentClass::Flat,
        Some(_) => ContentClass::Photographic,
        None => match format {
            ImageFormat::Jpeg | ImageFormat::Webp => ContentClass::Photographic,
            ImageFormat::Png | ImageFormat::Gif => ContentClass::Flat,
        },
    }
}

/// Same-format lossless re-encode used when no candidate clears the margin
pub fn lossless_op(format: ImageFormat) -> EncodeOp {
    match format {
        ImageFormat::Jpeg => EncodeOp::JpegLossless,
        ImageFormat::Png => EncodeOp::PngLossless,
        ImageFormat::Gif => EncodeOp::Gif { lossy: None },
        ImageFormat::Webp => EncodeOp::WebpLossless,
    }
}

fn lossy_op(format: ImageFormat, quality: u8) -> EncodeOp {
    match format {
        ImageFormat::Jpeg => EncodeOp::JpegLossy { quality },
        ImageFormat::Png => EncodeOp::PngQuantize { quality },
        ImageFormat::Gif => EncodeOp::Gif {
            lossy: Some((100u8.saturating_sub(quality)).saturating_mul(2)),
        },
        ImageFormat::Webp => EncodeOp::WebpLossy { quality },
    }
}

/// Candidate encodings: photographic content tries lossy first, flat content lossless first
pub fn candidate_ops(format: ImageFormat, class: ContentClass, quality: u8) -> Vec<EncodeOp> {
    let lossy = lossy_op(format, quality);
    let lossless = lossless_op(format);
    match class {
        ContentClass::Photographic => vec![lossy, lossless],
        ContentClass::Flat => vec![lossless, lossy],
    }
}

pub fn plan_image(size: u64, format: ImageFormat, signal: &ImageSignal, settings: &ImageSettings) -> ImagePlan {
    let class = classify_content(format, signal);
    let quality = adjusted_quality(base_quality(size, settings), signal.dynamic_range, settings);
    let resize = resize::needs_resize(signal.width, signal.height, settings.max_width, settings.max_height)
        .then_some((settings.max_width, settings.max_height));

    ImagePlan {
        class,
        quality,
        resize,
        candidates: candidate_ops(format, class, quality),
    }
}

/// Whether `candidate` beats `original` by at least `min_improvement`
pub fn meets_improvement(original: u64, candidate: u64, min_improvement: f64) -> bool {
    if candidate >= original || original == 0 {
        return false;
    }
    let saved = (original - candidate) as f64 / original as f64;
    saved >= min_improvement
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FontAction {
    Subset,
    Repack,
}

/// Subset only when the used characters are a small share of a known inventory
pub fn font_action(covered: usize, inventory: Option<usize>, ratio: f64) -> FontAction {
    match inventory {
        Some(total) if total > 0 && (covered as f64 / total as f64) < ratio => FontAction::Subset,
        _ => FontAction::Repack,
    }
}

/// Font container to write back; the file name is referenced by stylesheets, so it never changes
pub fn font_flavor(format: FontFormat) -> FontFlavor {
    match format {
        FontFormat::TrueType | FontFormat::OpenType => FontFlavor::Sfnt,
        FontFormat::Woff => FontFlavor::Woff,
        FontFormat::Woff2 => FontFlavor::Woff2,
    }
}
