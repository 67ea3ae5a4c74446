//! # Image Resize Module
//!
//! Calcolo puro dei limiti di ridimensionamento delle immagini.
//!
//! ## Regole:
//! - Si ridimensiona solo se almeno una dimensione supera il limite configurato
//! - L'aspect ratio viene sempre preservato (fit dentro il box)
//! - Mai ingrandire: la geometry ImageMagick usa il flag `>` (solo riduzione)

/// Geometry for ImageMagick that only ever shrinks
pub fn shrink_geometry(max_width: u32, max_height: u32) -> String {
    format!("{}x{}>", max_width, max_height)
}

/// Whether an image of `width`x`height` exceeds the bounding box
pub fn needs_resize(width: u32, height: u32, max_width: u32, max_height: u32) -> bool {
    width > max_width || height > max_height
}

/// Largest size that fits in the box while keeping the aspect ratio.
/// Returns the input unchanged when it already fits.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if !needs_resize(width, height, max_width, max_height) || width == 0 || height == 0 {
        return (width, height);
    }

    let scale_w = max_width as f64 / width as f64;
    let scale_h = max_height as f64 / height as f64;
    let scale = scale_w.min(scale_h);

    let fit_w = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let fit_h = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (fit_w, fit_h)
}
