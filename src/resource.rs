//! # Resource Model Module
//!
//! Modello dati di una risorsa estratta dal container.
//!
//! ## Responsabilità:
//! - `ResourceKind`: variante chiusa {Image, MarkupStyle, Font, Other}, risolta una sola volta
//!   dall'estensione (case-insensitive) e mai ricalcolata a valle
//! - `Resource`: path relativo nel container (chiave unica), path su disco, dimensione e
//!   fingerprint calcolati lazy al primo accesso
//! - `ResourceOutcome`: esito dell'ottimizzazione (unprocessed/optimized/skipped/deduplicated/failed)
//!
//! ## Lazy attributes:
//! Dimensione e fingerprint partono vuoti: una risorsa scartata dal size guard non viene
//! mai letta per intero. Dopo una modifica del contenuto `refresh()` invalida entrambi.

use crate::fingerprint::{Fingerprint, FingerprintSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextFormat {
    Html,
    Css,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontFormat {
    TrueType,
    OpenType,
    Woff,
    Woff2,
}

/// Classificazione di una risorsa
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "category", content = "format")]
pub enum ResourceKind {
    Image(ImageFormat),
    MarkupStyle(TextFormat),
    Font(FontFormat),
    Other,
}

/// Categoria senza formato, usata per raggruppare statistiche e ordinare l'archivio
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    MarkupStyle,
    Image,
    Font,
    Other,
}

impl ResourceKind {
    /// Classify a path by its extension only
    pub fn from_path(path: &Path) -> Self {
        let ext = match path.extension() {
            Some(ext) => ext.to_string_lossy().to_lowercase(),
            None => return Self::Other,
        };

        match ext.as_str() {
            "jpg" | "jpeg" => Self::Image(ImageFormat::Jpeg),
            "png" => Self::Image(ImageFormat::Png),
            "gif" => Self::Image(ImageFormat::Gif),
            "webp" => Self::Image(ImageFormat::Webp),
            "xhtml" | "html" | "htm" => Self::MarkupStyle(TextFormat::Html),
            "css" => Self::MarkupStyle(TextFormat::Css),
            "ttf" => Self::Font(FontFormat::TrueType),
            "otf" => Self::Font(FontFormat::OpenType),
            "woff" => Self::Font(FontFormat::Woff),
            "woff2" => Self::Font(FontFormat::Woff2),
            _ => Self::Other,
        }
    }

    pub fn category(&self) -> ResourceCategory {
        match self {
            Self::Image(_) => ResourceCategory::Image,
            Self::MarkupStyle(_) => ResourceCategory::MarkupStyle,
            Self::Font(_) => ResourceCategory::Font,
            Self::Other => ResourceCategory::Other,
        }
    }

    /// Binary kinds trust a fingerprint match; textual kinds need a byte comparison
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Image(_) | Self::Font(_))
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::MarkupStyle => "markup/style",
            Self::Image => "image",
            Self::Font => "font",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Motivo per cui una risorsa non è stata modificata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Size below the per-category floor
    BelowFloor,
    /// Content already carries an optimized-format marker
    AlreadyOptimized,
    /// No candidate beat the original
    NoGain,
    /// Category copied through unchanged
    Passthrough,
}

/// Esito dell'ottimizzazione di una risorsa
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ResourceOutcome {
    Unprocessed,
    Optimized {
        original_size: u64,
        optimized_size: u64,
        method: String,
    },
    Skipped {
        reason: SkipReason,
    },
    Deduplicated {
        canonical: String,
    },
    Failed {
        reason: String,
    },
}

impl ResourceOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Optimized { .. } => "optimized",
            Self::Skipped { .. } => "skipped",
            Self::Deduplicated { .. } => "deduplicated",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    pub fn failed(reason: impl ToString) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn canonical(&self) -> Option<&str> {
        match self {
            Self::Deduplicated { canonical } => Some(canonical),
            _ => None,
        }
    }
}

/// Una risorsa materializzata nella working directory
#[derive(Debug, Clone)]
pub struct Resource {
    /// Entry name inside the container, always `/`-separated
    pub name: String,
    /// Location of the materialized file
    pub path: PathBuf,
    pub kind: ResourceKind,
    pub outcome: ResourceOutcome,
    size: OnceLock<u64>,
    fingerprint: OnceLock<Fingerprint>,
}

impl Resource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: name.into(),
            kind: ResourceKind::from_path(&path),
            path,
            outcome: ResourceOutcome::Unprocessed,
            size: OnceLock::new(),
            fingerprint: OnceLock::new(),
        }
    }

    /// Byte size, stat-ed on first access
    pub fn size(&self) -> io::Result<u64> {
        if let Some(size) = self.size.get() {
            return Ok(*size);
        }
        let size = std::fs::metadata(&self.path)?.len();
        Ok(*self.size.get_or_init(|| size))
    }

    /// Size if already known, or the stat result, or zero when unreadable
    pub fn size_or_zero(&self) -> u64 {
        self.size().unwrap_or(0)
    }

    /// Content fingerprint, computed on first access
    pub fn fingerprint(&self, settings: &FingerprintSettings) -> io::Result<Fingerprint> {
        if let Some(fp) = self.fingerprint.get() {
            return Ok(fp.clone());
        }
        let fp = Fingerprint::of_file(&self.path, settings)?;
        Ok(self.fingerprint.get_or_init(|| fp).clone())
    }

    pub fn cached_fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.get()
    }

    pub(crate) fn set_fingerprint(&self, fp: Fingerprint) {
        let _ = self.fingerprint.set(fp);
    }

    /// Invalidate cached attributes after the content changed
    pub fn refresh(&mut self) {
        self.size = OnceLock::new();
        self.fingerprint = OnceLock::new();
    }

    pub fn is_deduplicated(&self) -> bool {
        matches!(self.outcome, ResourceOutcome::Deduplicated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classification_is_case_insensitive() {
        assert_eq!(
            ResourceKind::from_path(Path::new("OEBPS/img/Cover.JPG")),
            ResourceKind::Image(ImageFormat::Jpeg)
        );
        assert_eq!(
            ResourceKind::from_path(Path::new("a/b/chapter1.XHTML")),
            ResourceKind::MarkupStyle(TextFormat::Html)
        );
        assert_eq!(
            ResourceKind::from_path(Path::new("style.Css")),
            ResourceKind::MarkupStyle(TextFormat::Css)
        );
        assert_eq!(
            ResourceKind::from_path(Path::new("fonts/serif.woff2")),
            ResourceKind::Font(FontFormat::Woff2)
        );
        assert_eq!(ResourceKind::from_path(Path::new("content.opf")), ResourceKind::Other);
        assert_eq!(ResourceKind::from_path(Path::new("mimetype")), ResourceKind::Other);
    }

    #[test]
    fn test_category_order_matches_archive_layout() {
        assert!(ResourceCategory::MarkupStyle < ResourceCategory::Image);
        assert!(ResourceCategory::Image < ResourceCategory::Font);
        assert!(ResourceCategory::Font < ResourceCategory::Other);
        assert!(ResourceKind::Font(FontFormat::Woff).is_binary());
        assert!(!ResourceKind::MarkupStyle(TextFormat::Css).is_binary());
    }

    #[test]
    fn test_size_is_lazy_and_refreshable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.css");
        std::fs::write(&path, b"body { }").unwrap();

        let mut resource = Resource::new("a.css", &path);
        assert_eq!(resource.size().unwrap(), 8);

        std::fs::write(&path, b"body{}").unwrap();
        assert_eq!(resource.size().unwrap(), 8);
        resource.refresh();
        assert_eq!(resource.size().unwrap(), 6);
    }

    #[test]
    fn test_missing_file_size_is_error() {
        let resource = Resource::new("gone.png", "/nonexistent/gone.png");
        assert!(resource.size().is_err());
        assert_eq!(resource.size_or_zero(), 0);
    }
}
