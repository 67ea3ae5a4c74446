//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom dell'applicazione.
//!
//! ## Responsabilità:
//! - Definisce `OptimizeError` enum per categorizzare gli errori di una run
//! - Mappa ogni errore di run su un `FailureReason` stabile (usato nel summary e nel JSON)
//! - Integra con `thiserror` per automatic error conversion
//!
//! ## Categorie di errori:
//! - `ArchiveUnreadable`: il container sorgente non si apre (fatale)
//! - `ResourceProcessingFailed`: errore locale a una singola risorsa
//! - `SizeIncreased`: l'output è più grande dell'input (scartato se non `force`)
//! - `Timeout`: budget wall-clock superato (output scartato)
//! - `EncoderUnavailable`: tool esterno mancante (attiva il fallback)
//! - `TooLarge`: input oltre `max_input_size`
//! - `Config`: configurazione non valida
//! - `Io` / `Zip`: conversioni automatiche dagli errori di libreria
//!
//! `EncodeError` copre invece una singola invocazione di encoder esterno e non
//! esce mai dal livello della risorsa.
//!
//! ## Esempio:
//! ```rust,ignore
//! if size > limit {
//!     return Err(OptimizeError::TooLarge { size, limit });
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Custom error types for EPUB optimization
#[derive(thiserror::Error, Debug)]
pub enum OptimizeError {
    #[error("Archive unreadable: {path}: {reason}")]
    ArchiveUnreadable { path: PathBuf, reason: String },

    #[error("Processing failed for {path}: {reason}")]
    ResourceProcessingFailed { path: String, reason: String },

    #[error("Output grew by {increase} bytes ({input_size} -> {output_size})")]
    SizeIncreased {
        input_size: u64,
        output_size: u64,
        increase: u64,
    },

    #[error("Optimization timed out after {0:?}")]
    Timeout(Duration),

    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("Input too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Failure of one external encoder invocation
#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("No encoder available for {0}")]
    Unavailable(String),

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{0} produced no output")]
    EmptyOutput(String),

    #[error("{tool} timed out after {after:?}")]
    TimedOut { tool: String, after: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Motivo di fallimento di una run, come riportato nel summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SizeIncrease,
    Timeout,
    TooLarge,
    ArchiveUnreadable,
    ProcessingError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SizeIncrease => "size_increase",
            Self::Timeout => "timeout",
            Self::TooLarge => "too_large",
            Self::ArchiveUnreadable => "archive_unreadable",
            Self::ProcessingError => "processing_error",
        }
    }

    /// CI-friendly exit code for the binary
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SizeIncrease => 2,
            Self::TooLarge => 3,
            Self::Timeout => 4,
            Self::ArchiveUnreadable | Self::ProcessingError => 1,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OptimizeError {
    /// Run-level classification of this error
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::ArchiveUnreadable { .. } => FailureReason::ArchiveUnreadable,
            Self::SizeIncreased { .. } => FailureReason::SizeIncrease,
            Self::Timeout(_) => FailureReason::Timeout,
            Self::TooLarge { .. } => FailureReason::TooLarge,
            _ => FailureReason::ProcessingError,
        }
    }

    pub fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ArchiveUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            OptimizeError::Timeout(Duration::from_secs(5)).reason(),
            FailureReason::Timeout
        );
        assert_eq!(
            OptimizeError::unreadable("/tmp/x.epub", "bad magic").reason(),
            FailureReason::ArchiveUnreadable
        );
        assert_eq!(
            OptimizeError::TooLarge { size: 10, limit: 5 }.reason(),
            FailureReason::TooLarge
        );
        assert_eq!(
            OptimizeError::EncoderUnavailable("cwebp".into()).reason(),
            FailureReason::ProcessingError
        );
    }

    #[test]
    fn test_encode_error_messages() {
        assert!(EncodeError::Unavailable("x".into()).is_unavailable());
        assert!(!EncodeError::EmptyOutput("oxipng".into()).is_unavailable());
        assert_eq!(
            EncodeError::EmptyOutput("oxipng".into()).to_string(),
            "oxipng produced no output"
        );
        assert_eq!(
            OptimizeError::EncoderUnavailable("Png images".into()).to_string(),
            "Encoder unavailable: Png images"
        );
        assert_eq!(
            OptimizeError::Config("bad".into()).reason(),
            FailureReason::ProcessingError
        );
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&FailureReason::SizeIncrease).unwrap();
        assert_eq!(json, "\"size_increase\"");
        assert_eq!(FailureReason::Timeout.exit_code(), 4);
        assert_eq!(FailureReason::TooLarge.to_string(), "too_large");
    }
}
