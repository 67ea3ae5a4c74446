//! # Configuration Management Module
//!
//! Questo modulo gestisce tutta la configurazione dell'ottimizzatore EPUB.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri della pipeline
//! - Fornisce validazione robusta dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//! - Calcola il numero effettivo di worker (parallelismo disponibile, cap, ambienti vincolati)
//!
//! ## Parametri principali:
//! - `max_threads`: Cap sul numero di worker (default: None = parallelismo disponibile - 1)
//! - `timeout_secs`: Budget wall-clock per l'intera run (default: 300)
//! - `min_improvement`: Guadagno minimo per sostituire un'immagine (default: 0.05)
//! - `thresholds`: Soglie di dimensione per classificazione, streaming e fingerprint
//! - `images`: Limiti di resize e livelli di qualità
//! - `force`: Accetta un output più grande dell'input (default: false)
//! - `dry_run`: Solo stima, nessuna modifica (default: false)
//!
//! ## Ambienti vincolati:
//! Se `CI` o `GITHUB_ACTIONS` sono presenti nell'ambiente, `constrained` viene attivato:
//! i worker sono limitati a `constrained_thread_cap` e l'input a 50MB.
//!
//! ## Esempio:
//! ```rust,ignore
//! let config = Config {
//!     max_threads: Some(4),
//!     force: true,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use crate::error::OptimizeError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Size thresholds in bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SizeThresholds {
    /// Images below this size are skipped
    pub image_floor: u64,
    /// Markup/style files below this size are skipped
    pub markup_floor: u64,
    /// Fonts below this size are skipped
    pub font_floor: u64,
    /// Markup/style files above this size are minified in streamed batches
    pub markup_stream: u64,
    /// Archive entries above this size are copied in bounded chunks
    pub archive_stream: u64,
    /// Resources above this size are processed with the whole worker pool reserved
    pub exclusive: u64,
    /// Files at or above this size get the sampled (size, head, tail) fingerprint
    pub fingerprint_sample: u64,
    /// Window length of the head/tail samples
    pub fingerprint_window: u64,
}

impl Default for SizeThresholds {
    fn default() -> Self {
        Self {
            image_floor: 10_000,
            markup_floor: 1_000,
            font_floor: 50_000,
            markup_stream: 1_000_000,
            archive_stream: 10_000_000,
            exclusive: 20 * 1024 * 1024,
            fingerprint_sample: 2_000,
            fingerprint_window: 1_024,
        }
    }
}

/// Image policy parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageSettings {
    pub max_width: u32,
    pub max_height: u32,
    /// (upper size bound in bytes, base quality) tiers, checked in order
    pub quality_tiers: Vec<(u64, u8)>,
    /// Base quality for images above every tier
    pub fallback_quality: u8,
    pub min_quality: u8,
    pub max_quality: u8,
    /// Images with more pixels than this are not decoded for statistics
    pub max_probe_pixels: u64,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            max_width: 1200,
            max_height: 1600,
            quality_tiers: vec![(100_000, 85), (500_000, 80), (2_000_000, 75)],
            fallback_quality: 70,
            min_quality: 40,
            max_quality: 95,
            max_probe_pixels: 40_000_000,
        }
    }
}

/// Configuration for EPUB optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cap on parallel workers (None = available parallelism minus one)
    pub max_threads: Option<usize>,
    /// Resource-constrained execution context (CI runners)
    pub constrained: bool,
    /// Worker cap applied when `constrained` is set
    pub constrained_thread_cap: usize,
    /// Wall-clock budget for the whole run
    pub timeout_secs: u64,
    /// Wall-clock limit for a single external tool invocation
    pub tool_timeout_secs: u64,
    /// Minimum relative gain before an image is replaced (0.05 = 5%)
    pub min_improvement: f64,
    pub thresholds: SizeThresholds,
    /// Always hash full content instead of sampling large files
    pub full_hash: bool,
    pub images: ImageSettings,
    /// Subset a font only if used/inventory is below this ratio
    pub font_subset_ratio: f64,
    /// Keep printable ASCII in every font subset
    pub font_subset_keep_ascii: bool,
    /// Keep the output even if it is larger than the input
    pub force: bool,
    /// Estimate only, never write the destination
    pub dry_run: bool,
    /// Refuse inputs above this size
    pub max_input_size: Option<u64>,
    /// Memory limit handed to ImageMagick
    pub max_memory_mb: u64,
    /// Store duplicate entries as aliases of the canonical payload
    pub share_duplicate_payloads: bool,
    /// Parent of the per-run working directory (None = system temp)
    pub work_dir: Option<PathBuf>,
    /// Suppress progress bars
    pub quiet: bool,
    /// Output progress and status as JSON for programmatic use
    pub json_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_threads: None,
            constrained: false,
            constrained_thread_cap: 2,
            timeout_secs: 300,
            tool_timeout_secs: 120,
            min_improvement: 0.05,
            thresholds: SizeThresholds::default(),
            full_hash: false,
            images: ImageSettings::default(),
            font_subset_ratio: 0.5,
            font_subset_keep_ascii: true,
            force: false,
            dry_run: false,
            max_input_size: None,
            max_memory_mb: 512,
            share_duplicate_payloads: true,
            work_dir: None,
            quiet: false,
            json_output: false,
        }
    }
}

const CONSTRAINED_MAX_INPUT: u64 = 50 * 1024 * 1024;

impl Config {
    /// Default configuration adjusted for the current environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if std::env::var_os("GITHUB_ACTIONS").is_some() || std::env::var_os("CI").is_some() {
            config.constrained = true;
            config.max_input_size = Some(CONSTRAINED_MAX_INPUT);
        }
        config
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), OptimizeError> {
        if let Some(threads) = self.max_threads {
            if threads == 0 || threads > 256 {
                return Err(OptimizeError::Config("Thread cap must be between 1 and 256".into()));
            }
        }

        if self.constrained_thread_cap == 0 {
            return Err(OptimizeError::Config("Constrained thread cap must be greater than 0".into()));
        }

        if self.timeout_secs == 0 || self.tool_timeout_secs == 0 {
            return Err(OptimizeError::Config("Timeouts must be greater than 0".into()));
        }

        if !(0.0..1.0).contains(&self.min_improvement) {
            return Err(OptimizeError::Config("Minimum improvement must be in [0.0, 1.0)".into()));
        }

        if self.images.min_quality == 0
            || self.images.max_quality > 100
            || self.images.min_quality > self.images.max_quality
        {
            return Err(OptimizeError::Config("Image quality clamp must satisfy 1 <= min <= max <= 100".into()));
        }

        if self.images.max_width == 0 || self.images.max_height == 0 {
            return Err(OptimizeError::Config("Image bounds must be greater than 0".into()));
        }

        if self.font_subset_ratio <= 0.0 || self.font_subset_ratio > 1.0 {
            return Err(OptimizeError::Config("Font subset ratio must be in (0.0, 1.0]".into()));
        }

        if self.thresholds.fingerprint_window == 0 {
            return Err(OptimizeError::Config("Fingerprint window must be greater than 0".into()));
        }

        Ok(())
    }

    /// Worker count: available parallelism minus one reserved unit, then capped
    pub fn effective_workers(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.workers_for(available)
    }

    pub(crate) fn workers_for(&self, available: usize) -> usize {
        let mut workers = available.saturating_sub(1).max(1);
        if let Some(cap) = self.max_threads {
            workers = workers.min(cap);
        }
        if self.constrained {
            workers = workers.min(self.constrained_thread_cap);
        }
        workers.max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Load configuration from file
    pub async fn from_file(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::from_env());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.max_threads = Some(0);
        assert!(matches!(config.validate(), Err(OptimizeError::Config(_))));

        config.max_threads = Some(4);
        config.min_improvement = 1.5;
        assert!(config.validate().is_err());

        config.min_improvement = 0.05;
        config.images.min_quality = 90;
        config.images.max_quality = 80;
        assert!(config.validate().is_err());

        config.images.min_quality = 40;
        config.font_subset_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.timeout_secs, 300);
        assert_eq!(config.min_improvement, 0.05);
        assert_eq!(config.thresholds.image_floor, 10_000);
        assert_eq!(config.thresholds.markup_floor, 1_000);
        assert_eq!(config.thresholds.font_floor, 50_000);
        assert_eq!(config.images.max_width, 1200);
        assert_eq!(config.images.max_height, 1600);
        assert!(!config.force);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_worker_reservation_and_caps() {
        let mut config = Config::default();
        assert_eq!(config.workers_for(8), 7);
        assert_eq!(config.workers_for(1), 1);

        config.max_threads = Some(3);
        assert_eq!(config.workers_for(8), 3);

        config.constrained = true;
        assert_eq!(config.workers_for(8), 2);
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let original_config = Config {
            max_threads: Some(6),
            timeout_secs: 60,
            min_improvement: 0.1,
            force: true,
            ..Default::default()
        };

        original_config.save_to_file(&config_path).await.unwrap();
        let loaded_config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(loaded_config.max_threads, Some(6));
        assert_eq!(loaded_config.timeout_secs, 60);
        assert_eq!(loaded_config.min_improvement, 0.1);
        assert!(loaded_config.force);
        assert_eq!(loaded_config.thresholds, SizeThresholds::default());
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"timeout_secs": 5}"#).unwrap();
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.images, ImageSettings::default());
    }
}
