//! # File Management Module
//!
//! Operazioni sui file della working directory e utilità di formattazione.
//!
//! ## Operazioni:
//! - `replace_file()`: sostituisce una risorsa con la sua versione ottimizzata in modo
//!   atomico (staging nella stessa directory + rename), mai un file scritto a metà
//! - `scratch_dir()`: directory temporanea per gli output intermedi di una risorsa
//! - `default_output_path()`: `<stem>_optimized.epub` accanto al sorgente
//!
//! ## Utilità:
//! - `format_size()`: Converte bytes in formato leggibile (KB, MB, GB)
//! - `calculate_reduction()`: Calcola percentuale di riduzione

use anyhow::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;

/// Manages file operations inside the working directory
pub struct FileManager;

impl FileManager {
    /// Atomically replace `original` with the content of `optimized`.
    /// `optimized` is consumed.
    pub async fn replace_file(original: &Path, optimized: &Path) -> Result<()> {
        if fs::rename(optimized, original).await.is_ok() {
            return Ok(());
        }

        // different filesystem: stage a copy next to the original first
        let parent = original
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let staged = tempfile::Builder::new()
            .prefix(".replace-")
            .tempfile_in(&parent)?
            .into_temp_path();
        fs::copy(optimized, &staged).await?;
        staged.persist(original)?;
        let _ = fs::remove_file(optimized).await;
        Ok(())
    }

    /// Fresh scratch directory under `parent`, removed when dropped
    pub fn scratch_dir(parent: &Path, prefix: &str) -> std::io::Result<TempDir> {
        tempfile::Builder::new().prefix(prefix).tempdir_in(parent)
    }

    /// `<dir>/<stem>_optimized.epub`
    pub fn default_output_path(input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        input.with_file_name(format!("{}_optimized.epub", stem))
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }

    /// Calculate percentage reduction
    pub fn calculate_reduction(original_size: u64, new_size: u64) -> f64 {
        if original_size == 0 {
            0.0
        } else {
            ((original_size as f64 - new_size as f64) / original_size as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(FileManager::format_size(512), "512 B");
        assert_eq!(FileManager::format_size(1536), "1.50 KB");
        assert_eq!(FileManager::format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_calculate_reduction() {
        assert_eq!(FileManager::calculate_reduction(0, 10), 0.0);
        assert_eq!(FileManager::calculate_reduction(200, 150), 25.0);
        assert!(FileManager::calculate_reduction(100, 120) < 0.0);
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            FileManager::default_output_path(Path::new("/books/Moby Dick.epub")),
            PathBuf::from("/books/Moby Dick_optimized.epub")
        );
    }

    #[tokio::test]
    async fn test_replace_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let original = dir.path().join("a.png");
        let optimized = dir.path().join("a.tmp");
        std::fs::write(&original, b"original bytes").unwrap();
        std::fs::write(&optimized, b"small").unwrap();

        FileManager::replace_file(&original, &optimized).await.unwrap();
        assert_eq!(std::fs::read(&original).unwrap(), b"small");
        assert!(!optimized.exists());
    }

    #[tokio::test]
    async fn test_replace_breaks_hard_link_only_for_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let canonical = dir.path().join("a.png");
        let alias = dir.path().join("b.png");
        let optimized = dir.path().join("opt.tmp");
        std::fs::write(&canonical, b"shared").unwrap();
        std::fs::hard_link(&canonical, &alias).unwrap();
        std::fs::write(&optimized, b"new").unwrap();

        FileManager::replace_file(&canonical, &optimized).await.unwrap();
        assert_eq!(std::fs::read(&canonical).unwrap(), b"new");
        assert_eq!(std::fs::read(&alias).unwrap(), b"shared");
    }
}
