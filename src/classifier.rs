//! # Classifier Module
//!
//! Scopre i file materializzati nella working directory e li raggruppa per categoria.
//!
//! ## Responsabilità:
//! - Walk ricorsivo (ordinato per nome, quindi deterministico) della directory estratta
//! - Creazione di un `Resource` per ogni file, con nome relativo `/`-separato
//! - Un errore del walk interrompe la classificazione: una risorsa illeggibile
//!   non deve sparire silenziosamente dall'output
//! - Indici per categoria usati dall'ottimizzatore per processare i gruppi in sequenza

use crate::archive::reader::normalized_name;
use crate::resource::{Resource, ResourceCategory};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Tutte le risorse di una run, ordinate per nome
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    pub resources: Vec<Resource>,
}

impl ResourceSet {
    pub fn new(mut resources: Vec<Resource>) -> Self {
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        Self { resources }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources
            .binary_search_by(|r| r.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.resources[i])
    }

    /// Indices of the resources in `category`, in name order
    pub fn indices(&self, category: ResourceCategory) -> Vec<usize> {
        self.resources
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind.category() == category)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn counts(&self) -> BTreeMap<ResourceCategory, usize> {
        let mut counts = BTreeMap::new();
        for resource in &self.resources {
            *counts.entry(resource.kind.category()).or_insert(0) += 1;
        }
        counts
    }

    pub fn total_size(&self) -> u64 {
        self.resources.iter().map(Resource::size_or_zero).sum()
    }
}

pub struct Classifier;

impl Classifier {
    /// Classify every regular file under `root`
    pub fn classify(root: &Path) -> Result<ResourceSet> {
        let mut resources = Vec::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                warn!("Cannot walk extracted content: {}", e);
                anyhow::anyhow!("Cannot read extracted entry {}: {}", e.path().unwrap_or(root).display(), e)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root)?;
            resources.push(Resource::new(normalized_name(relative), path));
        }

        Ok(ResourceSet::new(resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ImageFormat, ResourceKind};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_classify_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("OEBPS/images")).unwrap();
        fs::create_dir_all(root.join("OEBPS/fonts")).unwrap();
        fs::write(root.join("mimetype"), "application/epub+zip").unwrap();
        fs::write(root.join("OEBPS/ch1.xhtml"), "<p/>").unwrap();
        fs::write(root.join("OEBPS/style.css"), "p{}").unwrap();
        fs::write(root.join("OEBPS/images/Cover.JPG"), [0u8; 4]).unwrap();
        fs::write(root.join("OEBPS/fonts/serif.otf"), [0u8; 4]).unwrap();

        let set = Classifier::classify(root).unwrap();
        assert_eq!(set.len(), 5);

        let cover = set.get("OEBPS/images/Cover.JPG").unwrap();
        assert_eq!(cover.kind, ResourceKind::Image(ImageFormat::Jpeg));

        let markup: Vec<_> = set
            .indices(ResourceCategory::MarkupStyle)
            .into_iter()
            .map(|i| set.resources[i].name.as_str())
            .collect();
        assert_eq!(markup, vec!["OEBPS/ch1.xhtml", "OEBPS/style.css"]);

        let counts = set.counts();
        assert_eq!(counts[&ResourceCategory::Font], 1);
        assert_eq!(counts[&ResourceCategory::Other], 1);
        assert_eq!(set.total_size(), 20 + 4 + 3 + 4 + 4);
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        let set = Classifier::classify(dir.path()).unwrap();
        assert!(set.is_empty());
        assert!(set.get("anything").is_none());
    }

    #[test]
    fn test_walk_error_is_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("not-extracted");

        let err = Classifier::classify(&missing).unwrap_err();
        assert!(err.to_string().contains("not-extracted"), "{}", err);
    }
}
