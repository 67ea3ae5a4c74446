//! # Deduplication Module
//!
//! Rileva risorse con contenuto identico e le riduce a una singola copia canonica.
//!
//! ## Flusso:
//! 1. Fingerprint di tutte le risorse, calcolati in parallelo (`spawn_blocking` + `buffer_unordered`)
//! 2. Claim nella `FingerprintTable` in ordine di nome: il primo claim vince e diventa canonico.
//!    La chiave include la categoria: un duplicato punta sempre a un canonico della stessa categoria
//! 3. Per i tipi testuali un match di fingerprint viene confermato con un confronto byte per byte
//! 4. Ogni duplicato viene sostituito da un hard link al canonico nella working directory
//!
//! Se il link fallisce la risorsa resta indipendente: la run non si interrompe.
//! Risorse già marcate come duplicate vengono ignorate, quindi una seconda passata non
//! cambia nulla.

use crate::archive::MIMETYPE_ENTRY;
use crate::cancel::CancellationToken;
use crate::classifier::ResourceSet;
use crate::error::OptimizeError;
use crate::fingerprint::{files_identical, Fingerprint, FingerprintSettings};
use crate::resource::{ResourceCategory, ResourceOutcome};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Esito di un claim nella tabella
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Canonical,
    Duplicate(String),
}

/// Mappa (categoria, fingerprint) -> nomi canonici, con claim atomico
#[derive(Debug, Default)]
pub struct FingerprintTable {
    entries: Mutex<HashMap<(ResourceCategory, Fingerprint), Vec<String>>>,
}

impl FingerprintTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `fingerprint` for `name`.
    ///
    /// An existing canonical with the same fingerprint is returned if `same_content`
    /// accepts it; otherwise `name` becomes a new canonical. The check and the insert
    /// happen under one lock, so concurrent claims agree on a single winner.
    pub fn claim(
        &self,
        category: ResourceCategory,
        fingerprint: &Fingerprint,
        name: &str,
        same_content: impl Fn(&str) -> bool,
    ) -> Claim {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let canonicals = entries.entry((category, fingerprint.clone())).or_default();

        if let Some(existing) = canonicals.iter().find(|c| c.as_str() == name) {
            debug!("{} already canonical", existing);
            return Claim::Canonical;
        }
        if let Some(existing) = canonicals.iter().find(|c| same_content(c.as_str())) {
            return Claim::Duplicate(existing.clone());
        }
        canonicals.push(name.to_string());
        Claim::Canonical
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|e| e.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    /// Fingerprints with at least one duplicate
    pub groups: usize,
    pub duplicates: usize,
    /// Duplicates replaced by a hard link in the working directory
    pub linked: usize,
    /// Bytes no longer stored thanks to duplicates
    pub bytes_saved: u64,
    /// Resources that could not be fingerprinted
    pub unreadable: usize,
}

pub struct Deduplicator {
    settings: FingerprintSettings,
    concurrency: usize,
}

impl Deduplicator {
    pub fn new(settings: FingerprintSettings, concurrency: usize) -> Self {
        Self {
            settings,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        set: &mut ResourceSet,
        cancel: &CancellationToken,
    ) -> Result<DedupReport, OptimizeError> {
        let mut report = DedupReport::default();

        let pending: Vec<(usize, PathBuf)> = set
            .resources
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_deduplicated() && r.name != MIMETYPE_ENTRY)
            .filter(|(_, r)| r.cached_fingerprint().is_none())
            .map(|(i, r)| (i, r.path.clone()))
            .collect();

        let settings = self.settings;
        let hashed: Vec<(usize, std::io::Result<Fingerprint>)> = stream::iter(pending)
            .map(|(index, path)| async move {
                let result = tokio::task::spawn_blocking(move || Fingerprint::of_file(&path, &settings))
                    .await
                    .unwrap_or_else(|e| Err(std::io::Error::other(e)));
                (index, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (index, result) in hashed {
            match result {
                Ok(fp) => set.resources[index].set_fingerprint(fp),
                Err(e) => {
                    warn!("Cannot fingerprint {}: {}", set.resources[index].name, e);
                    report.unreadable += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(crate::archive::cancelled_error().into());
        }

        let table = FingerprintTable::new();
        let paths: HashMap<String, PathBuf> = set
            .resources
            .iter()
            .map(|r| (r.name.clone(), r.path.clone()))
            .collect();
        let mut duplicates: Vec<(usize, String)> = Vec::new();
        let mut grouped: HashMap<String, usize> = HashMap::new();

        for (index, resource) in set.resources.iter().enumerate() {
            if resource.is_deduplicated() || resource.name == MIMETYPE_ENTRY {
                continue;
            }
            let Some(fp) = resource.cached_fingerprint() else {
                continue;
            };

            let binary = resource.kind.is_binary();
            let own_path = resource.path.as_path();
            let claim = table.claim(resource.kind.category(), fp, &resource.name, |candidate| {
                if binary {
                    return true;
                }
                paths
                    .get(candidate)
                    .map(|p| files_identical(p, own_path).unwrap_or(false))
                    .unwrap_or(false)
            });

            if let Claim::Duplicate(canonical) = claim {
                *grouped.entry(canonical.clone()).or_insert(0) += 1;
                duplicates.push((index, canonical));
            }
        }

        report.groups = grouped.len();
        for (index, canonical) in duplicates {
            let size = set.resources[index].size_or_zero();
            let canonical_path = paths.get(&canonical).cloned().unwrap_or_default();
            let duplicate_path = set.resources[index].path.clone();

            let linked = tokio::task::spawn_blocking(move || link_duplicate(&canonical_path, &duplicate_path))
                .await
                .unwrap_or_else(|e| Err(std::io::Error::other(e)));

            match linked {
                Ok(()) => {
                    debug!("{} -> {}", set.resources[index].name, canonical);
                    set.resources[index].outcome = ResourceOutcome::Deduplicated { canonical };
                    report.linked += 1;
                    report.duplicates += 1;
                    report.bytes_saved += size;
                }
                Err(e) => {
                    warn!(
                        "Keeping {} as an independent copy, link failed: {}",
                        set.resources[index].name, e
                    );
                }
            }
        }

        if report.duplicates > 0 {
            info!(
                "Deduplicated {} resources in {} groups ({} bytes)",
                report.duplicates, report.groups, report.bytes_saved
            );
        }
        Ok(report)
    }
}

/// Replace `duplicate` with a hard link to `canonical`, atomically
fn link_duplicate(canonical: &Path, duplicate: &Path) -> std::io::Result<()> {
    let parent = duplicate.parent().unwrap_or_else(|| Path::new("."));
    let staging = tempfile::Builder::new()
        .prefix(".dedup-")
        .make_in(parent, |path| fs::hard_link(canonical, path))?;
    staging.persist(duplicate).map_err(|e| e.error)?;
    Ok(())
}
