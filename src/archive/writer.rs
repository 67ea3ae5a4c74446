//! # Archive Writer
//!
//! Scrive il container di output in un file temporaneo accanto alla destinazione,
//! poi lo pubblica con un rename atomico.
//!
//! ## Ordine delle entry (deterministico):
//! 1. `mimetype`, sempre prima e non compressa
//! 2. per categoria (markup/style, immagini, font, altro)
//! 3. per dimensione crescente
//! 4. i riferimenti duplicati dopo il loro canonico
//! 5. per nome
//!
//! Stesso input e stessa configurazione producono un output identico byte per byte:
//! timestamp fissi, permessi fissi, livello di compressione fisso.

use super::{cancelled_error, MIMETYPE_ENTRY, STREAM_CHUNK};
use crate::cancel::CancellationToken;
use crate::error::OptimizeError;
use crate::resource::{Resource, ResourceCategory};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

const MAX_DEFLATE_LEVEL: i64 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    /// Payload read from a materialized file
    File(PathBuf),
    /// Duplicate of an earlier entry
    Alias {
        canonical: String,
        canonical_path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub name: String,
    pub category: ResourceCategory,
    pub size: u64,
    pub source: EntrySource,
}

impl PlannedEntry {
    fn is_alias(&self) -> bool {
        matches!(self.source, EntrySource::Alias { .. })
    }
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub stream_threshold: u64,
    /// Store duplicates as central-directory aliases of the canonical payload
    pub share_duplicate_payloads: bool,
}

/// Output written next to its destination, not yet published
#[derive(Debug)]
pub struct StagedArchive {
    file: NamedTempFile,
    pub size: u64,
    pub entries: usize,
}

impl StagedArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Rename onto `dest` unless the run was cancelled. Returns whether it was published.
    pub fn commit(self, dest: &Path, cancel: &CancellationToken) -> Result<bool, OptimizeError> {
        let file = self.file;
        match cancel.commit(|| file.persist(dest).map_err(|e| e.error)) {
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(e.into()),
            None => Ok(false),
        }
    }
}

/// Order resources into the output layout
pub fn plan_entries(resources: &[Resource]) -> Vec<PlannedEntry> {
    let by_name: HashMap<&str, &Resource> = resources.iter().map(|r| (r.name.as_str(), r)).collect();

    let mut entries: Vec<PlannedEntry> = resources
        .iter()
        .map(|resource| {
            let canonical = resource
                .outcome
                .canonical()
                .and_then(|name| by_name.get(name).copied());
            match canonical {
                Some(canonical) => PlannedEntry {
                    name: resource.name.clone(),
                    category: resource.kind.category(),
                    size: canonical.size_or_zero(),
                    source: EntrySource::Alias {
                        canonical: canonical.name.clone(),
                        canonical_path: canonical.path.clone(),
                    },
                },
                None => PlannedEntry {
                    name: resource.name.clone(),
                    category: resource.kind.category(),
                    size: resource.size_or_zero(),
                    source: EntrySource::File(resource.path.clone()),
                },
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        let a_key = (a.name != MIMETYPE_ENTRY, a.category, a.size, a.is_alias(), &a.name);
        let b_key = (b.name != MIMETYPE_ENTRY, b.category, b.size, b.is_alias(), &b.name);
        a_key.cmp(&b_key)
    });
    entries
}

fn entry_options(name: &str, size: u64) -> SimpleFileOptions {
    let base = SimpleFileOptions::default()
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);
    if name == MIMETYPE_ENTRY {
        base.compression_method(CompressionMethod::Stored)
    } else {
        base.compression_method(CompressionMethod::Deflated)
            .compression_level(Some(MAX_DEFLATE_LEVEL))
            .large_file(size > u32::MAX as u64)
    }
}

/// Write `entries` into a temporary file in the destination's directory
pub fn write_archive(
    dest: &Path,
    entries: &[PlannedEntry],
    options: &WriteOptions,
    cancel: &CancellationToken,
) -> Result<StagedArchive, OptimizeError> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let staged = tempfile::Builder::new()
        .prefix(".epub-optimizer-")
        .suffix(".partial")
        .tempfile_in(&parent)?;

    let mut zip = ZipWriter::new(BufWriter::new(staged.as_file().try_clone()?));
    let mut written: HashSet<&str> = HashSet::new();

    for entry in entries {
        if cancel.is_cancelled() {
            return Err(cancelled_error().into());
        }

        match &entry.source {
            EntrySource::Alias { canonical, .. }
                if options.share_duplicate_payloads && written.contains(canonical.as_str()) =>
            {
                debug!("Aliasing {} -> {}", entry.name, canonical);
                zip.shallow_copy_file(canonical.as_str(), entry.name.as_str())?;
            }
            EntrySource::Alias { canonical_path, .. } => {
                copy_entry(&mut zip, entry, canonical_path, options, cancel)?;
            }
            EntrySource::File(path) => {
                copy_entry(&mut zip, entry, path, options, cancel)?;
            }
        }
        written.insert(entry.name.as_str());
    }

    let mut out = zip.finish()?;
    out.flush()?;
    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    let size = staged.as_file().metadata()?.len();
    Ok(StagedArchive {
        file: staged,
        size,
        entries: entries.len(),
    })
}

fn copy_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    entry: &PlannedEntry,
    source: &Path,
    options: &WriteOptions,
    cancel: &CancellationToken,
) -> Result<(), OptimizeError> {
    let mut input = File::open(source)?;
    let size = input.metadata()?.len();
    zip.start_file(entry.name.as_str(), entry_options(&entry.name, size))?;

    if size <= options.stream_threshold {
        let mut content = Vec::with_capacity(size as usize);
        input.read_to_end(&mut content)?;
        zip.write_all(&content)?;
        return Ok(());
    }

    let mut buffer = vec![0u8; STREAM_CHUNK];
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled_error().into());
        }
        let read = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        zip.write_all(&buffer[..read])?;
    }
    Ok(())
}
