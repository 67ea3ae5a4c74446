//! # Archive Reader
//!
//! Estrae le entry del container sorgente in una directory, decomprimendo al volo.
//!
//! ## Comportamento:
//! - Le entry directory vengono saltate
//! - Le entry oltre `stream_threshold` vengono copiate a blocchi limitati, mai caricate intere
//! - Un errore su una singola entry viene loggato e l'entry viene saltata
//! - Nomi non sicuri (assoluti o con `..`) vengono saltati
//! - Solo l'impossibilità di aprire l'archivio è fatale (`ArchiveUnreadable`)

use super::{cancelled_error, STREAM_CHUNK};
use crate::cancel::CancellationToken;
use crate::error::OptimizeError;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path};
use tracing::{debug, warn};
use zip::ZipArchive;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub stream_threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    /// Normalized `/`-separated entry name
    pub name: String,
    pub size: u64,
    pub streamed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: String,
}

/// Risultato dell'estrazione, nell'ordine originale delle entry
#[derive(Debug, Clone, Default)]
pub struct ExtractReport {
    pub entries: Vec<ExtractedEntry>,
    pub skipped: Vec<SkippedEntry>,
    pub directories: usize,
}

impl ExtractReport {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

/// Extract every file entry of `source` under `dest`
pub fn extract_archive(
    source: &Path,
    dest: &Path,
    options: &ExtractOptions,
    cancel: &CancellationToken,
) -> Result<ExtractReport, OptimizeError> {
    let file = File::open(source).map_err(|e| OptimizeError::unreadable(source, e))?;
    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(|e| OptimizeError::unreadable(source, e))?;

    fs::create_dir_all(dest)?;
    let mut report = ExtractReport::default();

    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(cancelled_error().into());
        }

        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry #{}: {}", index, e);
                report.skipped.push(SkippedEntry {
                    name: format!("#{}", index),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let raw_name = entry.name().to_string();
        if entry.is_dir() {
            report.directories += 1;
            continue;
        }

        let relative = match entry.enclosed_name() {
            Some(path) => path,
            None => {
                warn!("Skipping entry with unsafe name: {}", raw_name);
                report.skipped.push(SkippedEntry {
                    name: raw_name,
                    reason: "unsafe path".to_string(),
                });
                continue;
            }
        };

        let name = normalized_name(&relative);
        let target = dest.join(&relative);
        let size = entry.size();
        let streamed = size > options.stream_threshold;

        match write_entry(&mut entry, &target, streamed, size, cancel) {
            Ok(written) => {
                debug!("Extracted {} ({} bytes{})", name, written, if streamed { ", streamed" } else { "" });
                report.entries.push(ExtractedEntry {
                    name,
                    size: written,
                    streamed,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted && cancel.is_cancelled() => {
                return Err(e.into());
            }
            Err(e) => {
                warn!("Skipping entry {}: {}", name, e);
                let _ = fs::remove_file(&target);
                report.skipped.push(SkippedEntry {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(report)
}

fn write_entry(
    entry: &mut impl Read,
    target: &Path,
    streamed: bool,
    declared_size: u64,
    cancel: &CancellationToken,
) -> io::Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    if !streamed {
        let mut content = Vec::with_capacity(declared_size as usize);
        entry.read_to_end(&mut content)?;
        fs::write(target, &content)?;
        return Ok(content.len() as u64);
    }

    let mut out = BufWriter::new(File::create(target)?);
    let mut buffer = vec![0u8; STREAM_CHUNK];
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        let read = entry.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])?;
        written += read as u64;
    }
    out.flush()?;
    Ok(written)
}

/// `/`-joined entry name for a relative path
pub(crate) fn normalized_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
