//! # Archive Module
//!
//! Lettura e scrittura del container ZIP di un EPUB.
//!
//! ## Componenti:
//! - `reader`: estrazione streaming delle entry nella working directory
//! - `writer`: ordinamento deterministico delle entry e scrittura con compressione massima
//! - `validate`: controllo di integrità strutturale (mimetype, container.xml)

pub mod reader;
pub mod validate;
pub mod writer;

pub use reader::{extract_archive, ExtractOptions, ExtractReport, ExtractedEntry, SkippedEntry};
pub use validate::{validate_structure, StructureReport};
pub use writer::{plan_entries, write_archive, EntrySource, PlannedEntry, StagedArchive, WriteOptions};

/// Reserved first entry of an EPUB container
pub const MIMETYPE_ENTRY: &str = "mimetype";
/// Expected content of the `mimetype` entry
pub const EPUB_MIMETYPE: &str = "application/epub+zip";
/// Package pointer required by the container format
pub const CONTAINER_ENTRY: &str = "META-INF/container.xml";

/// Chunk size used when streaming large entries
pub(crate) const STREAM_CHUNK: usize = 1024 * 1024;

pub(crate) fn cancelled_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Interrupted, "operation cancelled")
}
