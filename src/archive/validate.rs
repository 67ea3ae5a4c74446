//! Controllo strutturale del container: leggibilità, `mimetype` come prima entry
//! non compressa con il contenuto atteso, presenza di `META-INF/container.xml`.

use super::{CONTAINER_ENTRY, EPUB_MIMETYPE, MIMETYPE_ENTRY};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use zip::{CompressionMethod, ZipArchive};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureReport {
    pub readable: bool,
    pub mimetype_first: bool,
    pub mimetype_stored: bool,
    pub mimetype_content_ok: bool,
    pub has_container: bool,
    pub entries: usize,
}

impl StructureReport {
    pub fn is_valid(&self) -> bool {
        self.readable
            && self.mimetype_first
            && self.mimetype_stored
            && self.mimetype_content_ok
            && self.has_container
    }

    pub fn problems(&self) -> Vec<&'static str> {
        let mut problems = Vec::new();
        if !self.readable {
            problems.push("archive unreadable");
            return problems;
        }
        if !self.mimetype_first {
            problems.push("mimetype is not the first entry");
        }
        if self.mimetype_first && !self.mimetype_stored {
            problems.push("mimetype is compressed");
        }
        if self.mimetype_first && !self.mimetype_content_ok {
            problems.push("unexpected mimetype content");
        }
        if !self.has_container {
            problems.push("missing META-INF/container.xml");
        }
        problems
    }
}

/// Inspect the container layout of `path`. Never fails; problems are reported as flags.
pub fn validate_structure(path: &Path) -> StructureReport {
    let mut report = StructureReport::default();
    let Ok(file) = File::open(path) else {
        return report;
    };
    let Ok(mut archive) = ZipArchive::new(BufReader::new(file)) else {
        return report;
    };
    report.readable = true;
    report.entries = archive.len();

    if let Ok(mut first) = archive.by_index(0) {
        if first.name() == MIMETYPE_ENTRY {
            report.mimetype_first = true;
            report.mimetype_stored = first.compression() == CompressionMethod::Stored;
            let mut content = String::new();
            if first.read_to_string(&mut content).is_ok() {
                report.mimetype_content_ok = content.trim() == EPUB_MIMETYPE;
            }
        }
    }

    report.has_container = archive.by_name(CONTAINER_ENTRY).is_ok();
    report
}
