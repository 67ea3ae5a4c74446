//! # Fingerprint Module
//!
//! Digest usato per rilevare risorse duplicate.
//!
//! ## Strategia:
//! - File sotto `sample_threshold`: SHA-256 dell'intero contenuto
//! - File sopra la soglia: SHA-256 di (dimensione, primi K byte, ultimi K byte)
//! - `full_hash = true` forza sempre l'hash completo
//!
//! Il digest campionato può collidere per file della stessa dimensione con testa e coda
//! identiche ma parte centrale diversa. Per immagini e font il rischio è accettato;
//! per i file testuali il deduplicatore esegue sempre un confronto byte per byte.

use crate::config::Config;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintSettings {
    pub sample_threshold: u64,
    pub window: u64,
    pub full_hash: bool,
}

impl Default for FingerprintSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for FingerprintSettings {
    fn from(config: &Config) -> Self {
        Self {
            sample_threshold: config.thresholds.fingerprint_sample,
            window: config.thresholds.fingerprint_window,
            full_hash: config.full_hash,
        }
    }
}

/// Content digest of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    digest: String,
    sampled: bool,
}

impl Fingerprint {
    pub fn of_file(path: &Path, settings: &FingerprintSettings) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();

        if settings.full_hash || size < settings.sample_threshold {
            Self::full(&mut file)
        } else {
            Self::sampled(&mut file, size, settings.window)
        }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"full:");
        hasher.update(bytes);
        Self {
            digest: hex::encode(hasher.finalize()),
            sampled: false,
        }
    }

    fn full(file: &mut File) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(b"full:");
        let mut buffer = vec![0u8; READ_CHUNK];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(Self {
            digest: hex::encode(hasher.finalize()),
            sampled: false,
        })
    }

    fn sampled(file: &mut File, size: u64, window: u64) -> io::Result<Self> {
        let window = window.min(size) as usize;
        let mut head = vec![0u8; window];
        file.read_exact(&mut head)?;

        let mut tail = vec![0u8; window];
        file.seek(SeekFrom::Start(size - window as u64))?;
        file.read_exact(&mut tail)?;

        let mut hasher = Sha256::new();
        hasher.update(b"sampled:");
        hasher.update(size.to_le_bytes());
        hasher.update(&head);
        hasher.update(&tail);
        Ok(Self {
            digest: hex::encode(hasher.finalize()),
            sampled: true,
        })
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.digest[..16])
    }
}

/// Byte-exact comparison of two files, streaming both
pub fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let mut fa = File::open(a)?;
    let mut fb = File::open(b)?;
    if fa.metadata()?.len() != fb.metadata()?.len() {
        return Ok(false);
    }

    let mut buf_a = vec![0u8; READ_CHUNK];
    let mut buf_b = vec![0u8; READ_CHUNK];
    loop {
        let read_a = read_full(&mut fa, &mut buf_a)?;
        let read_b = read_full(&mut fb, &mut buf_b)?;
        if read_a != read_b || buf_a[..read_a] != buf_b[..read_b] {
            return Ok(false);
        }
        if read_a == 0 {
            return Ok(true);
        }
    }
}

fn read_full(file: &mut File, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
