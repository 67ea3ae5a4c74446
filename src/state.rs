//! # Run State Module
//!
//! Stato condiviso di una singola run, creato dall'orchestratore e scartato alla fine.
//!
//! ## Contenuto:
//! - Probe delle immagini indicizzati per fingerprint: contenuti identici non vengono
//!   decodificati due volte
//! - Insieme dei caratteri usati dal markup, calcolato una sola volta al primo font
//!
//! Nessuna persistenza su disco e nessuna cache globale: due run non condividono nulla.

use crate::fingerprint::Fingerprint;
use crate::policy::ImageSignal;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

pub type CharSet = BTreeSet<char>;

#[derive(Debug, Default)]
pub struct RunState {
    probes: Mutex<HashMap<Fingerprint, ImageSignal>>,
    used_chars: OnceCell<Arc<CharSet>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_probe(&self, fingerprint: &Fingerprint) -> Option<ImageSignal> {
        self.probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(fingerprint)
            .copied()
    }

    pub fn store_probe(&self, fingerprint: Fingerprint, signal: ImageSignal) {
        self.probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(fingerprint, signal);
    }

    pub fn probe_count(&self) -> usize {
        self.probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Used characters, computed by `init` on the first call only
    pub async fn used_chars<F, Fut>(&self, init: F) -> Arc<CharSet>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CharSet>,
    {
        self.used_chars
            .get_or_init(|| async move { Arc::new(init().await) })
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_probe_cache() {
        let state = RunState::new();
        let fp = Fingerprint::of_bytes(b"image");
        assert!(state.cached_probe(&fp).is_none());

        let signal = ImageSignal {
            width: 10,
            height: 20,
            dynamic_range: Some(100),
            distinct_colors: Some(3),
        };
        state.store_probe(fp.clone(), signal);
        assert_eq!(state.cached_probe(&fp), Some(signal));
        assert_eq!(state.probe_count(), 1);
    }

    #[tokio::test]
    async fn test_used_chars_computed_once() {
        let state = RunState::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let chars = state
                .used_chars(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "abc".chars().collect()
                })
                .await;
            assert_eq!(chars.len(), 3);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
