//! # Cancellation Module
//!
//! Token di cancellazione condiviso tra orchestratore, worker async e lavoro bloccante.
//!
//! ## Responsabilità:
//! - Il segnale di cancellazione è un `tokio_util::sync::CancellationToken`: i worker
//!   async attendono `cancelled()`, il lavoro bloccante controlla `is_cancelled()`
//! - Protegge il commit dell'archivio di destinazione: il commit e la cancellazione
//!   sono serializzati, quindi l'orchestratore sa sempre se un output è già stato
//!   pubblicato e può rimuoverlo

use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken as SignalToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GateState {
    #[default]
    Open,
    Committed,
    Closed,
}

/// Token clonabile, condiviso tra tutti i componenti di una run
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    signal: SignalToken,
    gate: Arc<Mutex<GateState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves once the run is cancelled
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }

    /// Cancel the run. Returns `true` if an output had already been committed.
    pub fn cancel(&self) -> bool {
        self.signal.cancel();
        let mut gate = self.lock_gate();
        let committed = *gate == GateState::Committed;
        *gate = GateState::Closed;
        committed
    }

    /// Run `publish` unless the run was cancelled; at most one commit per token
    pub fn commit<T, E>(&self, publish: impl FnOnce() -> Result<T, E>) -> Option<Result<T, E>> {
        let mut gate = self.lock_gate();
        if *gate != GateState::Open || self.is_cancelled() {
            return None;
        }
        let result = publish();
        if result.is_ok() {
            *gate = GateState::Committed;
        }
        Some(result)
    }

    fn lock_gate(&self) -> MutexGuard<'_, GateState> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
