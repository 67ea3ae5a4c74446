//! # EPUB Optimizer Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare della pipeline
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori
//!
//! ## Architettura dei moduli:
//! - `config`: Gestione configurazione e validazione parametri
//! - `error`: Tipi di errore di run e di encoder
//! - `archive`: Lettura, scrittura e validazione del container ZIP
//! - `resource` / `classifier`: Modello delle risorse e classificazione per estensione
//! - `fingerprint` / `dedup`: Fingerprint del contenuto e deduplicazione
//! - `image_processor`, `text_processor`, `font_processor`: Ottimizzazione per categoria
//! - `policy` / `resize` / `sfnt`: Decisioni di ottimizzazione e parsing dei font
//! - `optimizer`: Orchestratore, worker pool ed encoder esterni
//! - `summary`, `progress`, `json_output`: Risultato della run e reporting
//!
//! ## Utilizzo:
//! ```rust,ignore
//! use epub_optimizer::{Config, EpubOptimizer, ExternalEncoder, ToolPathResolver};
//!
//! let config = Config::default();
//! let encoder = ExternalEncoder::new(Arc::new(ToolPathResolver::new()), config.tool_timeout());
//! let optimizer = EpubOptimizer::new(config, Arc::new(encoder));
//! let summary = optimizer.optimize(&source, &dest).await?;
//! ```

pub mod archive;
pub mod cancel;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod error;
pub mod file_manager;
pub mod fingerprint;
pub mod font_processor;
pub mod image_processor;
pub mod json_output;
pub mod optimizer;
pub mod policy;
pub mod progress;
pub mod resize;
pub mod resource;
pub mod sfnt;
pub mod state;
pub mod summary;
pub mod text_processor;
pub mod tool_resolver;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{FailureReason, OptimizeError};
pub use optimizer::{EpubOptimizer, ExternalEncoder};
pub use resource::{Resource, ResourceKind, ResourceOutcome};
pub use summary::RunSummary;
pub use tool_resolver::ToolPathResolver;
