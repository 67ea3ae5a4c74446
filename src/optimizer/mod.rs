//! # Optimizer Module
//!
//! Orchestrazione della pipeline, separata in sottomoduli:
//! - `epub_optimizer`: orchestratore principale (fasi, timeout, summary)
//! - `task_optimizer`: worker pool per gruppo di risorse
//! - `progress_tracker`: progress bar ed eventi JSON per gruppo
//! - `encoder`: interfaccia verso gli encoder esterni

pub mod encoder;
pub mod epub_optimizer;
pub mod progress_tracker;
pub mod task_optimizer;

pub use encoder::{EncodeJob, EncodeOp, Encoder, ExternalEncoder};
pub use epub_optimizer::EpubOptimizer;
pub use progress_tracker::ProgressTracker;
pub use task_optimizer::TaskOptimizer;
