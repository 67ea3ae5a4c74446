//! # JSON Output Module
//!
//! Output strutturato in JSON (una riga per evento) per l'uso da script e pipeline CI.
//!
//! ## Tipi di messaggi:
//! - `start`: inizio della run, con sorgente, destinazione e configurazione effettiva
//! - `progress`: avanzamento del gruppo corrente
//! - `resource_complete`: esito di una singola risorsa
//! - `complete`: fine della run con il `RunSummary` completo
//! - `error`: fallimento a livello di run

use crate::config::Config;
use crate::resource::{ResourceCategory, ResourceOutcome};
use crate::summary::RunSummary;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tipo di messaggio JSON
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JsonMessage {
    #[serde(rename = "start")]
    Start {
        input: PathBuf,
        output: PathBuf,
        input_size: u64,
        config: JsonConfig,
    },

    #[serde(rename = "progress")]
    Progress {
        category: ResourceCategory,
        current: usize,
        total: usize,
        percentage: f64,
    },

    #[serde(rename = "resource_complete")]
    ResourceComplete {
        name: String,
        #[serde(flatten)]
        outcome: ResourceOutcome,
    },

    #[serde(rename = "complete")]
    Complete {
        #[serde(flatten)]
        summary: RunSummary,
    },

    #[serde(rename = "error")]
    Error {
        reason: String,
        message: String,
        exit_code: i32,
    },
}

/// Configurazione effettiva riportata nell'evento `start`
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonConfig {
    pub workers: usize,
    pub timeout_secs: u64,
    pub min_improvement: f64,
    pub force: bool,
    pub dry_run: bool,
    pub constrained: bool,
}

impl JsonMessage {
    /// Emette il messaggio JSON su stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    pub fn start(input: PathBuf, output: PathBuf, input_size: u64, config: &Config) -> Self {
        Self::Start {
            input,
            output,
            input_size,
            config: JsonConfig::from(config),
        }
    }

    pub fn progress(category: ResourceCategory, current: usize, total: usize) -> Self {
        let percentage = if total > 0 {
            (current as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self::Progress {
            category,
            current,
            total,
            percentage,
        }
    }

    pub fn resource_complete(name: &str, outcome: &ResourceOutcome) -> Self {
        Self::ResourceComplete {
            name: name.to_string(),
            outcome: outcome.clone(),
        }
    }

    /// `complete` for successful runs, `error` otherwise
    pub fn finished(summary: &RunSummary) -> Self {
        match summary.failure {
            Some(reason) if !summary.success => Self::Error {
                reason: reason.as_str().to_string(),
                message: summary.message.clone().unwrap_or_default(),
                exit_code: reason.exit_code(),
            },
            _ => Self::Complete {
                summary: summary.clone(),
            },
        }
    }

    pub fn error(reason: &str, message: String, exit_code: i32) -> Self {
        Self::Error {
            reason: reason.to_string(),
            message,
            exit_code,
        }
    }
}

impl From<&Config> for JsonConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.effective_workers(),
            timeout_secs: config.timeout_secs,
            min_improvement: config.min_improvement,
            force: config.force,
            dry_run: config.dry_run,
            constrained: config.constrained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OptimizeError;
    use crate::summary::SummaryBuilder;
    use std::time::{Duration, Instant};

    #[test]
    fn test_message_shapes() {
        let json = serde_json::to_value(JsonMessage::progress(ResourceCategory::Image, 1, 4)).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percentage"], 25.0);

        let outcome = ResourceOutcome::Deduplicated {
            canonical: "a.png".into(),
        };
        let json = serde_json::to_value(JsonMessage::resource_complete("b.png", &outcome)).unwrap();
        assert_eq!(json["type"], "resource_complete");
        assert_eq!(json["status"], "deduplicated");
        assert_eq!(json["canonical"], "a.png");
    }

    #[test]
    fn test_finished_picks_event_type() {
        let ok = SummaryBuilder::new(Instant::now(), 100, false).finish(&[], 80);
        let json = serde_json::to_value(JsonMessage::finished(&ok)).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["bytes_saved"], 20);

        let err = OptimizeError::SizeIncreased {
            input_size: 10,
            output_size: 12,
            increase: 2,
        };
        let failed = RunSummary::from_error(&err, 10, Duration::ZERO, false);
        let json = serde_json::to_value(JsonMessage::finished(&failed)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["reason"], "size_increase");
        assert_eq!(json["exit_code"], 2);
    }
}
