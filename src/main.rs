//! # EPUB Optimizer - Main Entry Point
//!
//! Questo è il punto di ingresso principale dell'applicazione.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Caricamento della configurazione (file JSON + override da CLI)
//! - Avvio dell'optimizer e traduzione dell'esito in exit code
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (input, output, threads, timeout, etc.)
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose, `RUST_LOG` se presente)
//! 3. Valida che il file di input esista
//! 4. Costruisce la `Config` e la valida
//! 5. Istanzia `EpubOptimizer` con gli encoder esterni e avvia la run
//!
//! ## Exit code:
//! - 0: successo
//! - 1: errore generico / archivio illeggibile
//! - 2: output più grande dell'input
//! - 3: input troppo grande
//! - 4: timeout
//!
//! ## Esempio di utilizzo:
//! ```bash
//! epub-optimizer book.epub book_small.epub --threads 4 --timeout 120 --verbose
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use epub_optimizer::file_manager::FileManager;
use epub_optimizer::json_output::JsonMessage;
use epub_optimizer::{Config, EpubOptimizer, ExternalEncoder, ResourceOutcome, ToolPathResolver};

#[derive(Parser)]
#[command(name = "epub-optimizer")]
#[command(about = "Shrink EPUB files: minify markup, recompress images, subset fonts, deduplicate resources")]
struct Args {
    /// EPUB file to optimize
    input: Option<PathBuf>,

    /// Output file (default: <input>_optimized.epub)
    output: Option<PathBuf>,

    /// Maximum number of parallel workers
    #[arg(short, long)]
    threads: Option<usize>,

    /// Wall-clock budget for the whole run, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Minimum relative gain required to replace an image (0.0-1.0)
    #[arg(long)]
    min_improvement: Option<f64>,

    /// Keep the output even if it is larger than the input
    #[arg(short, long)]
    force: bool,

    /// Estimate savings without writing anything
    #[arg(long)]
    dry_run: bool,

    /// No progress bars
    #[arg(short, long)]
    quiet: bool,

    /// Emit one JSON event per line on stdout
    #[arg(long)]
    json: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Report which encoder tools are available and exit
    #[arg(long)]
    check_tools: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let json = args.json;

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            if json {
                JsonMessage::error("processing_error", format!("{:#}", e), 1).emit();
            } else {
                error!("{:#}", e);
            }
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    init_logging(args.verbose, args.json)?;

    let resolver = Arc::new(ToolPathResolver::new());
    if args.check_tools {
        println!("{}", resolver.tools_report());
        return Ok(ExitCode::SUCCESS);
    }

    let input = args
        .input
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No input file given"))?;
    if !input.is_file() {
        return Err(anyhow::anyhow!("Input file does not exist: {}", input.display()));
    }
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| FileManager::default_output_path(&input));

    let config = build_config(&args).await?;
    let missing: Vec<String> = epub_optimizer::tool_resolver::Tool::ALL
        .into_iter()
        .filter(|tool| !resolver.is_tool_available(*tool))
        .map(|tool| tool.to_string())
        .collect();
    if !missing.is_empty() {
        info!("Encoders not found (affected resources fall back or are skipped): {}", missing.join(", "));
    }

    if config.json_output {
        let input_size = std::fs::metadata(&input).map(|m| m.len()).unwrap_or(0);
        JsonMessage::start(input.clone(), output.clone(), input_size, &config).emit();
    }

    let encoder = ExternalEncoder::new(resolver, config.tool_timeout());
    let optimizer = EpubOptimizer::new(config, Arc::new(encoder));
    let summary = optimizer.run(&input, &output).await;

    if optimizer.config().json_output {
        JsonMessage::finished(&summary).emit();
    } else {
        for failure in summary.failures() {
            if let ResourceOutcome::Failed { reason } = &failure.outcome {
                info!("  failed: {} ({})", failure.name, reason);
            }
        }
        println!("{}", summary.format_summary());
    }

    let code = summary.failure.map(|reason| reason.exit_code()).unwrap_or(0);
    Ok(ExitCode::from(code as u8))
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let default_level = match (verbose, json) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("Cannot load configuration from {}", path.display()))?,
        None => Config::from_env(),
    };

    if let Some(threads) = args.threads {
        config.max_threads = Some(threads);
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(min_improvement) = args.min_improvement {
        config.min_improvement = min_improvement;
    }
    config.force |= args.force;
    config.dry_run |= args.dry_run;
    config.quiet |= args.quiet;
    config.json_output |= args.json;

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
