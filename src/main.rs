//! # Trialscope CLI
//!
//! Command-line front end for the retrieval and deduplication core.
//!
//! ## Usage
//!
//! ```bash
//! trialscope --config ./config/trialscope.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trialscope ingest <entity> --file F --kind K` | Ledger-gated document ingestion |
//! | `trialscope search <entity> "<query>"` | Context-expanded semantic search |
//! | `trialscope extract <entity> "<topic>"` | Retrieval → extraction → dedup → export |
//! | `trialscope stats` | Index bundles, chunk counts, ledger size |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trialscope::config::{self, Config};
use trialscope::embedding::create_embedder;
use trialscope::error::IndexError;
use trialscope::extract::{create_extractor, create_validator, ExtractionRun};
use trialscope::index::SemanticIndexManager;
use trialscope::passage::build_passages;
use trialscope::{export, sources};

/// Trialscope — per-entity semantic retrieval and catalyst event
/// deduplication for clinical-trial document sets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/trialscope.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "trialscope",
    about = "Semantic retrieval and catalyst-event deduplication for clinical-trial documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trialscope.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Ingest documents into an entity's semantic index.
    ///
    /// Sources already recorded in the ingestion ledger are skipped, so
    /// re-running over the same file is safe and cheap.
    Ingest {
        /// Entity (company ticker) the documents belong to.
        entity: String,

        /// JSONL file of documents (`{"text": ..., "meta": {...}}` per line).
        #[arg(long)]
        file: PathBuf,

        /// Document kind recorded in the ledger (e.g. `10-Q`, `8-K`,
        /// `press release`).
        #[arg(long)]
        kind: String,
    },

    /// Search an entity's index.
    ///
    /// Hits are expanded with their neighboring chunks unless `--plain`
    /// is given.
    Search {
        /// Entity whose index to query.
        entity: String,

        /// The search query string.
        query: String,

        /// Number of top hits to retrieve (defaults from config).
        #[arg(long)]
        k: Option<usize>,

        /// Neighbor chunks to include on each side of a hit
        /// (defaults from config).
        #[arg(long)]
        window: Option<usize>,

        /// Return only the raw hits, without context expansion.
        #[arg(long)]
        plain: bool,
    },

    /// Extract catalyst events for a topic from an entity's documents.
    ///
    /// Retrieves context-expanded chunks, packs them into passages, runs
    /// the extraction pipeline, deduplicates, and writes the event set as
    /// JSON.
    Extract {
        /// Entity whose index to query.
        entity: String,

        /// Topic driving retrieval and extraction (e.g. "clinical trial
        /// catalysts").
        topic: String,

        /// Number of top hits to retrieve (defaults from config).
        #[arg(long)]
        k: Option<usize>,

        /// Neighbor chunks to include on each side of a hit
        /// (defaults from config).
        #[arg(long)]
        window: Option<usize>,

        /// Run the validation pass over each extracted batch.
        #[arg(long)]
        validate: bool,

        /// Output file (defaults to `events_<entity>_<timestamp>.json`;
        /// `-` prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show index bundles on disk, chunk counts, and ledger size.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(&cli.config)?;
    apply_env_fallbacks(&mut cfg);

    match cli.command {
        Commands::Ingest { entity, file, kind } => {
            run_ingest(&cfg, &entity, &file, &kind).await?;
        }
        Commands::Search {
            entity,
            query,
            k,
            window,
            plain,
        } => {
            run_search(&cfg, &entity, &query, k, window, plain).await?;
        }
        Commands::Extract {
            entity,
            topic,
            k,
            window,
            validate,
            output,
        } => {
            run_extract(&cfg, &entity, &topic, k, window, validate, output).await?;
        }
        Commands::Stats => {
            run_stats(&cfg).await?;
        }
    }

    Ok(())
}

/// The library takes keys from configuration only; the process
/// environment is consulted here, at the CLI boundary, as a fallback.
fn apply_env_fallbacks(cfg: &mut Config) {
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if cfg.embedding.api_key.is_none() {
            cfg.embedding.api_key = Some(key.clone());
        }
        if cfg.extraction.api_key.is_none() {
            cfg.extraction.api_key = Some(key);
        }
    }
}

async fn run_ingest(cfg: &Config, entity: &str, file: &std::path::Path, kind: &str) -> Result<()> {
    let docs = sources::read_documents(file)?;
    let embedder = create_embedder(&cfg.embedding)?;
    let mut manager = SemanticIndexManager::new(cfg, embedder)?;

    let summary = manager.add_documents(entity, &docs, kind).await?;
    println!(
        "{}: {} sources seen, {} indexed, {} skipped, {} failed, {} chunks written",
        entity,
        summary.sources_seen,
        summary.sources_indexed,
        summary.sources_skipped,
        summary.sources_failed,
        summary.chunks_written,
    );
    Ok(())
}

/// Read-only commands must not create an empty bundle file as a side
/// effect of loading a never-ingested entity.
fn require_bundle(manager: &SemanticIndexManager, entity: &str) -> Result<()> {
    if manager.bundle_path(entity).exists() {
        return Ok(());
    }
    Err(IndexError::NotInitialized {
        entity: entity.to_string(),
    }
    .into())
}

async fn run_search(
    cfg: &Config,
    entity: &str,
    query: &str,
    k: Option<usize>,
    window: Option<usize>,
    plain: bool,
) -> Result<()> {
    let k = k.unwrap_or(cfg.retrieval.top_k);
    let window = window.unwrap_or(cfg.retrieval.window);

    let embedder = create_embedder(&cfg.embedding)?;
    let mut manager = SemanticIndexManager::new(cfg, embedder)?;
    require_bundle(&manager, entity)?;
    manager.load(entity).await?;

    let chunks = if plain {
        manager.similarity_search(entity, query, k).await?
    } else {
        manager
            .similarity_search_with_context(entity, query, k, window)
            .await?
    };

    if chunks.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for chunk in &chunks {
        println!("[{} #{}] {}", chunk.source_id, chunk.chunk_index, chunk.text);
    }
    Ok(())
}

async fn run_extract(
    cfg: &Config,
    entity: &str,
    topic: &str,
    k: Option<usize>,
    window: Option<usize>,
    validate: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let k = k.unwrap_or(cfg.retrieval.top_k);
    let window = window.unwrap_or(cfg.retrieval.window);

    let embedder = create_embedder(&cfg.embedding)?;
    let mut manager = SemanticIndexManager::new(cfg, embedder)?;
    require_bundle(&manager, entity)?;
    manager.load(entity).await?;

    let chunks = manager
        .similarity_search_with_context(entity, topic, k, window)
        .await?;
    if chunks.is_empty() {
        println!("No indexed text matched the topic; nothing to extract.");
        return Ok(());
    }
    let passages = build_passages(&chunks, cfg.extraction.max_passage_chars);
    tracing::info!(chunks = chunks.len(), passages = passages.len(), "retrieval complete");

    let extractor = create_extractor(&cfg.extraction)?;
    let validator: Option<Arc<dyn trialscope::extract::Validator>> =
        if validate || cfg.extraction.validate {
            Some(create_validator(&cfg.extraction)?)
        } else {
            None
        };

    let run = ExtractionRun::new(extractor, validator, &cfg.extraction);
    let events = run.run(topic, &passages).await?;

    match output {
        Some(path) if path.as_os_str() == "-" => export::print_events(&events)?,
        Some(path) => export::write_events(&events, &path)?,
        None => export::write_events(&events, &export::default_output_path(entity))?,
    }
    println!("{} unique events extracted.", events.len());
    Ok(())
}

async fn run_stats(cfg: &Config) -> Result<()> {
    let embedder = create_embedder(&cfg.embedding)?;
    let mut manager = SemanticIndexManager::new(cfg, embedder)?;

    println!("Ledger: {} indexed sources", manager.ledger().len());

    let mut bundles: Vec<String> = Vec::new();
    if cfg.store.index_dir.is_dir() {
        for entry in std::fs::read_dir(&cfg.store.index_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("sqlite") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    bundles.push(stem.to_string());
                }
            }
        }
    }
    bundles.sort();

    if bundles.is_empty() {
        println!("No index bundles.");
        return Ok(());
    }
    for entity in &bundles {
        manager.load(entity).await?;
        let (chunks, vectors) = manager.counts(entity).await?;
        println!("{}: {} chunks, {} vectors", entity, chunks, vectors);
    }
    Ok(())
}
