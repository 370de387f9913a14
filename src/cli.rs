use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ticket_topology::config::PipelineConfig;
use ticket_topology::embedding::{Embedder, EmbeddingStore, MemoryStore};
use ticket_topology::label::Summarizer;
use ticket_topology::local::{HashingEmbedder, KeywordSummarizer};
use ticket_topology::normalize::Normalizer;
use ticket_topology::output::read_result;
use ticket_topology::source::{JsonFileSource, TicketSource};
use ticket_topology::validate::validate_structure;
use ticket_topology::{CancelToken, Pipeline};

#[derive(Parser)]
#[command(
    name = "ticket-topology",
    version,
    about = "Group support tickets into a hierarchy of recurring problems"
)]
struct Cli {
    /// Config file (JSON). Falls back to $TICKET_TOPOLOGY_CONFIG, then XDG
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis for one system and window
    Run {
        /// Source system, e.g. ERP
        #[arg(short, long)]
        system: String,
        /// Window length in days
        #[arg(short, long, default_value_t = 30)]
        days: u32,
        /// JSON file with an array of tickets
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// SQLite database with a `tickets` table
        #[arg(long)]
        sqlite: Option<PathBuf>,
        /// Use the local hashing embedder and keyword summarizer
        #[arg(long)]
        offline: bool,
        /// Keep embeddings in memory only
        #[arg(long)]
        no_cache: bool,
        /// Override the output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Override the minimum cluster size
        #[arg(long)]
        min_cluster_size: Option<usize>,
        /// Derive the minimum cluster size from the ticket count
        #[arg(long)]
        auto_tune: bool,
    },
    /// Print the normalized comparison text and fingerprint of each ticket
    Normalize {
        /// JSON file with an array of tickets
        input: PathBuf,
    },
    /// Re-check the invariants of a persisted result
    Validate {
        /// Result file written by `run`
        result: PathBuf,
    },
    /// Inspect or clear the embedding cache
    #[cfg(feature = "cache")]
    Cache {
        #[command(subcommand)]
        action: CacheAction,
        /// Cache file; defaults to the configured one
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[cfg(feature = "cache")]
#[derive(Subcommand)]
enum CacheAction {
    /// Entry count per model and dimensions, and age range
    Info,
    /// Delete every cached embedding
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Run {
            system,
            days,
            input,
            sqlite,
            offline,
            no_cache,
            output_dir,
            min_cluster_size,
            auto_tune,
        } => {
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            if let Some(size) = min_cluster_size {
                config.min_cluster_size = size;
            }
            config.auto_tune |= auto_tune;
            config.validate().context("invalid configuration")?;

            let source = open_source(input, sqlite)?;
            cmd_run(config, source.as_ref(), &system, days, offline, no_cache).await
        }
        Commands::Normalize { input } => cmd_normalize(&config, &input),
        Commands::Validate { result } => cmd_validate(&result),
        #[cfg(feature = "cache")]
        Commands::Cache { action, path } => cmd_cache(&config, path, action),
    }
}

fn open_source(input: Option<PathBuf>, sqlite: Option<PathBuf>) -> Result<Box<dyn TicketSource>> {
    match (input, sqlite) {
        (Some(_), Some(_)) => bail!("--input and --sqlite are mutually exclusive"),
        (Some(path), None) => Ok(Box::new(JsonFileSource::new(path))),
        #[cfg(feature = "cache")]
        (None, Some(path)) => {
            let source =
                ticket_topology::source::SqliteTicketSource::open(&path.to_string_lossy())
                    .with_context(|| format!("failed to open {}", path.display()))?;
            Ok(Box::new(source))
        }
        #[cfg(not(feature = "cache"))]
        (None, Some(_)) => bail!("built without the `cache` feature; use --input"),
        (None, None) => bail!("either --input or --sqlite is required"),
    }
}

async fn cmd_run(
    config: PipelineConfig,
    source: &dyn TicketSource,
    system: &str,
    days: u32,
    offline: bool,
    no_cache: bool,
) -> Result<()> {
    let store = open_store(&config, no_cache)?;
    let (embedder, summarizer) = capabilities(&config, offline)?;

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after the current stage");
            on_signal.cancel();
        }
    });

    let pipeline = Pipeline::new(config, store, embedder, summarizer)?.with_cancel(cancel);
    let outcome = pipeline
        .run(source, system, days)
        .await
        .with_context(|| format!("analysis of {system} over {days} days failed"))?;

    let meta = &outcome.result.metadata;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "path": outcome.path,
            "run_id": meta.run_id,
            "total_tickets": meta.total_tickets,
            "total_nodes": meta.total_nodes,
            "noise_ratio": meta.noise_ratio,
            "cache": meta.cache,
        }))?
    );
    Ok(())
}

fn open_store(config: &PipelineConfig, no_cache: bool) -> Result<Arc<dyn EmbeddingStore>> {
    if no_cache {
        return Ok(Arc::new(MemoryStore::new()));
    }
    #[cfg(feature = "cache")]
    {
        let path = cache_path(config, None);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = ticket_topology::algo::storage::SqliteStore::open_or_create(
            &path.to_string_lossy(),
        )
        .with_context(|| format!("failed to open embedding cache {}", path.display()))?;
        info!(cache = %path.display(), "embedding cache opened");
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "cache"))]
    {
        let _ = config;
        Ok(Arc::new(MemoryStore::new()))
    }
}

#[cfg(feature = "cache")]
fn cache_path(config: &PipelineConfig, explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| config.cache_path.clone())
        .unwrap_or_else(|| config.output_dir.join("embeddings.sqlite"))
}

fn capabilities(
    config: &PipelineConfig,
    offline: bool,
) -> Result<(Arc<dyn Embedder>, Arc<dyn Summarizer>)> {
    if offline {
        let dims = config.embedding_dimensions.unwrap_or(256);
        return Ok((
            Arc::new(HashingEmbedder::new(dims)),
            Arc::new(KeywordSummarizer::default()),
        ));
    }
    #[cfg(feature = "openai")]
    {
        use ticket_topology::config::OpenAiSettings;
        use ticket_topology::openai::{OpenAiEmbedder, OpenAiSummarizer};

        let settings = OpenAiSettings::from_env();
        let embedder = OpenAiEmbedder::new(&settings, config.embedding_dimensions)
            .context("embedding capability unavailable (use --offline to run without it)")?;
        let summarizer = OpenAiSummarizer::new(&settings)
            .context("text-generation capability unavailable")?;
        Ok((Arc::new(embedder), Arc::new(summarizer)))
    }
    #[cfg(not(feature = "openai"))]
    {
        let _ = config;
        bail!("built without the `openai` feature; pass --offline")
    }
}

fn cmd_normalize(config: &PipelineConfig, input: &Path) -> Result<()> {
    let tickets = JsonFileSource::new(input)
        .read_all()
        .with_context(|| format!("failed to read {}", input.display()))?;
    let normalizer = Normalizer::new(&config.boilerplate_patterns)
        .context("invalid boilerplate pattern")?;
    let normalized = normalizer.normalize_batch(&tickets);
    println!("{}", serde_json::to_string_pretty(&normalized)?);
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let result =
        read_result(path).with_context(|| format!("failed to read {}", path.display()))?;
    let assigned = validate_structure(&result)
        .with_context(|| format!("{} is inconsistent", path.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "path": path,
            "valid": true,
            "total_tickets": assigned.len(),
            "total_nodes": result.metadata.total_nodes,
        }))?
    );
    Ok(())
}

#[cfg(feature = "cache")]
fn cmd_cache(config: &PipelineConfig, path: Option<PathBuf>, action: CacheAction) -> Result<()> {
    use ticket_topology::algo::storage::SqliteStore;

    let path = cache_path(config, path);
    if !path.exists() {
        bail!("no embedding cache at {}", path.display());
    }
    let store = SqliteStore::open_or_create(&path.to_string_lossy())
        .with_context(|| format!("failed to open {}", path.display()))?;
    let report = match action {
        CacheAction::Info => {
            let info = store.info()?;
            json!({
                "path": path,
                "entries": info.entries,
                "models": info.models
                    .iter()
                    .map(|m| json!({
                        "model": m.model,
                        "dimensions": m.dimensions,
                        "entries": m.entries,
                    }))
                    .collect::<Vec<_>>(),
                "oldest": info.oldest,
                "newest": info.newest,
                "size_bytes": info.size_bytes,
            })
        }
        CacheAction::Clear => {
            let removed = store.clear()?;
            info!(removed, "embedding cache cleared");
            json!({ "path": path, "removed": removed })
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
