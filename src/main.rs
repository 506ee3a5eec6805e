//! # MedKB CLI (`medkb`)
//!
//! | Command | Description |
//! |---------|-------------|
//! | `medkb init` | Create the SQLite database and run schema migrations |
//! | `medkb serve` | Start the HTTP server |
//! | `medkb ingest <dir>` | Ingest every supported file under a directory |
//! | `medkb search "<query>"` | Search the knowledge base from the terminal |
//! | `medkb stats` | Print aggregate corpus and queue statistics |
//!
//! All commands accept `--config` pointing to a TOML configuration file;
//! see `config/medkb.example.toml`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use medkb::config;
use medkb::engine::{Engine, SearchRequest, UploadMeta};
use medkb::search::SearchMode;
use medkb::{db, migrate, server};

#[derive(Parser)]
#[command(
    name = "medkb",
    about = "Clinical knowledge base retrieval engine",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/medkb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP server.
    Serve,

    /// Ingest every supported file under a directory (txt, md, csv, pdf,
    /// docx). Waits for the ingestion queue to drain before exiting.
    Ingest {
        /// Directory to scan recursively.
        dir: PathBuf,

        /// Category recorded on every ingested document.
        #[arg(long)]
        category: Option<String>,

        /// Section label recorded on every ingested document.
        #[arg(long)]
        section: Option<String>,

        /// Publication year recorded on every ingested document.
        #[arg(long)]
        year: Option<i64>,
    },

    /// Search the knowledge base.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Dense-similarity weight in [0, 1].
        #[arg(long)]
        alpha: Option<f64>,

        /// Search mode: `hybrid`, `local`, or `openai`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Filter by document category.
        #[arg(long)]
        category: Option<String>,

        /// Exclude documents published before this year.
        #[arg(long)]
        min_year: Option<i64>,

        /// Compose a cited answer from the top results.
        #[arg(long)]
        answer: bool,
    },

    /// Print aggregate statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medkb=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Serve => {
            let engine = Engine::new(cfg).await?;
            server::run_server(engine).await?;
        }
        Commands::Ingest {
            dir,
            category,
            section,
            year,
        } => {
            let engine = Engine::new(cfg).await?;
            run_ingest(&engine, &dir, category, section, year).await?;
        }
        Commands::Search {
            query,
            top_k,
            alpha,
            mode,
            category,
            min_year,
            answer,
        } => {
            let engine = Engine::new(cfg).await?;
            run_search(&engine, &query, top_k, alpha, &mode, category, min_year, answer).await?;
        }
        Commands::Stats => {
            let engine = Engine::new(cfg).await?;
            let snap = engine.statistics();
            println!("{}", serde_json::to_string_pretty(&snap)?);
        }
    }
    Ok(())
}

const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "csv", "pdf", "docx"];

async fn run_ingest(
    engine: &Engine,
    dir: &std::path::Path,
    category: Option<String>,
    section: Option<String>,
    year: Option<i64>,
) -> Result<()> {
    let meta = UploadMeta {
        category,
        section,
        year,
    };

    let mut events = engine.queue.subscribe();
    let mut accepted = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        if !ext.is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str())) {
            continue;
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        let bytes = std::fs::read(path)?;
        let outcome = engine.ingest_file(&filename, bytes, &meta).await;
        match outcome.status.as_str() {
            "success" => {
                accepted += 1;
                println!(
                    "  queued  {} ({} chunks planned)",
                    filename,
                    outcome.chunks.unwrap_or(0)
                );
            }
            "skipped" => {
                skipped += 1;
                println!("  skipped {} (duplicate)", filename);
            }
            _ => {
                failed += 1;
                println!(
                    "  error   {}: {}",
                    filename,
                    outcome.reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    while !engine.queue.is_idle() {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(event)) if event.status.is_terminal() => {
                println!(
                    "  {} {} ({}/{} chunks)",
                    event.status.as_str(),
                    event.document_id,
                    event.current_chunk,
                    event.total_chunks
                );
            }
            _ => {}
        }
    }

    println!(
        "Done: {} accepted, {} skipped, {} failed.",
        accepted, skipped, failed
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_search(
    engine: &Engine,
    query: &str,
    top_k: Option<usize>,
    alpha: Option<f64>,
    mode: &str,
    category: Option<String>,
    min_year: Option<i64>,
    answer: bool,
) -> Result<()> {
    let mut options = engine.default_options();
    if let Some(top_k) = top_k {
        options.top_k = top_k;
    }
    if let Some(alpha) = alpha {
        options.alpha = alpha;
    }
    options.mode = SearchMode::parse(mode)
        .ok_or_else(|| anyhow::anyhow!("unknown search mode: '{}'", mode))?;
    options.filters.category = category;
    options.filters.min_year = min_year;

    let request = SearchRequest {
        query: query.to_string(),
        options,
        synthesize_answer: answer,
        verify_answer: false,
    };
    let outcome = engine.search(&request).await?;

    if outcome.results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in outcome.results.iter().enumerate() {
        let snippet: String = result.text.chars().take(160).collect();
        println!(
            "{:2}. [{:.3}] {} (chunk {})",
            i + 1,
            result.score,
            result.citation.filename,
            result.citation.chunk_index
        );
        println!("      {}", snippet.replace('\n', " "));
    }
    if let Some(synthesized) = outcome.answer {
        println!("\nAnswer:\n{}", synthesized.text);
        for (i, citation) in synthesized.citations.iter().enumerate() {
            println!("  [{}] {}", i + 1, citation.filename);
        }
    }
    Ok(())
}
