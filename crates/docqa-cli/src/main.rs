//! CLI entry point for the docqa backend: one-shot questions for dev and testing, and the
//! HTTP server.

mod server;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docqa_core::{
    app_data_dir, extractor_for_path, load_config, status, Config, Embedder, HashingEmbedder,
    OllamaClient, PdfExtractor, RetrievalPipeline, TextExtractor,
};
use tokio::runtime::{Handle, Runtime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "docqa")]
#[command(about = "docqa: ask questions about a single document, answered only from its text")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show backend status (for dev).
    Status,
    /// Show where docqa stores its config (app data directory).
    DataDir,
    /// Print the effective configuration as TOML.
    Config,
    /// Index a PDF or text file and answer one question about it.
    Ask {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(value_name = "QUESTION")]
        question: String,
        /// Embed locally with the hashing embedder instead of Ollama.
        #[arg(long)]
        offline: bool,
    },
    /// Index a file and list the chunks a question would retrieve, with scores.
    Search {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(value_name = "QUERY")]
        query: String,
        /// Embed locally with the hashing embedder instead of Ollama.
        #[arg(long)]
        offline: bool,
    },
    /// Serve the HTTP API (/health, /upload-pdf, /ask).
    Serve {
        /// Address to bind (host:port). Defaults to `bind` from the config file.
        #[arg(long)]
        bind: Option<String>,
        /// Embed locally with the hashing embedder instead of Ollama.
        #[arg(long)]
        offline: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Status)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            println!("docqa backend");
            println!("  core: {}", status());
        }
        Commands::DataDir => {
            let dir = app_data_dir().context("could not determine app data directory")?;
            println!("{}", dir.display());
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&load_config())?);
        }
        Commands::Ask {
            path,
            question,
            offline,
        } => {
            let config = load_config();
            let runtime = build_runtime(&config)?;
            let pipeline = load_document(&config, runtime.handle(), &path, offline)?;
            println!("{}", pipeline.answer(&question)?);
        }
        Commands::Search {
            path,
            query,
            offline,
        } => {
            let config = load_config();
            let runtime = build_runtime(&config)?;
            let pipeline = load_document(&config, runtime.handle(), &path, offline)?;
            let hits = pipeline.retrieve(&query)?;
            println!("{} chunk(s) above {:.2}", hits.len(), config.score_threshold);
            for hit in hits {
                println!("  [{:>4}] {:.3}  {}", hit.index, hit.score, preview(&hit.text, 80));
            }
        }
        Commands::Serve { bind, offline } => {
            let config = load_config();
            let runtime = build_runtime(&config)?;
            let pipeline = build_pipeline(&config, runtime.handle(), Arc::new(PdfExtractor), offline)?;
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            runtime.block_on(server::serve(Arc::new(pipeline), &bind))?;
        }
    }
    Ok(())
}

/// Multi-threaded so the Ollama client can block on it from worker threads. The blocking
/// pool is what runs ingestion and answering for the server.
fn build_runtime(config: &Config) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.blocking_threads.max(1))
        .build()
        .context("failed to start tokio runtime")
}

fn build_pipeline(
    config: &Config,
    runtime: &Handle,
    extractor: Arc<dyn TextExtractor>,
    offline: bool,
) -> Result<RetrievalPipeline> {
    let ollama = OllamaClient::from_url(&config.ollama_url, runtime.clone())?
        .with_embed_model(&config.embedding_model)
        .with_generation_model(&config.generation_model)
        .with_timeout(config.generation_timeout());
    let embedder: Arc<dyn Embedder> = if offline {
        Arc::new(HashingEmbedder::default())
    } else {
        Arc::new(ollama.clone())
    };
    Ok(RetrievalPipeline::from_config(
        config,
        extractor,
        embedder,
        Arc::new(ollama),
    )?)
}

fn load_document(
    config: &Config,
    runtime: &Handle,
    path: &Path,
    offline: bool,
) -> Result<RetrievalPipeline> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let pipeline = build_pipeline(config, runtime, extractor_for_path(path).into(), offline)?;
    let chunks = pipeline.ingest(&bytes)?;
    eprintln!("Indexed {} chunk(s) from {}", chunks, path.display());
    Ok(pipeline)
}

fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
