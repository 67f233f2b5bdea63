use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use docintel::ai::middleware::AiMiddleware;
use docintel::ai::ollama::OllamaProvider;
use docintel::ai::{AiProvider, ProviderHandle};
use docintel::config::{Config, EmbeddingBackend, ServerMode};
use docintel::db::VectorStore;
use docintel::embedder::Embedder;
use docintel::embedder::hash::HashEmbedder;
use docintel::embedder::ollama::OllamaEmbedder;
use docintel::extract::ExtractorSet;
use docintel::indexer::{IndexMode, IndexingPipeline};
use docintel::mcp::{Dispatcher, RagServices, serve_stdio};

#[derive(Parser)]
#[command(name = "docintel", version, about = "Local document intelligence server")]
struct Cli {
    /// Configuration file (defaults to ./docintel.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory to serve, overriding the configured root
    #[arg(long, global = true)]
    root: Option<String>,

    /// Tool set to expose, overriding the configured mode
    #[arg(long, value_enum, global = true)]
    mode: Option<ModeArg>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Rag,
    Basic,
}

#[derive(Subcommand)]
enum Command {
    /// Serve requests on stdin/stdout (default)
    Serve {
        /// Do not bring the index up to date at startup
        #[arg(long)]
        no_initial_index: bool,
    },
    /// Index the root once, print the report and exit
    Index {
        /// Rebuild from scratch instead of processing changed files only
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries MCP frames; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(mode) = cli.mode {
        config.mode = match mode {
            ModeArg::Rag => ServerMode::Rag,
            ModeArg::Basic => ServerMode::Basic,
        };
    }
    config.validate().context("invalid configuration")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down...");
                shutdown.cancel();
            }
        });
    }

    match cli.command.unwrap_or(Command::Serve {
        no_initial_index: false,
    }) {
        Command::Serve { no_initial_index } => serve(config, no_initial_index, shutdown).await,
        Command::Index { force } => index_once(config, force, shutdown).await,
    }
}

fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    Ok(match config.embedding.provider {
        EmbeddingBackend::Hash => Arc::new(HashEmbedder::new(config.embedding.dimensions)),
        EmbeddingBackend::Ollama => Arc::new(
            OllamaEmbedder::new(&config.embedding).context("failed to build Ollama embedder")?,
        ),
    })
}

fn build_pipeline(config: &Config, middleware: Arc<AiMiddleware>) -> Result<IndexingPipeline> {
    let db_path = config.resolved_db_path()?;
    let store = VectorStore::open(
        &db_path,
        config.embedding.dimensions,
        config.indexing.pool_size,
    )
    .with_context(|| format!("failed to open index at {}", db_path.display()))?;

    Ok(IndexingPipeline::new(
        Arc::new(store),
        ExtractorSet::with_defaults(),
        build_embedder(config)?,
        middleware,
        config.indexing.clone(),
    ))
}

async fn index_once(config: Config, force: bool, shutdown: CancellationToken) -> Result<()> {
    let middleware = Arc::new(AiMiddleware::new(config.middleware.clone()));
    let pipeline = build_pipeline(&config, middleware)?;
    let mode = if force {
        IndexMode::Full
    } else {
        IndexMode::Incremental
    };

    let result = pipeline.run(&config.root_dir()?, mode, &shutdown).await;
    pipeline.store().close();
    let result = result.context("indexing failed")?;

    println!("{}", result.summary());
    Ok(())
}

async fn serve(config: Config, no_initial_index: bool, shutdown: CancellationToken) -> Result<()> {
    let root = config.root_dir()?;
    anyhow::ensure!(root.is_dir(), "root {} is not a directory", root.display());
    info!("Starting docintel on {} ({:?} mode)", root.display(), config.mode);

    let provider = Arc::new(
        OllamaProvider::new(&config.provider).context("failed to build generation provider")?,
    );
    {
        let provider = provider.clone();
        tokio::spawn(async move {
            if !provider.is_available().await {
                warn!(
                    "Provider {} at {} is not reachable; AI tools will fail until it is",
                    provider.provider_name(),
                    provider.base_url()
                );
            }
        });
    }

    let middleware = Arc::new(AiMiddleware::new(config.middleware.clone()));
    let mut dispatcher = Dispatcher::new(
        root,
        ProviderHandle::new(provider),
        config.provider.clone(),
        middleware.clone(),
        ExtractorSet::with_defaults(),
        config.indexing.max_file_size_bytes(),
    )
    .with_shutdown(shutdown.clone());

    let mut store = None;
    if config.mode == ServerMode::Rag {
        let pipeline = Arc::new(build_pipeline(&config, middleware)?);
        store = Some(pipeline.store().clone());
        dispatcher = dispatcher.with_rag(RagServices {
            pipeline,
            search: config.search.clone(),
        });
    }
    let dispatcher = Arc::new(dispatcher);

    if store.is_some() && !no_initial_index {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            match dispatcher.reindex(IndexMode::Incremental).await {
                Ok(result) => info!("Initial index complete: {}", result.summary()),
                Err(e) => error!("Initial index failed: {e}"),
            }
        });
    }

    let served = serve_stdio(dispatcher, shutdown.clone()).await;

    // Stop a background index still running after the client left
    shutdown.cancel();
    if let Some(store) = store {
        store.close();
    }
    info!("docintel stopped");
    served
}
