//! docpipe API server binary.
//!
//! Wires the processing core together: storage, object store,
//! providers, event bus, the pipeline worker, and the HTTP surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use docpipe_core::config::Config;
use docpipe_core::dispatch::{DispatchPolicy, Dispatcher};
use docpipe_core::events::EventBus;
use docpipe_core::llm::factory::ProviderRegistry;
use docpipe_core::object_store::S3ObjectStore;
use docpipe_core::pipeline::{ingest_channel, PipelineDeps, PipelineWorker};
use docpipe_core::storage;

use docpipe_server::state::AppState;

/// docpipe API server — document ingestion, processing, and review.
#[derive(Parser)]
#[command(name = "docpipe-server", version, about)]
struct Cli {
    /// Path to the configuration file. Without one, configuration
    /// comes entirely from the environment.
    #[arg(long)]
    config: Option<String>,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).context("loading configuration file")?,
        None => Config::from_env().context("loading configuration from environment")?,
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    // RUST_LOG wins; LOG_LEVEL seeds the filter otherwise.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let db = storage::init_db(&config.database.url)
        .await
        .context("initializing database")?;
    let store = Arc::new(S3ObjectStore::from_config(&config.object_store).await);

    let registry = Arc::new(
        ProviderRegistry::from_config(&config).context("constructing LLM providers")?,
    );
    let dispatcher = Dispatcher::new(registry, DispatchPolicy::from_config(&config));

    let bus = EventBus::new();
    let (ingest_tx, ingest_rx) = ingest_channel();

    let deps = Arc::new(PipelineDeps {
        db: db.clone(),
        store: store.clone(),
        dispatcher,
        bus: Arc::clone(&bus),
    });

    let cancel = CancellationToken::new();
    let worker = PipelineWorker::new(
        Arc::clone(&deps),
        ingest_rx,
        cancel.clone(),
        &config.pipeline,
    );
    let worker_handle = tokio::spawn(worker.run());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState {
        db,
        config,
        bus,
        store,
        ingest: ingest_tx,
    });
    let router = docpipe_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "docpipe server listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await
        .context("serving HTTP")?;

    cancel.cancel();
    let _ = worker_handle.await;
    Ok(())
}
