//! Accretion server binary.

use std::sync::Arc;

use anyhow::Context;
use protostar::backends::sqlite::SqliteJobStore;
use tracing::info;

use accretion::config::Settings;
use accretion::embedding::HttpEmbedder;
use accretion::index::SearchIndex;
use accretion::{api, build_app_state, default_features, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging();

    let settings = Arc::new(Settings::from_env());
    info!(
        workers = settings.max_job_workers,
        batch_size = settings.job_step_batch_size,
        node = %settings.node_name,
        "starting accretion"
    );

    let store = Arc::new(
        SqliteJobStore::open(&settings.database_path)
            .await
            .context("opening the job record store")?,
    );
    let index = Arc::new(SearchIndex::new(&settings).context("building the index client")?);
    let embedder = Arc::new(HttpEmbedder::new(settings.embeddings_url.clone()));

    let state = build_app_state(
        settings.clone(),
        store,
        index,
        embedder,
        default_features(settings.clone()),
    );

    // Best effort: the application should boot even when the index store is
    // not quite up yet.
    state.bootstrap.ensure_index_created_no_rethrow().await;

    let app = api::router(state.clone());
    let address = format!("{}:{}", settings.bind_host, settings.bind_port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(%address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving the API")?;

    info!("draining job workers");
    state.queue.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for the shutdown signal");
    }
}
