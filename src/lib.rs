//! Accretion: document ingestion control plane.
//!
//! Crawls heterogeneous knowledge sources (a knowledge-management API, a
//! templated knowledge-article platform, a support-hub knowledge base, a
//! wiki, uploaded files, a local directory) and indexes their chunked
//! contents into a vector search store. The durable
//! job-and-step orchestration lives in the `protostar` crate; this crate
//! binds the datasource connectors, the indexing pipeline, the deletion
//! reconciliation and the HTTP API around it.

use std::sync::Arc;

use protostar::backends::sqlite::SqliteJobStore;
use protostar::{ConnectionRepository, Feature, FeatureRegistry, JobQueue, JobStore, QueueConfig};

pub mod api;
pub mod config;
pub mod connections;
pub mod embedding;
pub mod error;
pub mod health;
pub mod index;
pub mod indexing;
pub mod logging;
pub mod state;
pub mod text;

use config::Settings;
use connections::drive::DriveFeature;
use connections::files::{LocalFilesFeature, UploadFeature};
use connections::hub::HubFeature;
use connections::kms::KmsFeature;
use connections::wiki::WikiFeature;
use embedding::Embedder;
use health::{HealthIndicator, IndexHealthIndicator, RecordStoreHealthIndicator};
use index::{DocumentIndex, IndexBootstrap};
use indexing::IndexingChain;
use state::AppState;

/// The features in registry order; the first accepting one wins.
pub fn default_features(settings: Arc<Settings>) -> Vec<Arc<dyn Feature<IndexingChain>>> {
    vec![
        Arc::new(KmsFeature::new(settings.clone())),
        Arc::new(UploadFeature),
        Arc::new(DriveFeature::new(settings.clone())),
        Arc::new(HubFeature::new(settings.clone())),
        Arc::new(WikiFeature::new(settings.clone())),
        Arc::new(LocalFilesFeature::new(settings)),
    ]
}

/// Wires the queue, the indexing chain and the health indicators into the
/// shared application state. Must run inside a tokio runtime (the queue
/// spawns its workers).
pub fn build_app_state(
    settings: Arc<Settings>,
    store: Arc<SqliteJobStore>,
    index: Arc<dyn DocumentIndex>,
    embedder: Arc<dyn Embedder>,
    features: Vec<Arc<dyn Feature<IndexingChain>>>,
) -> AppState {
    let bootstrap = Arc::new(IndexBootstrap::new(index.clone()));
    let registry = Arc::new(FeatureRegistry::new(features));
    let chain_factory = IndexingChain::factory(
        index.clone(),
        bootstrap.clone(),
        embedder,
        settings.clone(),
    );

    let queue = JobQueue::new(
        store.clone() as Arc<dyn JobStore>,
        registry,
        store.clone() as Arc<dyn ConnectionRepository>,
        chain_factory,
        QueueConfig {
            workers: settings.max_job_workers,
            batch_size: settings.job_step_batch_size,
            node_name: settings.node_name.clone(),
        },
    );

    let health_indicators: Vec<Arc<dyn HealthIndicator>> = vec![
        Arc::new(RecordStoreHealthIndicator::new(store.pool().clone())),
        Arc::new(IndexHealthIndicator::new(index.clone())),
    ];

    AppState {
        settings,
        queue,
        index,
        bootstrap,
        health_indicators,
    }
}
