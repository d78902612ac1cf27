//! Global application state shared across HTTP handlers.

use std::sync::Arc;

use protostar::{FeatureRegistry, JobQueue};

use crate::config::Settings;
use crate::health::HealthIndicator;
use crate::index::{DocumentIndex, IndexBootstrap};
use crate::indexing::IndexingChain;

/// Shared by every request handler; everything inside is reference-counted.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub queue: Arc<JobQueue<IndexingChain>>,
    pub index: Arc<dyn DocumentIndex>,
    pub bootstrap: Arc<IndexBootstrap>,
    pub health_indicators: Vec<Arc<dyn HealthIndicator>>,
}

impl AppState {
    pub fn features(&self) -> &Arc<FeatureRegistry<IndexingChain>> {
        self.queue.features()
    }
}
