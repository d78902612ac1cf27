//! Vector search index access, consumed as a capability.
//!
//! The application owns neither the index nor its schema; it only needs the
//! handful of operations below. [`SearchIndex`] talks to an
//! OpenSearch-compatible store over REST, [`MemoryIndex`] is the in-process
//! stand-in used by tests and local development.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub mod memory;
pub mod search;

pub use memory::MemoryIndex;
pub use search::SearchIndex;

/// How long a racing task waits for the index-creation lock before skipping
/// the existence check.
const INDEX_CREATION_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IndexError {
    /// The application index does not exist. Benign on deletes.
    #[error("index not found")]
    IndexNotFound,

    /// The index already exists; tolerated when racing another creator.
    #[error("index resource already exists")]
    AlreadyExists,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Identifying metadata of one indexed document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocRef {
    pub doc_id: Option<String>,
    pub doc_display_id: Option<String>,
}

/// A chunk ready for insertion: text, embedding and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The index operations the ingestion pipeline consumes.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Whether the application index exists. Errors are rethrown.
    async fn index_exists(&self) -> Result<bool, IndexError>;

    /// Creates the application index with the built-in definition.
    async fn create_index(&self) -> Result<(), IndexError>;

    /// Deletes the documents matching the datasource, the key field/value
    /// and any of the given connection ids. Returns how many were deleted.
    async fn delete_by_key(
        &self,
        datasource: &str,
        key_field: &str,
        key_value: &str,
        connection_ids: &[String],
    ) -> Result<u64, IndexError>;

    /// Bulk-inserts embedded chunks.
    async fn insert_chunks(&self, chunks: Vec<IndexedChunk>) -> Result<(), IndexError>;

    /// Streams the `{doc_id, doc_display_id}` metadata of the documents of a
    /// datasource, optionally narrowed by one key field/value pair. The
    /// stream pages lazily; large result sets are never materialized.
    fn scroll_doc_refs(
        &self,
        datasource: String,
        key_field: Option<String>,
        key_value: Option<String>,
    ) -> BoxStream<'static, Result<DocRef, IndexError>>;

    /// Connectivity check used by readiness.
    async fn ping(&self) -> Result<(), IndexError>;
}

/// One-time "ensure the index exists" flow, shared process-wide.
///
/// Within a single process only one task performs the check/creation; a
/// concurrent creation racing between processes is tolerated by catching the
/// already-exists error at creation.
pub struct IndexBootstrap {
    index: Arc<dyn DocumentIndex>,
    lock: tokio::sync::Mutex<()>,
    created: AtomicBool,
}

impl IndexBootstrap {
    pub fn new(index: Arc<dyn DocumentIndex>) -> Self {
        Self {
            index,
            lock: tokio::sync::Mutex::new(()),
            created: AtomicBool::new(false),
        }
    }

    /// Checks whether the application index exists and tries to create it if
    /// it doesn't. Once existence has been established, further calls return
    /// without re-checking.
    pub async fn ensure_index_created(&self) -> Result<(), IndexError> {
        if self.created.load(Ordering::Acquire) {
            return Ok(());
        }

        let guard = tokio::time::timeout(INDEX_CREATION_LOCK_TIMEOUT, self.lock.lock()).await;
        let Ok(_guard) = guard else {
            info!("lock for application index detection timed out: skipping");
            return Ok(());
        };

        if self.created.load(Ordering::Acquire) {
            return Ok(());
        }

        let exists = self.index.index_exists().await?;
        info!(exists, "application index exists");
        if !exists {
            match self.index.create_index().await {
                Ok(()) => info!("created application index successfully"),
                Err(IndexError::AlreadyExists) => {
                    warn!("creation failure because application index already exists: did another node create it?");
                }
                Err(error) => return Err(error),
            }
        }
        self.created.store(true, Ordering::Release);
        Ok(())
    }

    /// A version of [`Self::ensure_index_created`] where errors are logged
    /// rather than rethrown, so the application can start even when the
    /// index store is not quite up yet.
    pub async fn ensure_index_created_no_rethrow(&self) {
        if let Err(error) = self.ensure_index_created().await {
            warn!(%error, "unable to ensure application index existence");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_creates_index_once() {
        let index = Arc::new(MemoryIndex::new());
        let bootstrap = IndexBootstrap::new(index.clone());

        assert!(!index.index_exists().await.unwrap());
        bootstrap.ensure_index_created().await.unwrap();
        assert!(index.index_exists().await.unwrap());

        // Second call is a no-op even if the index vanished meanwhile.
        bootstrap.ensure_index_created().await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_tolerates_racing_creator() {
        let index = Arc::new(MemoryIndex::new());
        index.create_index().await.unwrap();

        let bootstrap = IndexBootstrap::new(index.clone());
        bootstrap.ensure_index_created().await.unwrap();
    }
}
