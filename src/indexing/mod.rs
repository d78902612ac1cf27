//! Document indexing pipeline.
//!
//! [`IndexingChain`] is the chain handed to load/delete handlers: besides
//! the queueing capabilities of [`JobChain`], it chunks documents, stamps
//! chunk metadata, deletes the previously indexed revision once per unique
//! key, embeds the chunk texts and bulk-inserts them.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use protostar::{Attachment, ChainFactory, Job, JobChain, JobQueue, JobStep};
use serde_json::{json, Map, Value};
use tracing::{debug, error, trace, warn};

use crate::config::Settings;
use crate::embedding::Embedder;
use crate::index::{DocumentIndex, IndexBootstrap, IndexError, IndexedChunk};

pub mod chunk;

pub use chunk::generate_chunks;

/// A loaded document: text content plus index metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn from_text(content: impl Into<String>) -> Self {
        Document {
            content: content.into(),
            metadata: Map::new(),
        }
    }
}

/// Builder for index document metadata. Keeps loaders on the known set of
/// metadata properties; `None` fields are left out entirely.
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub connection_id: Option<String>,
    pub datasource: Option<String>,
    pub doc_id: Option<String>,
    pub doc_display_id: Option<String>,
    pub source: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub tags: Option<Vec<String>>,
    pub web_url: Option<String>,
    pub internal: Option<bool>,
    pub company: Option<String>,
}

impl DocumentMetadata {
    /// The metadata as a JSON object, without the unset properties.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        };
        put("connection_id", self.connection_id.clone().map(Value::from));
        put("datasource", self.datasource.clone().map(Value::from));
        put("doc_id", self.doc_id.clone().map(Value::from));
        put(
            "doc_display_id",
            self.doc_display_id.clone().map(Value::from),
        );
        put("source", self.source.clone().map(Value::from));
        put("language", self.language.clone().map(Value::from));
        put("title", self.title.clone().map(Value::from));
        put("tags", self.tags.clone().map(|tags| json!(tags)));
        put("web_url", self.web_url.clone().map(Value::from));
        put("internal", self.internal.map(Value::from));
        put("company", self.company.clone().map(Value::from));
        map
    }

    /// Updates the document's metadata with the set properties of this
    /// object; other metadata of the document is preserved.
    pub fn apply_to(&self, document: &mut Document) {
        for (key, value) in self.to_map() {
            document.metadata.insert(key, value);
        }
    }
}

/// Chain passed to handlers of indexing datasources.
pub struct IndexingChain {
    queue: Arc<JobQueue<IndexingChain>>,
    index: Arc<dyn DocumentIndex>,
    bootstrap: Arc<IndexBootstrap>,
    embedder: Arc<dyn Embedder>,
    settings: Arc<Settings>,
}

#[async_trait::async_trait]
impl JobChain for IndexingChain {
    fn job_queue(&self) -> &Arc<JobQueue<Self>> {
        &self.queue
    }
}

impl IndexingChain {
    /// The factory handed to the job queue; one chain is produced per
    /// handler invocation.
    pub fn factory(
        index: Arc<dyn DocumentIndex>,
        bootstrap: Arc<IndexBootstrap>,
        embedder: Arc<dyn Embedder>,
        settings: Arc<Settings>,
    ) -> ChainFactory<IndexingChain> {
        Arc::new(move |queue| {
            Arc::new(IndexingChain {
                queue,
                index: index.clone(),
                bootstrap: bootstrap.clone(),
                embedder: embedder.clone(),
                settings: settings.clone(),
            })
        })
    }

    pub fn index(&self) -> &Arc<dyn DocumentIndex> {
        &self.index
    }

    /// The file stored with the job record, if any.
    pub async fn job_attachment(&self, job: &Job) -> anyhow::Result<Option<Attachment>> {
        let job_id = job
            .id
            .ok_or_else(|| anyhow!("cannot load the attachment of an unpersisted job"))?;
        Ok(self.queue.store().get_job_attachment(job_id).await?)
    }

    /// Chunks, deduplicates previous revisions and indexes the documents.
    pub async fn index_documents(
        &self,
        job: &Job,
        step: &JobStep,
        documents: Vec<Document>,
    ) -> anyhow::Result<()> {
        let mut chunks = generate_chunks(
            &documents,
            self.settings.chunk_size,
            self.settings.chunk_overlap,
        );
        self.amend_chunks_metadata(job, &mut chunks);
        self.bootstrap.ensure_index_created().await?;
        self.delete_chunks_documents(job, step, &chunks).await?;
        self.store_chunks(job, chunks).await
    }

    fn amend_chunks_metadata(&self, job: &Job, chunks: &mut [Document]) {
        let connection_id = job
            .connection_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "NONE".to_string());
        for (chunk_id, chunk) in chunks.iter_mut().enumerate() {
            if let Some(prefix) = &self.settings.chunk_prefix {
                chunk.content = format!("{prefix}{}", chunk.content);
            }
            chunk
                .metadata
                .insert("datasource".to_string(), json!(job.datasource));
            chunk.metadata.insert("chunk_id".to_string(), json!(chunk_id));
            // Deletions filter on the connection id, so it is always
            // stamped, "NONE" standing in for connection-less jobs.
            chunk
                .metadata
                .entry("connection_id".to_string())
                .or_insert_with(|| json!(connection_id.clone()));
        }
    }

    /// Deletes the previously indexed documents for the keys appearing in
    /// the chunks, once per unique key within this call.
    async fn delete_chunks_documents(
        &self,
        job: &Job,
        step: &JobStep,
        chunks: &[Document],
    ) -> anyhow::Result<()> {
        let delete_doc_by = self
            .queue
            .features()
            .delete_doc_by(job, step)
            .ok_or_else(|| anyhow!("no deletion strategy for a {} job", job.datasource))?;

        let mut already_deleted: HashSet<(String, String)> = HashSet::new();
        for (chunk_id, chunk) in chunks.iter().enumerate() {
            let doc_id = chunk.metadata.get("doc_id").and_then(Value::as_str);
            let doc_display_id = chunk.metadata.get("doc_display_id").and_then(Value::as_str);
            let (key_field, key_value) = delete_doc_by.pick_key_for_delete(doc_id, doc_display_id);

            match key_value {
                Some(key_value) => {
                    let key = (key_field.to_string(), key_value);
                    if already_deleted.contains(&key) {
                        continue;
                    }
                    self.delete_document(&job.datasource, key_field, &key.1, job.connection_id)
                        .await?;
                    already_deleted.insert(key);
                }
                None => {
                    // This shouldn't happen but let's log something.
                    warn!(
                        datasource = %step.datasource,
                        chunk_id,
                        "couldn't determine the key to delete the indexed documents for chunk"
                    );
                }
            }
        }
        Ok(())
    }

    /// Deletes the indexed documents matching the datasource, the key and
    /// the connection scope. A missing index means there is nothing to
    /// delete in it.
    pub async fn delete_document(
        &self,
        datasource: &str,
        key_field: &str,
        key_value: &str,
        connection_id: Option<i64>,
    ) -> anyhow::Result<()> {
        let connection_ids: Vec<String> = match connection_id {
            Some(id) => vec!["NONE".to_string(), id.to_string()],
            None => vec!["NONE".to_string()],
        };
        trace!(
            datasource,
            key_field,
            key_value,
            connection = ?connection_ids,
            "deleting indexed documents"
        );

        match self
            .index
            .delete_by_key(datasource, key_field, key_value, &connection_ids)
            .await
        {
            Ok(deleted) => {
                debug!(
                    deleted,
                    datasource, key_field, key_value, "deleted indexed documents"
                );
                Ok(())
            }
            Err(IndexError::IndexNotFound) => Ok(()),
            Err(index_error) => {
                error!(
                    datasource,
                    key_field,
                    key_value,
                    error = %index_error,
                    "failed deleting indexed documents"
                );
                Err(index_error.into())
            }
        }
    }

    async fn store_chunks(&self, job: &Job, chunks: Vec<Document>) -> anyhow::Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        debug!(datasource = %job.datasource, count = chunks.len(), "storing chunks");

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let embeddings = self.embedder.embed_documents(&texts).await?;

        let indexed: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedChunk {
                text: chunk.content,
                embedding,
                metadata: chunk.metadata,
            })
            .collect();
        self.index.insert_chunks(indexed).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;

    #[test]
    fn test_metadata_map_skips_unset_properties() {
        let metadata = DocumentMetadata {
            doc_id: Some("42".into()),
            title: Some("How to".into()),
            ..DocumentMetadata::default()
        };
        let map = metadata.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["doc_id"], "42");
        assert_eq!(map["title"], "How to");
        assert!(!map.contains_key("language"));
    }

    #[test]
    fn test_metadata_apply_preserves_other_properties() {
        let mut document = Document::from_text("body");
        document.metadata.insert("page".into(), json!(3));

        DocumentMetadata {
            doc_id: Some("42".into()),
            ..DocumentMetadata::default()
        }
        .apply_to(&mut document);

        assert_eq!(document.metadata["page"], 3);
        assert_eq!(document.metadata["doc_id"], "42");
    }

    #[tokio::test]
    async fn test_memory_index_roundtrip_of_indexed_chunk() {
        let index = MemoryIndex::new();
        let mut metadata = Map::new();
        metadata.insert("datasource".into(), json!("KMS"));
        metadata.insert("doc_id".into(), json!("1"));
        index
            .insert_chunks(vec![IndexedChunk {
                text: "text".into(),
                embedding: vec![0.5; 4],
                metadata,
            }])
            .await
            .unwrap();
        assert_eq!(index.metadata_values("doc_id"), vec!["1"]);
    }
}
