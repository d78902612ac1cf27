//! In-process implementation of [`DocumentIndex`], used by tests and local
//! development runs where no search store is available.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::{DocRef, DocumentIndex, IndexError, IndexedChunk};

#[derive(Default)]
struct Inner {
    created: bool,
    chunks: Vec<IndexedChunk>,
}

/// Keeps every inserted chunk in memory and answers the same queries the
/// REST client would.
#[derive(Default)]
pub struct MemoryIndex {
    inner: Mutex<Inner>,
}

fn metadata_str<'a>(chunk: &'a IndexedChunk, key: &str) -> Option<&'a str> {
    chunk.metadata.get(key).and_then(|value| value.as_str())
}

/// `metadata.doc_id` → `doc_id`
fn strip_metadata_prefix(field: &str) -> &str {
    field.strip_prefix("metadata.").unwrap_or(field)
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything currently indexed.
    pub fn chunks(&self) -> Vec<IndexedChunk> {
        self.inner.lock().expect("memory index poisoned").chunks.clone()
    }

    /// The distinct values of one metadata field across all indexed chunks.
    pub fn metadata_values(&self, field: &str) -> Vec<String> {
        let field = strip_metadata_prefix(field);
        let inner = self.inner.lock().expect("memory index poisoned");
        let mut values: Vec<String> = inner
            .chunks
            .iter()
            .filter_map(|chunk| metadata_str(chunk, field).map(str::to_string))
            .collect();
        values.sort();
        values.dedup();
        values
    }
}

#[async_trait]
impl DocumentIndex for MemoryIndex {
    async fn index_exists(&self) -> Result<bool, IndexError> {
        Ok(self.inner.lock().expect("memory index poisoned").created)
    }

    async fn create_index(&self) -> Result<(), IndexError> {
        let mut inner = self.inner.lock().expect("memory index poisoned");
        if inner.created {
            return Err(IndexError::AlreadyExists);
        }
        inner.created = true;
        Ok(())
    }

    async fn delete_by_key(
        &self,
        datasource: &str,
        key_field: &str,
        key_value: &str,
        connection_ids: &[String],
    ) -> Result<u64, IndexError> {
        let mut inner = self.inner.lock().expect("memory index poisoned");
        if !inner.created {
            return Err(IndexError::IndexNotFound);
        }

        let field = strip_metadata_prefix(key_field);
        let before = inner.chunks.len();
        inner.chunks.retain(|chunk| {
            let connection = metadata_str(chunk, "connection_id").unwrap_or("NONE");
            let matches = metadata_str(chunk, "datasource") == Some(datasource)
                && metadata_str(chunk, field) == Some(key_value)
                && connection_ids.iter().any(|id| id == connection);
            !matches
        });
        Ok((before - inner.chunks.len()) as u64)
    }

    async fn insert_chunks(&self, chunks: Vec<IndexedChunk>) -> Result<(), IndexError> {
        let mut inner = self.inner.lock().expect("memory index poisoned");
        // Bulk insertion creates the index implicitly, like the real store.
        inner.created = true;
        inner.chunks.extend(chunks);
        Ok(())
    }

    fn scroll_doc_refs(
        &self,
        datasource: String,
        key_field: Option<String>,
        key_value: Option<String>,
    ) -> BoxStream<'static, Result<DocRef, IndexError>> {
        let inner = self.inner.lock().expect("memory index poisoned");
        let key_field = key_field.as_deref().map(strip_metadata_prefix);
        let refs: Vec<Result<DocRef, IndexError>> = inner
            .chunks
            .iter()
            .filter(|chunk| metadata_str(chunk, "datasource") == Some(datasource.as_str()))
            .filter(|chunk| match (key_field, key_value.as_deref()) {
                (Some(field), Some(value)) => metadata_str(chunk, field) == Some(value),
                _ => true,
            })
            .map(|chunk| {
                Ok(DocRef {
                    doc_id: metadata_str(chunk, "doc_id").map(str::to_string),
                    doc_display_id: metadata_str(chunk, "doc_display_id").map(str::to_string),
                })
            })
            .collect();
        stream::iter(refs).boxed()
    }

    async fn ping(&self) -> Result<(), IndexError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn chunk(datasource: &str, doc_id: &str, connection: Option<&str>) -> IndexedChunk {
        let mut metadata = serde_json::Map::new();
        metadata.insert("datasource".into(), json!(datasource));
        metadata.insert("doc_id".into(), json!(doc_id));
        if let Some(connection) = connection {
            metadata.insert("connection_id".into(), json!(connection));
        }
        IndexedChunk {
            text: format!("chunk of {doc_id}"),
            embedding: vec![0.0; 4],
            metadata,
        }
    }

    #[tokio::test]
    async fn test_delete_by_key_scopes_on_connection() {
        let index = MemoryIndex::new();
        index
            .insert_chunks(vec![
                chunk("KMS", "1", Some("NONE")),
                chunk("KMS", "1", Some("7")),
                chunk("KMS", "2", Some("NONE")),
            ])
            .await
            .unwrap();

        let deleted = index
            .delete_by_key("KMS", "metadata.doc_id", "1", &["NONE".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let deleted = index
            .delete_by_key(
                "KMS",
                "metadata.doc_id",
                "1",
                &["NONE".to_string(), "7".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(index.metadata_values("doc_id"), vec!["2"]);
    }

    #[tokio::test]
    async fn test_delete_on_missing_index_reports_not_found() {
        let index = MemoryIndex::new();
        let error = index
            .delete_by_key("KMS", "metadata.doc_id", "1", &["NONE".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(error, IndexError::IndexNotFound));
    }

    #[tokio::test]
    async fn test_scroll_filters_by_datasource_and_key() {
        let index = MemoryIndex::new();
        index
            .insert_chunks(vec![
                chunk("KMS", "1", None),
                chunk("KMS", "2", None),
                chunk("WIKI", "3", None),
            ])
            .await
            .unwrap();

        let all: Vec<DocRef> = index
            .scroll_doc_refs("KMS".into(), None, None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let narrowed: Vec<DocRef> = index
            .scroll_doc_refs(
                "KMS".into(),
                Some("metadata.doc_id".into()),
                Some("2".into()),
            )
            .try_collect()
            .await
            .unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].doc_id.as_deref(), Some("2"));
    }
}
