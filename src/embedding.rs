//! Embeddings computation, consumed as a capability.

use async_trait::async_trait;
use serde::Deserialize;

/// Turns chunk texts into embedding vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_documents(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Embedder backed by an HTTP embeddings endpoint.
pub struct HttpEmbedder {
    http: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbedder {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let response = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "input": texts }))
            .send()
            .await?
            .error_for_status()?;
        let embeddings: EmbeddingsResponse = response.json().await?;
        anyhow::ensure!(
            embeddings.embeddings.len() == texts.len(),
            "embeddings endpoint returned {} vectors for {} texts",
            embeddings.embeddings.len(),
            texts.len()
        );
        Ok(embeddings.embeddings)
    }
}
