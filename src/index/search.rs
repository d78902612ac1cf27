//! OpenSearch-compatible REST implementation of [`DocumentIndex`].

use std::collections::VecDeque;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use super::{DocRef, DocumentIndex, IndexError, IndexedChunk};
use crate::config::Settings;

const INDEX_SCHEMA: &str = include_str!("index_schema.json");

const ERROR_INDEX_NOT_FOUND: &str = "index_not_found_exception";
const ERROR_RESOURCE_ALREADY_EXISTS: &str = "resource_already_exists_exception";

/// How long the store keeps a scroll context alive between pages.
const SCROLL_KEEP_ALIVE: &str = "5m";
const SCROLL_PAGE_SIZE: usize = 10_000;

/// REST client for the application's vector search index.
#[derive(Clone)]
pub struct SearchIndex {
    http: reqwest::Client,
    base_url: String,
    index_name: String,
    username: Option<String>,
    password: Option<String>,
}

struct ScrollPage {
    scroll_id: Option<String>,
    refs: Vec<DocRef>,
}

impl SearchIndex {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if !settings.index_verify_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            http: builder.build().context("building index HTTP client")?,
            base_url: settings.index_url.trim_end_matches('/').to_string(),
            index_name: settings.index_name.clone(),
            username: settings.index_user.clone(),
            password: settings.index_password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        request
    }

    /// Maps an error response onto the taxonomy, reading the `error.type` of
    /// the JSON body when there is one.
    async fn error_for(response: reqwest::Response) -> IndexError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if let Ok(value) = serde_json::from_str::<Value>(&body) {
            match value["error"]["type"].as_str() {
                Some(ERROR_INDEX_NOT_FOUND) => return IndexError::IndexNotFound,
                Some(ERROR_RESOURCE_ALREADY_EXISTS) => return IndexError::AlreadyExists,
                _ => {}
            }
        }
        IndexError::Other(anyhow!("index request failed with status {status}: {body}"))
    }

    async fn search_page(
        &self,
        datasource: &str,
        key_field: Option<&str>,
        key_value: Option<&str>,
    ) -> Result<ScrollPage, IndexError> {
        let mut filters = vec![json!({"term": {"metadata.datasource": {"value": datasource}}})];
        if let (Some(field), Some(value)) = (key_field, key_value) {
            let mut term = serde_json::Map::new();
            term.insert(field.to_string(), json!({"value": value}));
            filters.push(json!({ "term": Value::Object(term) }));
        }

        let response = self
            .request(
                Method::POST,
                &format!("/{}/_search?scroll={}", self.index_name, SCROLL_KEEP_ALIVE),
            )
            .json(&json!({
                "size": SCROLL_PAGE_SIZE,
                "_source": ["metadata.doc_id", "metadata.doc_display_id"],
                "query": {"bool": {"must": filters}},
            }))
            .send()
            .await
            .context("searching indexed documents")?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Self::parse_scroll_page(response).await
    }

    async fn scroll_page(&self, scroll_id: &str) -> Result<ScrollPage, IndexError> {
        let response = self
            .request(Method::POST, "/_search/scroll")
            .json(&json!({"scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id}))
            .send()
            .await
            .context("scrolling indexed documents")?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Self::parse_scroll_page(response).await
    }

    async fn parse_scroll_page(response: reqwest::Response) -> Result<ScrollPage, IndexError> {
        let body: Value = response
            .json()
            .await
            .context("parsing index search response")?;
        let scroll_id = body["_scroll_id"].as_str().map(str::to_string);
        let refs = body["hits"]["hits"]
            .as_array()
            .map(|hits| {
                hits.iter()
                    .map(|hit| {
                        let metadata = &hit["_source"]["metadata"];
                        DocRef {
                            doc_id: metadata["doc_id"].as_str().map(str::to_string),
                            doc_display_id: metadata["doc_display_id"]
                                .as_str()
                                .map(str::to_string),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ScrollPage { scroll_id, refs })
    }
}

#[async_trait]
impl DocumentIndex for SearchIndex {
    async fn index_exists(&self) -> Result<bool, IndexError> {
        let response = self
            .request(Method::HEAD, &format!("/{}", self.index_name))
            .send()
            .await
            .context("checking index existence")?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::error_for(response).await),
        }
    }

    async fn create_index(&self) -> Result<(), IndexError> {
        let schema: Value =
            serde_json::from_str(INDEX_SCHEMA).context("parsing built-in index definition")?;
        let response = self
            .request(Method::PUT, &format!("/{}", self.index_name))
            .json(&schema)
            .send()
            .await
            .context("creating application index")?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Ok(())
    }

    async fn delete_by_key(
        &self,
        datasource: &str,
        key_field: &str,
        key_value: &str,
        connection_ids: &[String],
    ) -> Result<u64, IndexError> {
        let mut key_term = serde_json::Map::new();
        key_term.insert(key_field.to_string(), json!({"value": key_value}));

        let response = self
            .request(
                Method::POST,
                &format!("/{}/_delete_by_query", self.index_name),
            )
            .json(&json!({
                "query": {
                    "bool": {
                        "must": [
                            {"term": {"metadata.datasource": {"value": datasource}}},
                            {"term": Value::Object(key_term)},
                            {"terms": {"metadata.connection_id": connection_ids}},
                        ]
                    }
                }
            }))
            .send()
            .await
            .context("deleting indexed documents by query")?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let body: Value = response
            .json()
            .await
            .context("parsing delete-by-query response")?;
        Ok(body["deleted"].as_u64().unwrap_or(0))
    }

    async fn insert_chunks(&self, chunks: Vec<IndexedChunk>) -> Result<(), IndexError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for chunk in &chunks {
            body.push_str(
                &serde_json::to_string(&json!({"index": {"_index": self.index_name}}))
                    .context("serializing bulk action line")?,
            );
            body.push('\n');
            body.push_str(
                &serde_json::to_string(&json!({
                    "text": chunk.text,
                    "vector": chunk.embedding,
                    "metadata": chunk.metadata,
                }))
                .context("serializing bulk document line")?,
            );
            body.push('\n');
        }

        let count = chunks.len();
        let response = self
            .request(Method::POST, "/_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("bulk-inserting chunks")?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let result: Value = response.json().await.context("parsing bulk response")?;
        if result["errors"].as_bool().unwrap_or(false) {
            return Err(IndexError::Other(anyhow!(
                "bulk insert reported item failures: {}",
                result["items"]
            )));
        }
        debug!(count, "bulk-inserted chunks");
        Ok(())
    }

    fn scroll_doc_refs(
        &self,
        datasource: String,
        key_field: Option<String>,
        key_value: Option<String>,
    ) -> BoxStream<'static, Result<DocRef, IndexError>> {
        struct ScrollState {
            client: SearchIndex,
            datasource: String,
            key_field: Option<String>,
            key_value: Option<String>,
            scroll_id: Option<String>,
            buffer: VecDeque<DocRef>,
            started: bool,
            done: bool,
        }

        let state = ScrollState {
            client: self.clone(),
            datasource,
            key_field,
            key_value,
            scroll_id: None,
            buffer: VecDeque::new(),
            started: false,
            done: false,
        };

        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(doc_ref) = state.buffer.pop_front() {
                    return Ok(Some((doc_ref, state)));
                }
                if state.done {
                    return Ok(None);
                }

                let page = if !state.started {
                    state.started = true;
                    state
                        .client
                        .search_page(
                            &state.datasource,
                            state.key_field.as_deref(),
                            state.key_value.as_deref(),
                        )
                        .await?
                } else {
                    match &state.scroll_id {
                        Some(scroll_id) => state.client.scroll_page(scroll_id).await?,
                        None => {
                            state.done = true;
                            continue;
                        }
                    }
                };

                state.scroll_id = page.scroll_id;
                if page.refs.is_empty() {
                    state.done = true;
                }
                state.buffer.extend(page.refs);
            }
        })
        .boxed()
    }

    async fn ping(&self) -> Result<(), IndexError> {
        let response = self
            .request(Method::GET, "/")
            .send()
            .await
            .context("pinging index store")?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Ok(())
    }
}
