//! Knowledge-management service connector.
//!
//! Crawls the published articles of the KMS API, loads them one by one and
//! reconciles deletions. Articles are keyed by their numeric content id;
//! indexed documents are deleted by `metadata.doc_id`.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use protostar::{
    Connection, DeleteDocBy, Feature, Handler, Job, JobChain, JobStep, StepKind,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::config::Settings;
use crate::connections::datasource;
use crate::connections::deleter::Deleter;
use crate::connections::http::{HttpStatusError, RestClient};
use crate::indexing::{Document, DocumentMetadata, IndexingChain};
use crate::text::clean_text;

/// Typed view of a KMS connection record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KmsConnection {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl KmsConnection {
    pub fn from_connection(connection: &Connection) -> anyhow::Result<Self> {
        serde_json::from_value(connection.properties.clone())
            .with_context(|| format!("invalid KMS connection {} properties", connection.id))
    }
}

/// One KMS article with its indexable content.
#[derive(Debug, Clone, PartialEq)]
pub struct KmsArticle {
    pub content_id: i64,
    pub title: String,
    pub body: String,
    pub language: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// The KMS API surface the handlers consume.
#[async_trait]
pub trait KmsApi: Send + Sync {
    /// The content ids of the published articles. When `content_id` is
    /// given, the result contains at most that article (if published).
    async fn article_ids(&self, content_id: Option<i64>) -> anyhow::Result<BTreeSet<i64>>;

    /// The specified article, or `None` if it is not available.
    async fn get_article(&self, content_id: i64) -> anyhow::Result<Option<KmsArticle>>;
}

/// Opens an API client for a job's connection configuration.
pub trait KmsApiFactory: Send + Sync {
    fn open(&self, connection: Option<&Connection>) -> anyhow::Result<Arc<dyn KmsApi>>;
}

#[derive(Deserialize)]
struct ArticleListingDto {
    articles: Vec<ArticleRefDto>,
}

#[derive(Deserialize)]
struct ArticleRefDto {
    #[serde(rename = "contentId")]
    content_id: i64,
}

#[derive(Deserialize)]
struct ArticleDto {
    #[serde(rename = "contentId")]
    content_id: i64,
    title: String,
    body: String,
    language: Option<String>,
    tags: Option<Vec<String>>,
}

/// REST-backed implementation of [`KmsApi`].
pub struct HttpKmsApi {
    client: RestClient,
}

/// Recognizes the platform quirk where a downstream 404 surfaces as an HTTP
/// 500: the JSON error body is a list whose first element carries message
/// number 234010 and an appended text naming the failed article fetch and
/// the underlying "404 Not Found". Only exactly that shape counts; anything
/// else stays an error.
pub fn is_masked_not_found(error: &HttpStatusError) -> bool {
    if error.status != 500 {
        return false;
    }
    let Ok(Value::Array(errors)) = serde_json::from_str::<Value>(&error.body) else {
        return false;
    };
    let Some(first) = errors.first() else {
        return false;
    };
    first["messageType"] == "ERROR"
        && first["messageNumber"] == 234010
        && first["appendedText"].as_str().is_some_and(|text| {
            text.contains("Failed to get the knowledge article") && text.contains("404 Not Found")
        })
}

#[async_trait]
impl KmsApi for HttpKmsApi {
    async fn article_ids(&self, content_id: Option<i64>) -> anyhow::Result<BTreeSet<i64>> {
        match content_id {
            None => {
                let listing: ArticleListingDto = self
                    .client
                    .get_json(
                        "/api/knowledge/articles",
                        &[("status", "published".to_string())],
                    )
                    .await?;
                Ok(listing
                    .articles
                    .into_iter()
                    .map(|article| article.content_id)
                    .collect())
            }
            // Verify the specific article is published.
            Some(content_id) => Ok(self
                .get_article(content_id)
                .await?
                .map(|article| article.content_id)
                .into_iter()
                .collect()),
        }
    }

    async fn get_article(&self, content_id: i64) -> anyhow::Result<Option<KmsArticle>> {
        let result: anyhow::Result<ArticleDto> = self
            .client
            .get_json(&format!("/api/knowledge/articles/{content_id}"), &[])
            .await;
        match result {
            Ok(article) => Ok(Some(KmsArticle {
                content_id: article.content_id,
                title: article.title,
                body: article.body,
                language: article.language,
                tags: article.tags,
            })),
            Err(error) => {
                if let Some(status_error) = error.downcast_ref::<HttpStatusError>() {
                    if is_masked_not_found(status_error) {
                        return Ok(None);
                    }
                }
                Err(error)
            }
        }
    }
}

/// Default factory building REST clients from the connection record plus
/// the global settings.
pub struct HttpKmsApiFactory {
    settings: Arc<Settings>,
}

impl KmsApiFactory for HttpKmsApiFactory {
    fn open(&self, connection: Option<&Connection>) -> anyhow::Result<Arc<dyn KmsApi>> {
        let config = connection
            .map(KmsConnection::from_connection)
            .transpose()?
            .unwrap_or_default();
        let base_url = config
            .base_url
            .or_else(|| self.settings.kms_url.clone())
            .ok_or_else(|| anyhow!("KMS base URL is not configured"))?;
        let username = config
            .username
            .or_else(|| self.settings.kms_user.clone())
            .unwrap_or_default();
        let password = config
            .password
            .or_else(|| self.settings.kms_password.clone())
            .unwrap_or_default();
        Ok(Arc::new(HttpKmsApi {
            client: RestClient::new(base_url, username, password),
        }))
    }
}

fn parse_content_id(doc_id: Option<&str>) -> Option<i64> {
    doc_id.and_then(|raw| raw.parse().ok())
}

async fn crawl_kms(
    api: Arc<dyn KmsApiFactory>,
    mut job: Job,
    _step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    info!("crawling KMS articles");
    let kms = api.open(connection.as_ref())?;
    let article_ids = kms.article_ids(parse_content_id(job.doc_id.as_deref())).await?;

    if article_ids.is_empty() {
        info!("found no published KMS articles to load");
    }
    for content_id in &article_ids {
        info!(content_id, "scheduling a LOAD step for KMS article");
        let load_step = JobStep {
            job_id: job.id,
            doc_id: Some(content_id.to_string()),
            ..JobStep::new(StepKind::Load, job.datasource.clone())
        };
        chain
            .queue_job_step(&mut job, load_step, connection.as_ref(), false)
            .await?;
    }

    chain
        .queue_sync_deletions_if_configured(&mut job, connection.as_ref())
        .await?;
    chain.execute_job_steps(&job).await?;
    Ok(())
}

async fn load_kms_article(
    api: Arc<dyn KmsApiFactory>,
    job: Job,
    step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    let content_id: i64 = step
        .doc_id
        .as_deref()
        .ok_or_else(|| anyhow!("LOAD step without an article id"))?
        .parse()
        .context("invalid KMS article id")?;

    info!(content_id, "loading KMS article");
    let kms = api.open(connection.as_ref())?;
    let Some(article) = kms.get_article(content_id).await? else {
        info!(content_id, "skipping loading KMS article: not available anymore");
        return Ok(());
    };

    let title = clean_text(&article.title);
    let body = clean_text(&article.body);
    if body.is_empty() {
        info!(content_id, "skipping loading KMS article: empty content after cleanup");
        return Ok(());
    }

    let mut document = Document::from_text(format!("Title={title} {body}"));
    DocumentMetadata {
        doc_id: Some(content_id.to_string()),
        source: Some(format!("{}/{}", step.datasource, content_id)),
        connection_id: connection.as_ref().map(|connection| connection.id.to_string()),
        title: Some(title),
        language: article.language.clone(),
        tags: article.tags.clone().filter(|tags| !tags.is_empty()),
        ..DocumentMetadata::default()
    }
    .apply_to(&mut document);

    chain.index_documents(&job, &step, vec![document]).await
}

struct KmsDeleter {
    api: Arc<dyn KmsApiFactory>,
}

#[async_trait]
impl Deleter for KmsDeleter {
    fn source_document_label(&self) -> &str {
        "KMS article"
    }

    fn delete_doc_by(&self) -> DeleteDocBy {
        DeleteDocBy::ByDocId
    }

    async fn source_published_keys(
        &self,
        job: &Job,
        _step: &JobStep,
        connection: Option<&Connection>,
    ) -> anyhow::Result<std::collections::HashSet<String>> {
        let kms = self.api.open(connection)?;
        let article_ids = kms.article_ids(parse_content_id(job.doc_id.as_deref())).await?;
        Ok(article_ids.into_iter().map(|id| id.to_string()).collect())
    }
}

/// Feature binding the KMS datasource to its handlers.
pub struct KmsFeature {
    api: Arc<dyn KmsApiFactory>,
}

impl KmsFeature {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            api: Arc::new(HttpKmsApiFactory { settings }),
        }
    }

    /// Builds the feature on an arbitrary API factory; used by tests.
    pub fn with_factory(api: Arc<dyn KmsApiFactory>) -> Self {
        Self { api }
    }
}

impl Feature<IndexingChain> for KmsFeature {
    fn accept_job_request(&self, request: &protostar::JobRequest) -> bool {
        request.datasource == datasource::KMS
    }

    fn accept_job(&self, job: &Job) -> bool {
        job.datasource == datasource::KMS
    }

    fn create_first_job_step(&self, job: &Job) -> JobStep {
        JobStep {
            doc_id: job.doc_id.clone(),
            doc_display_id: job.doc_display_id.clone(),
            ..JobStep::new(StepKind::Crawl, job.datasource.clone())
        }
    }

    fn handler(&self, _job: &Job, step: &JobStep) -> Option<Handler<IndexingChain>> {
        let api = self.api.clone();
        match step.kind {
            StepKind::Crawl => Some(Arc::new(move |job, step, chain, connection| {
                Box::pin(crawl_kms(api.clone(), job, step, chain, connection))
            })),
            StepKind::Load => Some(Arc::new(move |job, step, chain, connection| {
                Box::pin(load_kms_article(api.clone(), job, step, chain, connection))
            })),
            StepKind::SyncDeletions => Some(Arc::new(move |mut job, step, chain, connection| {
                let api = api.clone();
                Box::pin(async move {
                    KmsDeleter { api }
                        .sync_deletions(&mut job, &step, &chain, connection.as_ref())
                        .await
                })
            })),
            StepKind::Delete => Some(Arc::new(move |job, step, chain, connection| {
                let api = api.clone();
                Box::pin(async move {
                    KmsDeleter { api }
                        .delete_indexed_document(&job, &step, &chain, connection.as_ref())
                        .await
                })
            })),
        }
    }

    fn delete_doc_by(&self, _job: &Job, _step: &JobStep) -> DeleteDocBy {
        DeleteDocBy::ByDocId
    }
}
