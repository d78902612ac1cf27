//! Support-hub knowledge base connector.
//!
//! Hub articles are free-form: each template defines its own set of labeled
//! content sections, so the loader concatenates every section as
//! `Label=text` pairs instead of dispatching on the template. Articles are
//! listed and loaded by their opaque uuid, while deletion reconciliation
//! runs on the human-facing content id (`metadata.doc_display_id`).

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use protostar::{
    Connection, DeleteDocBy, Feature, Handler, Job, JobChain, JobStep, StepKind,
};
use serde::Deserialize;
use tracing::info;

use crate::config::Settings;
use crate::connections::datasource;
use crate::connections::deleter::Deleter;
use crate::connections::http::RestClient;
use crate::indexing::{Document, DocumentMetadata, IndexingChain};
use crate::text::clean_text;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubConnection {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl HubConnection {
    pub fn from_connection(connection: &Connection) -> anyhow::Result<Self> {
        serde_json::from_value(connection.properties.clone())
            .with_context(|| format!("invalid HUB connection {} properties", connection.id))
    }
}

/// One labeled content section of an article. Different templates have
/// different such sections.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HubSection {
    pub label: String,
    pub content: String,
}

/// One hub article with all its content sections.
#[derive(Debug, Clone, PartialEq)]
pub struct HubArticle {
    pub uuid: String,
    /// Human-facing content id; the deletion key.
    pub content_id: String,
    pub template_name: String,
    pub title: String,
    pub sections: Vec<HubSection>,
    pub external: bool,
    pub locale: Option<String>,
}

/// The hub API surface the handlers consume.
#[async_trait]
pub trait HubApi: Send + Sync {
    /// The uuids of the published articles, optionally narrowed by display
    /// id and modification instant.
    async fn article_uuids(
        &self,
        display_id: Option<&str>,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<String>>;

    /// The content ids of all the published articles, optionally narrowed
    /// to one of them.
    async fn article_display_ids(&self, display_id: Option<&str>) -> anyhow::Result<Vec<String>>;

    /// The specified article, or `None` if it is not published.
    async fn get_article(&self, uuid: &str) -> anyhow::Result<Option<HubArticle>>;

    /// The company owning the article, when the hub knows one.
    async fn article_company(&self, uuid: &str) -> anyhow::Result<Option<String>>;
}

pub trait HubApiFactory: Send + Sync {
    fn open(&self, connection: Option<&Connection>) -> anyhow::Result<Arc<dyn HubApi>>;
}

/// Cleans and concatenates every content section as `Label=text` pairs
/// behind the title and the display id.
pub fn hub_article_content(article: &HubArticle) -> String {
    let title = clean_text(&article.title);
    let sections = article
        .sections
        .iter()
        .map(|section| format!("{}={}", clean_text(&section.label), clean_text(&section.content)))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "Title={title} doc_display_id={} {sections}",
        article.content_id
    )
}

#[derive(Deserialize)]
struct ArticleResultsDto {
    results: Vec<ArticleRefDto>,
}

#[derive(Deserialize)]
struct ArticleRefDto {
    uuid: String,
}

#[derive(Deserialize)]
struct DisplayIdResultsDto {
    results: Vec<DisplayIdRefDto>,
}

#[derive(Deserialize)]
struct DisplayIdRefDto {
    #[serde(rename = "contentId")]
    content_id: String,
}

#[derive(Deserialize)]
struct ArticleDto {
    uuid: String,
    #[serde(rename = "contentId")]
    content_id: String,
    #[serde(rename = "templateName")]
    template_name: String,
    title: String,
    content: Vec<HubSection>,
    external: bool,
    locale: Option<String>,
}

#[derive(Deserialize)]
struct CompanyDto {
    company: Option<String>,
}

pub struct HttpHubApi {
    client: RestClient,
}

impl HttpHubApi {
    fn listing_query(
        display_id: Option<&str>,
        modified_since: Option<DateTime<Utc>>,
    ) -> Vec<(&'static str, String)> {
        let mut query: Vec<(&'static str, String)> = vec![("status", "published".to_string())];
        if let Some(display_id) = display_id {
            query.push(("contentId", display_id.to_string()));
        }
        if let Some(modified_since) = modified_since {
            query.push(("modifiedSince", modified_since.to_rfc3339()));
        }
        query
    }
}

#[async_trait]
impl HubApi for HttpHubApi {
    async fn article_uuids(
        &self,
        display_id: Option<&str>,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<String>> {
        let listing: ArticleResultsDto = self
            .client
            .get_json(
                "/api/hub/articles",
                &Self::listing_query(display_id, modified_since),
            )
            .await?;
        Ok(listing.results.into_iter().map(|entry| entry.uuid).collect())
    }

    async fn article_display_ids(&self, display_id: Option<&str>) -> anyhow::Result<Vec<String>> {
        let listing: DisplayIdResultsDto = self
            .client
            .get_json(
                "/api/hub/articles/ids",
                &Self::listing_query(display_id, None),
            )
            .await?;
        Ok(listing
            .results
            .into_iter()
            .map(|entry| entry.content_id)
            .collect())
    }

    async fn get_article(&self, uuid: &str) -> anyhow::Result<Option<HubArticle>> {
        let uuids = self
            .client
            .get_json::<ArticleResultsDto>(
                "/api/hub/articles",
                &[("status", "published".to_string()), ("uuid", uuid.to_string())],
            )
            .await?;
        if uuids.results.is_empty() {
            return Ok(None);
        }

        let article: ArticleDto = self
            .client
            .get_json(&format!("/api/hub/articles/{uuid}"), &[])
            .await?;
        Ok(Some(HubArticle {
            uuid: article.uuid,
            content_id: article.content_id,
            template_name: article.template_name,
            title: article.title,
            sections: article.content,
            external: article.external,
            locale: article.locale,
        }))
    }

    async fn article_company(&self, uuid: &str) -> anyhow::Result<Option<String>> {
        let dto: CompanyDto = self
            .client
            .get_json(&format!("/api/hub/articles/{uuid}/company"), &[])
            .await?;
        Ok(dto.company)
    }
}

pub struct HttpHubApiFactory {
    settings: Arc<Settings>,
}

impl HubApiFactory for HttpHubApiFactory {
    fn open(&self, connection: Option<&Connection>) -> anyhow::Result<Arc<dyn HubApi>> {
        let config = connection
            .map(HubConnection::from_connection)
            .transpose()?
            .unwrap_or_default();
        let base_url = config
            .base_url
            .or_else(|| self.settings.hub_url.clone())
            .ok_or_else(|| anyhow!("HUB base URL is not configured"))?;
        let username = config
            .username
            .or_else(|| self.settings.hub_user.clone())
            .unwrap_or_default();
        let password = config
            .password
            .or_else(|| self.settings.hub_password.clone())
            .unwrap_or_default();
        Ok(Arc::new(HttpHubApi {
            client: RestClient::new(base_url, username, password),
        }))
    }
}

async fn crawl_hub(
    api: Arc<dyn HubApiFactory>,
    mut job: Job,
    step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    info!("crawling hub articles");
    let hub = api.open(connection.as_ref())?;

    // A job narrowed to one uuid skips the listing round-trip.
    let article_uuids = match &job.doc_id {
        Some(uuid) => vec![uuid.clone()],
        None => {
            hub.article_uuids(step.doc_display_id.as_deref(), job.modified_since)
                .await?
        }
    };

    if article_uuids.is_empty() {
        info!("no published hub articles found");
    }
    for uuid in &article_uuids {
        info!(uuid, "scheduling a LOAD step for hub article");
        let load_step = JobStep {
            job_id: job.id,
            doc_id: Some(uuid.clone()),
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

async fn load_hub_article(
    api: Arc<dyn HubApiFactory>,
    job: Job,
    step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    let uuid = step
        .doc_id
        .as_deref()
        .ok_or_else(|| anyhow!("LOAD step without an article uuid"))?;

    info!(uuid, "loading hub article");
    let hub = api.open(connection.as_ref())?;
    let Some(article) = hub.get_article(uuid).await? else {
        info!(uuid, "skipping loading hub article: not published anymore");
        return Ok(());
    };
    let company = hub.article_company(&article.uuid).await?;

    let title = clean_text(&article.title);
    let content = hub_article_content(&article);
    let mut document = Document::from_text(content);
    DocumentMetadata {
        doc_id: Some(article.uuid.clone()),
        doc_display_id: Some(article.content_id.clone()),
        source: Some(format!(
            "{}/{}/{}",
            step.datasource, article.template_name, article.content_id
        )),
        connection_id: connection.as_ref().map(|connection| connection.id.to_string()),
        title: Some(title),
        internal: Some(!article.external),
        language: article.locale.clone().filter(|locale| !locale.is_empty()),
        company,
        ..DocumentMetadata::default()
    }
    .apply_to(&mut document);

    chain.index_documents(&job, &step, vec![document]).await
}

struct HubDeleter {
    api: Arc<dyn HubApiFactory>,
}

#[async_trait]
impl Deleter for HubDeleter {
    fn source_document_label(&self) -> &str {
        "hub article"
    }

    fn delete_doc_by(&self) -> DeleteDocBy {
        DeleteDocBy::ByDocDisplayId
    }

    async fn source_published_keys(
        &self,
        job: &Job,
        _step: &JobStep,
        connection: Option<&Connection>,
    ) -> anyhow::Result<HashSet<String>> {
        let hub = self.api.open(connection)?;
        let display_ids = hub
            .article_display_ids(job.doc_display_id.as_deref())
            .await?;
        Ok(display_ids.into_iter().collect())
    }
}

/// Feature binding the support hub to its handlers.
pub struct HubFeature {
    api: Arc<dyn HubApiFactory>,
}

impl HubFeature {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            api: Arc::new(HttpHubApiFactory { settings }),
        }
    }

    pub fn with_factory(api: Arc<dyn HubApiFactory>) -> Self {
        Self { api }
    }
}

impl Feature<IndexingChain> for HubFeature {
    fn accept_job_request(&self, request: &protostar::JobRequest) -> bool {
        request.datasource == datasource::HUB
    }

    fn accept_job(&self, job: &Job) -> bool {
        job.datasource == datasource::HUB
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
                Box::pin(crawl_hub(api.clone(), job, step, chain, connection))
            })),
            StepKind::Load => Some(Arc::new(move |job, step, chain, connection| {
                Box::pin(load_hub_article(api.clone(), job, step, chain, connection))
            })),
            StepKind::SyncDeletions => Some(Arc::new(move |mut job, step, chain, connection| {
                let api = api.clone();
                Box::pin(async move {
                    HubDeleter { api }
                        .sync_deletions(&mut job, &step, &chain, connection.as_ref())
                        .await
                })
            })),
            StepKind::Delete => Some(Arc::new(move |job, step, chain, connection| {
                let api = api.clone();
                Box::pin(async move {
                    HubDeleter { api }
                        .delete_indexed_document(&job, &step, &chain, connection.as_ref())
                        .await
                })
            })),
        }
    }

    fn delete_doc_by(&self, _job: &Job, _step: &JobStep) -> DeleteDocBy {
        DeleteDocBy::ByDocDisplayId
    }
}
