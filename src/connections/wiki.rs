//! Wiki connector.
//!
//! Crawls the page tree below a root page configured on the connection and
//! loads page bodies. The wiki keeps no deletion feed, so this feature has
//! no deletion-sync handlers.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use protostar::{
    Connection, DeleteDocBy, Feature, Handler, Job, JobChain, JobStep, StepKind,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Settings;
use crate::connections::datasource;
use crate::indexing::{Document, DocumentMetadata, IndexingChain};
use crate::text::clean_text;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WikiConnection {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root of the crawled page tree.
    pub root_page_id: Option<String>,
}

impl WikiConnection {
    pub fn from_connection(connection: &Connection) -> anyhow::Result<Self> {
        serde_json::from_value(connection.properties.clone())
            .with_context(|| format!("invalid WIKI connection {} properties", connection.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WikiPage {
    pub id: String,
    pub title: String,
    pub body: String,
    pub web_url: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// The wiki API surface the handlers consume.
#[async_trait]
pub trait WikiApi: Send + Sync {
    /// The given page id plus the ids of all its descendants.
    async fn page_with_descendant_ids(&self, root_page_id: &str) -> anyhow::Result<Vec<String>>;

    /// The specified page, or `None` if it does not exist.
    async fn get_page(&self, page_id: &str) -> anyhow::Result<Option<WikiPage>>;
}

pub trait WikiApiFactory: Send + Sync {
    fn open(&self, connection: Option<&Connection>) -> anyhow::Result<Arc<dyn WikiApi>>;
}

/// REST implementation using the wiki's content API with basic auth.
pub struct HttpWikiApi {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpWikiApi {
    async fn get(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        Ok(response)
    }
}

#[async_trait]
impl WikiApi for HttpWikiApi {
    async fn page_with_descendant_ids(&self, root_page_id: &str) -> anyhow::Result<Vec<String>> {
        let response = self
            .get(
                &format!("/rest/api/content/{root_page_id}/descendant/page"),
                &[("limit", "1000")],
            )
            .await?
            .error_for_status()
            .context("listing wiki page descendants")?;
        let body: Value = response.json().await.context("parsing wiki page listing")?;

        let mut page_ids = vec![root_page_id.to_string()];
        if let Some(results) = body["results"].as_array() {
            for result in results {
                if let Some(id) = result["id"].as_str() {
                    page_ids.push(id.to_string());
                }
            }
        }
        Ok(page_ids)
    }

    async fn get_page(&self, page_id: &str) -> anyhow::Result<Option<WikiPage>> {
        let response = self
            .get(
                &format!("/rest/api/content/{page_id}"),
                &[("expand", "body.storage,version")],
            )
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().context("fetching wiki page")?;
        let body: Value = response.json().await.context("parsing wiki page")?;

        let last_modified = body["version"]["when"]
            .as_str()
            .and_then(|when| DateTime::parse_from_rfc3339(when).ok())
            .map(|when| when.with_timezone(&Utc));

        Ok(Some(WikiPage {
            id: body["id"].as_str().unwrap_or(page_id).to_string(),
            title: body["title"].as_str().unwrap_or_default().to_string(),
            body: body["body"]["storage"]["value"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            web_url: body["_links"]["webui"].as_str().map(str::to_string),
            last_modified,
        }))
    }
}

pub struct HttpWikiApiFactory {
    settings: Arc<Settings>,
}

impl WikiApiFactory for HttpWikiApiFactory {
    fn open(&self, connection: Option<&Connection>) -> anyhow::Result<Arc<dyn WikiApi>> {
        let config = connection
            .map(WikiConnection::from_connection)
            .transpose()?
            .unwrap_or_default();
        let base_url = config
            .base_url
            .or_else(|| self.settings.wiki_url.clone())
            .ok_or_else(|| anyhow!("WIKI base URL is not configured"))?;
        Ok(Arc::new(HttpWikiApi {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username: config
                .username
                .or_else(|| self.settings.wiki_user.clone())
                .unwrap_or_default(),
            password: config
                .password
                .or_else(|| self.settings.wiki_password.clone())
                .unwrap_or_default(),
        }))
    }
}

/// Root page of the crawl: the connection configuration wins, the job's
/// `doc_id` allows narrowing to a subtree.
fn crawl_root_page(job: &Job, connection: Option<&Connection>) -> anyhow::Result<Option<String>> {
    if let Some(doc_id) = &job.doc_id {
        return Ok(Some(doc_id.clone()));
    }
    match connection {
        Some(connection) => Ok(WikiConnection::from_connection(connection)?.root_page_id),
        None => Ok(None),
    }
}

async fn crawl_wiki(
    api: Arc<dyn WikiApiFactory>,
    mut job: Job,
    _step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    let Some(root_page_id) = crawl_root_page(&job, connection.as_ref())? else {
        warn!("wiki root page id not defined");
        return Ok(());
    };
    info!(root_page_id, "crawling wiki pages");

    let wiki = api.open(connection.as_ref())?;
    for page_id in wiki.page_with_descendant_ids(&root_page_id).await? {
        info!(page_id, "scheduling a LOAD step for wiki page");
        let load_step = JobStep {
            job_id: job.id,
            doc_id: Some(page_id),
            ..JobStep::new(StepKind::Load, job.datasource.clone())
        };
        chain
            .queue_job_step(&mut job, load_step, connection.as_ref(), false)
            .await?;
    }
    chain.execute_job_steps(&job).await?;
    Ok(())
}

/// Whether the page should be (re-)indexed: it must have a title and
/// content, and must have been modified after the job's `modified_since`
/// instant when one is set.
fn is_page_indexable(page: &WikiPage, modified_since: Option<DateTime<Utc>>) -> bool {
    if page.title.trim().is_empty() {
        info!(page_id = %page.id, "skipping wiki page: title is empty");
        return false;
    }
    if page.body.trim().is_empty() {
        info!(page_id = %page.id, "skipping wiki page: content is empty");
        return false;
    }
    if let (Some(modified_since), Some(last_modified)) = (modified_since, page.last_modified) {
        if modified_since >= last_modified {
            info!(
                page_id = %page.id,
                %modified_since,
                "skipping wiki page: it was not updated after the requested instant"
            );
            return false;
        }
    }
    true
}

async fn load_wiki_page(
    api: Arc<dyn WikiApiFactory>,
    job: Job,
    step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    let page_id = step
        .doc_id
        .as_deref()
        .ok_or_else(|| anyhow!("LOAD step without a page id"))?;

    info!(page_id, "loading wiki page");
    let wiki = api.open(connection.as_ref())?;
    let Some(page) = wiki.get_page(page_id).await? else {
        info!(page_id, "skipping loading wiki page: gone");
        return Ok(());
    };
    if !is_page_indexable(&page, job.modified_since) {
        return Ok(());
    }

    let title = clean_text(&page.title);
    let body = clean_text(&page.body);
    if body.is_empty() {
        info!(page_id, "skipping loading wiki page: empty body after cleanup");
        return Ok(());
    }

    let mut document = Document::from_text(format!("Title={title} {body}"));
    DocumentMetadata {
        doc_id: Some(page.id.clone()),
        source: Some(format!("{}/{}", step.datasource, page.id)),
        connection_id: connection.as_ref().map(|connection| connection.id.to_string()),
        title: Some(title),
        web_url: page.web_url.clone(),
        ..DocumentMetadata::default()
    }
    .apply_to(&mut document);

    chain.index_documents(&job, &step, vec![document]).await
}

/// Feature binding the wiki datasource to its handlers.
pub struct WikiFeature {
    api: Arc<dyn WikiApiFactory>,
}

impl WikiFeature {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            api: Arc::new(HttpWikiApiFactory { settings }),
        }
    }

    pub fn with_factory(api: Arc<dyn WikiApiFactory>) -> Self {
        Self { api }
    }
}

impl Feature<IndexingChain> for WikiFeature {
    fn accept_job_request(&self, request: &protostar::JobRequest) -> bool {
        request.datasource == datasource::WIKI
    }

    fn accept_job(&self, job: &Job) -> bool {
        job.datasource == datasource::WIKI
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
                Box::pin(crawl_wiki(api.clone(), job, step, chain, connection))
            })),
            StepKind::Load => Some(Arc::new(move |job, step, chain, connection| {
                Box::pin(load_wiki_page(api.clone(), job, step, chain, connection))
            })),
            _ => None,
        }
    }

    fn delete_doc_by(&self, _job: &Job, _step: &JobStep) -> DeleteDocBy {
        DeleteDocBy::ByDocId
    }
}
