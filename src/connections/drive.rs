//! Hosted knowledge-article platform connector.
//!
//! Articles are addressed by their human-facing display id, which is also
//! the deletion key: indexed documents are deleted by
//! `metadata.doc_display_id`. Every article is authored against one of a
//! closed set of templates; the loader dispatches on the template and
//! assembles the indexable content from that template's fields.

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
pub struct DriveConnection {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DriveConnection {
    pub fn from_connection(connection: &Connection) -> anyhow::Result<Self> {
        serde_json::from_value(connection.properties.clone())
            .with_context(|| format!("invalid DRV connection {} properties", connection.id))
    }
}

/// The article templates the platform publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleTemplate {
    HowTo,
    ProblemSolution,
    KnownError,
    Reference,
    Kcs,
}

impl ArticleTemplate {
    /// Parses the platform's template name; `None` for templates this
    /// connector does not index.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "howto" | "how-to" => Some(ArticleTemplate::HowTo),
            "problem-solution" => Some(ArticleTemplate::ProblemSolution),
            "known-error" => Some(ArticleTemplate::KnownError),
            "reference" => Some(ArticleTemplate::Reference),
            "kcs" => Some(ArticleTemplate::Kcs),
            _ => None,
        }
    }
}

/// Listing entry of one published article.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveArticle {
    pub display_id: String,
    /// Key of the template-specific detail record.
    pub guid: Option<String>,
    pub template: Option<String>,
    pub title: String,
    pub language: Option<String>,
    pub internal: Option<bool>,
    pub company: Option<String>,
}

/// The template-specific fields of one article.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateDetails {
    HowTo {
        question: String,
        answer: String,
        technician_notes: String,
    },
    ProblemSolution {
        problem: String,
        solution: String,
        technician_notes: String,
    },
    KnownError {
        error: String,
        root_cause: String,
        fix: String,
        technician_notes: String,
    },
    Reference {
        reference: String,
    },
    Kcs {
        problem: String,
        environment: String,
        resolution: String,
        cause: String,
    },
}

/// The platform API surface the handlers consume.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Display ids of the published articles. Scoping down to one display
    /// id is supported; the platform deletes by display id anyway.
    async fn document_display_ids(
        &self,
        display_id: Option<&str>,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<String>>;

    /// The manager entry of the specified article, or `None` if it is not
    /// published.
    async fn get_article(&self, display_id: &str) -> anyhow::Result<Option<DriveArticle>>;

    /// The template-specific detail record of an article.
    async fn get_template_details(
        &self,
        template: ArticleTemplate,
        guid: &str,
    ) -> anyhow::Result<Option<TemplateDetails>>;
}

pub trait DriveApiFactory: Send + Sync {
    fn open(&self, connection: Option<&Connection>) -> anyhow::Result<Arc<dyn DriveApi>>;
}

/// Cleans the template fields and assembles the indexable content, or
/// `None` when the template's main field is empty after cleanup.
pub fn assemble_article_content(
    title: &str,
    display_id: &str,
    details: &TemplateDetails,
) -> Option<String> {
    match details {
        TemplateDetails::HowTo {
            question,
            answer,
            technician_notes,
        } => {
            let answer = clean_text(answer);
            if answer.is_empty() {
                return None;
            }
            Some(format!(
                "Title={title} Question={} doc_display_id={display_id} {answer} Technical Notes={}",
                clean_text(question),
                clean_text(technician_notes),
            ))
        }
        TemplateDetails::ProblemSolution {
            problem,
            solution,
            technician_notes,
        } => {
            let solution = clean_text(solution);
            if solution.is_empty() {
                return None;
            }
            Some(format!(
                "Title={title} Question={} doc_display_id={display_id} {solution} Technical Notes={}",
                clean_text(problem),
                clean_text(technician_notes),
            ))
        }
        TemplateDetails::KnownError {
            error,
            root_cause,
            fix,
            technician_notes,
        } => {
            let fix = clean_text(fix);
            if fix.is_empty() {
                return None;
            }
            Some(format!(
                "Title={title} Error={} doc_display_id={display_id} Root Cause={} Fix={fix} Technical Notes={}",
                clean_text(error),
                clean_text(root_cause),
                clean_text(technician_notes),
            ))
        }
        TemplateDetails::Reference { reference } => {
            let reference = clean_text(reference);
            if reference.is_empty() {
                return None;
            }
            Some(format!(
                "Title={title} doc_display_id={display_id} Reference={reference}"
            ))
        }
        TemplateDetails::Kcs {
            problem,
            environment,
            resolution,
            cause,
        } => {
            let problem = clean_text(problem);
            if problem.is_empty() {
                return None;
            }
            Some(format!(
                "Title={title} doc_display_id={display_id} Problem={problem} Environment={} Resolution={} Cause={}",
                clean_text(environment),
                clean_text(resolution),
                clean_text(cause),
            ))
        }
    }
}

/// Language names the platform reports mapped to IETF tags. Values already
/// shaped like tags pass through; anything else is dropped.
pub fn article_language_tag(language: Option<&str>) -> Option<String> {
    const LANGUAGE_TAGS: [(&str, &str); 12] = [
        ("english", "en"),
        ("french", "fr"),
        ("german", "de"),
        ("italian", "it"),
        ("japanese", "ja"),
        ("korean", "ko"),
        ("spanish", "es"),
        ("portuguese", "pt"),
        ("russian", "ru"),
        ("dutch", "nl"),
        ("polish", "pl"),
        ("chinese", "zh-CN"),
    ];

    let language = language?.trim();
    if language.is_empty() {
        return None;
    }
    let lowered = language.to_ascii_lowercase();
    if let Some((_, tag)) = LANGUAGE_TAGS.iter().find(|(name, _)| *name == lowered) {
        return Some((*tag).to_string());
    }
    // "en", "pt-BR" and the like are already tags.
    if language.len() <= 5 && language.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
        return Some(lowered);
    }
    None
}

#[derive(Deserialize)]
struct DocumentListingDto {
    documents: Vec<DocumentRefDto>,
}

#[derive(Deserialize)]
struct DocumentRefDto {
    #[serde(rename = "displayId")]
    display_id: String,
}

#[derive(Deserialize)]
struct ArticleDto {
    #[serde(rename = "displayId")]
    display_id: String,
    guid: Option<String>,
    template: Option<String>,
    title: String,
    language: Option<String>,
    internal: Option<bool>,
    company: Option<String>,
}

#[derive(Deserialize)]
struct HowToDto {
    question: String,
    answer: String,
    #[serde(rename = "technicianNotes", default)]
    technician_notes: String,
}

#[derive(Deserialize)]
struct ProblemSolutionDto {
    problem: String,
    solution: String,
    #[serde(rename = "technicianNotes", default)]
    technician_notes: String,
}

#[derive(Deserialize)]
struct KnownErrorDto {
    error: String,
    #[serde(rename = "rootCause", default)]
    root_cause: String,
    fix: String,
    #[serde(rename = "technicianNotes", default)]
    technician_notes: String,
}

#[derive(Deserialize)]
struct ReferenceDto {
    reference: String,
}

#[derive(Deserialize)]
struct KcsDto {
    problem: String,
    #[serde(default)]
    environment: String,
    #[serde(default)]
    resolution: String,
    #[serde(default)]
    cause: String,
}

pub struct HttpDriveApi {
    client: RestClient,
}

#[async_trait]
impl DriveApi for HttpDriveApi {
    async fn document_display_ids(
        &self,
        display_id: Option<&str>,
        modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<String>> {
        let mut query: Vec<(&str, String)> = vec![("status", "published".to_string())];
        if let Some(display_id) = display_id {
            query.push(("displayId", display_id.to_string()));
        }
        if let Some(modified_since) = modified_since {
            query.push(("modifiedSince", modified_since.to_rfc3339()));
        }
        let listing: DocumentListingDto = self.client.get_json("/api/articles", &query).await?;
        Ok(listing
            .documents
            .into_iter()
            .map(|document| document.display_id)
            .collect())
    }

    async fn get_article(&self, display_id: &str) -> anyhow::Result<Option<DriveArticle>> {
        let ids = self.document_display_ids(Some(display_id), None).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        let article: ArticleDto = self
            .client
            .get_json(&format!("/api/articles/{display_id}"), &[])
            .await?;
        Ok(Some(DriveArticle {
            display_id: article.display_id,
            guid: article.guid,
            template: article.template,
            title: article.title,
            language: article.language,
            internal: article.internal,
            company: article.company,
        }))
    }

    async fn get_template_details(
        &self,
        template: ArticleTemplate,
        guid: &str,
    ) -> anyhow::Result<Option<TemplateDetails>> {
        let details = match template {
            ArticleTemplate::HowTo => {
                let dto: HowToDto = self
                    .client
                    .get_json(&format!("/api/articles/templates/howto/{guid}"), &[])
                    .await?;
                TemplateDetails::HowTo {
                    question: dto.question,
                    answer: dto.answer,
                    technician_notes: dto.technician_notes,
                }
            }
            ArticleTemplate::ProblemSolution => {
                let dto: ProblemSolutionDto = self
                    .client
                    .get_json(
                        &format!("/api/articles/templates/problem-solution/{guid}"),
                        &[],
                    )
                    .await?;
                TemplateDetails::ProblemSolution {
                    problem: dto.problem,
                    solution: dto.solution,
                    technician_notes: dto.technician_notes,
                }
            }
            ArticleTemplate::KnownError => {
                let dto: KnownErrorDto = self
                    .client
                    .get_json(&format!("/api/articles/templates/known-error/{guid}"), &[])
                    .await?;
                TemplateDetails::KnownError {
                    error: dto.error,
                    root_cause: dto.root_cause,
                    fix: dto.fix,
                    technician_notes: dto.technician_notes,
                }
            }
            ArticleTemplate::Reference => {
                let dto: ReferenceDto = self
                    .client
                    .get_json(&format!("/api/articles/templates/reference/{guid}"), &[])
                    .await?;
                TemplateDetails::Reference {
                    reference: dto.reference,
                }
            }
            ArticleTemplate::Kcs => {
                let dto: KcsDto = self
                    .client
                    .get_json(&format!("/api/articles/templates/kcs/{guid}"), &[])
                    .await?;
                TemplateDetails::Kcs {
                    problem: dto.problem,
                    environment: dto.environment,
                    resolution: dto.resolution,
                    cause: dto.cause,
                }
            }
        };
        Ok(Some(details))
    }
}

pub struct HttpDriveApiFactory {
    settings: Arc<Settings>,
}

impl DriveApiFactory for HttpDriveApiFactory {
    fn open(&self, connection: Option<&Connection>) -> anyhow::Result<Arc<dyn DriveApi>> {
        let config = connection
            .map(DriveConnection::from_connection)
            .transpose()?
            .unwrap_or_default();
        let base_url = config
            .base_url
            .or_else(|| self.settings.drv_url.clone())
            .ok_or_else(|| anyhow!("DRV base URL is not configured"))?;
        let username = config
            .username
            .or_else(|| self.settings.drv_user.clone())
            .unwrap_or_default();
        let password = config
            .password
            .or_else(|| self.settings.drv_password.clone())
            .unwrap_or_default();
        Ok(Arc::new(HttpDriveApi {
            client: RestClient::new(base_url, username, password),
        }))
    }
}

async fn crawl_drive(
    api: Arc<dyn DriveApiFactory>,
    mut job: Job,
    _step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    info!("crawling platform articles");
    let drive = api.open(connection.as_ref())?;
    let display_ids = drive
        .document_display_ids(job.doc_display_id.as_deref(), job.modified_since)
        .await?;

    if display_ids.is_empty() {
        info!("found no published platform articles to load");
    }
    for display_id in &display_ids {
        info!(display_id, "scheduling a LOAD step for platform article");
        let load_step = JobStep {
            job_id: job.id,
            doc_display_id: Some(display_id.clone()),
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

async fn load_drive_article(
    api: Arc<dyn DriveApiFactory>,
    job: Job,
    step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    let display_id = step
        .doc_display_id
        .as_deref()
        .ok_or_else(|| anyhow!("LOAD step without an article display id"))?;

    info!(display_id, "loading platform article");
    let drive = api.open(connection.as_ref())?;
    let Some(article) = drive.get_article(display_id).await? else {
        info!(display_id, "skipping loading platform article: not published anymore");
        return Ok(());
    };

    let Some(template_name) = article.template.as_deref() else {
        info!(display_id, "skipping loading platform article: it carries no template");
        return Ok(());
    };
    let Some(template) = ArticleTemplate::from_name(template_name) else {
        info!(
            display_id,
            template = template_name,
            "skipping loading platform article: unsupported template"
        );
        return Ok(());
    };
    let Some(guid) = article.guid.as_deref() else {
        info!(display_id, "skipping loading platform article: it carries no guid");
        return Ok(());
    };

    let title = clean_text(&article.title);
    if title.is_empty() {
        // However improbable.
        info!(display_id, "skipping loading platform article: empty title");
        return Ok(());
    }

    let Some(details) = drive.get_template_details(template, guid).await? else {
        info!(display_id, "skipping loading platform article: no template details");
        return Ok(());
    };
    let Some(content) = assemble_article_content(&title, display_id, &details) else {
        info!(display_id, "skipping loading platform article: empty content after cleanup");
        return Ok(());
    };

    let mut document = Document::from_text(content);
    DocumentMetadata {
        doc_id: article.guid.clone(),
        doc_display_id: Some(article.display_id.clone()),
        source: Some(format!(
            "{}/{}/{}",
            step.datasource, template_name, article.display_id
        )),
        connection_id: connection.as_ref().map(|connection| connection.id.to_string()),
        title: Some(title),
        language: article_language_tag(article.language.as_deref()),
        internal: article.internal,
        company: article.company.clone(),
        ..DocumentMetadata::default()
    }
    .apply_to(&mut document);

    chain.index_documents(&job, &step, vec![document]).await
}

struct DriveDeleter {
    api: Arc<dyn DriveApiFactory>,
}

#[async_trait]
impl Deleter for DriveDeleter {
    fn source_document_label(&self) -> &str {
        "platform article"
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
        let drive = self.api.open(connection)?;
        let display_ids = drive
            .document_display_ids(job.doc_display_id.as_deref(), None)
            .await?;
        Ok(display_ids.into_iter().collect())
    }
}

/// Feature binding the hosted knowledge-article platform to its handlers.
pub struct DriveFeature {
    api: Arc<dyn DriveApiFactory>,
}

impl DriveFeature {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            api: Arc::new(HttpDriveApiFactory { settings }),
        }
    }

    pub fn with_factory(api: Arc<dyn DriveApiFactory>) -> Self {
        Self { api }
    }
}

impl Feature<IndexingChain> for DriveFeature {
    fn accept_job_request(&self, request: &protostar::JobRequest) -> bool {
        request.datasource == datasource::DRIVE
    }

    fn accept_job(&self, job: &Job) -> bool {
        job.datasource == datasource::DRIVE
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
                Box::pin(crawl_drive(api.clone(), job, step, chain, connection))
            })),
            StepKind::Load => Some(Arc::new(move |job, step, chain, connection| {
                Box::pin(load_drive_article(api.clone(), job, step, chain, connection))
            })),
            StepKind::SyncDeletions => Some(Arc::new(move |mut job, step, chain, connection| {
                let api = api.clone();
                Box::pin(async move {
                    DriveDeleter { api }
                        .sync_deletions(&mut job, &step, &chain, connection.as_ref())
                        .await
                })
            })),
            StepKind::Delete => Some(Arc::new(move |job, step, chain, connection| {
                let api = api.clone();
                Box::pin(async move {
                    DriveDeleter { api }
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
