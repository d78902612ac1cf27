//! File-backed features: uploaded files and a local source directory.
//!
//! The upload feature accepts any job request carrying an uploaded file;
//! the file travels with the job record as an attachment and is retrieved
//! through the chain at load time. The local-files feature crawls a
//! directory on disk; LOAD steps are keyed by the relative path, which also
//! serves as the deletion key, so removing a file from the directory
//! removes it from the index on the next sync.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use glob::Pattern;
use protostar::{
    Connection, DeleteDocBy, Feature, Handler, Job, JobChain, JobRequest, JobStep, StepKind,
};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Settings;
use crate::connections::datasource;
use crate::connections::deleter::Deleter;
use crate::indexing::{Document, DocumentMetadata, IndexingChain};

/// Decodes a loaded payload as text. Binary formats are not parsed; their
/// bytes are decoded leniently.
fn read_document_text(content: &[u8]) -> String {
    String::from_utf8_lossy(content).into_owned()
}

// ---------------------------------------------------------------------------
// Uploaded files

async fn load_upload_file(
    job: Job,
    step: JobStep,
    chain: Arc<IndexingChain>,
    _connection: Option<Connection>,
) -> anyhow::Result<()> {
    info!(step = %step, "loading uploaded file");

    let Some(attachment) = chain.job_attachment(&job).await? else {
        warn!(step = %step, "skipping loading uploaded file: job has no attachment");
        return Ok(());
    };
    let Some(filename) = attachment.filename.clone().filter(|name| !name.is_empty()) else {
        warn!(step = %step, "skipping loading uploaded file: no filename specified");
        return Ok(());
    };

    let doc_id = step.doc_id.clone().unwrap_or_else(|| filename.clone());
    let mut document = Document::from_text(read_document_text(&attachment.content));
    DocumentMetadata {
        source: Some(format!("{}/{}", step.datasource, doc_id)),
        doc_id: Some(doc_id),
        doc_display_id: step.doc_display_id.clone(),
        title: Some(filename),
        ..DocumentMetadata::default()
    }
    .apply_to(&mut document);

    chain.index_documents(&job, &step, vec![document]).await
}

/// Feature for jobs created from an uploaded file. It accepts any request
/// carrying one, whatever the datasource tag says.
pub struct UploadFeature;

impl Feature<IndexingChain> for UploadFeature {
    fn accept_job_request(&self, request: &JobRequest) -> bool {
        request.upload.is_some()
    }

    fn create_job(&self, request: &JobRequest) -> Job {
        Job {
            datasource: request.datasource.clone(),
            upload: request.upload.clone(),
            doc_id: request.doc_id.clone(),
            doc_display_id: request.doc_display_id.clone(),
            connection_id: request.connection_id,
            ..Job::default()
        }
    }

    fn accept_job(&self, job: &Job) -> bool {
        job.upload_filename().is_some()
    }

    fn create_first_job_step(&self, job: &Job) -> JobStep {
        JobStep {
            doc_id: job.doc_id.clone(),
            doc_display_id: job.doc_display_id.clone(),
            ..JobStep::new(StepKind::Load, job.datasource.clone())
        }
    }

    fn handler(&self, _job: &Job, step: &JobStep) -> Option<Handler<IndexingChain>> {
        match step.kind {
            StepKind::Load => Some(Arc::new(|job, step, chain, connection| {
                Box::pin(load_upload_file(job, step, chain, connection))
            })),
            _ => None,
        }
    }

    fn delete_doc_by(&self, _job: &Job, _step: &JobStep) -> DeleteDocBy {
        DeleteDocBy::ByDocId
    }
}

// ---------------------------------------------------------------------------
// Local source directory

/// Relative paths of the files under `root` matching any of the patterns.
fn find_matching_files(root: &Path, patterns: &[String]) -> anyhow::Result<Vec<String>> {
    let compiled: Vec<Pattern> = patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))
        })
        .collect::<anyhow::Result<_>>()?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if compiled.iter().any(|pattern| pattern.matches_path(relative)) {
            files.push(relative.to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

async fn crawl_directory(
    settings: Arc<Settings>,
    mut job: Job,
    _step: JobStep,
    chain: Arc<IndexingChain>,
    connection: Option<Connection>,
) -> anyhow::Result<()> {
    let root = Path::new(&settings.fs_source_dir);
    info!(root = %root.display(), "crawling source directory");

    for file in find_matching_files(root, &settings.fs_patterns())? {
        info!(file, "scheduling a LOAD step for file");
        let load_step = JobStep {
            job_id: job.id,
            doc_id: Some(file),
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

async fn load_local_file(
    settings: Arc<Settings>,
    job: Job,
    step: JobStep,
    chain: Arc<IndexingChain>,
    _connection: Option<Connection>,
) -> anyhow::Result<()> {
    let relative = step
        .doc_id
        .as_deref()
        .ok_or_else(|| anyhow!("LOAD step without a file path"))?;
    let path = Path::new(&settings.fs_source_dir).join(relative);

    info!(file = relative, "loading file");
    let content = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let title = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    let mut document = Document::from_text(read_document_text(&content));
    DocumentMetadata {
        source: Some(relative.to_string()),
        doc_id: Some(relative.to_string()),
        title,
        ..DocumentMetadata::default()
    }
    .apply_to(&mut document);

    chain.index_documents(&job, &step, vec![document]).await
}

struct LocalFilesDeleter {
    settings: Arc<Settings>,
}

#[async_trait]
impl Deleter for LocalFilesDeleter {
    fn source_document_label(&self) -> &str {
        "source file"
    }

    fn delete_doc_by(&self) -> DeleteDocBy {
        DeleteDocBy::ByDocId
    }

    async fn source_published_keys(
        &self,
        _job: &Job,
        _step: &JobStep,
        _connection: Option<&Connection>,
    ) -> anyhow::Result<HashSet<String>> {
        let files = find_matching_files(
            Path::new(&self.settings.fs_source_dir),
            &self.settings.fs_patterns(),
        )?;
        Ok(files.into_iter().collect())
    }
}

/// Feature for the local source directory.
pub struct LocalFilesFeature {
    settings: Arc<Settings>,
}

impl LocalFilesFeature {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }
}

impl Feature<IndexingChain> for LocalFilesFeature {
    fn accept_job_request(&self, request: &JobRequest) -> bool {
        request.datasource == datasource::FILES
    }

    fn accept_job(&self, job: &Job) -> bool {
        job.datasource == datasource::FILES
    }

    fn create_first_job_step(&self, job: &Job) -> JobStep {
        JobStep {
            doc_id: job.doc_id.clone(),
            ..JobStep::new(StepKind::Crawl, job.datasource.clone())
        }
    }

    fn handler(&self, _job: &Job, step: &JobStep) -> Option<Handler<IndexingChain>> {
        let settings = self.settings.clone();
        match step.kind {
            StepKind::Crawl => Some(Arc::new(move |job, step, chain, connection| {
                Box::pin(crawl_directory(settings.clone(), job, step, chain, connection))
            })),
            StepKind::Load => Some(Arc::new(move |job, step, chain, connection| {
                Box::pin(load_local_file(settings.clone(), job, step, chain, connection))
            })),
            StepKind::SyncDeletions => Some(Arc::new(move |mut job, step, chain, connection| {
                let settings = settings.clone();
                Box::pin(async move {
                    LocalFilesDeleter { settings }
                        .sync_deletions(&mut job, &step, &chain, connection.as_ref())
                        .await
                })
            })),
            StepKind::Delete => Some(Arc::new(move |job, step, chain, connection| {
                let settings = settings.clone();
                Box::pin(async move {
                    LocalFilesDeleter { settings }
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
