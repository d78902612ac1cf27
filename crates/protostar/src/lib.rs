//! Protostar: durable job-and-step orchestration
//!
//! # Overview
//!
//! Protostar persists units of ingestion work as a two-level model: a [`Job`]
//! is one ingestion request, its [`JobStep`]s are the atomic actions (crawl,
//! load, synchronize deletions, delete) performed for it. Steps are stored
//! durably, claimed atomically by workers, dispatched to per-datasource
//! handlers and marked done or failed. The engine tolerates competing nodes:
//! the claim protocol makes PENDING → IN_PROGRESS happen at most once per
//! step barring store races, and handlers are expected to be idempotent.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use protostar::{
//!     backends::sqlite::SqliteJobStore, BasicChain, ChainFactory, FeatureRegistry, JobQueue,
//!     QueueConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteJobStore::open("jobs.db").await?);
//!     let registry: Arc<FeatureRegistry<BasicChain>> = Arc::new(FeatureRegistry::new(vec![]));
//!     let factory: ChainFactory<BasicChain> = Arc::new(|queue| Arc::new(BasicChain::new(queue)));
//!     let queue = JobQueue::new(store.clone(), registry, store, factory, QueueConfig::default());
//!
//!     queue.start_or_resume_job(42).await?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod backends;
pub mod queue;
pub mod store;
pub mod workers;

pub use queue::{
    BasicChain, ChainFactory, Feature, FeatureRegistry, Handler, JobChain, JobQueue, QueueConfig,
};
pub use store::{
    Attachment, ConnectionLoader, ConnectionRepository, GenericConnectionLoader, JobStore,
    StoreError,
};
pub use workers::WorkerPool;

/// Status of a job step.
///
/// The numeric codes are part of the record encoding and are what the store
/// persists; PARKED exists in the closed set but is never assigned by the
/// engine itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Parked,
    InProgress,
    Done,
    Error,
}

impl StepStatus {
    /// Numeric record code for this status.
    pub fn code(self) -> i64 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Parked => 1000,
            StepStatus::InProgress => 2000,
            StepStatus::Done => 3000,
            StepStatus::Error => 4000,
        }
    }

    pub fn from_code(code: i64) -> anyhow::Result<Self> {
        match code {
            0 => Ok(StepStatus::Pending),
            1000 => Ok(StepStatus::Parked),
            2000 => Ok(StepStatus::InProgress),
            3000 => Ok(StepStatus::Done),
            4000 => Ok(StepStatus::Error),
            other => Err(anyhow::anyhow!("invalid job step status code: {other}")),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "PENDING"),
            StepStatus::Parked => write!(f, "PARKED"),
            StepStatus::InProgress => write!(f, "IN_PROGRESS"),
            StepStatus::Done => write!(f, "DONE"),
            StepStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Kind of action a job step performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Crawl,
    Load,
    SyncDeletions,
    Delete,
}

impl StepKind {
    pub fn code(self) -> i64 {
        match self {
            StepKind::Crawl => 0,
            StepKind::Load => 1,
            StepKind::SyncDeletions => 2,
            StepKind::Delete => 3,
        }
    }

    pub fn from_code(code: i64) -> anyhow::Result<Self> {
        match code {
            0 => Ok(StepKind::Crawl),
            1 => Ok(StepKind::Load),
            2 => Ok(StepKind::SyncDeletions),
            3 => Ok(StepKind::Delete),
            other => Err(anyhow::anyhow!("invalid job step kind code: {other}")),
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Crawl => write!(f, "CRAWL"),
            StepKind::Load => write!(f, "LOAD"),
            StepKind::SyncDeletions => write!(f, "SYNC_DELETIONS"),
            StepKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Which metadata field identifies the indexed documents of a source
/// document when deleting a previous revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteDocBy {
    ByDocId,
    ByDocDisplayId,
}

impl DeleteDocBy {
    /// Returns the index field to delete by and the matching key value taken
    /// from the given pair, if present.
    pub fn pick_key_for_delete(
        self,
        doc_id: Option<&str>,
        doc_display_id: Option<&str>,
    ) -> (&'static str, Option<String>) {
        match self {
            DeleteDocBy::ByDocId => ("metadata.doc_id", doc_id.map(str::to_owned)),
            DeleteDocBy::ByDocDisplayId => {
                ("metadata.doc_display_id", doc_display_id.map(str::to_owned))
            }
        }
    }
}

/// A file uploaded with a job request, held in memory until the job is
/// persisted (the store keeps it as an attachment of the job record).
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

/// An external request to ingest documents from one datasource.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub datasource: String,
    pub doc_id: Option<String>,
    pub doc_display_id: Option<String>,
    pub uri: Option<String>,
    pub load_directory: Option<bool>,
    pub modified_since: Option<DateTime<Utc>>,
    pub connection_id: Option<i64>,
    pub upload: Option<Arc<UploadedFile>>,
}

/// One independent ingestion unit. The job steps are the atomic actions
/// executed for it.
///
/// `datasource` names the system providing the documents; the technical
/// source may differ (an uploaded file, a URI, a directory on disk).
#[derive(Debug, Clone, Default)]
pub struct Job {
    /// Assigned by the store on persist.
    pub id: Option<i64>,
    pub datasource: String,
    /// ID of the document to load, when the job is narrowed to one document.
    pub doc_id: Option<String>,
    /// Display ID of the document to load.
    pub doc_display_id: Option<String>,
    pub uri: Option<String>,
    /// File name or path; determines where to load from when applicable.
    pub file: Option<String>,
    pub load_directory: Option<bool>,
    /// Set when the job was created from an upload request; the content goes
    /// into the job record as an attachment.
    pub upload: Option<Arc<UploadedFile>>,
    /// Filename of a previously persisted upload, valued when the job is
    /// loaded back from the store.
    pub stored_upload_filename: Option<String>,
    pub modified_since: Option<DateTime<Utc>>,
    pub connection_id: Option<i64>,
    /// `None` means `true`.
    pub sync_deletions: Option<bool>,
}

impl Job {
    /// Default construction from the common request fields. Features with
    /// domain-specific fields build on top of this.
    pub fn from_request(request: &JobRequest) -> Self {
        Job {
            datasource: request.datasource.clone(),
            doc_id: request.doc_id.clone(),
            doc_display_id: request.doc_display_id.clone(),
            modified_since: request.modified_since,
            connection_id: request.connection_id,
            ..Job::default()
        }
    }

    /// Whether this job should sync deletions. Defaults to `true` when it
    /// was not specified.
    pub fn defaulted_sync_deletions(&self) -> bool {
        self.sync_deletions.unwrap_or(true)
    }

    /// Filename of the uploaded file, from the in-memory upload or from the
    /// persisted record.
    pub fn upload_filename(&self) -> Option<&str> {
        self.upload
            .as_deref()
            .map(|upload| upload.filename.as_str())
            .or(self.stored_upload_filename.as_deref())
    }
}

/// One atomic action within a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStep {
    /// Assigned by the store on persist.
    pub id: Option<i64>,
    /// Monotone lexicographic ordering token, assigned by the store.
    pub display_id: Option<String>,
    /// ID of the parent job.
    pub job_id: Option<i64>,
    pub kind: StepKind,
    pub datasource: String,
    pub status: StepStatus,
    pub doc_id: Option<String>,
    pub doc_display_id: Option<String>,
    pub executing_node: Option<String>,
    pub error_details: Option<String>,
}

impl JobStep {
    pub fn new(kind: StepKind, datasource: impl Into<String>) -> Self {
        JobStep {
            id: None,
            display_id: None,
            job_id: None,
            kind,
            datasource: datasource.into(),
            status: StepStatus::Pending,
            doc_id: None,
            doc_display_id: None,
            executing_node: None,
            error_details: None,
        }
    }
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} step {} of job {} ({}, {})",
            self.kind,
            self.id.map_or_else(|| "?".into(), |id| id.to_string()),
            self.job_id.map_or_else(|| "?".into(), |id| id.to_string()),
            self.datasource,
            self.status,
        )
    }
}

/// A datasource-specific configuration record, loaded on demand and handed
/// to handlers together with the step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: i64,
    pub datasource: Option<String>,
    pub name: Option<String>,
    /// Free-form fields; features parse the shape they need.
    pub properties: serde_json::Value,
}

/// A unit of work executable by the worker pool.
#[derive(Debug, Clone)]
pub enum Work {
    Step(StepWork),
    PollMore(PollMoreWork),
}

/// Execute one claimed-to-be job step.
#[derive(Debug, Clone)]
pub struct StepWork {
    pub job: Job,
    pub step: JobStep,
    pub connection: Option<Connection>,
}

/// Fetch and submit the next page of pending steps for a job.
#[derive(Debug, Clone)]
pub struct PollMoreWork {
    pub job_id: i64,
    pub datasource: String,
    /// Polled steps must have a display ID greater than this one.
    pub after_display_id: Option<String>,
}
