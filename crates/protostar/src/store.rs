//! Storage traits for jobs, job steps and connection records.
//!
//! The store is the single source of truth for step status. Implementations
//! must make [`JobStore::claim`] transition a step from PENDING to
//! IN_PROGRESS at most once per successful call; everything else is plain
//! record CRUD.

use async_trait::async_trait;
use thiserror::Error;

use crate::{Connection, Job, JobStep, StepStatus};

/// Errors raised by job storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The step is no longer PENDING; the work must be abandoned silently.
    #[error("job step {step_id} can no longer be claimed (status {status})")]
    ClaimConflict { step_id: i64, status: StepStatus },

    /// Transport failure while writing the claim; the step stays PENDING and
    /// will be picked up by a later resume.
    #[error("transport failure while claiming job step {step_id}")]
    ClaimTransport {
        step_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job step {0} not found")]
    StepNotFound(i64),

    #[error("connection {0} not found")]
    ConnectionNotFound(i64),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError::Backend(error.into())
    }
}

/// An uploaded file stored with its job record.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

/// Durable storage of jobs and their steps.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists the job and assigns its `id`. Reusing an already persisted
    /// job is a caller error.
    async fn store_job(&self, job: &mut Job) -> Result<(), StoreError>;

    /// Persists the step, assigning its `id` and a monotone `display_id`.
    ///
    /// When `job` is given it becomes the parent of the step and is persisted
    /// first if it has no id yet. Without a job, the step must already carry
    /// a `job_id`.
    async fn store_job_step(
        &self,
        step: &mut JobStep,
        job: Option<&mut Job>,
    ) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: i64) -> Result<Job, StoreError>;

    async fn get_job_step(&self, step_id: i64) -> Result<JobStep, StoreError>;

    /// Whether any step exists for the job (page-size-1 query).
    async fn has_job_steps(&self, job_id: i64) -> Result<bool, StoreError>;

    /// Returns up to `limit` PENDING steps of the job in ascending
    /// `display_id` order, cursor-exclusive on `after_display_id`.
    async fn get_pending_job_steps(
        &self,
        job_id: i64,
        limit: usize,
        after_display_id: Option<&str>,
    ) -> Result<Vec<JobStep>, StoreError>;

    /// Writes the step status. `executing_node` is left untouched when
    /// `None`; `error_details` is explicitly cleared when the status is not
    /// ERROR and no details are supplied.
    async fn set_job_step_status(
        &self,
        step_id: i64,
        status: StepStatus,
        executing_node: Option<&str>,
        error_details: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Atomically claims the step for `node`: re-reads it, refreshing the
    /// local `status` and `executing_node`, raises
    /// [`StoreError::ClaimConflict`] if it is no longer PENDING, then writes
    /// IN_PROGRESS guarded on the status still being PENDING. On success the
    /// local copy reflects IN_PROGRESS and the chosen node.
    async fn claim_job_step(&self, step: &mut JobStep, node: &str) -> Result<(), StoreError>;

    /// Returns the file stored with the job record, if any.
    async fn get_job_attachment(&self, job_id: i64) -> Result<Option<Attachment>, StoreError>;
}

/// Access to job connection configuration records.
#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn get_connection(&self, connection_id: i64) -> Result<Connection, StoreError>;
}

/// Loads one connection configuration. Features return a specialized loader
/// when the generic record shape is not enough.
#[async_trait]
pub trait ConnectionLoader: Send + Sync {
    async fn load(&self) -> Result<Connection, StoreError>;
}

/// Default loader returning the connection record as stored.
pub struct GenericConnectionLoader {
    connection_id: i64,
    repository: std::sync::Arc<dyn ConnectionRepository>,
}

impl GenericConnectionLoader {
    pub fn new(connection_id: i64, repository: std::sync::Arc<dyn ConnectionRepository>) -> Self {
        GenericConnectionLoader {
            connection_id,
            repository,
        }
    }
}

#[async_trait]
impl ConnectionLoader for GenericConnectionLoader {
    async fn load(&self) -> Result<Connection, StoreError> {
        self.repository.get_connection(self.connection_id).await
    }
}
