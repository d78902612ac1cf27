//! Job submission and execution endpoints.

use anyhow::anyhow;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use protostar::JobRequest;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Body of `POST /jobs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub datasource: String,
    pub doc_id: Option<String>,
    pub doc_display_id: Option<String>,
    pub uri: Option<String>,
    pub load_directory: Option<bool>,
    pub modified_since: Option<DateTime<Utc>>,
    pub connection_id: Option<i64>,
}

impl JobSubmission {
    pub fn into_request(self) -> JobRequest {
        JobRequest {
            datasource: self.datasource,
            doc_id: self.doc_id,
            doc_display_id: self.doc_display_id,
            uri: self.uri,
            load_directory: self.load_directory,
            modified_since: self.modified_since,
            connection_id: self.connection_id,
            upload: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: i64,
}

/// Body of `POST /jobexecutions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub job_id: i64,
}

/// Submits a job which will index the specified documents. The work happens
/// asynchronously; failures are visible on the step records.
pub async fn create_job(
    State(state): State<AppState>,
    Json(submission): Json<JobSubmission>,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    submit_job_request(&state, submission.into_request()).await
}

/// Shared by the JSON and the multipart submission endpoints.
pub(crate) async fn submit_job_request(
    state: &AppState,
    request: JobRequest,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let Some((mut job, step)) = state.features().convert_to_job_and_first_step(&request)? else {
        return Err(ApiError::BadRequest("unsupported job request".to_string()));
    };

    let connection = state.queue.resolve_connection(&job).await?;
    state
        .queue
        .queue_job_step(&mut job, step, connection.as_ref(), true)
        .await?;

    let job_id = job
        .id
        .ok_or_else(|| ApiError::Internal(anyhow!("persisted job has no id")))?;
    Ok((StatusCode::ACCEPTED, Json(JobResponse { id: job_id })))
}

/// Triggers the execution of the specified job; resumes it if it already
/// started.
pub async fn execute_job(
    State(state): State<AppState>,
    Json(execution): Json<JobExecution>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    state.queue.start_or_resume_job(execution.job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({}))))
}
