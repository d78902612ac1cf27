//! Multipart file upload endpoint.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use protostar::{JobRequest, UploadedFile};

use crate::api::jobs::{submit_job_request, JobResponse};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const CONTENT_TYPE_PDF: &str = "application/pdf";
const CONTENT_TYPE_WORD: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const CONTENT_TYPE_TEXT: &str = "text/plain";
const CONTENT_TYPE_MARKDOWN: &str = "text/markdown";

const SUPPORTED_CONTENT_TYPES: [&str; 4] = [
    CONTENT_TYPE_PDF,
    CONTENT_TYPE_WORD,
    CONTENT_TYPE_TEXT,
    CONTENT_TYPE_MARKDOWN,
];

/// Accepts an uploaded file with a `datasource` form field and queues a job
/// loading it.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<JobResponse>)> {
    let mut datasource: Option<String> = None;
    let mut upload: Option<UploadedFile> = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("datasource") => datasource = Some(field.text().await?),
            Some("upload_file") => {
                let filename = field.file_name().map(str::to_string).ok_or_else(|| {
                    ApiError::BadRequest("upload_file part must carry a filename".to_string())
                })?;
                let content_type = field.content_type().map(str::to_string);
                match content_type.as_deref() {
                    Some(content_type)
                        if SUPPORTED_CONTENT_TYPES.contains(&content_type) => {}
                    other => {
                        return Err(ApiError::UnsupportedMediaType(
                            other.unwrap_or("unspecified").to_string(),
                        ))
                    }
                }

                let content = field.bytes().await?.to_vec();
                if content.len() > state.settings.max_upload_bytes {
                    return Err(ApiError::PayloadTooLarge);
                }
                upload = Some(UploadedFile {
                    filename,
                    content_type,
                    content,
                });
            }
            _ => {}
        }
    }

    let datasource =
        datasource.ok_or_else(|| ApiError::BadRequest("missing datasource field".to_string()))?;
    let upload =
        upload.ok_or_else(|| ApiError::BadRequest("missing upload_file field".to_string()))?;

    let request = JobRequest {
        datasource,
        upload: Some(Arc::new(upload)),
        ..JobRequest::default()
    };
    submit_job_request(&state, request).await
}
