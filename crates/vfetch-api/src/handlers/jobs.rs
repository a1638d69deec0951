//! Asynchronous job submission and status.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::info;
use vfetch_models::{JobId, JobSnapshot};
use vfetch_pipeline::PipelineError;

use crate::error::ApiResult;
use crate::handlers::fetch::{stream_result, FetchRequest};
use crate::state::AppState;

#[derive(Serialize)]
pub struct SubmitResponse {
    /// Whether an identical job was already known
    pub coalesced: bool,
    #[serde(flatten)]
    pub job: JobSnapshot,
}

/// `POST /jobs`: start (or join) a job without waiting for it.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<FetchRequest>,
) -> ApiResult<Response> {
    let format = request.target_format()?;
    let handle = state.pipeline.submit(&request.url, format)?;
    let coalesced = handle.is_coalesced();
    let fallback = handle.detach();
    let job = state.pipeline.snapshot(&fallback.job_id).unwrap_or(fallback);

    info!(job_id = %job.job_id, coalesced, "Job accepted");
    let location = format!("/jobs/{}", job.job_id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(SubmitResponse { coalesced, job }),
    )
        .into_response())
}

/// `GET /jobs/:job_id`: live snapshot, or the final one from recent history.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let job_id = JobId::from_string(job_id);
    state
        .pipeline
        .snapshot(&job_id)
        .map(Json)
        .ok_or_else(|| PipelineError::NotFound(job_id).into())
}

/// `GET /jobs/:job_id/result`: wait for the job and stream its file.
pub async fn get_job_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let job_id = JobId::from_string(job_id);
    let handle = match state.pipeline.attach(&job_id) {
        Ok(handle) => handle,
        // Finished jobs still answer with their recorded outcome.
        Err(PipelineError::NotFound(id)) => {
            return Err(match state.pipeline.snapshot(&id).and_then(|s| s.error) {
                Some(failure) => PipelineError::job_failed(id, failure).into(),
                None => PipelineError::NotFound(id).into(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let lease = handle.wait().await?;
    stream_result(lease).await
}
