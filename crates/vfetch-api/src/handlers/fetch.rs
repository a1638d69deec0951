//! Synchronous fetch: submit (or attach), wait, stream the file.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use futures_util::Stream;
use serde::Deserialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;
use vfetch_models::TargetFormat;
use vfetch_pipeline::ResultLease;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::middleware::JOB_ID_HEADER;
use crate::state::AppState;

/// Fetch parameters, from the query string or a JSON body.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub format: Option<String>,
}

impl FetchRequest {
    pub fn target_format(&self) -> ApiResult<TargetFormat> {
        TargetFormat::parse_param(self.format.as_deref())
            .map_err(|e| ApiError::bad_request(e.to_string()))
    }
}

/// `GET /fetch?url=..&format=..`
pub async fn fetch_get(
    State(state): State<AppState>,
    Query(request): Query<FetchRequest>,
) -> ApiResult<Response> {
    fetch(&state, request).await
}

/// `POST /fetch` with `{"url": .., "format": ..}`
pub async fn fetch_post(
    State(state): State<AppState>,
    Json(request): Json<FetchRequest>,
) -> ApiResult<Response> {
    fetch(&state, request).await
}

async fn fetch(state: &AppState, request: FetchRequest) -> ApiResult<Response> {
    let format = request.target_format()?;
    let handle = state.pipeline.submit(&request.url, format)?;
    debug!(
        job_id = %handle.job_id(),
        coalesced = handle.is_coalesced(),
        "Waiting for job"
    );
    // Dropping this future (client gone) drops the handle and its interest.
    let lease = handle.wait().await?;
    stream_result(lease).await
}

/// Response body that keeps the result lease alive until the transfer ends
/// or the client disconnects.
struct LeasedBody {
    inner: ReaderStream<File>,
    _lease: ResultLease,
}

impl Stream for LeasedBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Stream a finished result with download headers.
pub async fn stream_result(lease: ResultLease) -> ApiResult<Response> {
    let file = lease
        .open()
        .await
        .map_err(|e| ApiError::internal(format!("failed to open result: {e}")))?;
    let info = lease.info().clone();
    let job_id = lease.job_id().to_string();

    metrics::record_result_streamed(&info.content_type, info.size_bytes);

    let body = Body::from_stream(LeasedBody {
        inner: ReaderStream::new(file),
        _lease: lease,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, info.content_type)
        .header(header::CONTENT_LENGTH, info.size_bytes)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", info.file_name),
        )
        .header(header::CACHE_CONTROL, "no-store")
        .header(JOB_ID_HEADER, job_id)
        .body(body)
        .map_err(|e| ApiError::internal(format!("Failed to build response: {e}")))
}
