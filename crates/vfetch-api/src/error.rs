//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use vfetch_models::FailureKind;
use vfetch_pipeline::PipelineError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) | ApiError::Pipeline(PipelineError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Pipeline(e) => status_for_kind(e.kind()),
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) | ApiError::Pipeline(PipelineError::NotFound(_)) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::RateLimited => "rate_limited",
            ApiError::Internal(_) => FailureKind::InternalError.as_str(),
            ApiError::Pipeline(e) => e.kind().as_str(),
        }
    }

    fn is_internal(&self) -> bool {
        match self {
            ApiError::Internal(_) => true,
            ApiError::Pipeline(PipelineError::NotFound(_)) => false,
            ApiError::Pipeline(e) => e.kind() == FailureKind::InternalError,
            _ => false,
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::Pipeline(e @ (PipelineError::Media(_) | PipelineError::JobFailed { .. })) => {
                e.diagnostic()
            }
            other => other.to_string(),
        }
    }
}

/// HTTP status for a client-visible failure kind.
pub fn status_for_kind(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::InvalidSource => StatusCode::BAD_REQUEST,
        FailureKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        FailureKind::LaunchFailure
        | FailureKind::Killed
        | FailureKind::StageFailed
        | FailureKind::DownloadFailed
        | FailureKind::TranscodeFailed => StatusCode::BAD_GATEWAY,
        FailureKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
}

/// Attached to responses for internal errors so the detail can be replaced
/// before it leaves a production deployment.
#[derive(Debug, Clone)]
pub struct InternalErrorMarker {
    code: &'static str,
    job_id: Option<String>,
}

impl InternalErrorMarker {
    /// Generic response with the same status, code and job id.
    pub fn redacted(&self, status: StatusCode) -> Response {
        let body = ErrorResponse {
            detail: "An internal error occurred".to_string(),
            code: self.code,
            job_id: self.job_id.clone(),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let job_id = match &self {
            ApiError::Pipeline(e) => e.job_id().map(ToString::to_string),
            _ => None,
        };

        let body = ErrorResponse {
            detail: self.detail(),
            code: self.code(),
            job_id: job_id.clone(),
        };

        let mut response = (status, Json(body)).into_response();
        if self.is_internal() {
            response.extensions_mut().insert(InternalErrorMarker {
                code: self.code(),
                job_id,
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert("Retry-After", axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}
