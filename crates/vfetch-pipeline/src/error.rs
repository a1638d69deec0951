//! Pipeline error types.

use thiserror::Error;
use vfetch_media::MediaError;
use vfetch_models::{FailureKind, JobFailure, JobId};

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before a job existed (invalid URL, startup problems).
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Terminal outcome of a job, identical for every waiter.
    #[error("Job {job_id} failed: {failure}")]
    JobFailed { job_id: JobId, failure: JobFailure },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

impl PipelineError {
    pub fn job_failed(job_id: JobId, failure: JobFailure) -> Self {
        Self::JobFailed { job_id, failure }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Media(e) => e.kind(),
            PipelineError::JobFailed { failure, .. } => failure.kind,
            PipelineError::NotFound(_) => FailureKind::InternalError,
            PipelineError::ShuttingDown => FailureKind::ResourceExhausted,
        }
    }

    /// Job the error belongs to, if one was created.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            PipelineError::JobFailed { job_id, .. } | PipelineError::NotFound(job_id) => Some(job_id),
            _ => None,
        }
    }

    /// Bounded message suitable for clients.
    pub fn diagnostic(&self) -> String {
        match self {
            PipelineError::Media(e) => e.to_failure().message,
            PipelineError::JobFailed { failure, .. } => failure.message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_passthrough() {
        let err: PipelineError = MediaError::invalid_source("bad host").into();
        assert_eq!(err.kind(), FailureKind::InvalidSource);
        assert!(err.job_id().is_none());

        let err = PipelineError::job_failed(
            JobId::from_string("j1"),
            JobFailure::new(FailureKind::Timeout, "yt-dlp timed out after 600 seconds"),
        );
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(err.job_id().map(JobId::as_str), Some("j1"));
        assert_eq!(err.diagnostic(), "yt-dlp timed out after 600 seconds");
    }
}
