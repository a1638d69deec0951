//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;
use vfetch_models::{FailureKind, JobFailure};

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while preparing workspaces or running external tools.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Invalid source URL: {0}")]
    InvalidSource(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Failed to launch {program}: {reason}")]
    LaunchFailure { program: String, reason: String },

    #[error("{program} timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },

    #[error("{program} was killed{}", .signal.map(|s| format!(" by signal {s}")).unwrap_or_default())]
    Killed { program: String, signal: Option<i32> },

    #[error("{program} failed: {message}")]
    StageFailed {
        program: String,
        message: String,
        exit_code: Option<i32>,
        stderr_tail: Option<String>,
    },

    #[error("Download failed: {0}")]
    DownloadFailed(#[source] Box<MediaError>),

    #[error("Transcode failed: {0}")]
    TranscodeFailed(#[source] Box<MediaError>),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    pub fn invalid_source(message: impl Into<String>) -> Self {
        Self::InvalidSource(message.into())
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted(message.into())
    }

    pub fn launch_failure(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LaunchFailure {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Create a stage failure error.
    pub fn stage_failed(
        program: impl Into<String>,
        message: impl Into<String>,
        exit_code: Option<i32>,
        stderr_tail: Option<String>,
    ) -> Self {
        Self::StageFailed {
            program: program.into(),
            message: message.into(),
            exit_code,
            stderr_tail,
        }
    }

    pub fn download_failed(cause: MediaError) -> Self {
        match cause {
            // Already classified, keep a single layer.
            e @ (Self::DownloadFailed(_) | Self::InvalidSource(_)) => e,
            other => Self::DownloadFailed(Box::new(other)),
        }
    }

    pub fn transcode_failed(cause: MediaError) -> Self {
        match cause {
            e @ Self::TranscodeFailed(_) => e,
            other => Self::TranscodeFailed(Box::new(other)),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classify into the kind reported to clients.
    ///
    /// Stage wrappers report their own kind unless the underlying cause is a
    /// timeout or quota problem, which keep their more specific status.
    pub fn kind(&self) -> FailureKind {
        match self {
            MediaError::InvalidSource(_) => FailureKind::InvalidSource,
            MediaError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            MediaError::LaunchFailure { .. } => FailureKind::LaunchFailure,
            MediaError::Timeout { .. } => FailureKind::Timeout,
            MediaError::Killed { .. } | MediaError::Cancelled => FailureKind::Killed,
            MediaError::StageFailed { .. } | MediaError::FileNotFound(_) => FailureKind::StageFailed,
            MediaError::DownloadFailed(inner) => match inner.kind() {
                k @ (FailureKind::Timeout | FailureKind::ResourceExhausted | FailureKind::Killed) => k,
                _ => FailureKind::DownloadFailed,
            },
            MediaError::TranscodeFailed(inner) => match inner.kind() {
                k @ (FailureKind::Timeout | FailureKind::ResourceExhausted | FailureKind::Killed) => k,
                _ => FailureKind::TranscodeFailed,
            },
            MediaError::Io(_) | MediaError::Internal(_) => FailureKind::InternalError,
        }
    }

    /// Short diagnostic: the message plus the captured stderr tail, if any.
    pub fn diagnostic(&self) -> String {
        match self {
            MediaError::StageFailed {
                stderr_tail: Some(tail),
                ..
            } if !tail.trim().is_empty() => format!("{self}\n{}", tail.trim_end()),
            MediaError::DownloadFailed(inner) => format!("Download failed: {}", inner.diagnostic()),
            MediaError::TranscodeFailed(inner) => format!("Transcode failed: {}", inner.diagnostic()),
            other => other.to_string(),
        }
    }

    /// Convert into the shareable failure broadcast to waiters.
    pub fn to_failure(&self) -> JobFailure {
        JobFailure::new(self.kind(), self.diagnostic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_timeout_keeps_timeout_kind() {
        let err = MediaError::download_failed(MediaError::Timeout {
            program: "yt-dlp".into(),
            secs: 5,
        });
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[test]
    fn test_wrapped_stage_failure_reports_stage_kind() {
        let err = MediaError::download_failed(MediaError::stage_failed(
            "yt-dlp",
            "exited with status 1",
            Some(1),
            Some("ERROR: Unsupported URL".into()),
        ));
        assert_eq!(err.kind(), FailureKind::DownloadFailed);
        assert!(err.diagnostic().contains("ERROR: Unsupported URL"));

        let err = MediaError::transcode_failed(MediaError::launch_failure("ffmpeg", "not found"));
        assert_eq!(err.kind(), FailureKind::TranscodeFailed);
    }

    #[test]
    fn test_download_failed_is_not_double_wrapped() {
        let inner = MediaError::download_failed(MediaError::Cancelled);
        let outer = MediaError::download_failed(inner);
        match outer {
            MediaError::DownloadFailed(inner) => assert!(matches!(*inner, MediaError::Cancelled)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_to_failure() {
        let failure = MediaError::invalid_source("host not allowed").to_failure();
        assert_eq!(failure.kind, FailureKind::InvalidSource);
        assert_eq!(failure.message, "Invalid source URL: host not allowed");
    }
}
