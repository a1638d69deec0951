//! Client-visible failure classification.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Maximum length of a diagnostic message handed to clients.
pub const MAX_DIAGNOSTIC_LEN: usize = 1024;

/// Kind of failure a job can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// URL rejected before any process ran
    InvalidSource,
    /// Disk, inode or workspace quota exhausted
    ResourceExhausted,
    /// External binary missing or not executable
    LaunchFailure,
    /// External process exceeded its deadline
    Timeout,
    /// External process was forcibly terminated
    Killed,
    /// External process exited nonzero or produced malformed output
    StageFailed,
    DownloadFailed,
    TranscodeFailed,
    InternalError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidSource => "invalid_source",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::LaunchFailure => "launch_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Killed => "killed",
            FailureKind::StageFailed => "stage_failed",
            FailureKind::DownloadFailed => "download_failed",
            FailureKind::TranscodeFailed => "transcode_failed",
            FailureKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a job, shared by every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    /// Create a failure, truncating the message to a bounded diagnostic.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: truncate_diagnostic(message.into()),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for JobFailure {}

/// Keep the tail of a diagnostic, which is where tools print the actual error.
pub fn truncate_diagnostic(message: String) -> String {
    if message.len() <= MAX_DIAGNOSTIC_LEN {
        return message;
    }
    let mut start = message.len() - MAX_DIAGNOSTIC_LEN;
    while !message.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &message[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_untouched() {
        let failure = JobFailure::new(FailureKind::Timeout, "yt-dlp timed out");
        assert_eq!(failure.message, "yt-dlp timed out");
        assert_eq!(failure.to_string(), "timeout: yt-dlp timed out");
    }

    #[test]
    fn test_long_message_keeps_tail() {
        let long = format!("{}ERROR: final line", "x".repeat(5000));
        let failure = JobFailure::new(FailureKind::DownloadFailed, long);
        assert!(failure.message.len() <= MAX_DIAGNOSTIC_LEN + 3);
        assert!(failure.message.starts_with("..."));
        assert!(failure.message.ends_with("ERROR: final line"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_DIAGNOSTIC_LEN);
        let truncated = truncate_diagnostic(long);
        assert!(truncated.starts_with("..."));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
    }
}
