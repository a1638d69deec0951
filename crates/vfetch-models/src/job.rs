//! Job identity, lifecycle states and snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::failure::JobFailure;
use crate::format::TargetFormat;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a fetch job.
///
/// ```text
/// Queued -> Downloading -> [Transcoding] -> Ready -> Served -> Purged
///    \__________\_______________\______-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Registered, waiting for a free execution slot
    #[default]
    Queued,
    /// Workspace allocated, downloader running
    Downloading,
    /// Transcoder running on the downloaded file
    Transcoding,
    /// Result file available, nobody has started reading yet
    Ready,
    /// At least one waiter has started streaming the result
    Served,
    /// Workspace released after the last reader left
    Purged,
    /// A stage failed or the job was abandoned
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Downloading => "downloading",
            JobState::Transcoding => "transcoding",
            JobState::Ready => "ready",
            JobState::Served => "served",
            JobState::Purged => "purged",
            JobState::Failed => "failed",
        }
    }

    /// Stage work still pending or running.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Downloading | JobState::Transcoding)
    }

    /// A result file exists and may be handed out.
    pub fn has_result(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Served)
    }

    /// No more transitions will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Purged | JobState::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Downloading, Transcoding)
                | (Downloading, Ready)
                | (Transcoding, Ready)
                | (Ready, Served)
                | (Ready, Purged)
                | (Served, Purged)
                | (Queued, Failed)
                | (Downloading, Failed)
                | (Transcoding, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamped state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StateTransition {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// Description of a finished result file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResultInfo {
    /// File name offered to clients (`<media id>.<ext>`)
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Whether the transcoder ran
    pub transcoded: bool,
}

/// Point-in-time view of a job, safe to serialize to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub source_url: String,
    pub format: TargetFormat,
    pub state: JobState,
    pub transitions: Vec<StateTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultInfo>,
    /// Attached waiters and readers at snapshot time
    pub references: usize,
}

impl JobSnapshot {
    /// Create a snapshot for a freshly queued job.
    pub fn queued(job_id: JobId, source_url: impl Into<String>, format: TargetFormat) -> Self {
        Self {
            job_id,
            source_url: source_url.into(),
            format,
            state: JobState::Queued,
            transitions: vec![StateTransition {
                state: JobState::Queued,
                at: Utc::now(),
            }],
            error: None,
            result: None,
            references: 0,
        }
    }

    /// Record a transition. Returns `false` and leaves the snapshot untouched
    /// when the edge is not part of the lifecycle.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.transitions.push(StateTransition {
            state: next,
            at: Utc::now(),
        });
        true
    }

    /// Time the job entered `state`, if it did.
    pub fn entered_at(&self, state: JobState) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .find(|t| t.state == state)
            .map(|t| t.at)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.transitions
            .last()
            .map(|t| t.at)
            .unwrap_or_else(Utc::now)
    }
}
