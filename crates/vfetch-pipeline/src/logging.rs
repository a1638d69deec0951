//! Structured job logging utilities.
//!
//! Provides consistent, structured logging for job processing with
//! tracing spans and contextual information.

use tracing::{error, info, warn, Span};
use vfetch_models::JobId;

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    url: String,
}

impl JobLogger {
    /// Create a new job logger for a job and its source URL.
    pub fn new(job_id: &JobId, url: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            url: url.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(job_id = %self.job_id, url = %self.url, "Job started: {}", message);
    }

    pub fn log_progress(&self, stage: &str, message: &str) {
        info!(job_id = %self.job_id, stage, "Job progress: {}", message);
    }

    pub fn log_warning(&self, message: &str) {
        warn!(job_id = %self.job_id, url = %self.url, "Job warning: {}", message);
    }

    pub fn log_error(&self, message: &str) {
        error!(job_id = %self.job_id, url = %self.url, "Job error: {}", message);
    }

    pub fn log_completion(&self, message: &str) {
        info!(job_id = %self.job_id, "Job completed: {}", message);
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Span wrapping all work done for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("job", job_id = %self.job_id, url = %self.url)
    }
}
