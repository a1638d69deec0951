//! Pipeline metrics.

use metrics::{counter, gauge};
use vfetch_models::FailureKind;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_CREATED_TOTAL: &str = "vfetch_jobs_created_total";
    pub const JOBS_COALESCED_TOTAL: &str = "vfetch_jobs_coalesced_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vfetch_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vfetch_jobs_failed_total";
    pub const JOBS_PURGED_TOTAL: &str = "vfetch_jobs_purged_total";
    pub const JOBS_ACTIVE: &str = "vfetch_jobs_active";
}

pub fn record_job_created() {
    counter!(names::JOBS_CREATED_TOTAL).increment(1);
}

/// A request attached to an existing job instead of creating one.
pub fn record_job_coalesced() {
    counter!(names::JOBS_COALESCED_TOTAL).increment(1);
}

pub fn record_job_completed(transcoded: bool) {
    let labels = [("transcoded", transcoded.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
}

pub fn record_job_failed(kind: FailureKind) {
    let labels = [("kind", kind.as_str().to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_purged() {
    counter!(names::JOBS_PURGED_TOTAL).increment(1);
}

pub fn set_active_jobs(count: usize) {
    gauge!(names::JOBS_ACTIVE).set(count as f64);
}
