//! Shared data models for the vfetch service.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their lifecycle states and snapshots
//! - Requested output formats
//! - Deduplication keys
//! - Client-visible failure kinds

pub mod dedup;
pub mod failure;
pub mod format;
pub mod job;

// Re-export common types
pub use dedup::DedupKey;
pub use failure::{FailureKind, JobFailure};
pub use format::{FormatParseError, MediaClass, OutputFormat, TargetFormat};
pub use job::{JobId, JobSnapshot, JobState, ResultInfo, StateTransition};
