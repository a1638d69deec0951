//! Job pipeline for the vfetch service.
//!
//! This crate provides:
//! - Request coalescing on `(normalized URL, format)` keys
//! - Download -> optional transcode orchestration with a per-job state machine
//! - Reference-counted result leases and workspace reclamation
//! - A background sweeper for idle jobs and orphaned workspaces

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use logging::JobLogger;
pub use pipeline::{JobHandle, JobPipeline, PipelineStats, ResultLease, SweepReport};
