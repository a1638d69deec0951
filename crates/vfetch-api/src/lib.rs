//! Axum HTTP API server.
//!
//! This crate provides:
//! - `/fetch`: submit or join a job, wait, and stream the file
//! - `/jobs`: fire-and-forget submission with status polling
//! - Tool, health and readiness probes
//! - Rate limiting, security headers and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
