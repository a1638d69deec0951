//! Health check handlers.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use vfetch_media::{check_ffmpeg, check_ytdlp};
use vfetch_pipeline::PipelineStats;

use crate::state::AppState;

const PROBE_FILE: &str = ".ready-probe";

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Health check endpoint (liveness probe).
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Readiness check response.
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
    pub jobs: PipelineStats,
}

#[derive(Serialize)]
pub struct ReadinessChecks {
    pub workspace: CheckStatus,
    pub downloader: CheckStatus,
    pub transcoder: CheckStatus,
}

#[derive(Serialize)]
pub struct CheckStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl CheckStatus {
    fn ok(latency_ms: Option<u64>) -> Self {
        Self {
            status: "ok".to_string(),
            error: None,
            latency_ms,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(msg.into()),
            latency_ms: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Readiness check endpoint (readiness probe).
/// Checks the workspace root accepts writes and both tools resolve.
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    let pipeline = &state.pipeline;

    let workspace_check = if pipeline.is_shutting_down() {
        CheckStatus::error("shutting down")
    } else {
        let start = Instant::now();
        let probe = pipeline.workspaces().root().join(PROBE_FILE);
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                CheckStatus::ok(Some(start.elapsed().as_millis() as u64))
            }
            Err(e) => CheckStatus::error(format!("workspace root not writable: {e}")),
        }
    };

    let config = pipeline.config();
    let tool_check = |status: vfetch_media::ToolStatus| {
        if status.available {
            CheckStatus::ok(None)
        } else {
            CheckStatus::error(status.error.unwrap_or_else(|| "not found".to_string()))
        }
    };
    let downloader_check = tool_check(check_ytdlp(&config.downloader.binary));
    let transcoder_check = tool_check(check_ffmpeg(&config.transcoder.binary));

    let all_ok = workspace_check.is_ok() && downloader_check.is_ok() && transcoder_check.is_ok();

    let response = ReadinessResponse {
        status: if all_ok { "ready" } else { "degraded" }.to_string(),
        checks: ReadinessChecks {
            workspace: workspace_check,
            downloader: downloader_check,
            transcoder: transcoder_check,
        },
        jobs: pipeline.stats(),
    };

    if all_ok {
        Ok(Json(response))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response)))
    }
}
