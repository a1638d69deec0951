//! External tool availability.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use vfetch_media::{check_ffmpeg, check_ytdlp, ToolStatus};

use crate::state::AppState;

#[derive(Serialize)]
pub struct ToolsResponse {
    pub ready: bool,
    pub tools: Vec<ToolStatus>,
}

/// `GET /tools`: whether the configured downloader and transcoder resolve.
pub async fn tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    let config = state.pipeline.config();
    let tools = vec![
        check_ytdlp(&config.downloader.binary),
        check_ffmpeg(&config.transcoder.binary),
    ];
    Json(ToolsResponse {
        ready: tools.iter().all(|t| t.available),
        tools,
    })
}
