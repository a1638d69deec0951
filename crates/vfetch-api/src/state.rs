//! Application state.

use anyhow::Context;
use vfetch_pipeline::{JobPipeline, PipelineConfig};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub pipeline: JobPipeline,
}

impl AppState {
    /// Create the state with a yt-dlp/FFmpeg backed pipeline.
    pub async fn new(config: ApiConfig, pipeline_config: PipelineConfig) -> anyhow::Result<Self> {
        let root = pipeline_config.workspace.root.clone();
        let pipeline = JobPipeline::new(pipeline_config)
            .await
            .with_context(|| format!("workspace root {} is not usable", root.display()))?;
        Ok(Self::with_pipeline(config, pipeline))
    }

    pub fn with_pipeline(config: ApiConfig, pipeline: JobPipeline) -> Self {
        Self { config, pipeline }
    }
}
