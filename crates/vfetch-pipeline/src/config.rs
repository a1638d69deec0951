//! Pipeline configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vfetch_media::process::{DEFAULT_KILL_GRACE, DEFAULT_OUTPUT_LIMIT};
use vfetch_media::{DownloaderConfig, TranscoderConfig, WorkspaceConfig};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Hosts accepted when `ALLOWED_HOSTS` is unset.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &["loom.com", "www.loom.com", "cdn.loom.com"];

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Workspace root and quotas
    pub workspace: WorkspaceConfig,
    /// yt-dlp settings
    pub downloader: DownloaderConfig,
    /// FFmpeg settings
    pub transcoder: TranscoderConfig,
    /// Source host allow-list
    pub allowed_hosts: Vec<String>,
    /// Jobs executing stages at once
    pub max_concurrent_jobs: usize,
    /// How long a finished result stays reusable after its last reader leaves
    pub result_reuse: Duration,
    /// Finished jobs idle this long are evicted even if a reader is attached
    pub idle_job_timeout: Duration,
    /// Period of the background sweeper
    pub sweep_interval: Duration,
    /// Age after which orphaned workspace directories are removed
    pub sweep_max_age: Duration,
    /// Terminal job snapshots kept for status queries
    pub job_history_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let stage_timeout = Duration::from_secs(600);
        let job_quota = 2 * GIB;
        Self {
            workspace: WorkspaceConfig {
                root: std::env::temp_dir().join("vfetch"),
                job_quota_bytes: job_quota,
                total_quota_bytes: 8 * GIB,
                max_workspaces: 16,
                min_free_bytes: 512 * MIB,
            },
            downloader: DownloaderConfig {
                stage_timeout,
                max_file_size: Some(job_quota),
                ..Default::default()
            },
            transcoder: TranscoderConfig {
                stage_timeout,
                max_file_size: Some(job_quota),
                ..Default::default()
            },
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
            max_concurrent_jobs: 4,
            result_reuse: Duration::from_secs(30),
            idle_job_timeout: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
            sweep_max_age: Duration::from_secs(3600),
            job_history_limit: 256,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let stage_timeout = Duration::from_secs(env_parse("STAGE_TIMEOUT_SECS", 600));
        let job_quota = env_parse("JOB_DISK_QUOTA_BYTES", 2 * GIB);
        let output_limit = env_parse("OUTPUT_CAPTURE_BYTES", DEFAULT_OUTPUT_LIMIT);
        let kill_grace = Duration::from_millis(env_parse(
            "KILL_GRACE_MILLIS",
            DEFAULT_KILL_GRACE.as_millis() as u64,
        ));

        let root = std::env::var("TEMP_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("vfetch"));

        let allowed_hosts = std::env::var("ALLOWED_HOSTS")
            .ok()
            .map(|s| parse_list(&s))
            .filter(|hosts| !hosts.is_empty())
            .unwrap_or_else(|| DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect());

        Self {
            workspace: WorkspaceConfig {
                root,
                job_quota_bytes: job_quota,
                total_quota_bytes: env_parse("TOTAL_DISK_QUOTA_BYTES", 8 * GIB),
                max_workspaces: env_parse("MAX_WORKSPACES", 16),
                min_free_bytes: env_parse("MIN_FREE_DISK_BYTES", 512 * MIB),
            },
            downloader: DownloaderConfig {
                binary: PathBuf::from(
                    std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),
                ),
                format_selector: std::env::var("DOWNLOAD_FORMAT_SELECTOR")
                    .unwrap_or_else(|_| "best".to_string()),
                socket_timeout: Duration::from_secs(env_parse("DOWNLOAD_SOCKET_TIMEOUT_SECS", 30)),
                stage_timeout,
                max_file_size: Some(job_quota),
                output_limit,
                kill_grace,
                cdn_fallback: env_parse("LOOM_CDN_FALLBACK", true),
            },
            transcoder: TranscoderConfig {
                binary: PathBuf::from(
                    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
                ),
                stage_timeout,
                max_file_size: Some(job_quota),
                output_limit,
                kill_grace,
            },
            allowed_hosts,
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 4usize).max(1),
            result_reuse: Duration::from_secs(env_parse("RESULT_REUSE_SECS", 30)),
            idle_job_timeout: Duration::from_secs(env_parse("IDLE_JOB_TIMEOUT_SECS", 900)),
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS", 60).max(1)),
            sweep_max_age: Duration::from_secs(env_parse("SWEEP_MAX_AGE_SECS", 3600)),
            job_history_limit: env_parse("JOB_HISTORY_LIMIT", 256),
        }
    }
}

/// Split a comma-separated list, dropping empty items.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
