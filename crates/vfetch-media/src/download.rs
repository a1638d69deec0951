//! Media download using yt-dlp.
//!
//! The downloader always runs inside the job workspace with an output
//! template of `<media id>.%(ext)s`, so the produced file name is predictable
//! and can never escape the directory. The source URL is passed as a single
//! positional argument after `--`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::histogram;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{MediaError, MediaResult};
use crate::process::{
    Invocation, ProcessRunner, ResourceLimits, DEFAULT_KILL_GRACE, DEFAULT_OUTPUT_LIMIT,
};
use crate::source::{SourcePolicy, SourceUrl};

/// Suffixes of intermediate files yt-dlp may leave behind.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp", ".tmp"];

/// Downloader settings.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// yt-dlp binary (name resolved on PATH, or absolute path)
    pub binary: PathBuf,
    /// Value passed to `-f`
    pub format_selector: String,
    /// Network timeout passed to `--socket-timeout`
    pub socket_timeout: Duration,
    /// Hard deadline for the whole process
    pub stage_timeout: Duration,
    /// Per-file size cap (`--max-filesize` and RLIMIT_FSIZE)
    pub max_file_size: Option<u64>,
    pub output_limit: usize,
    pub kill_grace: Duration,
    /// Retry a failed Loom download against the direct CDN URL
    pub cdn_fallback: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("yt-dlp"),
            format_selector: "best".to_string(),
            socket_timeout: Duration::from_secs(30),
            stage_timeout: Duration::from_secs(600),
            max_file_size: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            kill_grace: DEFAULT_KILL_GRACE,
            cdn_fallback: true,
        }
    }
}

/// Fetches a validated source into a workspace.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download `source` into `workspace` and return the path of the single
    /// media file produced. Sending `true` on `cancel` kills the process group.
    async fn download(
        &self,
        source: &SourceUrl,
        workspace: &Path,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf>;
}

/// yt-dlp backed [`Downloader`].
#[derive(Debug, Clone)]
pub struct DownloadStage {
    config: DownloaderConfig,
    policy: SourcePolicy,
}

impl DownloadStage {
    /// `policy` is re-applied to fallback URLs.
    pub fn new(config: DownloaderConfig, policy: SourcePolicy) -> Self {
        Self { config, policy }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Build the yt-dlp invocation for one URL, bounded by `timeout`.
    pub fn build_invocation(
        &self,
        url: &str,
        media_id: &str,
        workspace: &Path,
        timeout: Duration,
    ) -> Invocation {
        let config = &self.config;
        let mut inv = Invocation::new(&config.binary, workspace, timeout)
            .args([
                "--ignore-config",
                "--no-playlist",
                "--no-part",
                "--no-mtime",
                "--no-progress",
                "--restrict-filenames",
                "--socket-timeout",
            ])
            .arg(config.socket_timeout.as_secs().max(1).to_string())
            .arg("-f")
            .arg(&config.format_selector);

        if let Some(bytes) = config.max_file_size {
            inv = inv.arg("--max-filesize").arg(bytes.to_string());
        }

        inv.arg("-P")
            .arg(workspace)
            .arg("-o")
            .arg(format!("{media_id}.%(ext)s"))
            .arg("--")
            .arg(url)
            .output_limit(config.output_limit)
            .kill_grace(config.kill_grace)
            .limits(ResourceLimits {
                max_file_size: config.max_file_size,
                cpu_seconds: None,
            })
    }

    async fn attempt(
        &self,
        url: &str,
        media_id: &str,
        workspace: &Path,
        deadline: Instant,
        cancel: &watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        // Every attempt shares the stage deadline.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MediaError::Timeout {
                program: self.config.binary.display().to_string(),
                secs: self.config.stage_timeout.as_secs(),
            });
        }
        let invocation = self.build_invocation(url, media_id, workspace, remaining);
        let output = ProcessRunner::new()
            .with_cancel(cancel.clone())
            .run(&invocation)
            .await?;
        output.require_success(None)?;
        find_media_file(workspace, media_id, &output.program).await
    }
}

#[async_trait]
impl Downloader for DownloadStage {
    async fn download(
        &self,
        source: &SourceUrl,
        workspace: &Path,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        let started = Instant::now();
        let deadline = started + self.config.stage_timeout;
        info!(url = %source.as_str(), media_id = source.media_id(), "Downloading media");

        let first = self
            .attempt(source.as_str(), source.media_id(), workspace, deadline, &cancel)
            .await;
        let result = match first {
            Ok(path) => Ok(path),
            Err(e) => match self.fallback_url(source, &e) {
                Some(fallback) => {
                    warn!(
                        url = %source.as_str(),
                        fallback = %fallback.as_str(),
                        "Download failed ({}), retrying against the direct CDN URL",
                        e
                    );
                    clear_directory(workspace).await?;
                    self.attempt(
                        fallback.as_str(),
                        source.media_id(),
                        workspace,
                        deadline,
                        &cancel,
                    )
                    .await
                }
                None => Err(e),
            },
        };

        histogram!("vfetch_stage_duration_seconds", "stage" => "download")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(path) => {
                info!(path = %path.display(), "Download complete");
                Ok(path)
            }
            Err(e) => Err(MediaError::download_failed(e)),
        }
    }
}

impl DownloadStage {
    /// Only plain tool failures are retried. Timeouts, kills, quota and launch
    /// problems would fail the same way again.
    fn fallback_url(&self, source: &SourceUrl, error: &MediaError) -> Option<SourceUrl> {
        if !self.config.cdn_fallback || !matches!(error, MediaError::StageFailed { .. }) {
            return None;
        }
        let candidate = source.loom_cdn_url()?;
        if candidate == source.as_str() {
            return None;
        }
        match self.policy.validate(&candidate) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(fallback = %candidate, "CDN fallback rejected: {}", e);
                None
            }
        }
    }
}

/// Locate the single finished file named `<media_id>.<ext>`.
async fn find_media_file(workspace: &Path, media_id: &str, program: &str) -> MediaResult<PathBuf> {
    let prefix = format!("{media_id}.");
    let mut matches = Vec::new();
    let mut entries = tokio::fs::read_dir(workspace).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) || PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        if entry.file_type().await?.is_file() {
            matches.push(entry.path());
        }
    }

    match matches.as_slice() {
        [only] => {
            let size = tokio::fs::metadata(only).await?.len();
            if size == 0 {
                return Err(MediaError::stage_failed(
                    program,
                    format!("downloaded file {} is empty", only.display()),
                    Some(0),
                    None,
                ));
            }
            Ok(only.clone())
        }
        [] => Err(MediaError::stage_failed(
            program,
            format!("no file matching {prefix}* was produced"),
            Some(0),
            None,
        )),
        many => Err(MediaError::stage_failed(
            program,
            format!("expected one media file, found {}", many.len()),
            Some(0),
            None,
        )),
    }
}

/// Remove everything inside `dir`, keeping the directory itself.
async fn clear_directory(dir: &Path) -> MediaResult<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{read_log, write_script};
    use tempfile::TempDir;
    use vfetch_models::FailureKind;

    /// Fake yt-dlp: logs the URL, then runs `behaviour` with `$dir`, `$out`
    /// (template with `%(ext)s` replaced by webm) and `$url` set.
    fn fake_ytdlp(bin_dir: &Path, log: &Path, behaviour: &str) -> PathBuf {
        let body = format!(
            r#"dir=.; out=""; url=""
while [ $# -gt 0 ]; do
  case "$1" in
    -P) dir="$2"; shift 2 ;;
    -o) out=$(printf '%s' "$2" | sed 's/%(ext)s/webm/'); shift 2 ;;
    --) url="$2"; shift 2 ;;
    *) shift ;;
  esac
done
echo "$url" >> "{log}"
{behaviour}"#,
            log = log.display()
        );
        write_script(bin_dir, "yt-dlp", &body)
    }

    struct Fixture {
        _bin: TempDir,
        workspace: TempDir,
        log: PathBuf,
        stage: DownloadStage,
        policy: SourcePolicy,
    }

    fn fixture(behaviour: &str, cdn_fallback: bool) -> Fixture {
        let bin = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let log = bin.path().join("calls.log");
        let binary = fake_ytdlp(bin.path(), &log, behaviour);
        let policy = SourcePolicy::new(["loom.com", "cdn.loom.com"]);
        let stage = DownloadStage::new(
            DownloaderConfig {
                binary,
                stage_timeout: Duration::from_secs(10),
                kill_grace: Duration::from_millis(200),
                cdn_fallback,
                ..Default::default()
            },
            policy.clone(),
        );
        Fixture {
            _bin: bin,
            workspace,
            log,
            stage,
            policy,
        }
    }

    fn cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[test]
    fn test_invocation_keeps_url_positional() {
        let stage = DownloadStage::new(
            DownloaderConfig {
                max_file_size: Some(1000),
                ..Default::default()
            },
            SourcePolicy::new(["loom.com"]),
        );
        let inv = stage.build_invocation(
            "https://loom.com/share/abc",
            "abc",
            Path::new("/ws"),
            Duration::from_secs(5),
        );
        let argv: Vec<String> = inv
            .argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let sep = argv.iter().position(|a| a == "--").unwrap();
        assert_eq!(&argv[sep + 1..], ["https://loom.com/share/abc"]);
        assert!(argv.windows(2).any(|w| w == ["-o", "abc.%(ext)s"]));
        assert!(argv.windows(2).any(|w| w == ["-P", "/ws"]));
        assert!(argv.windows(2).any(|w| w == ["--max-filesize", "1000"]));
        assert!(argv.contains(&"--no-playlist".to_string()));
        assert_eq!(inv.working_dir(), Path::new("/ws"));
    }

    #[tokio::test]
    async fn test_download_success() {
        let fx = fixture(r#"printf 'video' > "$dir/$out""#, true);
        let source = fx.policy.validate("https://loom.com/share/abc123").unwrap();

        let path = fx
            .stage
            .download(&source, fx.workspace.path(), cancel())
            .await
            .unwrap();
        assert_eq!(path, fx.workspace.path().join("abc123.webm"));
        assert_eq!(read_log(&fx.log), ["https://loom.com/share/abc123"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_download_failed() {
        let fx = fixture("echo 'ERROR: Unsupported URL' >&2; exit 1", false);
        let source = fx.policy.validate("https://loom.com/share/abc123").unwrap();

        let err = fx
            .stage
            .download(&source, fx.workspace.path(), cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::DownloadFailed);
        assert!(err.diagnostic().contains("ERROR: Unsupported URL"));
        assert_eq!(read_log(&fx.log).len(), 1);
    }

    #[tokio::test]
    async fn test_success_without_file_is_failure() {
        let fx = fixture("exit 0", false);
        let source = fx.policy.validate("https://loom.com/share/abc123").unwrap();
        let err = fx
            .stage
            .download(&source, fx.workspace.path(), cancel())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::DownloadFailed);
    }

    #[tokio::test]
    async fn test_multiple_outputs_rejected() {
        let fx = fixture(
            r#"printf a > "$dir/abc123.webm"; printf b > "$dir/abc123.mp4""#,
            false,
        );
        let source = fx.policy.validate("https://loom.com/share/abc123").unwrap();
        let err = fx
            .stage
            .download(&source, fx.workspace.path(), cancel())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected one media file"));
    }

    #[tokio::test]
    async fn test_partial_files_are_ignored() {
        let fx = fixture(
            r#"printf a > "$dir/abc123.webm"; printf b > "$dir/abc123.mp4.part""#,
            false,
        );
        let source = fx.policy.validate("https://loom.com/share/abc123").unwrap();
        let path = fx
            .stage
            .download(&source, fx.workspace.path(), cancel())
            .await
            .unwrap();
        assert!(path.ends_with("abc123.webm"));
    }

    #[tokio::test]
    async fn test_cdn_fallback() {
        let fx = fixture(
            r#"case "$url" in
  *cdn.loom.com*) printf 'video' > "$dir/$out" ;;
  *) printf junk > "$dir/abc123.webm"; echo 'ERROR: extractor failed' >&2; exit 1 ;;
esac"#,
            true,
        );
        let source = fx.policy.validate("https://loom.com/share/abc123").unwrap();
        let path = fx
            .stage
            .download(&source, fx.workspace.path(), cancel())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"video");
        assert_eq!(
            read_log(&fx.log),
            [
                "https://loom.com/share/abc123",
                "https://cdn.loom.com/sessions/thumbnails/abc123.mp4"
            ]
        );
    }

    #[tokio::test]
    async fn test_fallback_skipped_on_timeout() {
        let bin = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let log = bin.path().join("calls.log");
        let binary = fake_ytdlp(bin.path(), &log, "sleep 30");
        let policy = SourcePolicy::new(["loom.com", "cdn.loom.com"]);
        let stage = DownloadStage::new(
            DownloaderConfig {
                binary,
                stage_timeout: Duration::from_millis(300),
                kill_grace: Duration::from_millis(200),
                ..Default::default()
            },
            policy.clone(),
        );
        let source = policy.validate("https://loom.com/share/abc123").unwrap();

        let err = stage.download(&source, workspace.path(), cancel()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(read_log(&log).len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_gets_only_remaining_budget() {
        let bin = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let log = bin.path().join("calls.log");
        let binary = fake_ytdlp(
            bin.path(),
            &log,
            r#"case "$url" in
  *cdn.loom.com*) sleep 30 ;;
  *) sleep 0.6; echo 'ERROR: extractor failed' >&2; exit 1 ;;
esac"#,
        );
        let policy = SourcePolicy::new(["loom.com", "cdn.loom.com"]);
        let stage = DownloadStage::new(
            DownloaderConfig {
                binary,
                stage_timeout: Duration::from_secs(1),
                kill_grace: Duration::from_millis(100),
                ..Default::default()
            },
            policy.clone(),
        );
        let source = policy.validate("https://loom.com/share/abc123").unwrap();

        let started = Instant::now();
        let err = stage.download(&source, workspace.path(), cancel()).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(read_log(&log).len(), 2);
        assert!(elapsed < Duration::from_millis(1600), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let workspace = TempDir::new().unwrap();
        let policy = SourcePolicy::new(["loom.com"]);
        let stage = DownloadStage::new(
            DownloaderConfig {
                binary: PathBuf::from("/nonexistent/yt-dlp"),
                ..Default::default()
            },
            policy.clone(),
        );
        let source = policy.validate("https://loom.com/share/abc123").unwrap();
        let err = stage.download(&source, workspace.path(), cancel()).await.unwrap_err();
        match err {
            MediaError::DownloadFailed(inner) => {
                assert!(matches!(*inner, MediaError::LaunchFailure { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
