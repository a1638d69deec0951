//! HTTP surface tests against a pipeline with in-process fake stages.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;
use vfetch_api::{create_router, ApiConfig, AppState};
use vfetch_media::{Downloader, MediaError, MediaResult, SourceUrl, Transcoder, WorkspaceConfig};
use vfetch_models::OutputFormat;
use vfetch_pipeline::{JobPipeline, PipelineConfig};

/// Produces `<media id>.webm`; URLs containing `fail` exit nonzero.
#[derive(Default)]
struct FakeDownloader {
    calls: AtomicUsize,
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(
        &self,
        source: &SourceUrl,
        workspace: &Path,
        _cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if source.as_str().contains("fail") {
            return Err(MediaError::download_failed(MediaError::stage_failed(
                "yt-dlp",
                "exited with status 1",
                Some(1),
                Some("ERROR: Unsupported URL".to_string()),
            )));
        }
        let path = workspace.join(format!("{}.webm", source.media_id()));
        tokio::fs::write(&path, b"webm-bytes").await?;
        Ok(path)
    }
}

#[derive(Default)]
struct FakeTranscoder;

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        format: OutputFormat,
        _cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        let output = input.with_extension(format.extension());
        tokio::fs::write(&output, b"converted-mp4-bytes").await?;
        Ok(output)
    }
}

struct TestApp {
    _dir: TempDir,
    root: PathBuf,
    router: Router,
    downloader: Arc<FakeDownloader>,
}

impl TestApp {
    async fn new() -> Self {
        Self::with_config(ApiConfig::default(), Duration::ZERO).await
    }

    async fn with_config(api: ApiConfig, result_reuse: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("workspaces");
        let config = PipelineConfig {
            workspace: WorkspaceConfig {
                root: root.clone(),
                job_quota_bytes: 1024 * 1024,
                total_quota_bytes: 64 * 1024 * 1024,
                max_workspaces: 16,
                min_free_bytes: 0,
            },
            allowed_hosts: vec!["loom.com".to_string()],
            result_reuse,
            ..Default::default()
        };
        let downloader = Arc::new(FakeDownloader::default());
        let pipeline =
            JobPipeline::with_stages(config, downloader.clone(), Arc::new(FakeTranscoder))
                .await
                .unwrap();
        let router = create_router(AppState::with_pipeline(api, pipeline), None);
        Self {
            _dir: dir,
            root,
            router,
            downloader,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_json(&self, uri: &str, body: Value) -> Response {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    fn job_dirs(&self) -> usize {
        std::fs::read_dir(&self.root)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("job-"))
            .count()
    }
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn header_str<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_fetch_streams_converted_file() {
    let app = TestApp::new().await;

    let response = app
        .get("/fetch?url=https%3A%2F%2Floom.com%2Fshare%2Fabc123&format=mp4")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-type"), "video/mp4");
    assert_eq!(header_str(&response, "content-length"), "19");
    assert_eq!(
        header_str(&response, "content-disposition"),
        "attachment; filename=\"abc123.mp4\""
    );
    assert!(!header_str(&response, "x-job-id").is_empty());
    assert_eq!(header_str(&response, "x-content-type-options"), "nosniff");
    assert!(!header_str(&response, "x-request-id").is_empty());

    // The workspace outlives the handler until the body is consumed.
    assert_eq!(app.job_dirs(), 1);
    assert_eq!(body_bytes(response).await, b"converted-mp4-bytes");
    eventually("workspace purge", || app.job_dirs() == 0).await;
}

#[tokio::test]
async fn test_fetch_post_native() {
    let app = TestApp::new().await;

    let response = app
        .post_json("/fetch", serde_json::json!({"url": "https://www.loom.com/share/xyz789"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "content-type"), "video/webm");
    assert_eq!(
        header_str(&response, "content-disposition"),
        "attachment; filename=\"xyz789.webm\""
    );
    assert_eq!(body_bytes(response).await, b"webm-bytes");
}

#[tokio::test]
async fn test_fetch_rejects_disallowed_host() {
    let app = TestApp::new().await;

    let response = app
        .get("/fetch?url=https%3A%2F%2Fmalicious.test%2F--exec%3Drm&format=mp4")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "invalid_source");
    assert!(body.get("job_id").is_none());
    assert_eq!(app.downloader.calls.load(Ordering::SeqCst), 0);
    assert_eq!(app.job_dirs(), 0);
}

#[tokio::test]
async fn test_fetch_rejects_unknown_format() {
    let app = TestApp::new().await;

    let response = app
        .get("/fetch?url=https%3A%2F%2Floom.com%2Fshare%2Fabc&format=exe")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "bad_request");
    assert_eq!(app.downloader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fetch_download_failure_is_bad_gateway() {
    let app = TestApp::new().await;

    let response = app
        .get("/fetch?url=https%3A%2F%2Floom.com%2Fshare%2Ffail1&format=mp4")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["code"], "download_failed");
    assert!(body["detail"].as_str().unwrap().contains("Unsupported URL"));
    assert!(body["job_id"].is_string());
    assert_eq!(app.job_dirs(), 0);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_download() {
    let app = TestApp::new().await;

    let requests = (0..5).map(|_| app.get("/fetch?url=https%3A%2F%2Floom.com%2Fshare%2Fsame&format=mp4"));
    let responses = futures_util::future::join_all(requests).await;

    let mut job_ids = Vec::new();
    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
        job_ids.push(header_str(&response, "x-job-id").to_string());
        assert_eq!(body_bytes(response).await, b"converted-mp4-bytes");
    }
    assert!(job_ids.iter().all(|id| id == &job_ids[0]));
    assert_eq!(app.downloader.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_job_submission_and_result() {
    // A detached job has no reader once ready; the window keeps it around.
    let app = TestApp::with_config(ApiConfig::default(), Duration::from_millis(500)).await;

    let response = app
        .post_json(
            "/jobs",
            serde_json::json!({"url": "https://loom.com/share/abc123", "format": "mp4"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(body["coalesced"], false);

    let status_uri = format!("/jobs/{job_id}");
    let mut state = String::new();
    for _ in 0..300 {
        let snapshot = body_json(app.get(&status_uri).await).await;
        state = snapshot["state"].as_str().unwrap().to_string();
        if state == "ready" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, "ready");

    let response = app.get(&format!("/jobs/{job_id}/result")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-job-id"), job_id);
    assert_eq!(body_bytes(response).await, b"converted-mp4-bytes");

    eventually("workspace purge", || app.job_dirs() == 0).await;
    let snapshot = body_json(app.get(&status_uri).await).await;
    assert_eq!(snapshot["state"], "purged");
}

#[tokio::test]
async fn test_failed_job_result_reports_failure() {
    let app = TestApp::new().await;

    let body = body_json(
        app.post_json("/jobs", serde_json::json!({"url": "https://loom.com/share/fail2"}))
            .await,
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let status_uri = format!("/jobs/{job_id}");
    let mut snapshot = Value::Null;
    for _ in 0..300 {
        snapshot = body_json(app.get(&status_uri).await).await;
        if snapshot["state"] == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(snapshot["state"], "failed");
    assert_eq!(snapshot["error"]["kind"], "download_failed");

    let response = app.get(&format!("/jobs/{job_id}/result")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["job_id"], job_id.as_str());
}

#[tokio::test]
async fn test_unknown_job() {
    let app = TestApp::new().await;

    let response = app.get("/jobs/does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "not_found");

    let response = app.get("/jobs/does-not-exist/result").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rate_limit_per_client() {
    let app = TestApp::with_config(
        ApiConfig {
            rate_limit_rps: 1,
            ..Default::default()
        },
        Duration::ZERO,
    )
    .await;

    let request = || {
        Request::get("/jobs/missing")
            .header("X-Forwarded-For", "203.0.113.9")
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(app.send(request()).await.status(), StatusCode::NOT_FOUND);

    let limited = app.send(request()).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&limited, "retry-after"), "1");
    assert_eq!(body_json(limited).await["code"], "rate_limited");

    // Probes are never limited.
    let health = Request::get("/health")
        .header("X-Forwarded-For", "203.0.113.9")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(health).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_index_and_health() {
    let app = TestApp::new().await;

    let index = body_json(app.get("/").await).await;
    assert_eq!(index["service"], "vfetch");
    assert!(index["endpoints"].as_array().unwrap().len() > 3);

    let health = body_json(app.get("/healthz").await).await;
    assert_eq!(health["status"], "healthy");

    let tools = body_json(app.get("/tools").await).await;
    assert_eq!(tools["tools"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = TestApp::new().await;

    let response = app
        .send(
            Request::get("/health")
                .header("X-Request-ID", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(header_str(&response, "x-request-id"), "req-42");
}
