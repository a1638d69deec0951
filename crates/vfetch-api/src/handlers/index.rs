use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct IndexResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

/// `GET /`: service name, version and available endpoints.
pub async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        service: "vfetch",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "GET /fetch?url=<url>&format=<format>",
            "POST /fetch",
            "POST /jobs",
            "GET /jobs/:job_id",
            "GET /jobs/:job_id/result",
            "GET /tools",
            "GET /health",
            "GET /ready",
        ],
    })
}
