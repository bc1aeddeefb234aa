//! End-to-end tests of the HTTP surface with in-process analyzers and log store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use fileinfo::context::RequestContext;
use fileinfo::logging::init_test_logging;
use fileinfo::media::analyzers::{digest, mime};
use fileinfo::media::{
    Analyzer, AnalyzerKind, AnalyzerOutput, FetchConfig, HandleLease, RemoteFetcher, ToolError,
};
use fileinfo::server::create_router;
use fileinfo::service::AppState;
use fileinfo::usage::{LogQuery, LogStore, LogStoreError, QueryResults, ResultField};

const PAYLOAD: &[u8] = b"abc";

/// Real in-process analyzers, failing for the kinds in `fail`.
#[derive(Default)]
struct LocalAnalyzer {
    fail: Vec<AnalyzerKind>,
}

#[async_trait]
impl Analyzer for LocalAnalyzer {
    async fn analyze(
        &self,
        kind: AnalyzerKind,
        lease: &mut HandleLease<'_>,
        _ctx: &RequestContext,
    ) -> Result<AnalyzerOutput, ToolError> {
        if self.fail.contains(&kind) {
            return Err(ToolError::Timeout { tool: "fake" });
        }
        match kind {
            AnalyzerKind::Mimetype => Ok(AnalyzerOutput::Mimetype(mime::detect(lease.file()).await?)),
            AnalyzerKind::Md5 => Ok(AnalyzerOutput::Digest(digest::md5_hex(lease.file()).await?)),
            AnalyzerKind::Sha1 => Ok(AnalyzerOutput::Digest(digest::sha1_hex(lease.file()).await?)),
            AnalyzerKind::Exif => Ok(AnalyzerOutput::Exif(None)),
            AnalyzerKind::Ffprobe => Err(ToolError::Decode {
                tool: "ffprobe",
                message: "not media".to_string(),
            }),
        }
    }
}

/// Log store returning one canned complete result.
struct CannedStore {
    row: Vec<ResultField>,
    queries: Mutex<Vec<LogQuery>>,
}

#[async_trait]
impl LogStore for CannedStore {
    async fn start_query(&self, query: &LogQuery) -> Result<String, LogStoreError> {
        self.queries.lock().push(query.clone());
        Ok("query-1".to_string())
    }

    async fn get_query_results(&self, _query_id: &str) -> Result<QueryResults, LogStoreError> {
        Ok(QueryResults {
            status: "Complete".to_string(),
            results: vec![self.row.clone()],
        })
    }
}

fn canned_store() -> Arc<CannedStore> {
    Arc::new(CannedStore {
        row: vec![
            ResultField::new("count()", "4"),
            ResultField::new("sum(file_size)", "400"),
            ResultField::new("avg(file_size)", "100"),
            ResultField::new("min(file_size)", "10"),
            ResultField::new("max(file_size)", "250"),
        ],
        queries: Mutex::new(Vec::new()),
    })
}

async fn spawn_origin() -> SocketAddr {
    let app = Router::new()
        .route("/abc.txt", get(|| async { PAYLOAD }))
        .route("/big", get(|| async { vec![0u8; 4096] }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                PAYLOAD
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn state_with(analyzer: LocalAnalyzer, temp_dir: &std::path::Path) -> AppState {
    let fetcher = RemoteFetcher::new(
        FetchConfig::default()
            .with_max_size(1024)
            .with_temp_dir(temp_dir.to_path_buf()),
    )
    .unwrap();
    AppState::new(fetcher, Arc::new(analyzer), canned_store(), "/aws/lambda/test")
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// ==== health / metrics ====

#[tokio::test]
async fn test_health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_metrics_count_requests_by_code() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(LocalAnalyzer::default(), dir.path());

    let (status, _) = post_json(
        create_router(state.clone()),
        "/read_file",
        json!({"url": "not a url", "analyzers": ["md5"]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = create_router(state)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("# TYPE fileinfo_requests_total counter"));
    assert!(text
        .contains("fileinfo_requests_total{operation=\"read_file\",code=\"invalid_url\"} 1"));
}

// ==== read_file ====

#[tokio::test]
async fn test_read_file_reports_selected_analyzers() {
    init_test_logging();
    let addr = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));

    let (status, body) = post_json(
        app,
        "/read_file",
        json!({
            "url": format!("http://{addr}/abc.txt"),
            "analyzers": ["md5", "sha1", "bogus"]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["size"], 3);
    assert_eq!(body["size_human"], "3 B");
    assert_eq!(body["mimetype"], "text/plain; charset=utf-8");
    assert_eq!(body["digest_md5"], "900150983cd24fb0d6963f7d28e17f72");
    assert_eq!(body["digest_sha1"], "a9993e364706816aba3e25717850c26c");
    assert!(body.get("exif").is_none());
    assert!(body.get("ffprobe").is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_read_file_fail_soft_analyzers_are_omitted() {
    init_test_logging();
    let addr = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));

    let (status, body) = post_json(
        app,
        "/read_file",
        json!({
            "url": format!("http://{addr}/abc.txt"),
            "analyzers": ["exif", "ffprobe"]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mimetype"], "text/plain; charset=utf-8");
    assert!(body.get("exif").is_none());
    assert!(body.get("ffprobe").is_none());
    assert!(body.get("digest_md5").is_none());
}

#[tokio::test]
async fn test_read_file_mandatory_failure_is_analyzer_error() {
    let addr = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let analyzer = LocalAnalyzer {
        fail: vec![AnalyzerKind::Md5],
    };
    let app = create_router(state_with(analyzer, dir.path()));

    let (status, body) = post_json(
        app,
        "/read_file",
        json!({"url": format!("http://{addr}/abc.txt"), "analyzers": ["md5"]}),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "analyzer_error");
    assert_eq!(body["meta"]["analyzer"], "md5");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_read_file_too_large() {
    let addr = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));

    let (status, body) = post_json(
        app,
        "/read_file",
        json!({"url": format!("http://{addr}/big"), "analyzers": ["md5"]}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "file_too_large");
    assert_eq!(body["meta"]["max_file_size"], 1024);
}

#[tokio::test]
async fn test_read_file_upstream_not_found() {
    let addr = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));

    let (status, body) = post_json(
        app,
        "/read_file",
        json!({"url": format!("http://{addr}/nope"), "analyzers": ["md5"]}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "request_failed");
    assert_eq!(body["meta"]["http_status"], 404);
}

#[tokio::test]
async fn test_read_file_honors_request_deadline() {
    let addr = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(LocalAnalyzer::default(), dir.path())
        .with_request_timeout(Duration::from_millis(100));

    let (status, body) = post_json(
        create_router(state),
        "/read_file",
        json!({"url": format!("http://{addr}/slow"), "analyzers": ["md5"]}),
    )
    .await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["code"], "request_timeout");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

// ==== validation ====

#[tokio::test]
async fn test_read_file_rejects_empty_analyzers() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));
    let (status, body) = post_json(
        app,
        "/read_file",
        json!({"url": "https://example.com/a.png", "analyzers": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn test_read_file_rejects_unknown_fields() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));
    let (status, body) = post_json(
        app,
        "/read_file",
        json!({"url": "https://example.com/a.png", "analyzers": ["md5"], "extra": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn test_get_usage_rejects_bad_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));
    let (status, body) = post_json(
        app,
        "/get_usage",
        json!({"start_time": "yesterday", "end_time": "2024-01-02T00:00:00Z"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

// ==== get_usage ====

#[tokio::test]
async fn test_get_usage_maps_aggregates() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(LocalAnalyzer::default(), dir.path()));
    let (status, body) = post_json(
        app,
        "/get_usage",
        json!({"start_time": "2024-01-01T00:00:00Z", "end_time": "2024-01-02T00:00:00Z"}),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["start_time"], "2024-01-01T00:00:00Z");
    assert_eq!(body["end_time"], "2024-01-02T00:00:00Z");
    assert_eq!(body["request_count"], 4);
    assert_eq!(body["sum_file_size"], 400);
    assert_eq!(body["mean_file_size"], 100);
    assert_eq!(body["min_file_size"], 10);
    assert_eq!(body["max_file_size"], 250);
}
