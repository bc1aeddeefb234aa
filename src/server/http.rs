//! JSON-over-HTTP surface
//!
//! - `POST /read_file` → [`FileReport`](crate::media::FileReport)
//! - `POST /get_usage` → [`GetUsageResponse`](crate::usage::GetUsageResponse)
//! - `GET /health`
//! - `GET /metrics` (Prometheus text)
//!
//! Failures are returned as `{"code", "message", "meta"?}` with the status
//! from [`Error::status`].

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::metrics::metrics_handler;
use crate::error::{Error, ErrorCode};
use crate::media::ReadFileRequest;
use crate::service::AppState;
use crate::usage::GetUsageRequest;

/// Error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::info!(code = self.code(), error = %self, "request rejected");
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            meta: self.meta(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Build the router over shared state.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/read_file", post(read_file_handler))
        .route("/get_usage", post(get_usage_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Decode a JSON body, reporting shape errors as `invalid_request`.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::InvalidRequest(e.to_string()))
}

async fn read_file_handler(State(state): State<AppState>, body: Bytes) -> Result<Response, Error> {
    let request: ReadFileRequest = decode(&body)?;
    let ctx = state.request_context();
    let report = state.read_file(request, &ctx).await?;
    Ok(Json(report).into_response())
}

async fn get_usage_handler(State(state): State<AppState>, body: Bytes) -> Result<Response, Error> {
    let request: GetUsageRequest = decode(&body)?;
    let response = state.get_usage(request).await?;
    Ok(Json(response).into_response())
}

async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Serve until `shutdown` fires.
pub async fn serve(
    state: AppState,
    bind: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(address = %listener.local_addr()?, "fileinfo listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
