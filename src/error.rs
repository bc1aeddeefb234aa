//! Request-facing error classification.
//!
//! Every error that can end a `read_file` or `get_usage` call carries a stable,
//! machine-readable code. Callers branch on the code; the message is for humans.

use axum::http::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::media::{AnalysisError, FetchError};
use crate::usage::UsageError;

/// Stable code used when an error has no more specific classification.
pub const INTERNAL_ERROR: &str = "internal_error";

/// Classification shared by the fetch, analysis, and usage error types.
pub trait ErrorCode {
    /// Stable snake_case code, e.g. `file_too_large`.
    fn code(&self) -> &'static str;

    /// Structured metadata attached to the error, if any.
    fn meta(&self) -> Option<Value> {
        None
    }
}

/// Failure of a service operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl Error {
    /// HTTP status the error maps to on the JSON surface.
    pub fn status(&self) -> StatusCode {
        match self.code() {
            "invalid_request" | "invalid_url" | "no_response_body" | "request_failed"
            | "file_too_large" => StatusCode::BAD_REQUEST,
            "request_timeout" | "query_timed_out" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorCode for Error {
    fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::Fetch(e) => e.code(),
            Error::Analysis(e) => e.code(),
            Error::Usage(e) => e.code(),
        }
    }

    fn meta(&self) -> Option<Value> {
        match self {
            Error::InvalidRequest(_) => None,
            Error::Fetch(e) => e.meta(),
            Error::Analysis(e) => e.meta(),
            Error::Usage(e) => e.meta(),
        }
    }
}

/// Result alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;
