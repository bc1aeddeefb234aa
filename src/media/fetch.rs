//! Bounded remote fetch
//!
//! Streams a URL's body into a [`TransientFile`] under a hard byte ceiling:
//! - URL validated before any network I/O (HTTP/HTTPS only)
//! - Single GET with a fixed client tag
//! - Non-2xx responses classified with status code and normalized phrase
//! - Body copied through a bounded reader, constant memory regardless of size
//! - Storage released on every failure path

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use url::Url;

use crate::context::RequestContext;
use crate::error::{ErrorCode, INTERNAL_ERROR};
use crate::media::store::{ResourceHandle, StoreError, TransientFile};

/// Client tag sent as the `User-Agent` of every fetch.
pub const USER_AGENT: &str = concat!("fileinfo-reader/", env!("CARGO_PKG_VERSION"));

/// Default maximum body size (11 MB, room for e.g. a 10.1 MiB file).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 11_000_000;

/// Default fetch timeout in milliseconds (30s)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Connect timeout applied to the HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while fetching a remote file
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid url")]
    InvalidUrl,

    #[error("request timed out")]
    RequestTimeout,

    #[error("response has no body")]
    NoResponseBody,

    #[error("request failed with status {status} ({status_text})")]
    RequestFailed { status: u16, status_text: String },

    #[error("file is larger than the maximum of {limit} bytes")]
    FileTooLarge { limit: u64 },

    #[error("cannot fetch remote file: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ErrorCode for FetchError {
    fn code(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl => "invalid_url",
            FetchError::RequestTimeout => "request_timeout",
            FetchError::NoResponseBody => "no_response_body",
            FetchError::RequestFailed { .. } => "request_failed",
            FetchError::FileTooLarge { .. } => "file_too_large",
            FetchError::Transport(_) | FetchError::Storage(_) => INTERNAL_ERROR,
        }
    }

    fn meta(&self) -> Option<serde_json::Value> {
        match self {
            FetchError::RequestFailed {
                status,
                status_text,
            } => Some(json!({
                "http_status": status,
                "status_text": status_text,
            })),
            FetchError::FileTooLarge { limit } => Some(json!({ "max_file_size": limit })),
            _ => None,
        }
    }
}

/// Configuration for the fetcher
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Maximum body size in bytes
    pub max_size: u64,

    /// Whole-request timeout in milliseconds
    pub timeout_ms: u64,

    /// Directory transient files are created in
    pub temp_dir: PathBuf,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_FILE_SIZE,
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl FetchConfig {
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: PathBuf) -> Self {
        self.temp_dir = temp_dir;
        self
    }
}

/// Fetches remote files into transient storage under a size ceiling.
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    client: Client,
    config: FetchConfig,
}

impl RemoteFetcher {
    /// Build a fetcher with its own HTTP client.
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn max_size(&self) -> u64 {
        self.config.max_size
    }

    /// Fetch `url` into a new [`ResourceHandle`] positioned at offset 0.
    pub async fn fetch(
        &self,
        url: &str,
        ctx: &RequestContext,
    ) -> Result<ResourceHandle, FetchError> {
        let url = parse_url(url)?;
        let response = self.request(url, ctx).await?;

        let mut storage = TransientFile::create_in(&self.config.temp_dir).await?;
        match self.save_body(response, &mut storage, ctx).await {
            Ok(size) => Ok(ResourceHandle::new(storage, size)),
            Err(e) => {
                if let Err(cleanup) = storage.remove().await {
                    tracing::warn!(error = %cleanup, "failed to release storage after fetch error");
                }
                Err(e)
            }
        }
    }

    async fn request(&self, url: Url, ctx: &RequestContext) -> Result<Response, FetchError> {
        let send = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send();

        let response = match ctx.guard(send).await {
            Err(_) => return Err(FetchError::RequestTimeout),
            Ok(Err(e)) if e.is_timeout() => return Err(FetchError::RequestTimeout),
            Ok(Err(e)) => return Err(FetchError::Transport(e)),
            Ok(Ok(response)) => response,
        };

        classify_status(response.status(), response.content_length())?;
        Ok(response)
    }

    /// Copy at most `max_size + 1` bytes; the extra byte is the only signal
    /// separating "fits" from "too large".
    async fn save_body(
        &self,
        response: Response,
        storage: &mut TransientFile,
        ctx: &RequestContext,
    ) -> Result<u64, FetchError> {
        let limit = self.config.max_size;
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let body = StreamReader::new(stream).take(limit.saturating_add(1));
        tokio::pin!(body);

        let file = storage.file_mut().ok_or_else(|| {
            StoreError::Write(std::io::Error::other("transient file is already closed"))
        })?;

        let copied = match ctx.guard(tokio::io::copy(&mut body, file)).await {
            Err(_) => return Err(FetchError::RequestTimeout),
            Ok(Err(e)) if is_timeout(&e) => return Err(FetchError::RequestTimeout),
            Ok(Err(e)) => return Err(StoreError::Write(e).into()),
            Ok(Ok(copied)) => copied,
        };

        if copied > limit {
            return Err(FetchError::FileTooLarge { limit });
        }
        if copied == 0 {
            return Err(FetchError::NoResponseBody);
        }

        file.flush().await.map_err(StoreError::Write)?;
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(StoreError::Write)?;

        tracing::debug!(size = copied, "saved remote file");
        Ok(copied)
    }
}

/// Validate a URL before any network I/O.
pub fn parse_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl)?;
    match parsed.scheme() {
        "http" | "https" if parsed.has_host() => Ok(parsed),
        _ => Err(FetchError::InvalidUrl),
    }
}

/// Accept 2xx responses that can carry a body; classify everything else.
pub fn classify_status(status: StatusCode, content_length: Option<u64>) -> Result<(), FetchError> {
    if status.is_success() {
        if status == StatusCode::NO_CONTENT || content_length == Some(0) {
            return Err(FetchError::NoResponseBody);
        }
        return Ok(());
    }

    Err(FetchError::RequestFailed {
        status: status.as_u16(),
        status_text: status_text(status),
    })
}

/// Canonical reason phrase, lower-cased and underscore-joined (`404` -> `not_found`).
pub fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("unknown")
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

fn is_timeout(err: &std::io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(reqwest::Error::is_timeout)
}
