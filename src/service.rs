//! Request orchestration.
//!
//! [`AppState`] owns the fetcher, the analyzer pipeline, the usage poller and
//! the metrics, and is shared by every HTTP handler and CLI command.
//!
//! `read_file` is fetch → analyze → release. The transient file is released
//! on every path once the fetch succeeded; a failed release is logged and
//! never replaces the analysis outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::AppConfig;
use crate::context::RequestContext;
use crate::error::{Error, ErrorCode, Result};
use crate::media::{
    AnalysisPipeline, Analyzer, FetchError, FileReport, ReadFileRequest, RemoteFetcher, ToolError,
    Toolchain,
};
use crate::server::metrics::ServiceMetrics;
use crate::usage::{
    CloudWatchLogs, GetUsageRequest, GetUsageResponse, LogStore, LogStoreError, UsagePoller,
};

/// Failures while assembling the application.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("analyzer toolchain unavailable: {0}")]
    Toolchain(#[from] ToolError),

    #[error("cannot build HTTP client: {0}")]
    Fetcher(#[from] FetchError),

    #[error("cannot configure log store: {0}")]
    LogStore(#[from] LogStoreError),
}

struct Inner {
    fetcher: RemoteFetcher,
    pipeline: AnalysisPipeline,
    usage: UsagePoller,
    metrics: ServiceMetrics,
    toolchain: Option<Arc<Toolchain>>,
}

/// Shared application state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
    request_timeout: Option<Duration>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("max_file_size", &self.inner.fetcher.max_size())
            .field("log_group", &self.inner.usage.log_group())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Assemble from explicit parts.
    pub fn new(
        fetcher: RemoteFetcher,
        analyzer: Arc<dyn Analyzer>,
        log_store: Arc<dyn LogStore>,
        log_group: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                pipeline: AnalysisPipeline::new(analyzer),
                usage: UsagePoller::new(log_store, log_group),
                metrics: ServiceMetrics::new(),
                toolchain: None,
            }),
            request_timeout: None,
        }
    }

    /// Bound every request context handed out by [`AppState::request_context`].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Start the analyzer toolchain and build all clients from `config`.
    pub async fn from_config(config: &AppConfig) -> std::result::Result<Self, StartupError> {
        let toolchain = Arc::new(Toolchain::start(&config.toolchain_config()).await?);
        let fetcher = RemoteFetcher::new(config.fetch_config())?;

        Ok(Self {
            inner: Arc::new(Inner {
                fetcher,
                pipeline: AnalysisPipeline::new(toolchain.clone()),
                usage: usage_poller(config)?,
                metrics: ServiceMetrics::new(),
                toolchain: Some(toolchain),
            }),
            request_timeout: Some(config.request_timeout()),
        })
    }

    /// A fresh context carrying the configured request deadline, if any.
    pub fn request_context(&self) -> RequestContext {
        match self.request_timeout {
            Some(timeout) => RequestContext::with_timeout(timeout),
            None => RequestContext::new(),
        }
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.inner.metrics
    }

    /// Fetch `request.url` and run the requested analyzers over it.
    pub async fn read_file(
        &self,
        request: ReadFileRequest,
        ctx: &RequestContext,
    ) -> Result<FileReport> {
        let result = self.read_file_inner(request, ctx).await;
        self.record("read_file", &result);
        result
    }

    async fn read_file_inner(
        &self,
        request: ReadFileRequest,
        ctx: &RequestContext,
    ) -> Result<FileReport> {
        request.validate().map_err(Error::InvalidRequest)?;
        let selection = request.selection();
        let metrics = &self.inner.metrics;

        let fetch_started = Instant::now();
        let handle = match self.inner.fetcher.fetch(&request.url, ctx).await {
            Ok(handle) => handle,
            Err(e) => {
                if let FetchError::FileTooLarge { limit } = &e {
                    tracing::info!(file_size = limit, "remote file exceeds size limit");
                }
                return Err(e.into());
            }
        };
        let fetch_elapsed = fetch_started.elapsed();
        metrics.fetch_duration_seconds.observe_duration(fetch_elapsed);
        metrics.file_size_bytes.observe(handle.size() as f64);

        let analysis_started = Instant::now();
        let outcome = self.inner.pipeline.run(&handle, &selection, ctx).await;
        let analysis_elapsed = analysis_started.elapsed();
        metrics
            .analysis_duration_seconds
            .observe_duration(analysis_elapsed);

        let file_size = handle.size();
        if let Err(e) = handle.release().await {
            tracing::warn!(error = %e, "failed to release transient file");
        }

        tracing::info!(
            file_size,
            file_dl_duration_ms = fetch_elapsed.as_millis() as u64,
            file_info_duration_ms = analysis_elapsed.as_millis() as u64,
            "file read"
        );

        Ok(outcome?)
    }

    /// Aggregate usage statistics over `request`'s range.
    pub async fn get_usage(&self, request: GetUsageRequest) -> Result<GetUsageResponse> {
        let started = Instant::now();
        let result = self
            .inner
            .usage
            .get_usage(&request)
            .await
            .map_err(Error::from);
        self.inner
            .metrics
            .usage_query_duration_seconds
            .observe_duration(started.elapsed());
        self.record("get_usage", &result);
        result
    }

    fn record<T>(&self, operation: &str, result: &Result<T>) {
        let code = match result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        self.inner.metrics.record_request(operation, code);
    }

    /// Stop background tool processes.
    pub async fn shutdown(&self) {
        if let Some(toolchain) = &self.inner.toolchain {
            toolchain.shutdown().await;
        }
    }
}

/// Usage poller over CloudWatch Logs. Needs no analyzer tooling.
pub fn usage_poller(config: &AppConfig) -> std::result::Result<UsagePoller, StartupError> {
    let log_store = Arc::new(CloudWatchLogs::new(&config.cloudwatch)?);
    if config.cloudwatch.credentials.is_none() {
        tracing::warn!("AWS credentials not configured; get_usage will fail");
    }
    Ok(UsagePoller::new(log_store, config.log_group.clone()))
}
