//! Usage statistics.
//!
//! Aggregates historical `read_file` activity from the log store: submits a
//! fixed aggregation query over a time range, polls the job with linear
//! backoff until it settles, and maps the first result row to
//! [`GetUsageResponse`].
//!
//! The poll schedule is `100ms + i * 1s` for iteration `i`, and the poller
//! gives up with [`UsageError::QueryTimedOut`] once the job is still pending
//! after iteration 5. That ceiling does not depend on the caller's deadline.

pub mod cloudwatch;
pub mod sigv4;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;

pub use cloudwatch::{CloudWatchConfig, CloudWatchLogs};
pub use sigv4::{AwsCredentials, SigV4Signer};

/// Aggregation over the service's own structured log lines.
pub const USAGE_QUERY: &str = "fields file_size, handler_duration
| filter file_size > 0
| stats count(), sum(file_size), avg(file_size), min(file_size), max(file_size)";

/// Default log group searched by the usage query.
pub const DEFAULT_LOG_GROUP: &str = "/aws/lambda/fileinfo";

/// Last iteration that may still sleep and retry.
pub const MAX_POLL_ITERATION: u32 = 5;

const POLL_BASE_DELAY: Duration = Duration::from_millis(100);
const POLL_STEP: Duration = Duration::from_secs(1);

/// Delay before re-polling after iteration `iteration` saw a pending job.
pub fn poll_delay(iteration: u32) -> Duration {
    POLL_BASE_DELAY + POLL_STEP * iteration
}

// ============== Request / response ==============

/// `get_usage` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetUsageRequest {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Aggregates over the requested range, with the range echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUsageResponse {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub request_count: i64,
    pub sum_file_size: i64,
    pub mean_file_size: i64,
    pub min_file_size: i64,
    pub max_file_size: i64,
}

impl GetUsageResponse {
    /// All-zero aggregates for a range with no matching activity.
    pub fn empty(request: &GetUsageRequest) -> Self {
        Self {
            start_time: request.start_time,
            end_time: request.end_time,
            request_count: 0,
            sum_file_size: 0,
            mean_file_size: 0,
            min_file_size: 0,
            max_file_size: 0,
        }
    }
}

// ============== Log store seam ==============

/// Query submission parameters. Times are epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub log_group_name: String,
    pub query_string: String,
    pub start_time: i64,
    pub end_time: i64,
}

/// One `{field, value}` cell of a result row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultField {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl ResultField {
    pub fn new(field: &str, value: &str) -> Self {
        Self {
            field: Some(field.to_string()),
            value: Some(value.to_string()),
        }
    }
}

/// Snapshot of a query job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueryResults {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub results: Vec<Vec<ResultField>>,
}

/// Query job lifecycle as reported by the log store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Scheduled,
    Running,
    Complete,
    Cancelled,
    Failed,
    Timeout,
    Unknown,
    Other(String),
}

impl QueryStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "Scheduled" => QueryStatus::Scheduled,
            "Running" => QueryStatus::Running,
            "Complete" => QueryStatus::Complete,
            "Cancelled" => QueryStatus::Cancelled,
            "Failed" => QueryStatus::Failed,
            "Timeout" => QueryStatus::Timeout,
            "Unknown" => QueryStatus::Unknown,
            other => QueryStatus::Other(other.to_string()),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, QueryStatus::Scheduled | QueryStatus::Running)
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            QueryStatus::Cancelled | QueryStatus::Failed | QueryStatus::Timeout | QueryStatus::Unknown
        )
    }
}

/// Errors raised by a log store client.
#[derive(Error, Debug)]
pub enum LogStoreError {
    #[error("log store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("log store returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("log store credentials are not configured")]
    MissingCredentials,

    #[error("invalid log store endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("cannot encode log store request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Asynchronous query service over structured logs.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Submit a query and return its opaque id.
    async fn start_query(&self, query: &LogQuery) -> Result<String, LogStoreError>;

    /// Fetch the current status and rows of a submitted query.
    async fn get_query_results(&self, query_id: &str) -> Result<QueryResults, LogStoreError>;
}

// ============== Errors ==============

/// Errors that end a `get_usage` call.
#[derive(Error, Debug)]
pub enum UsageError {
    #[error("query error: {0}")]
    Query(#[from] LogStoreError),

    #[error("error parsing result: {0}")]
    InvalidResult(String),

    #[error("log query failed with status {status}")]
    QueryFailed { status: String },

    #[error("log query failed with unknown status {status}")]
    UnknownStatus { status: String },

    #[error("log query timed out")]
    QueryTimedOut,
}

impl ErrorCode for UsageError {
    fn code(&self) -> &'static str {
        match self {
            UsageError::Query(_) | UsageError::InvalidResult(_) => "query_error",
            UsageError::QueryFailed { .. } | UsageError::UnknownStatus { .. } => "query_failed",
            UsageError::QueryTimedOut => "query_timed_out",
        }
    }

    fn meta(&self) -> Option<serde_json::Value> {
        match self {
            UsageError::QueryFailed { status } | UsageError::UnknownStatus { status } => {
                Some(serde_json::json!({ "status": status }))
            }
            _ => None,
        }
    }
}

// ============== Poller ==============

/// Runs the usage query against a [`LogStore`].
#[derive(Clone)]
pub struct UsagePoller {
    store: Arc<dyn LogStore>,
    log_group: String,
}

impl fmt::Debug for UsagePoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsagePoller")
            .field("log_group", &self.log_group)
            .finish_non_exhaustive()
    }
}

impl UsagePoller {
    pub fn new(store: Arc<dyn LogStore>, log_group: impl Into<String>) -> Self {
        Self {
            store,
            log_group: log_group.into(),
        }
    }

    pub fn log_group(&self) -> &str {
        &self.log_group
    }

    /// Submit the aggregation query for `request`'s range and wait for it.
    pub async fn get_usage(&self, request: &GetUsageRequest) -> Result<GetUsageResponse, UsageError> {
        let query = LogQuery {
            log_group_name: self.log_group.clone(),
            query_string: USAGE_QUERY.to_string(),
            start_time: request.start_time.timestamp(),
            end_time: request.end_time.timestamp(),
        };

        let query_id = self.store.start_query(&query).await?;
        tracing::debug!(query_id = %query_id, log_group = %self.log_group, "usage query submitted");

        let results = self.wait_for_results(&query_id).await?;
        map_results(request, &results.results)
    }

    async fn wait_for_results(&self, query_id: &str) -> Result<QueryResults, UsageError> {
        let mut iteration = 0u32;
        loop {
            let results = self.store.get_query_results(query_id).await?;
            let status = QueryStatus::parse(&results.status);

            if status == QueryStatus::Complete {
                return Ok(results);
            }
            if status.is_terminal_failure() {
                return Err(UsageError::QueryFailed {
                    status: results.status,
                });
            }
            if !status.is_pending() {
                return Err(UsageError::UnknownStatus {
                    status: results.status,
                });
            }
            if iteration > MAX_POLL_ITERATION {
                return Err(UsageError::QueryTimedOut);
            }

            let delay = poll_delay(iteration);
            tracing::trace!(query_id, iteration, delay_ms = delay.as_millis() as u64, "usage query pending");
            tokio::time::sleep(delay).await;
            iteration += 1;
        }
    }
}

/// Map the first row to aggregates in column order
/// `[count, sum, mean, min, max]`.
pub fn map_results(
    request: &GetUsageRequest,
    rows: &[Vec<ResultField>],
) -> Result<GetUsageResponse, UsageError> {
    let Some(row) = rows.first() else {
        return Ok(GetUsageResponse::empty(request));
    };

    let mut columns = [0i64; 5];
    for (i, slot) in columns.iter_mut().enumerate() {
        let cell = row
            .get(i)
            .ok_or_else(|| UsageError::InvalidResult(format!("missing column {i}")))?;
        let raw = cell.value.as_deref().unwrap_or_default();
        *slot = raw.parse().map_err(|e| {
            UsageError::InvalidResult(format!("column {i} value {raw:?}: {e}"))
        })?;
    }

    let [request_count, sum_file_size, mean_file_size, min_file_size, max_file_size] = columns;
    Ok(GetUsageResponse {
        start_time: request.start_time,
        end_time: request.end_time,
        request_count,
        sum_file_size,
        mean_file_size,
        min_file_size,
        max_file_size,
    })
}
