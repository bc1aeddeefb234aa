//! Analyzer pipeline.
//!
//! Runs a fixed, ordered set of analyzers over one [`ResourceHandle`]:
//!
//! 1. MIME detection (always)
//! 2. `md5`, `sha1` digests (when requested)
//! 3. `exif` metadata extraction, `ffprobe` media probing (when requested)
//!
//! MIME detection and digests are mandatory: any failure aborts the run.
//! Metadata extraction and probing are fail-soft: a failure leaves the field
//! out of the report and is logged.
//!
//! Analyzer internals sit behind the [`Analyzer`] trait, so the ordering and
//! failure policy here stay independent of how each one is computed.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::context::RequestContext;
use crate::error::{ErrorCode, INTERNAL_ERROR};
use crate::media::analyzers::probe::ProbeData;
use crate::media::store::{HandleLease, ResourceHandle, StoreError};

/// One analyzer variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    Mimetype,
    Md5,
    Sha1,
    Exif,
    Ffprobe,
}

/// What happens to the request when an analyzer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the pipeline and fail the request.
    Mandatory,
    /// Omit the field, log, and continue.
    FailSoft,
}

impl AnalyzerKind {
    /// Execution order, independent of the order analyzers were requested in.
    pub const PIPELINE_ORDER: [AnalyzerKind; 5] = [
        AnalyzerKind::Mimetype,
        AnalyzerKind::Md5,
        AnalyzerKind::Sha1,
        AnalyzerKind::Exif,
        AnalyzerKind::Ffprobe,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            AnalyzerKind::Mimetype => "mimetype",
            AnalyzerKind::Md5 => "md5",
            AnalyzerKind::Sha1 => "sha1",
            AnalyzerKind::Exif => "exif",
            AnalyzerKind::Ffprobe => "ffprobe",
        }
    }

    /// Parse a requestable analyzer id. MIME detection always runs and is not
    /// requestable.
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "md5" => Some(AnalyzerKind::Md5),
            "sha1" => Some(AnalyzerKind::Sha1),
            "exif" => Some(AnalyzerKind::Exif),
            "ffprobe" => Some(AnalyzerKind::Ffprobe),
            _ => None,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        match self {
            AnalyzerKind::Mimetype | AnalyzerKind::Md5 | AnalyzerKind::Sha1 => {
                FailurePolicy::Mandatory
            }
            AnalyzerKind::Exif | AnalyzerKind::Ffprobe => FailurePolicy::FailSoft,
        }
    }

    /// Whether the analyzer reads content through the leased file handle
    /// (as opposed to handing the path to an external process).
    pub fn reads_handle(&self) -> bool {
        matches!(
            self,
            AnalyzerKind::Mimetype | AnalyzerKind::Md5 | AnalyzerKind::Sha1
        )
    }
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// The set of analyzers to run. Unknown ids and duplicates are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyzerSelection(BTreeSet<AnalyzerKind>);

impl AnalyzerSelection {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            ids.into_iter()
                .filter_map(|id| AnalyzerKind::from_id(id.as_ref()))
                .collect(),
        )
    }

    pub fn contains(&self, kind: AnalyzerKind) -> bool {
        kind == AnalyzerKind::Mimetype || self.0.contains(&kind)
    }

    /// Analyzers that will run, in pipeline order.
    pub fn planned(&self) -> impl Iterator<Item = AnalyzerKind> + '_ {
        AnalyzerKind::PIPELINE_ORDER
            .into_iter()
            .filter(|kind| self.contains(*kind))
    }
}

/// `read_file` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadFileRequest {
    pub url: String,
    pub analyzers: Vec<String>,
}

impl ReadFileRequest {
    /// Check the shape constraints serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("url must not be empty".to_string());
        }
        if self.analyzers.is_empty() {
            return Err("analyzers must contain at least one entry".to_string());
        }
        Ok(())
    }

    pub fn selection(&self) -> AnalyzerSelection {
        AnalyzerSelection::from_ids(&self.analyzers)
    }
}

/// Analysis report for one fetched file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub size: u64,
    pub size_human: String,
    pub mimetype: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_sha1: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exif: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffprobe: Option<ProbeData>,
}

impl FileReport {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            size_human: ByteSize::b(size).to_string(),
            mimetype: String::new(),
            digest_md5: None,
            digest_sha1: None,
            exif: None,
            ffprobe: None,
        }
    }

    fn apply(&mut self, kind: AnalyzerKind, output: AnalyzerOutput) -> Result<(), ToolError> {
        match (kind, output) {
            (AnalyzerKind::Mimetype, AnalyzerOutput::Mimetype(mime)) => self.mimetype = mime,
            (AnalyzerKind::Md5, AnalyzerOutput::Digest(hex)) => self.digest_md5 = Some(hex),
            (AnalyzerKind::Sha1, AnalyzerOutput::Digest(hex)) => self.digest_sha1 = Some(hex),
            (AnalyzerKind::Exif, AnalyzerOutput::Exif(fields)) => self.exif = fields,
            (AnalyzerKind::Ffprobe, AnalyzerOutput::Probe(data)) => self.ffprobe = Some(data),
            (kind, _) => return Err(ToolError::UnexpectedOutput(kind)),
        }
        Ok(())
    }
}

/// Value produced by a single analyzer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerOutput {
    Mimetype(String),
    Digest(String),
    /// `None` when the extractor found nothing to report.
    Exif(Option<Map<String, Value>>),
    Probe(ProbeData),
}

/// Failure inside one analyzer.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{tool} could not be started: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Exit {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("{tool} timed out")]
    Timeout { tool: &'static str },

    #[error("{tool} output could not be decoded: {message}")]
    Decode { tool: &'static str, message: String },

    #[error("analyzer produced output for a different kind than {0}")]
    UnexpectedOutput(AnalyzerKind),
}

/// Errors that end a pipeline run.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("analyzer error ({which}): {source}")]
    Analyzer {
        which: AnalyzerKind,
        #[source]
        source: ToolError,
    },

    #[error(transparent)]
    Lease(#[from] StoreError),
}

impl ErrorCode for AnalysisError {
    fn code(&self) -> &'static str {
        match self {
            AnalysisError::Analyzer { .. } => "analyzer_error",
            AnalysisError::Lease(_) => INTERNAL_ERROR,
        }
    }

    fn meta(&self) -> Option<Value> {
        match self {
            AnalysisError::Analyzer { which, .. } => Some(json!({ "analyzer": which.id() })),
            AnalysisError::Lease(_) => None,
        }
    }
}

/// Uniform interface over all analyzer variants.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Run analyzer `kind` against the leased file.
    async fn analyze(
        &self,
        kind: AnalyzerKind,
        lease: &mut HandleLease<'_>,
        ctx: &RequestContext,
    ) -> Result<AnalyzerOutput, ToolError>;
}

/// Ordered, policy-aware execution of analyzers over one handle.
#[derive(Clone)]
pub struct AnalysisPipeline {
    analyzer: Arc<dyn Analyzer>,
}

impl fmt::Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisPipeline").finish_non_exhaustive()
    }
}

impl AnalysisPipeline {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer }
    }

    /// Run every selected analyzer in pipeline order.
    ///
    /// Holds the handle's lease for the whole run. The handle is not released
    /// here; that is the caller's job.
    pub async fn run(
        &self,
        handle: &ResourceHandle,
        selection: &AnalyzerSelection,
        ctx: &RequestContext,
    ) -> Result<FileReport, AnalysisError> {
        let mut lease = handle.acquire()?;
        let mut report = FileReport::new(handle.size());

        for kind in selection.planned() {
            let outcome = match self.run_one(kind, &mut lease, ctx).await {
                Ok(output) => report.apply(kind, output),
                Err(e) => Err(e),
            };

            let Err(source) = outcome else {
                continue;
            };
            match kind.policy() {
                FailurePolicy::Mandatory => {
                    return Err(AnalysisError::Analyzer {
                        which: kind,
                        source,
                    })
                }
                FailurePolicy::FailSoft => {
                    tracing::warn!(analyzer = %kind, error = %source, "analyzer error");
                }
            }
        }

        Ok(report)
    }

    async fn run_one(
        &self,
        kind: AnalyzerKind,
        lease: &mut HandleLease<'_>,
        ctx: &RequestContext,
    ) -> Result<AnalyzerOutput, ToolError> {
        if kind.reads_handle() {
            lease.rewind().await?;
        }
        self.analyzer.analyze(kind, lease, ctx).await
    }
}
