//! File pipeline
//!
//! - **RemoteFetcher**: bounded HTTP/HTTPS fetch into transient storage
//!   - URL validated before any network I/O
//!   - Streaming copy with a hard byte ceiling
//!   - Non-2xx responses classified with status and reason phrase
//!
//! - **ResourceHandle**: a fetched file on disk with its measured size
//!   - Exclusive lease for analysis, rewindable
//!   - Deleted on release, or on drop if never released
//!
//! - **AnalysisPipeline**: fixed-order analyzers over one handle
//!   - MIME detection and digests are mandatory
//!   - EXIF extraction and media probing are fail-soft
//!
//! # Example
//!
//! ```ignore
//! use fileinfo::context::RequestContext;
//! use fileinfo::media::{AnalysisPipeline, AnalyzerSelection, FetchConfig, RemoteFetcher};
//!
//! let fetcher = RemoteFetcher::new(FetchConfig::default())?;
//! let ctx = RequestContext::new();
//! let handle = fetcher.fetch("https://example.com/image.png", &ctx).await?;
//!
//! let selection = AnalyzerSelection::from_ids(["md5", "exif"]);
//! let report = pipeline.run(&handle, &selection, &ctx).await;
//! handle.release().await?;
//! ```

pub mod analysis;
pub mod analyzers;
pub mod fetch;
pub mod store;

pub use analysis::{
    AnalysisError, AnalysisPipeline, Analyzer, AnalyzerKind, AnalyzerOutput, AnalyzerSelection,
    FailurePolicy, FileReport, ReadFileRequest, ToolError,
};
pub use analyzers::{Toolchain, ToolchainConfig};
pub use fetch::{
    FetchConfig, FetchError, RemoteFetcher, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_FILE_SIZE,
    USER_AGENT,
};
pub use store::{HandleLease, ResourceHandle, StoreError, TransientFile};
