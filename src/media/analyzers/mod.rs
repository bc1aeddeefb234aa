//! Analyzer implementations.
//!
//! [`Toolchain`] is the production [`Analyzer`]: MIME detection and digests
//! read the leased file in-process, EXIF extraction and probing hand the file
//! path to external tools.

pub mod digest;
pub mod exif;
pub mod mime;
pub mod probe;

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::context::RequestContext;
use crate::media::analysis::{Analyzer, AnalyzerKind, AnalyzerOutput, ToolError};
use crate::media::store::HandleLease;

pub use exif::ExifTool;
pub use probe::{FfProbe, ProbeData, ProbeFormat};

/// Default per-invocation limit for external tools (30s)
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// Locations and limits for the external tools.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub exiftool_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub timeout: Duration,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            exiftool_bin: PathBuf::from("exiftool"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            timeout: Duration::from_millis(DEFAULT_TOOL_TIMEOUT_MS),
        }
    }
}

/// All analyzers backed by real implementations.
#[derive(Debug)]
pub struct Toolchain {
    exiftool: ExifTool,
    ffprobe: FfProbe,
}

impl Toolchain {
    /// Verify ffprobe runs and start the exiftool session.
    ///
    /// Either failing is fatal: the service refuses to start half-equipped.
    pub async fn start(config: &ToolchainConfig) -> Result<Self, ToolError> {
        let ffprobe = FfProbe::new(&config.ffprobe_bin, config.timeout);
        ffprobe.verify().await?;

        let exiftool = ExifTool::start(&config.exiftool_bin, config.timeout)?;

        tracing::info!(
            exiftool = %config.exiftool_bin.display(),
            ffprobe = %config.ffprobe_bin.display(),
            "analyzer toolchain ready"
        );

        Ok(Self { exiftool, ffprobe })
    }

    /// Stop the exiftool session.
    pub async fn shutdown(&self) {
        self.exiftool.shutdown().await;
    }
}

#[async_trait]
impl Analyzer for Toolchain {
    async fn analyze(
        &self,
        kind: AnalyzerKind,
        lease: &mut HandleLease<'_>,
        ctx: &RequestContext,
    ) -> Result<AnalyzerOutput, ToolError> {
        match kind {
            AnalyzerKind::Mimetype => Ok(AnalyzerOutput::Mimetype(
                mime::detect(lease.file()).await?,
            )),
            AnalyzerKind::Md5 => Ok(AnalyzerOutput::Digest(
                digest::md5_hex(lease.file()).await?,
            )),
            AnalyzerKind::Sha1 => Ok(AnalyzerOutput::Digest(
                digest::sha1_hex(lease.file()).await?,
            )),
            AnalyzerKind::Exif => Ok(AnalyzerOutput::Exif(
                self.exiftool.extract(lease.path(), ctx).await?,
            )),
            AnalyzerKind::Ffprobe => Ok(AnalyzerOutput::Probe(
                self.ffprobe.probe(lease.path(), ctx).await?,
            )),
        }
    }
}

/// Run a one-shot command, capturing output, bounded by `limit` and the
/// request context. The child is killed if the bound is hit.
pub(crate) async fn run_command(
    tool: &'static str,
    cmd: &mut Command,
    limit: Duration,
    ctx: &RequestContext,
) -> Result<Output, ToolError> {
    let child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolError::Spawn { tool, source })?;

    let budget = ctx.budget(limit);
    match ctx
        .guard(tokio::time::timeout(budget, child.wait_with_output()))
        .await
    {
        Ok(Ok(output)) => Ok(output?),
        Ok(Err(_)) | Err(_) => Err(ToolError::Timeout { tool }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toolchain_config_defaults() {
        let config = ToolchainConfig::default();
        assert_eq!(config.exiftool_bin, PathBuf::from("exiftool"));
        assert_eq!(config.ffprobe_bin, PathBuf::from("ffprobe"));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_start_fails_without_ffprobe() {
        let config = ToolchainConfig {
            ffprobe_bin: PathBuf::from("/nonexistent/fileinfo/ffprobe"),
            ..Default::default()
        };
        let err = Toolchain::start(&config).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { tool: "ffprobe", .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf hi; printf oops >&2; exit 3"]);
        let output = run_command("sh", &mut cmd, Duration::from_secs(5), &RequestContext::new())
            .await
            .unwrap();
        assert_eq!(output.stdout, b"hi");
        assert_eq!(output.stderr, b"oops");
        assert_eq!(output.status.code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_command("sleep", &mut cmd, Duration::from_millis(50), &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { tool: "sleep" }));
    }
}
