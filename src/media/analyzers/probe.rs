//! Media probing with `ffprobe`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;

use super::run_command;
use crate::context::RequestContext;
use crate::media::analysis::ToolError;

const TOOL: &str = "ffprobe";

/// Structured ffprobe output: per-stream objects plus the container format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeData {
    #[serde(default)]
    pub streams: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ProbeFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub filename: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProbeData {
    /// Reduce `format.filename` to its final path segment so the local
    /// directory layout never leaves the process.
    pub fn strip_local_path(&mut self) {
        if let Some(format) = self.format.as_mut() {
            if let Some(name) = format.filename.rsplit('/').next() {
                format.filename = name.to_string();
            }
        }
    }
}

/// ffprobe invoker.
#[derive(Debug, Clone)]
pub struct FfProbe {
    bin: PathBuf,
    timeout: Duration,
}

impl FfProbe {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    /// Run `ffprobe -version` to confirm the binary is usable.
    pub async fn verify(&self) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-version").stdin(Stdio::null());
        let output = run_command(TOOL, &mut cmd, self.timeout, &RequestContext::new()).await?;
        if !output.status.success() {
            return Err(exit_error(&output));
        }
        Ok(())
    }

    pub async fn probe(&self, path: &Path, ctx: &RequestContext) -> Result<ProbeData, ToolError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null());

        let output = run_command(TOOL, &mut cmd, self.timeout, ctx).await?;
        if !output.status.success() {
            return Err(exit_error(&output));
        }
        parse_output(&output.stdout)
    }
}

/// Decode ffprobe's JSON and strip the local path.
pub fn parse_output(stdout: &[u8]) -> Result<ProbeData, ToolError> {
    let mut data: ProbeData = serde_json::from_slice(stdout).map_err(|e| ToolError::Decode {
        tool: TOOL,
        message: e.to_string(),
    })?;
    data.strip_local_path();
    Ok(data)
}

fn exit_error(output: &std::process::Output) -> ToolError {
    ToolError::Exit {
        tool: TOOL,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}
