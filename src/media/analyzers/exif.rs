//! EXIF metadata via a long-lived `exiftool` process.
//!
//! exiftool is expensive to start, so one process is kept in `-stay_open`
//! mode and fed arguments over stdin. Each request writes `-json`, the file
//! path and `-execute`; exiftool answers with the JSON document followed by
//! a `{ready}` line.
//!
//! Requests are serialized through a mutex. A request that fails or times out
//! discards the process (it is killed on drop) and the next request starts a
//! fresh one.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::context::RequestContext;
use crate::media::analysis::ToolError;

const TOOL: &str = "exiftool";

const READY_MARKER: &str = "{ready}";

/// Substring exiftool uses in place of binary field values.
pub const BINARY_SENTINEL: &str = "use -b option to extract";

/// Replacement for binary field values.
pub const BINARY_PLACEHOLDER: &str = "[binary data not parsed]";

/// Fields describing the local copy rather than the fetched content.
pub const LOCAL_FIELDS: [&str; 7] = [
    "FileName",
    "SourceFile",
    "Directory",
    "FilePermissions",
    "FileAccessDate",
    "FileInodeChangeDate",
    "FileModifyDate",
];

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Session {
    fn spawn(bin: &Path) -> Result<Self, ToolError> {
        let mut child = Command::new(bin)
            .args(["-stay_open", "True", "-@", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn { tool: TOOL, source })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ToolError::Spawn {
                tool: TOOL,
                source: std::io::Error::other("stdio pipes were not captured"),
            });
        };

        tracing::debug!(bin = %bin.display(), "started exiftool session");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn execute(&mut self, path: &Path) -> Result<Vec<u8>, ToolError> {
        let request = format!("-json\n{}\n-execute\n", path.display());
        self.stdin.write_all(request.as_bytes()).await?;
        self.stdin.flush().await?;

        let mut output = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line).await? == 0 {
                return Err(ToolError::Exit {
                    tool: TOOL,
                    status: "closed".to_string(),
                    stderr: "process closed its output mid-request".to_string(),
                });
            }
            if line.trim_end() == READY_MARKER {
                return Ok(output);
            }
            output.extend_from_slice(line.as_bytes());
        }
    }

    async fn close(mut self) {
        let _ = self.stdin.write_all(b"-stay_open\nFalse\n").await;
        let _ = self.stdin.flush().await;
        if let Err(e) = self.child.wait().await {
            tracing::debug!(error = %e, "exiftool did not exit cleanly");
        }
    }
}

/// Shared exiftool session.
pub struct ExifTool {
    bin: PathBuf,
    timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for ExifTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExifTool")
            .field("bin", &self.bin)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ExifTool {
    /// Spawn the session up front so a missing binary fails at startup.
    pub fn start(bin: impl Into<PathBuf>, timeout: Duration) -> Result<Self, ToolError> {
        let bin = bin.into();
        let session = Session::spawn(&bin)?;
        Ok(Self {
            bin,
            timeout,
            session: Mutex::new(Some(session)),
        })
    }

    /// Extract metadata for `path`. `Ok(None)` when exiftool reports nothing.
    pub async fn extract(
        &self,
        path: &Path,
        ctx: &RequestContext,
    ) -> Result<Option<Map<String, Value>>, ToolError> {
        let mut slot = self.session.lock().await;
        let mut session = match slot.take() {
            Some(session) => session,
            None => Session::spawn(&self.bin)?,
        };

        let budget = ctx.budget(self.timeout);
        let output = match ctx
            .guard(tokio::time::timeout(budget, session.execute(path)))
            .await
        {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) | Err(_) => return Err(ToolError::Timeout { tool: TOOL }),
        };

        *slot = Some(session);
        drop(slot);
        parse_output(&output)
    }

    /// Ask the session to exit and wait for it.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }
}

/// Decode exiftool's `-json` array and sanitize the first entry.
pub fn parse_output(output: &[u8]) -> Result<Option<Map<String, Value>>, ToolError> {
    let entries: Vec<Map<String, Value>> =
        serde_json::from_slice(output).map_err(|e| ToolError::Decode {
            tool: TOOL,
            message: e.to_string(),
        })?;
    Ok(entries.into_iter().next().map(sanitize))
}

/// Drop local-copy fields and replace binary placeholders.
pub fn sanitize(mut fields: Map<String, Value>) -> Map<String, Value> {
    for key in LOCAL_FIELDS {
        fields.remove(key);
    }
    for value in fields.values_mut() {
        if value.as_str().is_some_and(|s| s.contains(BINARY_SENTINEL)) {
            *value = Value::String(BINARY_PLACEHOLDER.to_string());
        }
    }
    fields
}
