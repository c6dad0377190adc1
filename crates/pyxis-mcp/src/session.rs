//! Persistent upstream MCP session.
//!
//! One session = one child process + one MCP client protocol state. The
//! child is spawned here so two concerns can sit between it and the SDK:
//!
//! - a forwarding task drops whitespace-only stdout lines (some servers
//!   emit stray newlines that would otherwise surface as JSON parse errors)
//! - stderr is spilled to an unlinked temp file and folded into the
//!   startup error when the handshake fails

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rmcp::ServiceExt;
use rmcp::service::{Peer, RoleClient, RunningService};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::process::ChildStdout;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pyxis_config::ServerRecord;

use crate::error::{McpError, McpResult};

/// Buffer size for the filtered stdout pipe.
const FILTER_PIPE_CAPACITY: usize = 64 * 1024;

/// A live MCP client session over a child process.
pub struct UpstreamSession {
    record: Arc<ServerRecord>,
    service: RunningService<RoleClient, ()>,
    child: tokio::process::Child,
    forward_task: JoinHandle<()>,
}

impl UpstreamSession {
    /// Spawn the server process and complete the MCP handshake.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Startup`] (with captured stderr) when the
    /// process cannot be spawned or the handshake does not complete.
    pub async fn start(record: Arc<ServerRecord>) -> McpResult<Self> {
        if let Some(cwd) = &record.cwd {
            // Warn only; startup proceeds and the server reports its own
            // failure if the directory matters.
            if !Path::new(cwd).exists() {
                warn!(
                    server = %record.name,
                    cwd = %cwd,
                    "Configured cwd for MCP server does not exist"
                );
            }
        }

        let mut capture = tempfile::tempfile().map_err(McpError::Io)?;
        let capture_sink = capture.try_clone().map_err(McpError::Io)?;

        let mut cmd = tokio::process::Command::new(&record.command);
        cmd.args(&record.args);
        for (key, value) in &record.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &record.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(capture_sink))
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|error| McpError::Startup {
            name: record.name.clone(),
            reason: format!("failed to spawn {}: {error}", record.command),
            stderr: String::new(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Startup {
            name: record.name.clone(),
            reason: "child stdin unavailable".to_string(),
            stderr: String::new(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Startup {
            name: record.name.clone(),
            reason: "child stdout unavailable".to_string(),
            stderr: String::new(),
        })?;

        let (filtered, forward_task) = spawn_noise_filter(stdout);

        let service = match ().serve((filtered, stdin)).await {
            Ok(service) => service,
            Err(error) => {
                forward_task.abort();
                let _ = child.start_kill();
                return Err(McpError::Startup {
                    name: record.name.clone(),
                    reason: format!("MCP handshake failed: {error}"),
                    stderr: drain_capture(&mut capture),
                });
            },
        };

        info!(server = %record.name, "MCP connection established");

        Ok(Self {
            record,
            service,
            child,
            forward_task,
        })
    }

    /// The server record this session was started from.
    #[must_use]
    pub fn record(&self) -> &Arc<ServerRecord> {
        &self.record
    }

    /// Whether the protocol session is still open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.service.is_closed()
    }

    /// A cloneable peer handle for making requests without holding any
    /// session lock. The peer serializes request/response pairing itself.
    #[must_use]
    pub fn peer(&self) -> Peer<RoleClient> {
        self.service.peer().clone()
    }

    /// Terminate the session: close the MCP side gracefully, then reap the
    /// child. Idempotent in effect; shutdown-time failures are logged, not
    /// raised.
    pub async fn stop(mut self, shutdown_timeout: Duration) {
        let name = self.record.name.clone();
        info!(server = %name, "Stopping MCP server");

        match self.service.close_with_timeout(shutdown_timeout).await {
            Ok(Some(reason)) => {
                debug!(server = %name, ?reason, "MCP session closed gracefully");
            },
            Ok(None) => {
                warn!(
                    server = %name,
                    timeout_secs = shutdown_timeout.as_secs(),
                    "MCP session close timed out; killing process"
                );
            },
            Err(error) => {
                warn!(server = %name, %error, "MCP session close join error");
            },
        }

        self.forward_task.abort();
        if let Err(error) = self.child.start_kill() {
            debug!(server = %name, %error, "Child already terminated");
        }
        let _ = self.child.wait().await;
    }
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("server", &self.record.name)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Interpose a line filter between the child's stdout and the protocol
/// parser: whitespace-only lines are dropped, everything else is forwarded
/// unchanged. The returned stream ends when the child closes stdout.
fn spawn_noise_filter(stdout: ChildStdout) -> (DuplexStream, JoinHandle<()>) {
    let (parser_side, mut writer_side) = tokio::io::duplex(FILTER_PIPE_CAPACITY);

    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if writer_side.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if writer_side.write_all(b"\n").await.is_err() {
                        break;
                    }
                },
                Ok(None) => break,
                Err(error) => {
                    debug!(%error, "Upstream stdout read failed");
                    break;
                },
            }
        }
        // Dropping the writer half signals EOF to the parser.
    });

    (parser_side, handle)
}

/// Read back whatever the child wrote to the capture file.
fn drain_capture(capture: &mut std::fs::File) -> String {
    let mut text = String::new();
    if capture.seek(SeekFrom::Start(0)).is_ok() {
        let _ = capture.read_to_string(&mut text);
    }
    text
}
