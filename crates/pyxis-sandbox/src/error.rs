//! Sandbox error types.

use thiserror::Error;

/// Errors raised by the container sandbox.
///
/// `Failed` and `Timeout` carry whatever stdout/stderr was captured before
/// the failure so it can be surfaced to the client.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No container runtime could be located.
    #[error(
        "no container runtime found; install podman or rootless docker and set PYXIS_RUNTIME \
         when several are available"
    )]
    RuntimeUnavailable,

    /// The runtime or container failed to start or make progress.
    #[error("{message}")]
    Failed {
        /// What went wrong.
        message: String,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },

    /// The execution exceeded its timeout; the container was destroyed.
    #[error("execution timed out after {timeout_secs}s")]
    Timeout {
        /// The clamped timeout that expired.
        timeout_secs: u64,
        /// Stdout flushed before the timeout.
        stdout: String,
        /// Stderr flushed before the timeout.
        stderr: String,
    },

    /// I/O failure talking to the container process.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Construct a `Failed` error without captured output.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Captured stdout, if any.
    #[must_use]
    pub fn stdout(&self) -> &str {
        match self {
            Self::Failed { stdout, .. } | Self::Timeout { stdout, .. } => stdout,
            _ => "",
        }
    }

    /// Captured stderr, if any.
    #[must_use]
    pub fn stderr(&self) -> &str {
        match self {
            Self::Failed { stderr, .. } | Self::Timeout { stderr, .. } => stderr,
            _ => "",
        }
    }
}
