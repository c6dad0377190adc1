//! Bridge-level error taxonomy.
//!
//! The frontend maps these onto the client-visible statuses:
//! `Validation` → `validation_error`, a sandbox timeout → `timeout`, and
//! everything else → `error`.

use thiserror::Error;

use pyxis_mcp::McpError;
use pyxis_sandbox::SandboxError;

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that escape an execution and become client-visible.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed client arguments (missing code, unknown server names).
    #[error("{0}")]
    Validation(String),

    /// Container or runtime failure, including timeouts.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Upstream session failure for a server the invocation requested.
    #[error(transparent)]
    Mcp(#[from] McpError),

    /// Filesystem failure while preparing invocation state.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
