//! Error types for the upstream session layer.

use thiserror::Error;

/// Result alias for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors from upstream session management and metadata queries.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server name is not present in the registry.
    #[error("unknown MCP server: {name}")]
    UnknownServer {
        /// The requested server name.
        name: String,
    },

    /// The server has no live session.
    #[error("MCP server {name} is not running")]
    NotRunning {
        /// The server name.
        name: String,
    },

    /// Spawning the server process or completing the MCP handshake failed.
    ///
    /// `stderr` carries whatever the child wrote before failing, for
    /// diagnosis.
    #[error("failed to start MCP server {name}: {reason}")]
    Startup {
        /// The server name.
        name: String,
        /// What went wrong.
        reason: String,
        /// Captured child stderr.
        stderr: String,
    },

    /// A tool invocation failed on the upstream server.
    #[error("tool call {server}:{tool} failed: {reason}")]
    ToolCallFailed {
        /// The server name.
        server: String,
        /// The tool name.
        tool: String,
        /// What went wrong.
        reason: String,
    },

    /// Any other MCP protocol failure.
    #[error("MCP protocol error: {0}")]
    Protocol(String),

    /// Tool documentation was requested for a server with no cached
    /// metadata.
    #[error("documentation unavailable for server {server}")]
    DocsUnavailable {
        /// The server name.
        server: String,
    },

    /// A specific tool was requested but is not present on the server.
    #[error("tool '{tool}' not found for server {server}")]
    ToolNotFound {
        /// The server name.
        server: String,
        /// The requested tool name or alias.
        tool: String,
    },

    /// I/O failure while preparing the child process.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
