//! Pyxis MCP - persistent upstream sessions and tool metadata.
//!
//! This crate provides:
//! - [`UpstreamSession`]: one long-lived stdio MCP client session per
//!   upstream server, with transport-level noise filtering and captured
//!   stderr for startup diagnostics
//! - [`SessionManager`]: at most one live session per server name, reused
//!   across invocations and torn down on bridge shutdown
//! - [`MetadataCache`]: lazily filled per-server tool metadata with
//!   identifier aliases and a free-text search index
//!
//! # Architecture
//!
//! Sessions wrap the official `rmcp` SDK. The child process is spawned by
//! this crate (not by the SDK transport) so that a forwarding task can drop
//! whitespace-only stdout lines before the protocol parser sees them, and
//! so stderr can be spilled to a temp file for post-mortem inclusion in
//! startup errors.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod manager;
mod metadata;
mod session;
mod types;

pub use error::{McpError, McpResult};
pub use manager::SessionManager;
pub use metadata::{DocDetail, DocEntry, MetadataCache, ServerMetadata, ToolMetadata};
pub use session::UpstreamSession;
pub use types::ToolSpec;
