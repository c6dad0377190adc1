//! Session lifecycle management.
//!
//! Holds at most one live [`UpstreamSession`] per server name. Sessions
//! are started lazily on first use, reused across invocations, and stopped
//! explicitly on bridge shutdown.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolRequestParams, CallToolResult};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use pyxis_config::ServerRecord;

use crate::error::{McpError, McpResult};
use crate::session::UpstreamSession;
use crate::types::ToolSpec;

/// Default graceful-close budget for a session being stopped.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Manages upstream MCP sessions.
///
/// Invariant: at most one live session per server name. Session startup is
/// serialized by the internal write lock, so two concurrent requests for
/// the same server cannot both spawn it.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, UpstreamSession>>,
    shutdown_timeout: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl SessionManager {
    /// Create a manager with the given graceful-shutdown budget.
    #[must_use]
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            shutdown_timeout,
        }
    }

    /// Ensure a live session exists for the record.
    ///
    /// Returns `true` when a new session was started, `false` when an
    /// existing one was reused. A dead session (process exited) is replaced.
    ///
    /// # Errors
    ///
    /// Returns a startup error when the server cannot be spawned or fails
    /// the MCP handshake.
    pub async fn ensure_started(&self, record: &Arc<ServerRecord>) -> McpResult<bool> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(&record.name) {
            if existing.is_alive() {
                return Ok(false);
            }
            warn!(server = %record.name, "Replacing dead MCP session");
            if let Some(dead) = sessions.remove(&record.name) {
                let timeout = self.shutdown_timeout;
                tokio::spawn(async move { dead.stop(timeout).await });
            }
        }

        let session = UpstreamSession::start(Arc::clone(record)).await?;
        sessions.insert(record.name.clone(), session);
        info!(server = %record.name, "MCP server loaded");
        Ok(true)
    }

    /// Whether a server has a live session.
    pub async fn is_running(&self, name: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.get(name).is_some_and(UpstreamSession::is_alive)
    }

    /// Names of servers with a session entry.
    pub async fn list_running(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions.keys().cloned().collect()
    }

    /// Number of session entries.
    pub async fn running_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Round-trip the protocol's list-tools call for a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server has no live session or the protocol
    /// call fails.
    pub async fn list_tools(&self, server: &str) -> McpResult<Vec<ToolSpec>> {
        let peer = self.peer(server).await?;
        let tools = peer
            .list_all_tools()
            .await
            .map_err(|error| McpError::Protocol(error.to_string()))?;
        Ok(tools.iter().map(ToolSpec::from_rmcp).collect())
    }

    /// Invoke a tool on a server and return the structured response.
    ///
    /// # Errors
    ///
    /// Returns an error if the server has no live session or the upstream
    /// reports a failure.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Map<String, Value>,
    ) -> McpResult<CallToolResult> {
        let peer = self.peer(server).await?;

        let params = CallToolRequestParams {
            meta: None,
            name: Cow::Owned(tool.to_string()),
            arguments: Some(arguments),
            task: None,
        };

        peer.call_tool(params)
            .await
            .map_err(|error| McpError::ToolCallFailed {
                server: server.to_string(),
                tool: tool.to_string(),
                reason: error.to_string(),
            })
    }

    /// Stop one server's session.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::NotRunning`] when no session exists.
    pub async fn stop(&self, name: &str) -> McpResult<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(name).ok_or_else(|| McpError::NotRunning {
                name: name.to_string(),
            })?
        };
        session.stop(self.shutdown_timeout).await;
        Ok(())
    }

    /// Stop every session. Individual failures are logged, not raised.
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        for name in names {
            if let Err(error) = self.stop(&name).await {
                warn!(server = %name, %error, "Failed to stop server");
            }
        }
    }

    /// Cloneable peer handle for a live session; the lock is released
    /// before the caller issues any request.
    async fn peer(&self, name: &str) -> McpResult<rmcp::service::Peer<rmcp::service::RoleClient>> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(name).ok_or_else(|| McpError::NotRunning {
            name: name.to_string(),
        })?;
        if !session.is_alive() {
            return Err(McpError::NotRunning {
                name: name.to_string(),
            });
        }
        Ok(session.peer())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}
