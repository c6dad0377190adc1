//! The bridge root object.
//!
//! Owns the registry, the upstream session manager, the metadata cache,
//! and the container sandbox. The MCP frontend closes over one shared
//! [`Bridge`]; there are no process-wide singletons.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use pyxis_config::{CatalogFormat, ConfigSource, ServerRecord, ServerRegistry, discover_into};
use pyxis_core::{BridgeSettings, StateDir};
use pyxis_mcp::{DocDetail, DocEntry, McpError, McpResult, MetadataCache, SessionManager};
use pyxis_sandbox::{ContainerSandbox, ExecutionResult, SandboxError};

use crate::error::{BridgeError, BridgeResult};
use crate::invocation::Invocation;

/// The bridge: discovery, sessions, metadata, and the sandbox.
pub struct Bridge {
    settings: BridgeSettings,
    state_dir: StateDir,
    registry: RwLock<ServerRegistry>,
    sessions: SessionManager,
    metadata: MetadataCache,
    sandbox: ContainerSandbox,
}

impl Bridge {
    /// Construct the bridge from settings, autodetecting the container
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the state directory cannot be resolved.
    pub fn new(settings: BridgeSettings) -> BridgeResult<Self> {
        let sandbox = ContainerSandbox::new(&settings);
        Self::with_sandbox(settings, sandbox)
    }

    /// Construct the bridge around an existing sandbox (useful for
    /// testing).
    ///
    /// # Errors
    ///
    /// Returns an error when the state directory cannot be resolved.
    pub(crate) fn with_sandbox(
        settings: BridgeSettings,
        sandbox: ContainerSandbox,
    ) -> BridgeResult<Self> {
        let state_dir = StateDir::resolve(settings.state_dir.as_deref())?;
        Ok(Self {
            settings,
            state_dir,
            registry: RwLock::new(ServerRegistry::new()),
            sessions: SessionManager::default(),
            metadata: MetadataCache::new(),
            sandbox,
        })
    }

    /// Bridge settings.
    #[must_use]
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// The persistent state directory.
    #[must_use]
    pub fn state_dir(&self) -> &StateDir {
        &self.state_dir
    }

    /// The container sandbox.
    #[must_use]
    pub(crate) fn sandbox(&self) -> &ContainerSandbox {
        &self.sandbox
    }

    /// The metadata cache.
    #[must_use]
    pub(crate) fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// The upstream session manager.
    #[must_use]
    pub(crate) fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The catalog sources scanned by discovery, in order.
    fn config_sources(&self) -> Vec<ConfigSource> {
        let home = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let workspace = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        let mut sources = pyxis_config::default_sources(&home, &workspace);
        if let Some(extra) = &self.settings.extra_config_path {
            let format = if extra.extension().and_then(|ext| ext.to_str()) == Some("toml") {
                CatalogFormat::Toml
            } else {
                CatalogFormat::Json
            };
            sources.push(ConfigSource::file(extra.clone(), "Environment").with_format(format));
        }
        sources
    }

    /// Scan all catalog sources, registering any servers not yet known.
    /// Repeated scans of an unchanged filesystem leave the registry
    /// unchanged.
    pub async fn discover(&self) {
        let sources = self.config_sources();
        let mut registry = self.registry.write().await;
        let added = discover_into(&mut registry, &sources, self.settings.allow_self_server);
        if added > 0 {
            info!(added, total = registry.len(), "Discovered MCP servers");
        } else {
            debug!(total = registry.len(), "Discovery found no new servers");
        }
    }

    /// Registered server names, in discovery order.
    pub async fn server_names(&self) -> Vec<String> {
        self.registry.read().await.names()
    }

    /// Name → description map over the whole registry.
    pub async fn describe_all(&self) -> std::collections::BTreeMap<String, String> {
        self.registry.read().await.describe_all()
    }

    /// Execute code in the sandbox with the given allowed servers.
    ///
    /// `timeout_secs` must already be clamped by the caller.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Validation`] when a requested server is unknown
    /// - session startup errors for requested servers
    /// - sandbox errors, including timeout
    pub async fn execute_code(
        &self,
        code: &str,
        servers: &[String],
        timeout_secs: u64,
    ) -> BridgeResult<ExecutionResult> {
        self.discover().await;

        // Requested names, deduplicated, preserving request order.
        let mut requested: Vec<String> = Vec::new();
        for name in servers {
            if !requested.contains(name) {
                requested.push(name.clone());
            }
        }

        let records = {
            let registry = self.registry.read().await;
            let mut records: Vec<Arc<ServerRecord>> = Vec::with_capacity(requested.len());
            for name in &requested {
                let record = registry.lookup(name).cloned().ok_or_else(|| {
                    BridgeError::Validation(format!("Unknown MCP server: {name}"))
                })?;
                records.push(record);
            }
            records
        };

        for record in &records {
            let started = self.sessions.ensure_started(record).await?;
            if started {
                // A (re)started session invalidates any cached tool list.
                self.metadata.invalidate(&record.name).await;
            }
            self.ensure_metadata(&record.name).await?;
        }

        let invocation = Invocation::prepare(self, requested).await?;
        let result = self
            .sandbox
            .execute(code, timeout_secs, invocation.launch_spec(), &invocation)
            .await?;
        drop(invocation);

        if !result.success {
            return Err(BridgeError::Sandbox(SandboxError::Failed {
                message: format!("sandbox exited with code {}", result.exit_code),
                stdout: result.stdout,
                stderr: result.stderr,
            }));
        }
        Ok(result)
    }

    /// Fill the metadata cache for a loaded server if needed.
    pub(crate) async fn ensure_metadata(&self, name: &str) -> McpResult<()> {
        if self.metadata.contains(name).await {
            return Ok(());
        }
        let record = {
            let registry = self.registry.read().await;
            registry
                .lookup(name)
                .cloned()
                .ok_or_else(|| McpError::UnknownServer {
                    name: name.to_string(),
                })?
        };
        let specs = self.sessions.list_tools(name).await?;
        self.metadata.insert_specs(&record, &specs).await;
        Ok(())
    }

    /// Documentation entries for one loaded server.
    pub(crate) async fn tool_docs(
        &self,
        server: &str,
        tool: Option<&str>,
        detail: DocDetail,
    ) -> McpResult<Vec<DocEntry>> {
        self.ensure_metadata(server).await?;
        self.metadata.tool_docs(server, tool, detail).await
    }

    /// Search tool documentation across the allowed servers.
    pub(crate) async fn search_tool_docs(
        &self,
        query: &str,
        allowed: &[String],
        limit: i64,
        detail: DocDetail,
    ) -> McpResult<Vec<DocEntry>> {
        for server in allowed {
            self.ensure_metadata(server).await?;
        }
        Ok(self.metadata.search(query, allowed, limit, detail).await)
    }

    /// Shut down the bridge: stop every upstream session and the sandbox.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        self.sessions.stop_all().await;
        self.sandbox.shutdown().await;
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}
