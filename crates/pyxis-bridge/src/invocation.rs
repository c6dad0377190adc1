//! Per-invocation scope and upcall dispatch.
//!
//! An [`Invocation`] lives for one `run_python` call. It snapshots the
//! metadata of the requested servers, prepares the IPC directory and
//! container launch parameters, and acts as the upcall dispatcher: every
//! upcall is validated against the invocation's allowlist before it can
//! reach any upstream session. The IPC directory is removed when the
//! invocation is dropped.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use pyxis_core::dirs::IPC_DIR_PREFIX;
use pyxis_mcp::DocDetail;
use pyxis_sandbox::{
    IPC_MOUNT_TARGET, LaunchSpec, PROJECTS_MOUNT_TARGET, UpcallHandler,
};

use crate::bridge::Bridge;
use crate::error::BridgeResult;

/// Security scope and IPC resources for one execution.
pub struct Invocation<'a> {
    bridge: &'a Bridge,
    allowed: BTreeSet<String>,
    launch: LaunchSpec,
    _ipc_dir: tempfile::TempDir,
}

impl<'a> Invocation<'a> {
    /// Prepare the invocation: snapshot metadata for the active servers,
    /// create the IPC directory under the state dir, and assemble the
    /// container launch parameters.
    ///
    /// The active servers must already have live sessions and cached
    /// metadata.
    pub(crate) async fn prepare(bridge: &'a Bridge, active: Vec<String>) -> BridgeResult<Self> {
        let mut server_metadata = Vec::with_capacity(active.len());
        for name in &active {
            if let Some(metadata) = bridge.metadata().metadata(name).await {
                server_metadata.push(metadata);
            }
        }
        let allowed: BTreeSet<String> = server_metadata
            .iter()
            .map(|metadata| metadata.name.clone())
            .collect();
        let discovered = bridge.describe_all().await;

        let state = bridge.state_dir();
        state.ensure()?;
        let user_tools_dir = state.user_tools_dir();

        bridge.sandbox().ensure_shared_directory(state.root()).await?;

        let ipc_dir = tempfile::Builder::new()
            .prefix(IPC_DIR_PREFIX)
            .tempdir_in(state.root())?;
        // The container user must be able to traverse into the mount.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(ipc_dir.path(), std::fs::Permissions::from_mode(0o755))?;
        }

        let host_dir = ipc_dir.path().to_path_buf();
        let launch = LaunchSpec {
            mounts: vec![
                format!("{}:{IPC_MOUNT_TARGET}:rw", host_dir.display()),
                format!("{}:{PROJECTS_MOUNT_TARGET}:rw", user_tools_dir.display()),
            ],
            env: vec![
                (
                    "PYXIS_AVAILABLE_SERVERS".to_string(),
                    serde_json::to_string(&server_metadata).unwrap_or_else(|_| "[]".to_string()),
                ),
                (
                    "PYXIS_DISCOVERED_SERVERS".to_string(),
                    serde_json::to_string(&discovered).unwrap_or_else(|_| "{}".to_string()),
                ),
            ],
            host_dir,
        };

        Ok(Self {
            bridge,
            allowed,
            launch,
            _ipc_dir: ipc_dir,
        })
    }

    /// Container launch parameters for this invocation.
    #[must_use]
    pub(crate) fn launch_spec(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Extract and authorize the `server` field of an upcall payload.
    fn authorized_server<'p>(&self, payload: &'p Value) -> Result<&'p str, Value> {
        if let Some(server) = payload.get("server").and_then(Value::as_str) {
            if self.allowed.contains(server) {
                return Ok(server);
            }
        }
        let shown = match payload.get("server") {
            Some(Value::String(name)) => format!("'{name}'"),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        };
        Err(fail(format!("Server {shown} is not available")))
    }

    async fn query_tool_docs(&self, payload: &Value) -> Value {
        let server = match self.authorized_server(payload) {
            Ok(server) => server,
            Err(response) => return response,
        };

        let tool = match payload.get("tool") {
            None | Some(Value::Null) => None,
            Some(Value::String(tool)) => Some(tool.as_str()),
            Some(_) => return fail("'tool' must be a string when provided"),
        };
        let detail = DocDetail::parse(payload.get("detail").and_then(Value::as_str));

        match self.bridge.tool_docs(server, tool, detail).await {
            Ok(docs) => json!({"success": true, "docs": docs}),
            Err(error) => fail(error.to_string()),
        }
    }

    async fn search_tool_docs(&self, payload: &Value) -> Value {
        let Some(query) = payload
            .get("query")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
        else {
            return fail("Missing 'query' value");
        };

        let limit = match payload.get("limit") {
            None | Some(Value::Null) => 5,
            Some(value) => match value.as_i64() {
                Some(limit) => limit,
                None => return fail("'limit' must be an integer"),
            },
        };
        let detail = DocDetail::parse(payload.get("detail").and_then(Value::as_str));

        let allowed: Vec<String> = self.allowed.iter().cloned().collect();
        match self
            .bridge
            .search_tool_docs(query, &allowed, limit, detail)
            .await
        {
            Ok(results) => json!({"success": true, "results": results}),
            Err(error) => fail(error.to_string()),
        }
    }

    async fn proxy_call(&self, req_type: &str, payload: &Value) -> Value {
        let server = match self.authorized_server(payload) {
            Ok(server) => server,
            Err(response) => return response,
        };

        if req_type == "list_tools" {
            return match self.bridge.sessions().list_tools(server).await {
                Ok(tools) => json!({"success": true, "tools": tools}),
                Err(error) => fail(error.to_string()),
            };
        }

        let Some(tool) = payload.get("tool").and_then(Value::as_str) else {
            return fail("Missing tool name");
        };
        let arguments = match payload.get("arguments") {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return fail("Arguments must be an object"),
        };

        match self.bridge.sessions().call_tool(server, tool, arguments).await {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => json!({"success": true, "result": value}),
                Err(error) => fail(format!("failed to encode tool result: {error}")),
            },
            Err(error) => fail(error.to_string()),
        }
    }
}

#[async_trait]
impl UpcallHandler for Invocation<'_> {
    async fn handle(&self, payload: Value) -> Value {
        let req_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(upcall = %req_type, "Dispatching upcall");

        match req_type.as_str() {
            "list_servers" => {
                let servers: Vec<&String> = self.allowed.iter().collect();
                json!({"success": true, "servers": servers})
            },
            "query_tool_docs" => self.query_tool_docs(&payload).await,
            "search_tool_docs" => self.search_tool_docs(&payload).await,
            "list_tools" | "call_tool" => self.proxy_call(&req_type, &payload).await,
            other => fail(format!("Unknown RPC type: {other}")),
        }
    }
}

fn fail(error: impl Into<String>) -> Value {
    json!({"success": false, "error": error.into()})
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use pyxis_config::ServerRecord;
    use pyxis_core::BridgeSettings;
    use pyxis_mcp::ToolSpec;

    fn test_bridge(state_dir: &std::path::Path) -> Bridge {
        let settings = BridgeSettings {
            state_dir: Some(state_dir.to_path_buf()),
            ..BridgeSettings::default()
        };
        // No runtime: invocation preparation must not shell out to podman.
        let sandbox = pyxis_sandbox::ContainerSandbox::with_runtime(&settings, None);
        Bridge::with_sandbox(settings, sandbox).unwrap()
    }

    fn record(name: &str) -> Arc<ServerRecord> {
        Arc::new(ServerRecord {
            name: name.to_string(),
            alias: name.to_string(),
            command: "cmd".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            description: String::new(),
        })
    }

    async fn prepare_invocation<'a>(bridge: &'a Bridge, active: &[&str]) -> Invocation<'a> {
        Invocation::prepare(bridge, active.iter().map(ToString::to_string).collect())
            .await
            .unwrap()
    }

    async fn prime_demo(bridge: &Bridge) {
        let demo = record("demo");
        let specs = vec![ToolSpec {
            name: "echo".to_string(),
            description: Some("Echo a message".to_string()),
            input_schema: Some(serde_json::json!({"type": "object"})),
        }];
        bridge.metadata().insert_specs(&demo, &specs).await;
    }

    #[tokio::test]
    async fn prepare_injects_metadata_and_mounts() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());
        prime_demo(&bridge).await;

        let invocation = prepare_invocation(&bridge, &["demo"]).await;
        let spec = invocation.launch_spec();

        assert!(spec.mounts.iter().any(|m| m.ends_with(":/ipc:rw")));
        assert!(spec.mounts.iter().any(|m| m.ends_with(":/projects:rw")));

        let available = spec
            .env
            .iter()
            .find(|(key, _)| key == "PYXIS_AVAILABLE_SERVERS")
            .map(|(_, value)| value.clone())
            .unwrap();
        let parsed: Value = serde_json::from_str(&available).unwrap();
        assert_eq!(parsed[0]["name"], "demo");
        assert_eq!(parsed[0]["tools"][0]["alias"], "echo");

        assert!(
            spec.env
                .iter()
                .any(|(key, _)| key == "PYXIS_DISCOVERED_SERVERS")
        );
        assert!(spec.host_dir.exists());
    }

    #[tokio::test]
    async fn ipc_dir_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());

        let host_dir = {
            let invocation = prepare_invocation(&bridge, &[]).await;
            invocation.launch_spec().host_dir.clone()
        };
        assert!(!host_dir.exists());
    }

    #[tokio::test]
    async fn list_servers_returns_sorted_allowlist() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());
        prime_demo(&bridge).await;
        let beta = record("beta");
        bridge.metadata().insert_specs(&beta, &[]).await;

        let invocation = prepare_invocation(&bridge, &["demo", "beta"]).await;
        let response = invocation.handle(json!({"type": "list_servers"})).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["servers"], json!(["beta", "demo"]));
    }

    #[tokio::test]
    async fn empty_allowlist_yields_no_servers() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());

        let invocation = prepare_invocation(&bridge, &[]).await;
        let response = invocation.handle(json!({"type": "list_servers"})).await;
        assert_eq!(response["servers"], json!([]));
    }

    #[tokio::test]
    async fn out_of_scope_call_tool_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());
        prime_demo(&bridge).await;

        let invocation = prepare_invocation(&bridge, &["demo"]).await;
        let response = invocation
            .handle(json!({
                "type": "call_tool",
                "server": "forbidden",
                "tool": "echo",
                "arguments": {}
            }))
            .await;
        assert_eq!(response["success"], false);
        assert_eq!(response["error"], "Server 'forbidden' is not available");
    }

    #[tokio::test]
    async fn missing_server_field_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());

        let invocation = prepare_invocation(&bridge, &[]).await;
        let response = invocation.handle(json!({"type": "list_tools"})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["error"], "Server null is not available");
    }

    #[tokio::test]
    async fn unknown_rpc_type_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());

        let invocation = prepare_invocation(&bridge, &[]).await;
        let response = invocation.handle(json!({"type": "mystery"})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["error"], "Unknown RPC type: mystery");
    }

    #[tokio::test]
    async fn query_tool_docs_reads_the_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());
        prime_demo(&bridge).await;

        let invocation = prepare_invocation(&bridge, &["demo"]).await;
        let response = invocation
            .handle(json!({"type": "query_tool_docs", "server": "demo", "tool": "echo", "detail": "full"}))
            .await;
        assert_eq!(response["success"], true);
        assert_eq!(response["docs"][0]["toolAlias"], "echo");
        assert!(response["docs"][0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn query_tool_docs_rejects_non_string_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());
        prime_demo(&bridge).await;

        let invocation = prepare_invocation(&bridge, &["demo"]).await;
        let response = invocation
            .handle(json!({"type": "query_tool_docs", "server": "demo", "tool": 7}))
            .await;
        assert_eq!(response["error"], "'tool' must be a string when provided");
    }

    #[tokio::test]
    async fn search_tool_docs_validates_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());
        prime_demo(&bridge).await;
        let invocation = prepare_invocation(&bridge, &["demo"]).await;

        let response = invocation
            .handle(json!({"type": "search_tool_docs", "query": "   "}))
            .await;
        assert_eq!(response["error"], "Missing 'query' value");

        let response = invocation
            .handle(json!({"type": "search_tool_docs", "query": "echo", "limit": "five"}))
            .await;
        assert_eq!(response["error"], "'limit' must be an integer");

        let response = invocation
            .handle(json!({"type": "search_tool_docs", "query": "echo message"}))
            .await;
        assert_eq!(response["success"], true);
        assert_eq!(response["results"][0]["tool"], "echo");
    }

    #[tokio::test]
    async fn call_tool_without_session_surfaces_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());
        prime_demo(&bridge).await;

        let invocation = prepare_invocation(&bridge, &["demo"]).await;
        let response = invocation
            .handle(json!({"type": "call_tool", "server": "demo", "tool": "echo"}))
            .await;
        assert_eq!(response["success"], false);
        assert!(
            response["error"]
                .as_str()
                .unwrap()
                .contains("is not running")
        );
    }

    #[tokio::test]
    async fn call_tool_rejects_non_object_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = test_bridge(tmp.path());
        prime_demo(&bridge).await;

        let invocation = prepare_invocation(&bridge, &["demo"]).await;
        let response = invocation
            .handle(json!({
                "type": "call_tool",
                "server": "demo",
                "tool": "echo",
                "arguments": [1, 2]
            }))
            .await;
        assert_eq!(response["error"], "Arguments must be an object");
    }
}
