//! The client-facing MCP server.
//!
//! Exposes a single tool, `run_python`, plus one static resource
//! describing sandbox capabilities. Validation failures are answered
//! without touching the sandbox; sandbox and session failures map onto
//! the response status taxonomy.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::ErrorData;
use rmcp::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Implementation, ListResourcesResult, ListToolsResult,
    PaginatedRequestParams, ProtocolVersion, RawResource, ReadResourceRequestParams,
    ReadResourceResult, Resource, ResourceContents, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use serde_json::{Map, Value, json};
use tracing::{error, info};

use pyxis_core::BridgeSettings;
use pyxis_mcp::McpError;
use pyxis_sandbox::SandboxError;

use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::response::{Status, ToolResponse};

/// URI of the static capability resource.
pub const CAPABILITY_RESOURCE_URI: &str = "resource://pyxis/capabilities";

const CAPABILITY_RESOURCE_NAME: &str = "code-execution-capabilities";

const CAPABILITY_RESOURCE_DESCRIPTION: &str = "Capability overview, helper reference, and sandbox \
     usage notes (call runtime.capability_summary() inside the sandbox for this text).";

/// One-paragraph summary of the sandbox helper surface, shared by the
/// server instructions and the capability resource.
pub const SANDBOX_HELPERS_SUMMARY: &str = "Persistent Python Sandbox (state retained between tool \
     calls). 1. DISCOVER: `runtime.discovered_servers()`, `runtime.search_tool_docs('query')`. \
     Use `discovered_servers(detailed=True)` for descriptions. 2. CALL: `await mcp_server.tool()`. \
     3. PERSIST: `save_tool(func)` for functions, `save_memory(key, value)` for data. 4. MEMORY: \
     `load_memory(key)`, `list_memories()`, `update_memory(key, fn)`. Run \
     `print(runtime.capability_summary())` for the full manual.";

const CAPABILITY_RESOURCE_TEXT: &str = "# Code Execution Sandbox Capabilities

Persistent Python Sandbox (state retained between tool calls).
1. DISCOVER: `runtime.discovered_servers()`, `runtime.search_tool_docs('query')`. Use `discovered_servers(detailed=True)` for descriptions.
2. CALL: `await mcp_server.tool()`.
3. PERSIST: `save_tool(func)` for functions, `save_memory(key, value)` for data.
4. MEMORY: `load_memory(key)`, `list_memories()`, `update_memory(key, fn)`.
Run `print(runtime.capability_summary())` for the full manual.

## Quick usage

- Pass `servers=[...]` to mount MCP proxies (`mcp_<alias>` modules).
- Import `mcp.runtime as runtime`; call `runtime.capability_summary()` instead of rereading this resource for the same hint.
- Prefer the `_sync` helpers first to read cached metadata before issuing RPCs.
- Server configs support a `cwd` field to start the host MCP server in a specific working directory; check `runtime.describe_server(name)` before assuming one.

Resource URI: resource://pyxis/capabilities";

/// The MCP frontend handler. Cheap to clone; all state lives in the
/// shared [`Bridge`].
#[derive(Clone)]
pub struct PyxisServer {
    bridge: Arc<Bridge>,
}

impl PyxisServer {
    /// Create the frontend over a bridge.
    #[must_use]
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    async fn run_python(&self, arguments: &Map<String, Value>) -> ToolResponse {
        let settings = self.bridge.settings().clone();
        let (code, servers, timeout_secs) = match parse_run_python_args(arguments, &settings) {
            Ok(parsed) => parsed,
            Err(message) => {
                return ToolResponse::new(Status::ValidationError, message.clone())
                    .with_error(message);
            },
        };

        info!(
            code_len = code.len(),
            servers = ?servers,
            timeout_secs,
            "run_python invoked"
        );

        match self.bridge.execute_code(&code, &servers, timeout_secs).await {
            Ok(result) => ToolResponse::new(Status::Success, "Success")
                .with_exit_code(result.exit_code)
                .with_stdout(result.stdout)
                .with_stderr(result.stderr),
            Err(BridgeError::Validation(message)) => {
                ToolResponse::new(Status::ValidationError, message.clone()).with_error(message)
            },
            Err(BridgeError::Sandbox(SandboxError::Timeout {
                timeout_secs,
                stdout,
                stderr,
            })) => ToolResponse::new(
                Status::Timeout,
                format!("Timeout: execution exceeded {timeout_secs}s"),
            )
            .with_stdout(stdout)
            .with_stderr(stderr)
            .with_servers(&servers)
            .with_error(format!("execution timed out after {timeout_secs}s"))
            .with_timeout_seconds(timeout_secs),
            Err(BridgeError::Sandbox(sandbox_error)) => {
                let summary = format!("Sandbox error: {sandbox_error}");
                ToolResponse::new(Status::Error, summary)
                    .with_stdout(sandbox_error.stdout().to_string())
                    .with_stderr(sandbox_error.stderr().to_string())
                    .with_servers(&servers)
                    .with_error(sandbox_error.to_string())
            },
            Err(BridgeError::Mcp(mcp_error)) => {
                let stderr = match &mcp_error {
                    McpError::Startup { stderr, .. } => stderr.clone(),
                    _ => String::new(),
                };
                ToolResponse::new(Status::Error, format!("Sandbox error: {mcp_error}"))
                    .with_stderr(stderr)
                    .with_servers(&servers)
                    .with_error(mcp_error.to_string())
            },
            Err(other) => {
                error!(error = %other, "Unexpected failure");
                ToolResponse::new(Status::Error, "Unexpected failure").with_error(other.to_string())
            },
        }
    }
}

impl ServerHandler for PyxisServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "pyxis-bridge".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(SANDBOX_HELPERS_SUMMARY.to_string()),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        self.bridge.discover().await;
        let names = self.bridge.server_names().await;
        let settings = self.bridge.settings();
        let schema = run_python_input_schema(&names, settings.default_timeout, settings.max_timeout);

        let tool = Tool {
            name: Cow::Borrowed("run_python"),
            title: None,
            description: Some(Cow::Borrowed(
                "Execute Python code in a persistent sandbox. To call MCP server tools, pass \
                 servers=['name'] and use: result = await mcp_<name>.<tool>(...); print(result)",
            )),
            input_schema: Arc::new(schema),
            output_schema: None,
            annotations: None,
            execution: None,
            icons: None,
            meta: None,
        };

        Ok(ListToolsResult::with_all_items(vec![tool]))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let mode = self.bridge.settings().output_mode;

        if request.name.as_ref() != "run_python" {
            let message = format!("Unknown tool: {}", request.name);
            return Ok(ToolResponse::new(Status::Error, message.clone())
                .with_error(message)
                .into_call_tool_result(mode));
        }

        let arguments = request.arguments.unwrap_or_default();
        let response = self.run_python(&arguments).await;
        Ok(response.into_call_tool_result(mode))
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        Ok(ListResourcesResult::with_all_items(vec![
            capability_resource(),
        ]))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        if request.uri != CAPABILITY_RESOURCE_URI {
            return Err(ErrorData::invalid_params(
                format!("Unknown resource: {}", request.uri),
                None,
            ));
        }
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(
                CAPABILITY_RESOURCE_TEXT,
                CAPABILITY_RESOURCE_URI,
            )],
        })
    }
}

fn capability_resource() -> Resource {
    let mut raw = RawResource::new(CAPABILITY_RESOURCE_URI, CAPABILITY_RESOURCE_NAME);
    raw.description = Some(CAPABILITY_RESOURCE_DESCRIPTION.to_string());
    raw.mime_type = Some("text/markdown".to_string());
    raw.size = u32::try_from(CAPABILITY_RESOURCE_TEXT.len()).ok();
    Resource {
        raw,
        annotations: None,
    }
}

/// The `run_python` input schema. The `servers` property enumerates the
/// currently discovered names so clients can offer completion.
fn run_python_input_schema(
    server_names: &[String],
    default_timeout: u64,
    max_timeout: u64,
) -> Map<String, Value> {
    let servers_items = if server_names.is_empty() {
        json!({"type": "string"})
    } else {
        json!({"type": "string", "enum": server_names})
    };
    let available = if server_names.is_empty() {
        "none".to_string()
    } else {
        server_names.join(", ")
    };

    let schema = json!({
        "type": "object",
        "properties": {
            "code": {
                "type": "string",
                "description": "Python code to execute. For MCP tools, use: result = await \
                                mcp_<server>.<tool>(...); print(result)",
            },
            "servers": {
                "type": "array",
                "items": servers_items,
                "description": format!(
                    "MCP servers to load. Available: {available}. REQUIRED when calling MCP tools."
                ),
            },
            "timeout": {
                "type": "integer",
                "minimum": 1,
                "maximum": max_timeout,
                "default": default_timeout,
                "description": "Execution timeout in seconds",
            },
        },
        "required": ["code"],
    });

    match schema {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Validate and normalize `run_python` arguments.
///
/// Returns `(code, servers, clamped_timeout_secs)` or the
/// validation-error message.
fn parse_run_python_args(
    arguments: &Map<String, Value>,
    settings: &BridgeSettings,
) -> Result<(String, Vec<String>, u64), String> {
    let code = match arguments.get("code") {
        Some(Value::String(code)) if !code.trim().is_empty() => code.clone(),
        _ => return Err("Missing 'code' argument".to_string()),
    };

    let servers = match arguments.get("servers") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(name) => name.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(_) => return Err("'servers' must be a list".to_string()),
    };

    let timeout = match arguments.get("timeout") {
        None | Some(Value::Null) => i64::try_from(settings.default_timeout).unwrap_or(30),
        Some(value) => match value.as_i64() {
            Some(timeout) => timeout,
            None => return Err("'timeout' must be an integer".to_string()),
        },
    };

    Ok((code, servers, settings.clamp_timeout(timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn blank_code_is_a_validation_error() {
        let settings = BridgeSettings::default();
        let result = parse_run_python_args(&args(json!({"code": "   "})), &settings);
        assert_eq!(result.unwrap_err(), "Missing 'code' argument");

        let result = parse_run_python_args(&args(json!({})), &settings);
        assert_eq!(result.unwrap_err(), "Missing 'code' argument");
    }

    #[test]
    fn servers_must_be_a_list() {
        let settings = BridgeSettings::default();
        let result = parse_run_python_args(
            &args(json!({"code": "print(1)", "servers": "demo"})),
            &settings,
        );
        assert_eq!(result.unwrap_err(), "'servers' must be a list");
    }

    #[test]
    fn timeout_must_be_an_integer() {
        let settings = BridgeSettings::default();
        let result = parse_run_python_args(
            &args(json!({"code": "print(1)", "timeout": "soon"})),
            &settings,
        );
        assert_eq!(result.unwrap_err(), "'timeout' must be an integer");
    }

    #[test]
    fn timeout_is_clamped_into_range() {
        let settings = BridgeSettings::default();

        let (_, _, low) =
            parse_run_python_args(&args(json!({"code": "x", "timeout": 0})), &settings).unwrap();
        assert_eq!(low, 1);

        let (_, _, high) =
            parse_run_python_args(&args(json!({"code": "x", "timeout": 9999})), &settings).unwrap();
        assert_eq!(high, settings.max_timeout);

        let (_, _, default) = parse_run_python_args(&args(json!({"code": "x"})), &settings).unwrap();
        assert_eq!(default, settings.default_timeout);
    }

    #[test]
    fn defaults_to_no_servers() {
        let settings = BridgeSettings::default();
        let (code, servers, _) =
            parse_run_python_args(&args(json!({"code": "print(2+2)"})), &settings).unwrap();
        assert_eq!(code, "print(2+2)");
        assert!(servers.is_empty());
    }

    #[test]
    fn schema_enumerates_discovered_servers() {
        let names = vec!["weather".to_string(), "stocks".to_string()];
        let schema = run_python_input_schema(&names, 30, 120);
        let items = &schema["properties"]["servers"]["items"];
        assert_eq!(items["enum"], json!(["weather", "stocks"]));
        assert_eq!(schema["properties"]["timeout"]["maximum"], 120);
        assert_eq!(schema["required"], json!(["code"]));
    }

    #[test]
    fn schema_falls_back_to_plain_strings() {
        let schema = run_python_input_schema(&[], 30, 120);
        let items = &schema["properties"]["servers"]["items"];
        assert_eq!(items, &json!({"type": "string"}));
    }
}
