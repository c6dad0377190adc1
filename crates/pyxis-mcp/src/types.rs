//! Wire-facing tool description.

use rmcp::model as rmcp_model;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool as reported by an upstream server.
///
/// Serialized with `inputSchema` (wire casing) because these structs are
/// forwarded verbatim to the sandbox in `list_tools` upcall responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Raw tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool input.
    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolSpec {
    /// Convert from an rmcp `Tool`.
    #[must_use]
    pub fn from_rmcp(tool: &rmcp_model::Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool.description.as_deref().map(String::from),
            input_schema: serde_json::to_value(&*tool.input_schema).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_casing() {
        let spec = ToolSpec {
            name: "echo".to_string(),
            description: Some("Echo a message".to_string()),
            input_schema: Some(serde_json::json!({"type": "object"})),
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert!(value.get("inputSchema").is_some());
        assert!(value.get("input_schema").is_none());
    }

    #[test]
    fn omits_missing_fields() {
        let spec = ToolSpec {
            name: "bare".to_string(),
            description: None,
            input_schema: None,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value, serde_json::json!({"name": "bare"}));
    }
}
