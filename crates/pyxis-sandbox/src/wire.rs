//! Newline-delimited JSON frames between the bridge and the interpreter.
//!
//! Each line is one frame carrying a `type` tag. Frames the broker sends
//! are [`HostFrame`]s; frames the sandbox sends are [`SandboxFrame`]s.
//! Ordering is the transport's: frames arrive in the order the sandbox
//! produced them, and upcall request/response pairs are correlated solely
//! by `id`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames written by the bridge to the sandbox's stdin.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// Submit code for execution. Executions queue in arrival order.
    Execute {
        /// Source code to run.
        code: String,
    },
    /// Reply to an upcall.
    RpcResponse {
        /// Correlation id copied from the request.
        id: u64,
        /// Whether the upcall succeeded.
        success: bool,
        /// The full structured response.
        payload: Value,
        /// Error message when `success` is false.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Frames read from the sandbox's stdout.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxFrame {
    /// A chunk of standard output, preserved verbatim.
    Stdout {
        /// Output data.
        #[serde(default)]
        data: String,
    },
    /// A chunk of standard error, preserved verbatim.
    Stderr {
        /// Output data.
        #[serde(default)]
        data: String,
    },
    /// An upcall from sandboxed code; `payload.type` selects the
    /// operation.
    RpcRequest {
        /// Correlation id, monotonically assigned by the sandbox.
        id: u64,
        /// Operation payload.
        #[serde(default)]
        payload: Value,
    },
    /// Terminal frame for the current execution.
    ExecutionDone,
}

/// Result of parsing one line from the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A well-formed protocol frame.
    Frame(SandboxFrame),
    /// Valid JSON that is not a known frame; surfaced on stderr.
    Unrecognized(Value),
    /// Not JSON at all; the raw line is surfaced on stderr.
    Invalid,
}

/// Parse one line of sandbox output.
#[must_use]
pub fn parse_line(line: &str) -> ParsedLine {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return ParsedLine::Invalid;
    };
    match serde_json::from_value::<SandboxFrame>(value.clone()) {
        Ok(frame) => ParsedLine::Frame(frame),
        Err(_) => ParsedLine::Unrecognized(value),
    }
}

/// Handles upcalls issued by sandboxed code.
///
/// The returned value is the structured response object; it must contain a
/// boolean `success` field and, on failure, an `error` string.
#[async_trait]
pub trait UpcallHandler: Send + Sync {
    /// Dispatch one upcall payload.
    async fn handle(&self, payload: Value) -> Value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execute_frame_serializes_with_type_tag() {
        let frame = HostFrame::Execute {
            code: "print(2+2)".to_string(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type": "execute", "code": "print(2+2)"}));
    }

    #[test]
    fn rpc_response_omits_error_on_success() {
        let frame = HostFrame::RpcResponse {
            id: 3,
            success: true,
            payload: json!({"success": true, "servers": []}),
            error: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["id"], 3);
    }

    #[test]
    fn rpc_response_carries_error_on_failure() {
        let frame = HostFrame::RpcResponse {
            id: 9,
            success: false,
            payload: json!({"success": false}),
            error: Some("boom".to_string()),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn parses_stream_frames() {
        assert_eq!(
            parse_line(r#"{"type":"stdout","data":"4\n"}"#),
            ParsedLine::Frame(SandboxFrame::Stdout {
                data: "4\n".to_string()
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"execution_done"}"#),
            ParsedLine::Frame(SandboxFrame::ExecutionDone)
        );
    }

    #[test]
    fn parses_rpc_request_with_payload() {
        let parsed = parse_line(
            r#"{"type":"rpc_request","id":1,"payload":{"type":"call_tool","server":"demo"}}"#,
        );
        let ParsedLine::Frame(SandboxFrame::RpcRequest { id, payload }) = parsed else {
            panic!("expected rpc_request frame");
        };
        assert_eq!(id, 1);
        assert_eq!(payload["type"], "call_tool");
    }

    #[test]
    fn non_json_lines_are_invalid() {
        assert_eq!(parse_line("Traceback (most recent call last):"), ParsedLine::Invalid);
    }

    #[test]
    fn unknown_frame_types_are_unrecognized() {
        let parsed = parse_line(r#"{"type":"heartbeat","data":1}"#);
        assert!(matches!(parsed, ParsedLine::Unrecognized(_)));
    }
}
