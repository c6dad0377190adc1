//! Client-visible response rendering.
//!
//! Two modes: compact (terse text plus a trimmed structured payload) and
//! structured (a fenced JSON block carrying the full payload). Stdout and
//! stderr are split into lines with whitespace-only and noise-only lines
//! filtered out to save response tokens.

use serde_json::{Map, Value};

use pyxis_core::OutputMode;
use rmcp::model::{CallToolResult, Content};

/// Lines that carry no signal and are dropped from stream output.
const NOISE_STREAM_TOKENS: &[&str] = &["()"];

/// Client-visible execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The execution completed normally.
    Success,
    /// The execution exceeded its timeout.
    Timeout,
    /// A sandbox, session, or unexpected failure.
    Error,
    /// The request arguments were rejected before any sandbox work.
    ValidationError,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::ValidationError => "validation_error",
        }
    }
}

/// Builder for one `run_python` response.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    status: Status,
    summary: String,
    exit_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
    servers: Vec<String>,
    error: Option<String>,
    timeout_seconds: Option<u64>,
}

impl ToolResponse {
    /// Start a response with a status and summary.
    pub fn new(status: Status, summary: impl Into<String>) -> Self {
        Self {
            status,
            summary: summary.into(),
            exit_code: None,
            stdout: None,
            stderr: None,
            servers: Vec::new(),
            error: None,
            timeout_seconds: None,
        }
    }

    /// Attach the interpreter exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    /// Attach captured stdout.
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    /// Attach captured stderr.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    /// Attach the requested server list.
    #[must_use]
    pub fn with_servers(mut self, servers: &[String]) -> Self {
        self.servers = servers.to_vec();
        self
    }

    /// Attach an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach the clamped timeout that applied.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Build the normalized structured payload shared by both renderers.
    #[must_use]
    pub fn build_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("status".into(), Value::from(self.status.as_str()));
        payload.insert("summary".into(), Value::from(self.summary.clone()));

        if let Some(exit_code) = self.exit_code {
            payload.insert("exitCode".into(), Value::from(exit_code));
        }
        if !self.servers.is_empty() {
            payload.insert("servers".into(), Value::from(self.servers.clone()));
        }

        let stdout_lines = filter_stream_lines(split_output_lines(self.stdout.as_deref()));
        if !stdout_lines.is_empty() {
            payload.insert("stdout".into(), Value::from(stdout_lines));
        }
        let stderr_lines = filter_stream_lines(split_output_lines(self.stderr.as_deref()));
        if !stderr_lines.is_empty() {
            payload.insert("stderr".into(), Value::from(stderr_lines));
        }

        if let Some(error) = &self.error {
            if !error.is_empty() {
                payload.insert("error".into(), Value::from(error.clone()));
            }
        }
        if let Some(seconds) = self.timeout_seconds {
            payload.insert("timeoutSeconds".into(), Value::from(seconds));
        }

        let no_output = !payload.contains_key("stdout") && !payload.contains_key("stderr");
        if self.status == Status::Success
            && no_output
            && self.summary.trim().eq_ignore_ascii_case("success")
        {
            payload.insert("summary".into(), Value::from("Success (no output)"));
        }

        payload
    }

    /// Render the response for the client.
    #[must_use]
    pub fn into_call_tool_result(self, mode: OutputMode) -> CallToolResult {
        let payload = self.build_payload();
        let is_error = self.status != Status::Success;

        let (message, structured) = match mode {
            OutputMode::Compact => (
                render_compact(&payload),
                Value::Object(build_compact_structured(&payload)),
            ),
            OutputMode::Structured => (render_json_block(&payload), Value::Object(payload)),
        };

        CallToolResult {
            content: vec![Content::text(message)],
            structured_content: Some(structured),
            is_error: Some(is_error),
            meta: None,
        }
    }
}

/// Split a stream into lines, dropping a sole trailing newline.
fn split_output_lines(stream: Option<&str>) -> Vec<String> {
    match stream {
        None | Some("") => Vec::new(),
        Some(text) => text.lines().map(String::from).collect(),
    }
}

/// Drop whitespace-only and noise-only lines.
fn filter_stream_lines(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .filter(|line| {
            let stripped = line.trim();
            !stripped.is_empty() && !NOISE_STREAM_TOKENS.contains(&stripped)
        })
        .collect()
}

fn lines_field(payload: &Map<String, Value>, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Terse, token-efficient textual rendering that leads with program
/// output.
fn render_compact(payload: &Map<String, Value>) -> String {
    let mut lines: Vec<String> = Vec::new();

    let stdout_lines = lines_field(payload, "stdout");
    if !stdout_lines.is_empty() {
        lines.push(stdout_lines.join("\n"));
    }
    let stderr_lines = lines_field(payload, "stderr");
    if !stderr_lines.is_empty() {
        lines.push(format!("stderr:\n{}", stderr_lines.join("\n")));
    }

    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let summary = payload
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let error = payload.get("error").and_then(Value::as_str);
    let exit_code = payload.get("exitCode").and_then(Value::as_i64);

    if lines.is_empty() && !summary.is_empty() {
        lines.push(summary.clone());
    }

    if let Some(error) = error {
        if lines.is_empty() || status != "error" {
            lines.push(format!("error: {error}"));
        }
    }

    if let Some(code) = exit_code {
        if code != 0 {
            lines.insert(0, format!("exit: {code}"));
        }
    }

    if !status.is_empty() && status != "success" {
        lines.insert(0, format!("status: {status}"));
    }

    let text = lines
        .iter()
        .filter(|line| !line.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    if !text.is_empty() {
        return text;
    }

    if !status.is_empty() {
        return status;
    }
    if !summary.trim().is_empty() {
        return summary.trim().to_string();
    }
    "success".to_string()
}

/// The trimmed structured payload for compact responses: only non-default
/// fields survive.
fn build_compact_structured(payload: &Map<String, Value>) -> Map<String, Value> {
    let mut compact = Map::new();

    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !status.is_empty() && status != "success" {
        compact.insert("status".into(), Value::from(status));
    }

    if let Some(code) = payload.get("exitCode").and_then(Value::as_i64) {
        if code != 0 {
            compact.insert("exitCode".into(), Value::from(code));
        }
    }

    for key in ["stdout", "stderr", "servers", "timeoutSeconds", "error"] {
        if let Some(value) = payload.get(key) {
            compact.insert(key.into(), value.clone());
        }
    }

    if let Some(summary) = payload.get("summary") {
        if status != "success" || !compact.contains_key("stdout") {
            compact.insert("summary".into(), summary.clone());
        }
    }

    if compact.is_empty() {
        for key in ["status", "summary"] {
            if let Some(value) = payload.get(key) {
                compact.insert(key.into(), value.clone());
            }
        }
    }

    compact
}

/// The full payload as a fenced JSON block.
fn render_json_block(payload: &Map<String, Value>) -> String {
    let body = serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string());
    format!("```json\n{body}\n```")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_with_no_output_synthesizes_summary() {
        let payload = ToolResponse::new(Status::Success, "Success")
            .with_exit_code(0)
            .build_payload();
        assert_eq!(payload["summary"], "Success (no output)");
        // The full payload keeps the exit code; only the compact
        // projection drops the zero default.
        assert_eq!(payload["exitCode"], 0);
        let compact = build_compact_structured(&payload);
        assert!(!compact.contains_key("exitCode"));
    }

    #[test]
    fn stdout_is_split_and_filtered() {
        let payload = ToolResponse::new(Status::Success, "Success")
            .with_stdout("4\n\n()\nlast\n")
            .build_payload();
        assert_eq!(payload["stdout"], serde_json::json!(["4", "last"]));
        assert_eq!(payload["summary"], "Success");
    }

    #[test]
    fn compact_text_leads_with_program_output() {
        let response = ToolResponse::new(Status::Success, "Success").with_stdout("4\n");
        let payload = response.build_payload();
        assert_eq!(render_compact(&payload), "4");
    }

    #[test]
    fn compact_text_for_timeout_includes_status_and_error() {
        let response = ToolResponse::new(Status::Timeout, "Timeout: execution exceeded 2s")
            .with_stdout("partial\n")
            .with_error("execution timed out after 2s")
            .with_timeout_seconds(2);
        let text = render_compact(&response.build_payload());
        assert!(text.starts_with("status: timeout"));
        assert!(text.contains("partial"));
        assert!(text.contains("error: execution timed out after 2s"));
    }

    #[test]
    fn compact_structured_drops_default_fields() {
        let response = ToolResponse::new(Status::Success, "Success").with_stdout("hello\n");
        let compact = build_compact_structured(&response.build_payload());
        assert!(!compact.contains_key("status"));
        assert!(!compact.contains_key("summary"));
        assert_eq!(compact["stdout"], serde_json::json!(["hello"]));
    }

    #[test]
    fn compact_structured_keeps_status_and_summary_on_failure() {
        let response = ToolResponse::new(Status::ValidationError, "Missing 'code' argument")
            .with_error("Missing 'code' argument");
        let compact = build_compact_structured(&response.build_payload());
        assert_eq!(compact["status"], "validation_error");
        assert_eq!(compact["summary"], "Missing 'code' argument");
        assert_eq!(compact["error"], "Missing 'code' argument");
    }

    #[test]
    fn compact_structured_keeps_only_the_summary_on_quiet_success() {
        let response = ToolResponse::new(Status::Success, "Success");
        let compact = build_compact_structured(&response.build_payload());
        assert_eq!(compact.len(), 1);
        assert_eq!(compact["summary"], "Success (no output)");
    }

    #[test]
    fn structured_mode_renders_json_block() {
        let result = ToolResponse::new(Status::Success, "Success")
            .with_stdout("4\n")
            .into_call_tool_result(OutputMode::Structured);
        assert_eq!(result.is_error, Some(false));
        let text = match &*result.content[0] {
            rmcp::model::RawContent::Text(text) => text.text.clone(),
            other => panic!("expected text content, got {other:?}"),
        };
        assert!(text.starts_with("```json\n"));
        assert!(text.contains("\"stdout\""));
    }

    #[test]
    fn error_status_marks_result_as_error() {
        let result = ToolResponse::new(Status::Error, "Sandbox error: boom")
            .with_error("boom")
            .into_call_tool_result(OutputMode::Compact);
        assert_eq!(result.is_error, Some(true));
    }
}
