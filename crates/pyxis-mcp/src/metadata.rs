//! Per-server tool metadata cache and search index.
//!
//! Metadata is filled lazily on first use of a server within an
//! invocation and invalidated when the session is restarted. The search
//! index flattens every cached server's tools into
//! `(server, server_alias, tool, keyword blob)` entries and is rebuilt
//! lazily after any metadata change.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use pyxis_config::ServerRecord;
use pyxis_core::sanitize_identifier;

use crate::error::{McpError, McpResult};
use crate::types::ToolSpec;

/// Upper bound on search results.
const SEARCH_RESULT_CAP: usize = 20;

/// One tool with its sandbox-safe alias.
#[derive(Debug, Clone, Serialize)]
pub struct ToolMetadata {
    /// Raw tool name as reported by the server.
    pub name: String,
    /// Identifier-safe alias, unique within the server.
    pub alias: String,
    /// Description (empty string when the server supplied none).
    pub description: String,
    /// JSON Schema for the tool input, retained verbatim.
    pub input_schema: Option<Value>,
}

/// Metadata snapshot for one server, injected into the sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetadata {
    /// Server name.
    pub name: String,
    /// Server alias.
    pub alias: String,
    /// Configured working directory, surfaced so sandbox code can reason
    /// about relative paths on the host side.
    pub cwd: Option<String>,
    /// Tools with aliases.
    pub tools: Vec<ToolMetadata>,
}

/// Documentation detail level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DocDetail {
    /// Names, aliases, and description only.
    #[default]
    Summary,
    /// Also includes the input schema.
    Full,
}

impl DocDetail {
    /// Parse a detail string; anything but `full` is `Summary`.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(text) if text.trim().eq_ignore_ascii_case("full") => Self::Full,
            _ => Self::Summary,
        }
    }
}

/// A documentation entry returned by `query_tool_docs` and
/// `search_tool_docs` upcalls.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocEntry {
    /// Server name.
    pub server: String,
    /// Server alias.
    pub server_alias: String,
    /// Raw tool name.
    pub tool: String,
    /// Tool alias.
    pub tool_alias: String,
    /// Description, omitted when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input schema, present only at full detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone)]
struct DocRecord {
    tool: ToolMetadata,
    keywords: String,
}

#[derive(Debug)]
struct CachedServer {
    metadata: ServerMetadata,
    docs: Vec<DocRecord>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    server: String,
    server_alias: String,
    tool: ToolMetadata,
    keywords: String,
}

#[derive(Debug, Default)]
struct Inner {
    servers: HashMap<String, CachedServer>,
    index: Vec<IndexEntry>,
    index_dirty: bool,
}

/// Lazily filled metadata cache shared by the bridge and the upcall
/// dispatcher.
#[derive(Debug, Default)]
pub struct MetadataCache {
    inner: Mutex<Inner>,
}

impl MetadataCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether metadata for a server is cached.
    pub async fn contains(&self, server: &str) -> bool {
        self.inner.lock().await.servers.contains_key(server)
    }

    /// Build and store metadata for a server from its tool specs.
    ///
    /// Tool aliases are derived with the shared identifier rule and made
    /// unique within the server by numeric suffix.
    pub async fn insert_specs(&self, record: &Arc<ServerRecord>, specs: &[ToolSpec]) {
        let mut alias_counts: HashMap<String, u32> = HashMap::new();
        let mut tools = Vec::with_capacity(specs.len());
        let mut docs = Vec::with_capacity(specs.len());

        for spec in specs {
            let base = sanitize_identifier(&spec.name, "tool");
            let count = alias_counts
                .entry(base.clone())
                .and_modify(|seen| *seen = seen.saturating_add(1))
                .or_insert(1);
            let alias = if *count == 1 {
                base
            } else {
                format!("{base}_{count}")
            };

            let description = spec
                .description
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string();

            let tool = ToolMetadata {
                name: spec.name.clone(),
                alias,
                description,
                input_schema: spec.input_schema.clone(),
            };

            let keywords = [
                record.name.as_str(),
                record.alias.as_str(),
                tool.name.as_str(),
                tool.alias.as_str(),
                tool.description.as_str(),
            ]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");

            docs.push(DocRecord {
                tool: tool.clone(),
                keywords,
            });
            tools.push(tool);
        }

        let metadata = ServerMetadata {
            name: record.name.clone(),
            alias: record.alias.clone(),
            cwd: record.cwd.clone(),
            tools,
        };

        let mut inner = self.inner.lock().await;
        inner.servers.insert(
            record.name.clone(),
            CachedServer { metadata, docs },
        );
        inner.index_dirty = true;
    }

    /// Drop a server's cached metadata (used when its session restarts).
    pub async fn invalidate(&self, server: &str) {
        let mut inner = self.inner.lock().await;
        if inner.servers.remove(server).is_some() {
            inner.index_dirty = true;
        }
    }

    /// Cached metadata snapshot for a server.
    pub async fn metadata(&self, server: &str) -> Option<ServerMetadata> {
        let inner = self.inner.lock().await;
        inner
            .servers
            .get(server)
            .map(|cached| cached.metadata.clone())
    }

    /// Documentation entries for one server, optionally narrowed to a
    /// single tool (matched by alias or raw name, case-insensitively).
    ///
    /// # Errors
    ///
    /// Returns an error when the server has no cached metadata or the
    /// requested tool does not exist.
    pub async fn tool_docs(
        &self,
        server: &str,
        tool: Option<&str>,
        detail: DocDetail,
    ) -> McpResult<Vec<DocEntry>> {
        let inner = self.inner.lock().await;
        let cached = inner
            .servers
            .get(server)
            .ok_or_else(|| McpError::DocsUnavailable {
                server: server.to_string(),
            })?;

        let alias = cached.metadata.alias.clone();
        if let Some(wanted) = tool {
            let target = wanted.to_lowercase();
            let found = cached.docs.iter().find(|doc| {
                doc.tool.alias.to_lowercase() == target || doc.tool.name.to_lowercase() == target
            });
            let doc = found.ok_or_else(|| McpError::ToolNotFound {
                server: server.to_string(),
                tool: wanted.to_string(),
            })?;
            return Ok(vec![format_doc(server, &alias, &doc.tool, detail)]);
        }

        Ok(cached
            .docs
            .iter()
            .map(|doc| format_doc(server, &alias, &doc.tool, detail))
            .collect())
    }

    /// Search cached tool documentation.
    ///
    /// The query is tokenized on whitespace (lowercased); an entry matches
    /// when its keyword blob contains every token. Only servers in
    /// `allowed` are searched, and at most `limit` (clamped to `[1, 20]`)
    /// entries are returned.
    pub async fn search(
        &self,
        query: &str,
        allowed: &[String],
        limit: i64,
        detail: DocDetail,
    ) -> Vec<DocEntry> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let cap = usize::try_from(limit.clamp(1, SEARCH_RESULT_CAP as i64)).unwrap_or(1);

        let mut inner = self.inner.lock().await;
        rebuild_index_if_dirty(&mut inner);

        let mut matches = Vec::new();
        for entry in &inner.index {
            if !allowed.iter().any(|name| name == &entry.server) {
                continue;
            }
            if tokens.iter().all(|token| entry.keywords.contains(token)) {
                matches.push(format_doc(
                    &entry.server,
                    &entry.server_alias,
                    &entry.tool,
                    detail,
                ));
                if matches.len() >= cap {
                    break;
                }
            }
        }
        matches
    }
}

fn rebuild_index_if_dirty(inner: &mut Inner) {
    if !inner.index_dirty {
        return;
    }

    let mut names: Vec<&String> = inner.servers.keys().collect();
    names.sort();

    let mut index = Vec::new();
    for name in names {
        let Some(cached) = inner.servers.get(name) else {
            continue;
        };
        for doc in &cached.docs {
            index.push(IndexEntry {
                server: cached.metadata.name.clone(),
                server_alias: cached.metadata.alias.clone(),
                tool: doc.tool.clone(),
                keywords: doc.keywords.clone(),
            });
        }
    }

    inner.index = index;
    inner.index_dirty = false;
}

fn format_doc(server: &str, server_alias: &str, tool: &ToolMetadata, detail: DocDetail) -> DocEntry {
    DocEntry {
        server: server.to_string(),
        server_alias: server_alias.to_string(),
        tool: tool.name.clone(),
        tool_alias: tool.alias.clone(),
        description: if tool.description.is_empty() {
            None
        } else {
            Some(tool.description.clone())
        },
        input_schema: match detail {
            DocDetail::Full => tool.input_schema.clone(),
            DocDetail::Summary => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn record(name: &str, alias: &str) -> Arc<ServerRecord> {
        Arc::new(ServerRecord {
            name: name.to_string(),
            alias: alias.to_string(),
            command: "cmd".to_string(),
            args: Vec::new(),
            env: StdHashMap::new(),
            cwd: None,
            description: String::new(),
        })
    }

    fn spec(name: &str, description: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: Some(serde_json::json!({"type": "object"})),
        }
    }

    #[tokio::test]
    async fn tool_aliases_are_unique_within_server() {
        let cache = MetadataCache::new();
        let server = record("demo", "demo");
        cache
            .insert_specs(
                &server,
                &[spec("get-data", ""), spec("get data", ""), spec("get_data", "")],
            )
            .await;

        let metadata = cache.metadata("demo").await.unwrap();
        let aliases: Vec<&str> = metadata.tools.iter().map(|t| t.alias.as_str()).collect();
        assert_eq!(aliases, vec!["get_data", "get_data_2", "get_data_3"]);
    }

    #[tokio::test]
    async fn keyword_aliases_escape_python_keywords() {
        let cache = MetadataCache::new();
        let server = record("demo", "demo");
        cache.insert_specs(&server, &[spec("import", "")]).await;

        let metadata = cache.metadata("demo").await.unwrap();
        assert_eq!(metadata.tools[0].alias, "import_");
    }

    #[tokio::test]
    async fn tool_docs_matches_alias_and_raw_name() {
        let cache = MetadataCache::new();
        let server = record("demo", "demo");
        cache.insert_specs(&server, &[spec("Get-Weather", "Forecast lookup")]).await;

        let by_alias = cache
            .tool_docs("demo", Some("get_weather"), DocDetail::Summary)
            .await
            .unwrap();
        assert_eq!(by_alias.len(), 1);
        assert_eq!(by_alias[0].tool, "Get-Weather");

        let by_name = cache
            .tool_docs("demo", Some("GET-WEATHER"), DocDetail::Summary)
            .await
            .unwrap();
        assert_eq!(by_name[0].tool_alias, "get_weather");
    }

    #[tokio::test]
    async fn tool_docs_detail_controls_schema() {
        let cache = MetadataCache::new();
        let server = record("demo", "demo");
        cache.insert_specs(&server, &[spec("echo", "Echo")]).await;

        let summary = cache.tool_docs("demo", None, DocDetail::Summary).await.unwrap();
        assert!(summary[0].input_schema.is_none());

        let full = cache.tool_docs("demo", None, DocDetail::Full).await.unwrap();
        assert!(full[0].input_schema.is_some());
    }

    #[tokio::test]
    async fn tool_docs_errors_for_unknown_tool_or_server() {
        let cache = MetadataCache::new();
        let server = record("demo", "demo");
        cache.insert_specs(&server, &[spec("echo", "")]).await;

        assert!(matches!(
            cache.tool_docs("demo", Some("missing"), DocDetail::Summary).await,
            Err(McpError::ToolNotFound { .. })
        ));
        assert!(matches!(
            cache.tool_docs("other", None, DocDetail::Summary).await,
            Err(McpError::DocsUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn search_requires_all_tokens() {
        let cache = MetadataCache::new();
        let server = record("weather", "weather");
        cache
            .insert_specs(
                &server,
                &[
                    spec("current", "Current conditions for a city"),
                    spec("forecast", "Seven day forecast for a city"),
                ],
            )
            .await;

        let allowed = vec!["weather".to_string()];
        let hits = cache.search("forecast city", &allowed, 5, DocDetail::Summary).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool, "forecast");

        let all = cache.search("city", &allowed, 5, DocDetail::Summary).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn search_respects_allowlist_and_limit() {
        let cache = MetadataCache::new();
        cache
            .insert_specs(&record("a", "a"), &[spec("one", "shared term")])
            .await;
        cache
            .insert_specs(&record("b", "b"), &[spec("two", "shared term")])
            .await;

        let only_a = vec!["a".to_string()];
        let hits = cache.search("shared", &only_a, 5, DocDetail::Summary).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].server, "a");

        let both = vec!["a".to_string(), "b".to_string()];
        let capped = cache.search("shared", &both, 1, DocDetail::Summary).await;
        assert_eq!(capped.len(), 1);

        // Out-of-range limits clamp into [1, 20].
        let low = cache.search("shared", &both, -3, DocDetail::Summary).await;
        assert_eq!(low.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_drops_metadata_and_index_entries() {
        let cache = MetadataCache::new();
        let server = record("demo", "demo");
        cache.insert_specs(&server, &[spec("echo", "repeat a value")]).await;

        cache.invalidate("demo").await;
        assert!(!cache.contains("demo").await);

        let allowed = vec!["demo".to_string()];
        let hits = cache.search("repeat", &allowed, 5, DocDetail::Summary).await;
        assert!(hits.is_empty());
    }

    #[test]
    fn detail_parsing() {
        assert_eq!(DocDetail::parse(None), DocDetail::Summary);
        assert_eq!(DocDetail::parse(Some("FULL")), DocDetail::Full);
        assert_eq!(DocDetail::parse(Some("bogus")), DocDetail::Summary);
    }
}
