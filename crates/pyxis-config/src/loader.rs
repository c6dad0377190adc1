//! Catalog loading and discovery.
//!
//! A catalog file carries a top-level `mcpServers` map of name → server
//! definition and an optional top-level `description` that acts as the
//! default description for every server in the file. Unrecognized keys are
//! tolerated; entries without a usable `command` are skipped.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::registry::ServerRegistry;
use crate::source::{CatalogFormat, ConfigSource, SourceKind};

/// Names and command basenames that identify the bridge's own entry point.
/// Catalog entries matching these would recursively host the bridge inside
/// itself and are rejected unless explicitly allowed.
const SELF_SERVER_TOKENS: &[&str] = &["pyxis", "pyxis-bridge", "pyxis_bridge"];

/// A server definition parsed from a catalog, not yet registered.
#[derive(Debug, Clone)]
pub struct ParsedServer {
    /// Server name (the key in the `mcpServers` map).
    pub name: String,
    /// Launch command.
    pub command: String,
    /// Launch arguments.
    pub args: Vec<String>,
    /// Environment for the launched process.
    pub env: HashMap<String, String>,
    /// Working directory for the launched process.
    pub cwd: Option<String>,
    /// Description (per-server, falling back to the file default).
    pub description: String,
}

/// Return `true` when a catalog entry appears to launch this bridge.
#[must_use]
pub fn looks_like_self_server(name: &str, command: &str, args: &[String]) -> bool {
    let matches_token = |candidate: &str| {
        let lowered = candidate.to_ascii_lowercase();
        let basename = Path::new(&lowered)
            .file_name()
            .and_then(|os| os.to_str())
            .unwrap_or(&lowered)
            .to_string();
        SELF_SERVER_TOKENS.contains(&lowered.as_str())
            || SELF_SERVER_TOKENS.contains(&basename.as_str())
    };

    if SELF_SERVER_TOKENS.contains(&name.to_ascii_lowercase().as_str()) {
        return true;
    }
    if matches_token(command) {
        return true;
    }
    args.iter().any(|arg| matches_token(arg))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, item)| {
                let text = match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect(),
        _ => HashMap::new(),
    }
}

fn parse_entry(name: &str, raw: &Value, file_description: &str) -> Option<ParsedServer> {
    let command = raw.get("command")?.as_str()?.to_string();
    let description = raw
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or(file_description)
        .to_string();

    Some(ParsedServer {
        name: name.to_string(),
        command,
        args: string_list(raw.get("args")),
        env: string_map(raw.get("env")),
        cwd: raw.get("cwd").and_then(Value::as_str).map(String::from),
        description,
    })
}

/// Load one catalog file into a list of parsed servers.
///
/// Self-referential entries are dropped here (with a log line) unless
/// `allow_self_server` is set.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed; the caller
/// treats that as a skipped source, not a fatal condition.
pub fn load_catalog(
    path: &Path,
    format: CatalogFormat,
    label: &str,
    allow_self_server: bool,
) -> Result<Vec<ParsedServer>, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let data: Value = match format {
        CatalogFormat::Json => serde_json::from_str(&text)?,
        CatalogFormat::Toml => {
            let table: toml::Value = toml::from_str(&text)?;
            serde_json::to_value(table)?
        },
    };

    let file_description = data
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut servers = Vec::new();
    let Some(Value::Object(entries)) = data.get("mcpServers") else {
        return Ok(servers);
    };

    for (name, raw) in entries {
        let Some(parsed) = parse_entry(name, raw, &file_description) else {
            debug!(server = %name, source = label, "Skipping entry without a command");
            continue;
        };
        if !allow_self_server && looks_like_self_server(&parsed.name, &parsed.command, &parsed.args)
        {
            info!(server = %name, source = label, "Skipping self-referential server");
            continue;
        }
        servers.push(parsed);
    }

    Ok(servers)
}

fn catalog_files(source: &ConfigSource) -> Vec<std::path::PathBuf> {
    let Ok(entries) = std::fs::read_dir(&source.path) else {
        return Vec::new();
    };
    let mut files: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(source.format.extension()))
        })
        .collect();
    // Deterministic scan order so repeated discovery yields the same
    // registry.
    files.sort();
    files
}

/// Scan the given sources in order and register every new server.
///
/// First-discovered wins: names already present in `registry` (or earlier
/// in the scan) are skipped. Unreadable or malformed sources are logged
/// and skipped. Returns the number of newly registered servers.
pub fn discover_into(
    registry: &mut ServerRegistry,
    sources: &[ConfigSource],
    allow_self_server: bool,
) -> usize {
    let mut added: usize = 0;

    for source in sources {
        if !source.path.exists() {
            continue;
        }

        let files = match source.kind {
            SourceKind::File => vec![source.path.clone()],
            SourceKind::Directory => catalog_files(source),
        };

        for file in files {
            match load_catalog(&file, source.format, &source.label, allow_self_server) {
                Ok(servers) => {
                    for parsed in servers {
                        let name = parsed.name.clone();
                        if registry.insert(parsed) {
                            info!(
                                server = %name,
                                path = %file.display(),
                                source = %source.label,
                                "Found MCP server"
                            );
                            added = added.saturating_add(1);
                        }
                    }
                },
                Err(error) => {
                    warn!(
                        path = %file.display(),
                        source = %source.label,
                        %error,
                        "Failed to load catalog"
                    );
                },
            }
        }
    }

    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ConfigSource;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn loads_json_catalog_with_default_description() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("servers.json");
        write(
            &path,
            r#"{
                "description": "Example tools",
                "mcpServers": {
                    "weather": {"command": "uvx", "args": ["weather-mcp"]},
                    "stocks": {"command": "npx", "description": "Quotes", "env": {"KEY": "v"}}
                }
            }"#,
        );

        let servers = load_catalog(&path, CatalogFormat::Json, "test", false).unwrap();
        assert_eq!(servers.len(), 2);
        let weather = servers.iter().find(|s| s.name == "weather").unwrap();
        assert_eq!(weather.description, "Example tools");
        assert_eq!(weather.args, vec!["weather-mcp"]);
        let stocks = servers.iter().find(|s| s.name == "stocks").unwrap();
        assert_eq!(stocks.description, "Quotes");
        assert_eq!(stocks.env.get("KEY").map(String::as_str), Some("v"));
    }

    #[test]
    fn loads_toml_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("servers.toml");
        write(
            &path,
            r#"
            [mcpServers.notes]
            command = "notes-mcp"
            args = ["--stdio"]
            cwd = "/srv/notes"
            "#,
        );

        let servers = load_catalog(&path, CatalogFormat::Toml, "test", false).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].cwd.as_deref(), Some("/srv/notes"));
    }

    #[test]
    fn entries_without_command_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("servers.json");
        write(
            &path,
            r#"{"mcpServers": {"broken": {"args": ["x"]}, "ok": {"command": "cmd"}}}"#,
        );

        let servers = load_catalog(&path, CatalogFormat::Json, "test", false).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "ok");
    }

    #[test]
    fn self_reference_detection() {
        assert!(looks_like_self_server("pyxis", "anything", &[]));
        assert!(looks_like_self_server("other", "/usr/local/bin/pyxis-bridge", &[]));
        assert!(looks_like_self_server(
            "other",
            "cargo",
            &["run".to_string(), "pyxis_bridge".to_string()],
        ));
        assert!(!looks_like_self_server("weather", "uvx", &["weather-mcp".to_string()]));
    }

    #[test]
    fn self_referential_entries_are_dropped_unless_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("servers.json");
        write(
            &path,
            r#"{"mcpServers": {"loop": {"command": "pyxis-bridge"}, "ok": {"command": "cmd"}}}"#,
        );

        let rejected = load_catalog(&path, CatalogFormat::Json, "test", false).unwrap();
        assert_eq!(rejected.len(), 1);

        let allowed = load_catalog(&path, CatalogFormat::Json, "test", true).unwrap();
        assert_eq!(allowed.len(), 2);
    }

    #[test]
    fn discovery_is_first_wins_across_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("a/servers.json");
        let second = tmp.path().join("b/servers.json");
        write(
            &first,
            r#"{"mcpServers": {"shared": {"command": "first"}}}"#,
        );
        write(
            &second,
            r#"{"mcpServers": {"shared": {"command": "second"}, "extra": {"command": "x"}}}"#,
        );

        let sources = vec![
            ConfigSource::file(&first, "first"),
            ConfigSource::file(&second, "second"),
        ];

        let mut registry = ServerRegistry::new();
        let added = discover_into(&mut registry, &sources, false);
        assert_eq!(added, 2);
        assert_eq!(registry.lookup("shared").unwrap().command, "first");
    }

    #[test]
    fn discovery_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("catalogs");
        write(
            &dir.join("one.json"),
            r#"{"mcpServers": {"alpha": {"command": "a"}, "beta": {"command": "b"}}}"#,
        );

        let sources = vec![ConfigSource::directory(&dir, "dir")];
        let mut registry = ServerRegistry::new();
        assert_eq!(discover_into(&mut registry, &sources, false), 2);
        let names_before = registry.names();

        assert_eq!(discover_into(&mut registry, &sources, false), 0);
        assert_eq!(registry.names(), names_before);
    }

    #[test]
    fn directory_scan_honors_format_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("catalogs");
        write(&dir.join("good.json"), r#"{"mcpServers": {"a": {"command": "a"}}}"#);
        write(&dir.join("ignored.toml"), "mcpServers = {}");
        write(&dir.join("notes.txt"), "not a catalog");

        let sources = vec![ConfigSource::directory(&dir, "dir")];
        let mut registry = ServerRegistry::new();
        assert_eq!(discover_into(&mut registry, &sources, false), 1);
    }

    #[test]
    fn unreadable_source_degrades_gracefully() {
        let tmp = tempfile::tempdir().unwrap();
        let bad = tmp.path().join("bad.json");
        write(&bad, "{ not json at all");
        let good = tmp.path().join("good.json");
        write(&good, r#"{"mcpServers": {"ok": {"command": "cmd"}}}"#);

        let sources = vec![
            ConfigSource::file(&bad, "bad"),
            ConfigSource::file(&good, "good"),
        ];
        let mut registry = ServerRegistry::new();
        assert_eq!(discover_into(&mut registry, &sources, false), 1);
        assert!(registry.contains("ok"));
    }
}
