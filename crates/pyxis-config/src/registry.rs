//! Server registry with stable sandbox-safe aliases.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use pyxis_core::sanitize_identifier;

use crate::loader::ParsedServer;

/// One normalized upstream server. Immutable once registered; shared
/// read-only with the session layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// User-supplied name, unique across the registry.
    pub name: String,
    /// Identifier-safe alias, unique across the registry.
    pub alias: String,
    /// Command used to launch the server.
    pub command: String,
    /// Command arguments, in order.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server process.
    pub cwd: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

/// Ordered collection of [`ServerRecord`]s.
///
/// Insertion is first-wins per name; aliases are assigned at insertion and
/// stay stable for the lifetime of the registry.
#[derive(Debug, Default, Clone)]
pub struct ServerRegistry {
    records: Vec<Arc<ServerRecord>>,
    by_name: HashMap<String, usize>,
}

impl ServerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a server name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Register a parsed server. Returns `false` when the name is already
    /// taken (the existing record is left untouched).
    pub fn insert(&mut self, parsed: ParsedServer) -> bool {
        if self.contains(&parsed.name) {
            return false;
        }

        let alias = self.next_alias(&parsed.name);
        let record = Arc::new(ServerRecord {
            name: parsed.name.clone(),
            alias,
            command: parsed.command,
            args: parsed.args,
            env: parsed.env,
            cwd: parsed.cwd,
            description: parsed.description,
        });
        self.by_name.insert(parsed.name, self.records.len());
        self.records.push(record);
        true
    }

    /// Derive an alias unique among the already-assigned ones.
    fn next_alias(&self, name: &str) -> String {
        let base = sanitize_identifier(name, "server");
        let used: std::collections::HashSet<&str> =
            self.records.iter().map(|record| record.alias.as_str()).collect();

        if !used.contains(base.as_str()) {
            return base;
        }
        let mut suffix: u32 = 2;
        loop {
            let candidate = format!("{base}_{suffix}");
            if !used.contains(candidate.as_str()) {
                return candidate;
            }
            suffix = suffix.saturating_add(1);
        }
    }

    /// Records in discovery order.
    #[must_use]
    pub fn list(&self) -> &[Arc<ServerRecord>] {
        &self.records
    }

    /// Look up a record by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Arc<ServerRecord>> {
        self.by_name.get(name).map(|&index| &self.records[index])
    }

    /// Server names in discovery order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.records.iter().map(|record| record.name.clone()).collect()
    }

    /// Name → description map, used for discovery from inside the sandbox.
    #[must_use]
    pub fn describe_all(&self) -> BTreeMap<String, String> {
        self.records
            .iter()
            .map(|record| (record.name.clone(), record.description.clone()))
            .collect()
    }

    /// Number of registered servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(name: &str) -> ParsedServer {
        ParsedServer {
            name: name.to_string(),
            command: "cmd".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            description: String::new(),
        }
    }

    #[test]
    fn first_insert_wins() {
        let mut registry = ServerRegistry::new();
        let mut first = parsed("weather");
        first.description = "original".to_string();
        assert!(registry.insert(first));

        let mut second = parsed("weather");
        second.description = "replacement".to_string();
        assert!(!registry.insert(second));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("weather").unwrap().description, "original");
    }

    #[test]
    fn aliases_are_unique() {
        let mut registry = ServerRegistry::new();
        registry.insert(parsed("my server"));
        registry.insert(parsed("my-server"));
        registry.insert(parsed("My Server"));

        let aliases: Vec<&str> = registry.list().iter().map(|r| r.alias.as_str()).collect();
        assert_eq!(aliases, vec!["my_server", "my_server_2", "my_server_3"]);
    }

    #[test]
    fn alias_prefixes_leading_digit() {
        let mut registry = ServerRegistry::new();
        registry.insert(parsed("3d"));
        assert_eq!(registry.lookup("3d").unwrap().alias, "_3d");
    }

    #[test]
    fn describe_all_maps_names_to_descriptions() {
        let mut registry = ServerRegistry::new();
        let mut server = parsed("weather");
        server.description = "Forecasts".to_string();
        registry.insert(server);
        registry.insert(parsed("stocks"));

        let described = registry.describe_all();
        assert_eq!(described.get("weather").map(String::as_str), Some("Forecasts"));
        assert_eq!(described.get("stocks").map(String::as_str), Some(""));
    }
}
