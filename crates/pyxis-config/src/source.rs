//! Catalog source enumeration.
//!
//! Sources are scanned in a fixed order; the first occurrence of a server
//! name wins. A directory source contributes every file in it matching the
//! declared format.

use std::path::{Path, PathBuf};

/// Whether a source is a single file or a directory of catalog files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A single catalog file.
    File,
    /// A directory scanned for catalog files.
    Directory,
}

/// On-disk format of a catalog source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatalogFormat {
    /// JSON with a top-level `mcpServers` map.
    #[default]
    Json,
    /// TOML with a top-level `mcpServers` table.
    Toml,
}

impl CatalogFormat {
    /// File extension for this format (without the dot).
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Toml => "toml",
        }
    }
}

/// One place to look for server definitions.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path of the file or directory.
    pub path: PathBuf,
    /// File vs. directory.
    pub kind: SourceKind,
    /// Expected catalog format.
    pub format: CatalogFormat,
    /// Human-readable label used in logs.
    pub label: String,
}

impl ConfigSource {
    /// A single-file JSON source.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::File,
            format: CatalogFormat::Json,
            label: label.into(),
        }
    }

    /// A directory source scanned for JSON files.
    #[must_use]
    pub fn directory(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: SourceKind::Directory,
            format: CatalogFormat::Json,
            label: label.into(),
        }
    }

    /// Override the expected format.
    #[must_use]
    pub fn with_format(mut self, format: CatalogFormat) -> Self {
        self.format = format;
        self
    }
}

/// The built-in source list, scanned in order.
///
/// `home` and `workspace` are injected so tests can point discovery at a
/// scratch directory.
#[must_use]
pub fn default_sources(home: &Path, workspace: &Path) -> Vec<ConfigSource> {
    let mut sources = vec![
        // Primary: user MCPs directory (doubles as the state dir).
        ConfigSource::directory(home.join("MCPs"), "User MCPs"),
        // Standard config directory.
        ConfigSource::directory(home.join(".config/mcp/servers"), "Standard MCP"),
        // Workspace-local catalogs.
        ConfigSource::directory(workspace.join("mcp-servers"), "Local Project"),
        ConfigSource::file(workspace.join(".vscode/mcp.json"), "VS Code Workspace"),
        // Assistant / editor configs.
        ConfigSource::file(home.join(".claude.json"), "Claude CLI"),
        ConfigSource::file(home.join(".cursor/mcp.json"), "Cursor"),
        ConfigSource::file(home.join(".opencode.json"), "OpenCode CLI"),
        ConfigSource::file(home.join(".codeium/windsurf/mcp_config.json"), "Windsurf"),
    ];

    #[cfg(target_os = "macos")]
    sources.extend([
        ConfigSource::file(
            home.join("Library/Application Support/Claude Code/claude_code_config.json"),
            "Claude Code (macOS)",
        ),
        ConfigSource::file(
            home.join("Library/Application Support/Claude/claude_desktop_config.json"),
            "Claude Desktop (macOS)",
        ),
        ConfigSource::file(
            home.join("Library/Application Support/Code/User/settings.json"),
            "VS Code Global (macOS)",
        ),
    ]);

    #[cfg(target_os = "linux")]
    sources.push(ConfigSource::file(
        home.join(".config/Code/User/settings.json"),
        "VS Code Global (Linux)",
    ));

    sources
}
