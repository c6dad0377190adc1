//! Pyxis config - upstream server catalog discovery.
//!
//! This crate locates MCP server catalogs across well-known locations
//! (the user `MCPs` directory, XDG config, workspace-local files, and
//! per-editor config files), normalizes their entries into
//! [`ServerRecord`]s, and maintains the [`ServerRegistry`] with stable,
//! sandbox-safe aliases.
//!
//! Discovery is first-wins: once a server name is registered, later
//! sources never replace it. Entries that would launch the bridge itself
//! are rejected unless explicitly allowed.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod loader;
mod registry;
mod source;

pub use error::ConfigError;
pub use loader::{discover_into, load_catalog, looks_like_self_server, ParsedServer};
pub use registry::{ServerRecord, ServerRegistry};
pub use source::{default_sources, CatalogFormat, ConfigSource, SourceKind};
