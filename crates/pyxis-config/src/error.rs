//! Catalog loading errors.

use thiserror::Error;

/// Errors raised while reading a single catalog source.
///
/// Discovery treats these as per-source failures: the source is logged and
/// skipped, and scanning continues.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The catalog file could not be read.
    #[error("cannot read catalog: {0}")]
    Io(#[from] std::io::Error),

    /// The catalog file is not valid JSON.
    #[error("invalid JSON catalog: {0}")]
    Json(#[from] serde_json::Error),

    /// The catalog file is not valid TOML.
    #[error("invalid TOML catalog: {0}")]
    Toml(#[from] toml::de::Error),
}
