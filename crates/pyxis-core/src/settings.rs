//! Bridge settings resolved from the process environment.
//!
//! Every knob has a `PYXIS_*` environment variable and a conservative
//! default; the bridge binary may override individual fields from CLI flags
//! after calling [`BridgeSettings::from_env`].

use std::path::PathBuf;

/// How tool responses are rendered for the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Terse human-readable text plus a trimmed structured payload.
    #[default]
    Compact,
    /// A fenced JSON block carrying the full structured payload.
    Structured,
}

impl OutputMode {
    /// Parse a mode string. Unknown values select the structured block
    /// renderer; a missing or empty value selects compact output.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => Self::Compact,
            Some(other) => {
                if other.eq_ignore_ascii_case("compact") {
                    Self::Compact
                } else {
                    Self::Structured
                }
            },
        }
    }
}

/// Runtime configuration for the bridge process.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Container image used for the interpreter sandbox.
    pub image: String,
    /// Explicit container runtime (binary name or path); autodetected when
    /// unset.
    pub runtime: Option<String>,
    /// Default execution timeout in seconds.
    pub default_timeout: u64,
    /// Upper clamp for the per-call timeout, in seconds.
    pub max_timeout: u64,
    /// Container memory limit (runtime syntax, e.g. `512m`).
    pub memory_limit: String,
    /// Container pids limit.
    pub pids_limit: u32,
    /// Container cpu limit (runtime syntax, e.g. `1.5`).
    pub cpu_limit: Option<String>,
    /// User the interpreter runs as inside the container.
    pub container_user: String,
    /// Seconds of idleness before the container runtime is shut down;
    /// `0` disables the idle timer.
    pub runtime_idle_timeout: u64,
    /// Response rendering mode.
    pub output_mode: OutputMode,
    /// Allow catalog entries that launch this bridge itself.
    pub allow_self_server: bool,
    /// Override for the persistent state directory.
    pub state_dir: Option<PathBuf>,
    /// Additional catalog path consulted after the built-in sources.
    pub extra_config_path: Option<PathBuf>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            image: "python:3.14-slim".to_string(),
            runtime: None,
            default_timeout: 30,
            max_timeout: 120,
            memory_limit: "512m".to_string(),
            pids_limit: 128,
            cpu_limit: None,
            container_user: "65534:65534".to_string(),
            runtime_idle_timeout: 300,
            output_mode: OutputMode::Compact,
            allow_self_server: false,
            state_dir: None,
            extra_config_path: None,
        }
    }
}

impl BridgeSettings {
    /// Resolve settings from `PYXIS_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            image: env_var("PYXIS_IMAGE").unwrap_or(defaults.image),
            runtime: env_var("PYXIS_RUNTIME"),
            default_timeout: parse_u64(
                env_var("PYXIS_TIMEOUT").as_deref(),
                defaults.default_timeout,
            ),
            max_timeout: parse_u64(
                env_var("PYXIS_MAX_TIMEOUT").as_deref(),
                defaults.max_timeout,
            ),
            memory_limit: env_var("PYXIS_MEMORY").unwrap_or(defaults.memory_limit),
            pids_limit: parse_u32(env_var("PYXIS_PIDS").as_deref(), defaults.pids_limit),
            cpu_limit: env_var("PYXIS_CPUS"),
            container_user: env_var("PYXIS_CONTAINER_USER").unwrap_or(defaults.container_user),
            runtime_idle_timeout: parse_u64(
                env_var("PYXIS_RUNTIME_IDLE_TIMEOUT").as_deref(),
                defaults.runtime_idle_timeout,
            ),
            output_mode: OutputMode::parse(env_var("PYXIS_OUTPUT_MODE").as_deref()),
            allow_self_server: parse_truthy(env_var("PYXIS_ALLOW_SELF_SERVER").as_deref()),
            state_dir: env_var("PYXIS_STATE_DIR").map(PathBuf::from),
            extra_config_path: env_var("PYXIS_SERVERS_CONFIG").map(PathBuf::from),
        }
    }

    /// Clamp a requested timeout to `[1, max_timeout]` seconds.
    #[must_use]
    pub fn clamp_timeout(&self, requested: i64) -> u64 {
        let ceiling = i64::try_from(self.max_timeout).unwrap_or(i64::MAX);
        u64::try_from(requested.clamp(1, ceiling.max(1))).unwrap_or(1)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u64(value: Option<&str>, default: u64) -> u64 {
    value.and_then(|raw| raw.trim().parse().ok()).unwrap_or(default)
}

fn parse_u32(value: Option<&str>, default: u32) -> u32 {
    value.and_then(|raw| raw.trim().parse().ok()).unwrap_or(default)
}

fn parse_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|raw| raw.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_mode_defaults_to_compact() {
        assert_eq!(OutputMode::parse(None), OutputMode::Compact);
        assert_eq!(OutputMode::parse(Some("")), OutputMode::Compact);
        assert_eq!(OutputMode::parse(Some("  Compact ")), OutputMode::Compact);
    }

    #[test]
    fn output_mode_other_values_are_structured() {
        assert_eq!(OutputMode::parse(Some("toon")), OutputMode::Structured);
        assert_eq!(OutputMode::parse(Some("structured")), OutputMode::Structured);
    }

    #[test]
    fn clamp_timeout_bounds() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.clamp_timeout(-5), 1);
        assert_eq!(settings.clamp_timeout(0), 1);
        assert_eq!(settings.clamp_timeout(30), 30);
        assert_eq!(settings.clamp_timeout(9999), 120);
    }

    #[test]
    fn parse_helpers_fall_back_to_defaults() {
        assert_eq!(parse_u64(Some("not a number"), 30), 30);
        assert_eq!(parse_u64(Some(" 45 "), 30), 45);
        assert_eq!(parse_u32(Some("256"), 128), 256);
        assert!(parse_truthy(Some("YES")));
        assert!(parse_truthy(Some("1")));
        assert!(!parse_truthy(Some("0")));
        assert!(!parse_truthy(None));
    }
}
