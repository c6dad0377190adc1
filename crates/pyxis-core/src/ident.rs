//! Identifier sanitization for sandbox-facing aliases.
//!
//! Server and tool names come from arbitrary user configuration, but inside
//! the sandbox they become Python module attributes (`mcp_<alias>.<tool>`),
//! so every alias must be a valid, non-keyword Python identifier.

/// Python keywords as of 3.14. An alias matching one of these gets a
/// trailing underscore so it stays usable as an attribute name.
const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

fn is_python_keyword(value: &str) -> bool {
    PYTHON_KEYWORDS.iter().any(|kw| kw.eq_ignore_ascii_case(value))
}

/// Convert an arbitrary string into a valid Python identifier.
///
/// Runs of characters outside `[0-9A-Za-z_]` collapse into a single `_`,
/// the result is lowercased, a leading digit gets a `_` prefix, and Python
/// keywords get a `_` suffix. `default` is used when nothing survives.
#[must_use]
pub fn sanitize_identifier(value: &str, default: &str) -> String {
    let mut cleaned = String::with_capacity(value.len());
    let mut last_was_gap = false;
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            cleaned.push(ch.to_ascii_lowercase());
            last_was_gap = false;
        } else if !last_was_gap {
            cleaned.push('_');
            last_was_gap = true;
        }
    }

    if cleaned.is_empty() {
        cleaned = default.to_string();
    }
    if cleaned.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
        cleaned.insert(0, '_');
    }
    if is_python_keyword(&cleaned) {
        cleaned.push('_');
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_non_identifier_runs() {
        assert_eq!(sanitize_identifier("My Cool-Server!", "server"), "my_cool_server_");
        assert_eq!(sanitize_identifier("weather", "server"), "weather");
        assert_eq!(sanitize_identifier("a  b", "server"), "a_b");
    }

    #[test]
    fn prefixes_leading_digits() {
        assert_eq!(sanitize_identifier("3d-tools", "server"), "_3d_tools");
    }

    #[test]
    fn escapes_python_keywords() {
        assert_eq!(sanitize_identifier("import", "tool"), "import_");
        assert_eq!(sanitize_identifier("class", "tool"), "class_");
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(sanitize_identifier("", "server"), "server");
        assert_eq!(sanitize_identifier("---", "server"), "_");
    }
}
