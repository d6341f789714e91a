//! Shared utility functions used across the codebase.

/// Return `value` unless it is empty or whitespace-only.
pub fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Append `suffix` to the final component of `path` (`tokens.json` -> `tokens.json.backup`).
pub fn sibling_with_suffix(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    std::path::PathBuf::from(name)
}
