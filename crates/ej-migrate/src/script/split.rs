//! Splitting scripts on `GO` batch separators.

use std::sync::OnceLock;

use regex::Regex;

fn go_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?im)^\s*GO\s*$").expect("GO pattern is valid"))
}

/// Split a script into batches on lines holding only `GO`.
///
/// Batches are trimmed and empty ones dropped.
pub fn split_batches(script: &str) -> Vec<String> {
    go_pattern()
        .split(script)
        .map(str::trim)
        .filter(|batch| !batch.is_empty())
        .map(str::to_string)
        .collect()
}
