//! Failure classification for stage retries.
//!
//! Deterministic failures (unknown flag, missing executable, missing file,
//! syntax error, auth failure) are surfaced immediately and never retried.
//! Everything else is treated as transient and counts toward `max_retries`.
//!
//! The regex patterns here are a stable contract: their count and capture
//! groups are asserted by tests, and the missing-executable capture feeds
//! the `missing_executables` list surfaced to the user.

use std::sync::OnceLock;

use regex::Regex;

/// Tool stderr patterns that indicate a missing input path. Capture group 1
/// is the path.
pub fn tool_missing_path_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?mi)\bcd:\s+([^:\r\n]+):\s+No such file or directory").unwrap(),
            Regex::new(r"(?mi)\btest:\s+([^:\r\n]+):\s+No such file or directory").unwrap(),
            Regex::new(r"(?mi)\bcannot (?:stat|open)\s+'([^'\r\n]+)'").unwrap(),
            Regex::new(r"(?mi)\bopen\s+([^:\r\n]+):\s+no such file or directory").unwrap(),
        ]
    })
}

/// Shell "command not found" pattern. Capture group 1 is the executable.
pub fn tool_missing_executable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?mi)^(?:.*?:\s+)?([A-Za-z0-9._+\-/]+):\s+command not found$").unwrap()
    })
}

/// Extract the missing input paths reported in tool stderr.
pub fn extract_missing_paths(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for re in tool_missing_path_patterns() {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let path = m.as_str().trim().to_string();
                if !path.is_empty() && !out.contains(&path) {
                    out.push(path);
                }
            }
        }
    }
    out
}

/// Extract the missing executables reported in tool stderr, deduplicated and
/// sorted for stable presentation.
pub fn extract_missing_executables(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in tool_missing_executable_pattern().captures_iter(text) {
        if let Some(m) = caps.get(1) {
            let exe = m.as_str().trim().to_string();
            if !exe.is_empty() && !out.contains(&exe) {
                out.push(exe);
            }
        }
    }
    out.sort();
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retrying cannot help: the same inputs produce the same failure.
    Deterministic,
    /// May succeed on retry.
    Transient,
}

/// Classify a failure reason (typically tool stderr or a provider error
/// message). Unrecognized failures default to transient so real flakes keep
/// their retry budget.
pub fn classify_failure(reason: &str) -> FailureClass {
    let lower = reason.to_ascii_lowercase();

    if lower.contains("unknown flag")
        || lower.contains("unrecognized option")
        || lower.contains("syntax error")
        || lower.contains("authentication failed")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
    {
        return FailureClass::Deterministic;
    }
    if tool_missing_executable_pattern().is_match(reason) {
        return FailureClass::Deterministic;
    }
    if tool_missing_path_patterns().iter().any(|re| re.is_match(reason)) {
        return FailureClass::Deterministic;
    }

    FailureClass::Transient
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
