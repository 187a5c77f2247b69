//! Build metadata and the stale-build check.

/// Revision embedded at build time (via `KILROY_BUILD_SHA`), when available.
pub fn embedded_revision() -> Option<&'static str> {
    option_env!("KILROY_BUILD_SHA").filter(|s| !s.trim().is_empty())
}

/// The embedded revision and the repository HEAD agree when either is a
/// prefix of the other. Short SHAs are common on both sides, so this stays a
/// prefix match rather than strict equality.
pub fn revision_matches(embedded: &str, head: &str) -> bool {
    let embedded = embedded.trim();
    let head = head.trim();
    if embedded.is_empty() || head.is_empty() {
        return false;
    }
    embedded.starts_with(head) || head.starts_with(embedded)
}

/// Compare the embedded revision against the repo HEAD; `None` means no
/// verdict (no embedded revision or no repo).
pub fn stale_build_warning(repo_path: &std::path::Path) -> Option<String> {
    let embedded = embedded_revision()?;
    let output = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if revision_matches(embedded, &head) {
        return None;
    }
    Some(format!(
        "binary was built from {embedded} but the repository HEAD is {head}; rebuild to pick up local changes"
    ))
}
