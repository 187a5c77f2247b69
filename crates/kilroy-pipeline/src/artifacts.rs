//! Artifact store: named, content-addressed storage for stage outputs with
//! spill-to-disk above a size threshold.
//!
//! Reads may proceed concurrently; writes exclude everything (including the
//! file IO they perform). In-memory retrievals return copies so callers can
//! never mutate stored data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use kilroy_types::{KilroyError, Result};

/// Artifacts at or below this size stay in memory; above it they are written
/// to disk under the run's `artifacts/` subdirectory.
pub const DEFAULT_FILE_BACKING_THRESHOLD: u64 = 100 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub stored_at: chrono::DateTime<chrono::Utc>,
    pub is_file_backed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_hash: String,
}

struct ArtifactEntry {
    info: ArtifactInfo,
    /// In-memory bytes; empty when file-backed.
    data: Vec<u8>,
    /// Backing file path; `None` when in-memory.
    path: Option<PathBuf>,
}

pub struct ArtifactStore {
    entries: RwLock<HashMap<String, ArtifactEntry>>,
    /// Run logs root; `None` disables file backing entirely.
    base_dir: Option<PathBuf>,
    threshold: u64,
}

/// Validate and sanitize an artifact ID: non-empty, no path separators, no
/// `..`, no leading/trailing dots. Prevents traversal out of the artifacts
/// directory.
fn sanitize_artifact_id(id: &str) -> Result<&str> {
    if id.is_empty() {
        return Err(KilroyError::ValidationError(
            "artifact ID must not be empty".into(),
        ));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(KilroyError::ValidationError(format!(
            "artifact ID must not contain path separators: {id:?}"
        )));
    }
    if id.contains("..") {
        return Err(KilroyError::ValidationError(format!(
            "artifact ID must not contain '..': {id:?}"
        )));
    }
    if id == "." || id.starts_with('.') || id.ends_with('.') {
        return Err(KilroyError::ValidationError(format!(
            "artifact ID is not a safe filename: {id:?}"
        )));
    }
    Ok(id)
}

impl ArtifactStore {
    /// `base_dir` is the run's logs root (the `artifacts/` subdirectory is
    /// created beneath it on first file-backed write); `None` disables file
    /// backing.
    pub fn new(base_dir: Option<PathBuf>, threshold: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            base_dir,
            threshold,
        }
    }

    pub fn with_defaults(base_dir: impl Into<PathBuf>) -> Self {
        Self::new(Some(base_dir.into()), DEFAULT_FILE_BACKING_THRESHOLD)
    }

    /// Add or replace an artifact. Replacing a file-backed artifact removes
    /// the old file.
    pub fn store(&self, artifact_id: &str, name: &str, data: &[u8]) -> Result<ArtifactInfo> {
        let artifact_id = sanitize_artifact_id(artifact_id)?;

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        let size = data.len() as u64;
        let content_hash = format!("sha256:{:x}", Sha256::digest(data));
        let backing_dir = if size > self.threshold {
            self.base_dir.as_deref()
        } else {
            None
        };

        let info = ArtifactInfo {
            id: artifact_id.to_string(),
            name: name.to_string(),
            size_bytes: size,
            stored_at: chrono::Utc::now(),
            is_file_backed: backing_dir.is_some(),
            content_hash,
        };

        let mut entry = ArtifactEntry {
            info: info.clone(),
            data: Vec::new(),
            path: None,
        };
        if let Some(base) = backing_dir {
            let dir = base.join("artifacts");
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(format!("{artifact_id}.json"));
            std::fs::write(&path, data)?;
            entry.path = Some(path);
        } else {
            entry.data = data.to_vec();
        }

        if let Some(old) = entries.get(artifact_id) {
            if let Some(old_path) = &old.path {
                let _ = std::fs::remove_file(old_path);
            }
        }

        entries.insert(artifact_id.to_string(), entry);
        Ok(info)
    }

    /// Fetch the artifact bytes. File-backed artifacts read from disk;
    /// in-memory artifacts return a copy.
    pub fn retrieve(&self, artifact_id: &str) -> Result<Vec<u8>> {
        sanitize_artifact_id(artifact_id)?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .get(artifact_id)
            .ok_or_else(|| KilroyError::Other(format!("artifact not found: {artifact_id}")))?;
        if let Some(path) = &entry.path {
            return Ok(std::fs::read(path)?);
        }
        Ok(entry.data.clone())
    }

    pub fn has(&self, artifact_id: &str) -> bool {
        if sanitize_artifact_id(artifact_id).is_err() {
            return false;
        }
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(artifact_id)
    }

    pub fn info(&self, artifact_id: &str) -> Option<ArtifactInfo> {
        sanitize_artifact_id(artifact_id).ok()?;
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(artifact_id)
            .map(|e| e.info.clone())
    }

    /// All artifact infos, sorted by ID ascending.
    pub fn list(&self) -> Vec<ArtifactInfo> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<ArtifactInfo> = entries.values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Delete an artifact, returning whether it existed. File-backed
    /// artifacts lose their backing file too.
    pub fn remove(&self, artifact_id: &str) -> bool {
        if sanitize_artifact_id(artifact_id).is_err() {
            return false;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.remove(artifact_id) {
            Some(entry) => {
                if let Some(path) = entry.path {
                    let _ = std::fs::remove_file(path);
                }
                true
            }
            None => false,
        }
    }

    /// Remove every artifact (and backing file), returning the count removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let count = entries.len();
        for entry in entries.values() {
            if let Some(path) = &entry.path {
                let _ = std::fs::remove_file(path);
            }
        }
        entries.clear();
        count
    }

    pub fn artifacts_dir(&self) -> Option<PathBuf> {
        self.base_dir.as_ref().map(|b| b.join("artifacts"))
    }
}

/// Expected backing path for a file-backed artifact.
pub fn artifact_file_path(base_dir: &Path, artifact_id: &str) -> PathBuf {
    base_dir.join("artifacts").join(format!("{artifact_id}.json"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
