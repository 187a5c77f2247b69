//! Local progress journal: `progress.ndjson` + `live.json` under the logs
//! root.
//!
//! Appends are best-effort — progress logging must never block or fail a
//! run. A mutex serializes append-and-live writes so interleaved stages do
//! not corrupt lines, and the last-append timestamp feeds the stall
//! watchdog.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;

pub struct ProgressJournal {
    logs_root: PathBuf,
    run_id: String,
    state: Mutex<ProgressState>,
}

struct ProgressState {
    last_progress_at: Instant,
}

impl ProgressJournal {
    pub fn new(logs_root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            logs_root: logs_root.into(),
            run_id: run_id.into(),
            state: Mutex::new(ProgressState {
                last_progress_at: Instant::now(),
            }),
        }
    }

    pub fn logs_root(&self) -> &Path {
        &self.logs_root
    }

    /// Append one event to `progress.ndjson` and overwrite `live.json`.
    /// `ts` and `run_id` are stamped when absent.
    pub fn append(&self, event: &str, mut fields: serde_json::Map<String, Value>) {
        fields
            .entry("event".to_string())
            .or_insert_with(|| Value::String(event.to_string()));
        fields.entry("ts".to_string()).or_insert_with(|| {
            Value::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
        });
        if !self.run_id.is_empty() {
            fields
                .entry("run_id".to_string())
                .or_insert_with(|| Value::String(self.run_id.clone()));
        }

        let line = match serde_json::to_string(&Value::Object(fields)) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "progress event not serializable; dropped");
                return;
            }
        };

        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.last_progress_at = Instant::now();

        use std::io::Write;
        let ndjson = self.logs_root.join("progress.ndjson");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ndjson)
        {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{line}") {
                    tracing::warn!(error = %e, "progress.ndjson append failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, path = %ndjson.display(), "progress.ndjson open failed"),
        }

        if let Err(e) = std::fs::write(self.logs_root.join("live.json"), format!("{line}\n")) {
            tracing::warn!(error = %e, "live.json write failed");
        }
    }

    /// Seconds since the last appended event; drives the stall watchdog.
    pub fn idle_for(&self) -> std::time::Duration {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.last_progress_at.elapsed()
    }

    /// Reset the idle clock without writing an event (used when a handler
    /// observes byte-level output that is not worth a journal line).
    pub fn touch(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.last_progress_at = Instant::now();
    }
}

/// Convenience macro-free builder for event fields.
pub fn fields(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
