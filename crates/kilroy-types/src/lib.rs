//! Shared types, errors, context, and outcome for the Kilroy attractor engine.
//!
//! This crate provides the foundational types used across all other Kilroy crates:
//! - `KilroyError` — unified error taxonomy
//! - `Context` — thread-safe key-value store for run state
//! - `Outcome` / `StageStatus` — result of executing a node handler
//! - `Checkpoint` — serializable snapshot for crash recovery
//! - `FinalOutcome` — the terminal `final.json` record

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Unified error type for all Kilroy subsystems.
#[derive(Debug, thiserror::Error)]
pub enum KilroyError {
    // === Provider errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    // === Parser errors ===
    #[error("DOT parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    // === Graph / config errors ===
    #[error("Graph validation failed: {0}")]
    ValidationError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    // === Execution errors ===
    #[error("Handler '{handler}' failed on node '{node}': {message}")]
    HandlerError {
        handler: String,
        node: String,
        message: String,
    },

    #[error("Stage '{node}' exceeded its timeout of {timeout_ms}ms")]
    StageTimeout { node: String, timeout_ms: u64 },

    #[error("Stage '{node}' canceled by stall watchdog after {idle_ms}ms without progress")]
    StallWatchdog { node: String, idle_ms: u64 },

    #[error("Max retries exhausted for node '{node}' after {attempts} attempts")]
    RetriesExhausted { node: String, attempts: usize },

    #[error("Run failed at node '{node}': {reason}")]
    RunFailed { node: String, reason: String },

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    // === Turn database ===
    #[error("cxdb {path}: status={status} {message}")]
    CxdbError {
        path: String,
        status: u16,
        code: Option<String>,
        message: String,
    },

    // === VCS ===
    #[error("git {operation} failed: {message}")]
    VcsError { operation: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl KilroyError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KilroyError::RateLimited { .. }
                | KilroyError::CommandTimeout { .. }
                | KilroyError::RequestTimeout { .. }
                | KilroyError::ProviderError {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KilroyError::AuthError { .. }
                | KilroyError::ValidationError(_)
                | KilroyError::ConfigError(_)
        )
    }
}

/// A convenience alias for `Result<T, KilroyError>`.
pub type Result<T> = std::result::Result<T, KilroyError>;

// ---------------------------------------------------------------------------
// StageStatus — outcome status of a pipeline node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Fail,
    Retry,
    ImplRepair,
    Skipped,
}

impl StageStatus {
    /// The lowercase string used in edge conditions and status.json files.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::PartialSuccess => "partial_success",
            StageStatus::Fail => "fail",
            StageStatus::Retry => "retry",
            StageStatus::ImplRepair => "impl_repair",
            StageStatus::Skipped => "skipped",
        }
    }

    /// Parse the status strings accepted in worker-written status.json files.
    /// Unknown strings map to `None`; callers decide how to degrade.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" | "ok" => Some(StageStatus::Success),
            "partial_success" | "partial" => Some(StageStatus::PartialSuccess),
            "fail" | "failure" | "error" => Some(StageStatus::Fail),
            "retry" => Some(StageStatus::Retry),
            "impl_repair" => Some(StageStatus::ImplRepair),
            "skipped" => Some(StageStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::PartialSuccess)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome — result of executing a node handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_next_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context_updates: HashMap<String, serde_json::Value>,
}

impl Outcome {
    /// Create a successful outcome with the given notes.
    pub fn success(notes: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            failure_reason: None,
            notes: notes.into(),
            context_updates: HashMap::new(),
        }
    }

    /// Create a failed outcome with the given reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            failure_reason: Some(reason.into()),
            notes: String::new(),
            context_updates: HashMap::new(),
        }
    }

    /// Decode a worker-written status.json payload. Tolerant of unknown status
    /// strings (mapped to `fail` with a reason) and missing optional fields;
    /// never panics on arbitrary JSON.
    pub fn decode_json(bytes: &[u8]) -> Result<Outcome> {
        let raw: serde_json::Value = serde_json::from_slice(bytes)?;
        let obj = raw
            .as_object()
            .ok_or_else(|| KilroyError::Other("status.json is not a JSON object".into()))?;

        let status_str = obj
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let status = match StageStatus::parse(status_str) {
            Some(s) => s,
            None => {
                return Ok(Outcome::fail(format!(
                    "status.json has unknown status {:?}",
                    status_str
                )))
            }
        };

        let as_string = |key: &str| -> Option<String> {
            obj.get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        let suggested_next_ids = obj
            .get("suggested_next_ids")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let context_updates = obj
            .get("context_updates")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(Outcome {
            status,
            preferred_label: as_string("preferred_label"),
            suggested_next_ids,
            failure_reason: as_string("failure_reason"),
            notes: as_string("notes").unwrap_or_default(),
            context_updates,
        })
    }
}

// ---------------------------------------------------------------------------
// Context — thread-safe key-value store for run state
// ---------------------------------------------------------------------------

/// Thread-safe key-value store shared across pipeline nodes, plus an
/// append-only log list. Values must be JSON-serializable for checkpointing.
///
/// Cloning a `Context` yields another handle to the **same** inner state.
/// Use [`clone_isolated`](Context::clone_isolated) to get a deep copy for
/// parallel branch isolation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextInner {
    values: HashMap<String, serde_json::Value>,
    logs: Vec<String>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner {
                values: HashMap::new(),
                logs: Vec::new(),
            })),
        }
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.values.insert(key.into(), value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent. Non-string JSON values render via `to_string`.
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        match self.inner.read().await.values.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => default.to_owned(),
        }
    }

    /// Append a free-form log entry.
    pub async fn append_log(&self, entry: impl Into<String>) {
        self.inner.write().await.logs.push(entry.into());
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.values.clone()
    }

    /// Copy of the log list.
    pub async fn snapshot_logs(&self) -> Vec<String> {
        self.inner.read().await.logs.clone()
    }

    /// Deep copy that is fully independent of the original context. Primitive
    /// values are copied by value; composite values go through a JSON
    /// round-trip so nested structures cannot alias across branches.
    pub async fn clone_isolated(&self) -> Context {
        let guard = self.inner.read().await;
        let mut values = HashMap::with_capacity(guard.values.len());
        for (k, v) in &guard.values {
            values.insert(k.clone(), deep_copy_value(v));
        }
        Context {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner {
                values,
                logs: guard.logs.clone(),
            })),
        }
    }

    /// Merge `updates` into the context. Existing keys not present in
    /// `updates` are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, serde_json::Value>) {
        if updates.is_empty() {
            return;
        }
        let mut guard = self.inner.write().await;
        guard.values.extend(updates);
    }

    /// Replace the entire value map and log list (checkpoint restore).
    pub async fn replace_snapshot(
        &self,
        values: HashMap<String, serde_json::Value>,
        logs: Vec<String>,
    ) {
        let mut guard = self.inner.write().await;
        guard.values = values;
        guard.logs = logs;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn deep_copy_value(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Null
        | serde_json::Value::Bool(_)
        | serde_json::Value::Number(_)
        | serde_json::Value::String(_) => v.clone(),
        composite => serde_json::to_vec(composite)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_else(|| composite.clone()),
    }
}

// ---------------------------------------------------------------------------
// Checkpoint — serializable snapshot for crash recovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub current_node: String,
    pub completed_nodes: Vec<String>,
    pub node_retries: HashMap<String, usize>,
    pub context_values: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub context_logs: Vec<String>,
    pub git_commit_sha: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Serialize this checkpoint to JSON and write it atomically to `path`
    /// (temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read a checkpoint from a JSON file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&data)?;
        Ok(checkpoint)
    }
}

// ---------------------------------------------------------------------------
// FinalOutcome — the terminal final.json record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Success,
    Fail,
    Canceled,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Success => "success",
            FinalStatus::Fail => "fail",
            FinalStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalOutcome {
    pub status: FinalStatus,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_sha: Option<String>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_provider_error() {
        let err = KilroyError::ProviderError {
            provider: "openai".into(),
            status: 500,
            message: "internal server error".into(),
            retryable: true,
        };
        assert_eq!(
            err.to_string(),
            "Provider openai returned HTTP 500: internal server error"
        );
    }

    #[test]
    fn error_display_stall_watchdog() {
        let err = KilroyError::StallWatchdog {
            node: "build".into(),
            idle_ms: 30_000,
        };
        assert!(err.to_string().contains("stall watchdog"));
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn retryable_classification() {
        assert!(KilroyError::RateLimited {
            provider: "x".into(),
            retry_after_ms: 100
        }
        .is_retryable());
        assert!(KilroyError::CommandTimeout { timeout_ms: 5000 }.is_retryable());
        assert!(!KilroyError::AuthError {
            provider: "x".into()
        }
        .is_retryable());
        assert!(!KilroyError::ProviderError {
            provider: "x".into(),
            status: 400,
            message: "bad".into(),
            retryable: false,
        }
        .is_retryable());
    }

    #[test]
    fn terminal_classification() {
        assert!(KilroyError::AuthError {
            provider: "x".into()
        }
        .is_terminal());
        assert!(KilroyError::ValidationError("bad".into()).is_terminal());
        assert!(KilroyError::ConfigError("bad".into()).is_terminal());
        assert!(!KilroyError::CommandTimeout { timeout_ms: 1 }.is_terminal());
    }

    // --- StageStatus ---

    #[test]
    fn stage_status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&StageStatus::PartialSuccess).unwrap(),
            "\"partial_success\""
        );
        assert_eq!(
            serde_json::to_string(&StageStatus::ImplRepair).unwrap(),
            "\"impl_repair\""
        );
    }

    #[test]
    fn stage_status_parse_accepts_aliases() {
        assert_eq!(StageStatus::parse("ok"), Some(StageStatus::Success));
        assert_eq!(StageStatus::parse("FAILURE"), Some(StageStatus::Fail));
        assert_eq!(
            StageStatus::parse("partial"),
            Some(StageStatus::PartialSuccess)
        );
        assert_eq!(StageStatus::parse("bogus"), None);
    }

    // --- Outcome ---

    #[test]
    fn outcome_success_constructor() {
        let o = Outcome::success("all good");
        assert_eq!(o.status, StageStatus::Success);
        assert_eq!(o.notes, "all good");
        assert!(o.preferred_label.is_none());
        assert!(o.failure_reason.is_none());
    }

    #[test]
    fn outcome_fail_constructor() {
        let o = Outcome::fail("something broke");
        assert_eq!(o.status, StageStatus::Fail);
        assert_eq!(o.failure_reason.as_deref(), Some("something broke"));
    }

    #[test]
    fn outcome_decode_json_full_payload() {
        let payload = serde_json::json!({
            "status": "partial_success",
            "preferred_label": "Approve",
            "suggested_next_ids": ["fix", "review"],
            "failure_reason": "",
            "notes": "mostly done",
            "context_updates": {"tests_passed": true}
        });
        let o = Outcome::decode_json(payload.to_string().as_bytes()).unwrap();
        assert_eq!(o.status, StageStatus::PartialSuccess);
        assert_eq!(o.preferred_label.as_deref(), Some("Approve"));
        assert_eq!(o.suggested_next_ids, vec!["fix", "review"]);
        // Empty failure_reason is normalized to None.
        assert!(o.failure_reason.is_none());
        assert_eq!(
            o.context_updates.get("tests_passed"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    #[test]
    fn outcome_decode_json_unknown_status_degrades_to_fail() {
        let o = Outcome::decode_json(br#"{"status":"exploded"}"#).unwrap();
        assert_eq!(o.status, StageStatus::Fail);
        assert!(o.failure_reason.unwrap().contains("exploded"));
    }

    #[test]
    fn outcome_decode_json_rejects_non_object() {
        assert!(Outcome::decode_json(b"[1,2,3]").is_err());
        assert!(Outcome::decode_json(b"not json").is_err());
    }

    // --- Context ---

    #[tokio::test]
    async fn context_set_and_get_round_trip() {
        let ctx = Context::new();
        ctx.set("key", serde_json::json!("hello")).await;
        assert_eq!(ctx.get("key").await, Some(serde_json::json!("hello")));
    }

    #[tokio::test]
    async fn context_get_string_returns_default_when_missing() {
        let ctx = Context::new();
        assert_eq!(ctx.get_string("missing", "fallback").await, "fallback");
    }

    #[tokio::test]
    async fn context_clone_isolated_is_independent() {
        let ctx = Context::new();
        ctx.set("nested", serde_json::json!({"list": [1, 2, 3]}))
            .await;

        let isolated = ctx.clone_isolated().await;
        isolated
            .set("nested", serde_json::json!({"list": [9]}))
            .await;
        isolated.set("extra", serde_json::json!(true)).await;

        assert_eq!(
            ctx.get("nested").await,
            Some(serde_json::json!({"list": [1, 2, 3]}))
        );
        assert_eq!(ctx.get("extra").await, None);
    }

    #[tokio::test]
    async fn context_apply_updates_merges() {
        let ctx = Context::new();
        ctx.set("keep", serde_json::json!("old")).await;
        ctx.set("overwrite", serde_json::json!("old")).await;

        let mut updates = HashMap::new();
        updates.insert("overwrite".into(), serde_json::json!("new"));
        updates.insert("added".into(), serde_json::json!("fresh"));
        ctx.apply_updates(updates).await;

        assert_eq!(ctx.get("keep").await, Some(serde_json::json!("old")));
        assert_eq!(ctx.get("overwrite").await, Some(serde_json::json!("new")));
        assert_eq!(ctx.get("added").await, Some(serde_json::json!("fresh")));
    }

    #[tokio::test]
    async fn context_replace_snapshot_resets_state() {
        let ctx = Context::new();
        ctx.set("stale", serde_json::json!(1)).await;
        ctx.append_log("before").await;

        let mut values = HashMap::new();
        values.insert("fresh".into(), serde_json::json!(2));
        ctx.replace_snapshot(values, vec!["restored".into()]).await;

        assert_eq!(ctx.get("stale").await, None);
        assert_eq!(ctx.get("fresh").await, Some(serde_json::json!(2)));
        assert_eq!(ctx.snapshot_logs().await, vec!["restored".to_string()]);
    }

    // --- Checkpoint ---

    #[test]
    fn checkpoint_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let cp = Checkpoint {
            run_id: "run-1".into(),
            current_node: "node_a".into(),
            completed_nodes: vec!["start".into()],
            node_retries: HashMap::from([("node_a".to_string(), 2)]),
            context_values: HashMap::from([("key".to_string(), serde_json::json!("val"))]),
            context_logs: vec!["started".into()],
            git_commit_sha: "abc123".into(),
            timestamp: chrono::Utc::now(),
        };

        cp.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, cp);
    }

    #[test]
    fn checkpoint_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let cp = Checkpoint {
            run_id: "r".into(),
            current_node: "n".into(),
            completed_nodes: vec![],
            node_retries: HashMap::new(),
            context_values: HashMap::new(),
            context_logs: vec![],
            git_commit_sha: String::new(),
            timestamp: chrono::Utc::now(),
        };
        cp.save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    // --- FinalOutcome ---

    #[test]
    fn final_outcome_round_trip() {
        let out = FinalOutcome {
            status: FinalStatus::Fail,
            run_id: "r9".into(),
            failure_reason: Some("all parallel branches failed".into()),
            git_commit_sha: None,
            completed_at: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains("\"status\":\"fail\""));
        let back: FinalOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, FinalStatus::Fail);
        assert_eq!(back.run_id, "r9");
    }
}
