//! The published field-tag registry for Kilroy attractor turn types.
//!
//! Every event the engine appends to the turn database is a versioned typed
//! turn. The registry bundle maps numeric field tags to field names per type
//! version; the msgpack encoder uses it to compress payload keys, and
//! consumers use the published bundle to decode them.

use std::sync::OnceLock;

use serde_json::{json, Value};

/// Registry bundle ID under which the attractor types are published.
pub const BUNDLE_ID: &str = "com.kilroy.attractor";

/// Current bundle version.
pub const BUNDLE_VERSION: u32 = 1;

/// Field layouts for version 1 of every attractor turn type. Tags are
/// 1-based in declaration order; the order is a wire contract — append new
/// fields, never renumber.
const TYPE_FIELDS: &[(&str, &[&str])] = &[
    (
        "com.kilroy.attractor.RunStarted",
        &[
            "run_id",
            "timestamp_ms",
            "repo_path",
            "base_sha",
            "run_branch",
            "logs_root",
            "worktree_dir",
            "graph_name",
            "goal",
            "graph_dot",
        ],
    ),
    (
        "com.kilroy.attractor.Prompt",
        &["run_id", "node_id", "text", "timestamp_ms"],
    ),
    (
        "com.kilroy.attractor.StageStarted",
        &["run_id", "node_id", "timestamp_ms", "handler_type"],
    ),
    (
        "com.kilroy.attractor.StageHeartbeat",
        &["run_id", "node_id", "timestamp_ms", "elapsed_s", "stdout_bytes"],
    ),
    (
        "com.kilroy.attractor.StageFinished",
        &[
            "run_id",
            "node_id",
            "timestamp_ms",
            "status",
            "preferred_label",
            "failure_reason",
            "notes",
            "suggested_next_ids",
        ],
    ),
    (
        "com.kilroy.attractor.StageFailed",
        &[
            "run_id",
            "node_id",
            "timestamp_ms",
            "failure_reason",
            "will_retry",
            "attempt",
        ],
    ),
    (
        "com.kilroy.attractor.StageRetrying",
        &["run_id", "node_id", "timestamp_ms", "attempt", "delay_ms"],
    ),
    (
        "com.kilroy.attractor.GitCheckpoint",
        &["run_id", "node_id", "status", "git_commit_sha", "timestamp_ms"],
    ),
    (
        "com.kilroy.attractor.CheckpointSaved",
        &[
            "run_id",
            "node_id",
            "timestamp_ms",
            "checkpoint_path",
            "cxdb_context_id",
            "cxdb_head_turn_id",
        ],
    ),
    (
        "com.kilroy.attractor.ParallelStarted",
        &[
            "run_id",
            "node_id",
            "timestamp_ms",
            "branch_count",
            "join_policy",
            "error_policy",
        ],
    ),
    (
        "com.kilroy.attractor.ParallelBranchStarted",
        &["run_id", "node_id", "timestamp_ms", "branch_key", "branch_index"],
    ),
    (
        "com.kilroy.attractor.ParallelBranchCompleted",
        &[
            "run_id",
            "node_id",
            "timestamp_ms",
            "branch_key",
            "branch_index",
            "status",
            "duration_ms",
        ],
    ),
    (
        "com.kilroy.attractor.ParallelCompleted",
        &[
            "run_id",
            "node_id",
            "timestamp_ms",
            "success_count",
            "failure_count",
            "duration_ms",
        ],
    ),
    (
        "com.kilroy.attractor.InterviewStarted",
        &["run_id", "node_id", "timestamp_ms", "question_text", "question_type"],
    ),
    (
        "com.kilroy.attractor.InterviewCompleted",
        &["run_id", "node_id", "timestamp_ms", "answer_value", "duration_ms"],
    ),
    (
        "com.kilroy.attractor.InterviewTimeout",
        &["run_id", "node_id", "timestamp_ms", "question_text", "duration_ms"],
    ),
    (
        "com.kilroy.attractor.RunCompleted",
        &[
            "run_id",
            "timestamp_ms",
            "final_status",
            "final_git_commit_sha",
            "cxdb_context_id",
            "cxdb_head_turn_id",
        ],
    ),
    (
        "com.kilroy.attractor.RunFailed",
        &["run_id", "timestamp_ms", "reason", "node_id", "git_commit_sha"],
    ),
];

/// The attractor registry bundle as published to
/// `PUT /v1/registry/bundles/{BUNDLE_ID}`.
pub fn registry_bundle() -> &'static Value {
    static BUNDLE: OnceLock<Value> = OnceLock::new();
    BUNDLE.get_or_init(|| {
        let mut types = serde_json::Map::new();
        for (type_id, fields) in TYPE_FIELDS {
            let mut field_map = serde_json::Map::new();
            for (idx, name) in fields.iter().enumerate() {
                field_map.insert((idx + 1).to_string(), json!({ "name": name }));
            }
            types.insert(
                type_id.to_string(),
                json!({ "versions": { "1": { "fields": field_map } } }),
            );
        }
        json!({
            "bundle_id": BUNDLE_ID,
            "bundle_version": BUNDLE_VERSION,
            "types": types,
        })
    })
}

/// Look up the `name -> tag` mapping for one type version. Unknown types or
/// versions yield an empty map (the encoder then drops all named fields).
pub fn field_tags(type_id: &str, type_version: u32) -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    let bundle = registry_bundle();
    let fields = bundle
        .get("types")
        .and_then(|t| t.get(type_id))
        .and_then(|t| t.get("versions"))
        .and_then(|v| v.get(type_version.to_string()))
        .and_then(|v| v.get("fields"))
        .and_then(|f| f.as_object());
    if let Some(fields) = fields {
        for (tag, spec) in fields {
            if let Some(name) = spec.get("name").and_then(|n| n.as_str()) {
                let name = name.trim();
                if !name.is_empty() {
                    out.insert(name.to_string(), tag.trim().to_string());
                }
            }
        }
    }
    out
}
