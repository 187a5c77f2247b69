//! The dual event journal.
//!
//! Every engine event lands in the local progress journal
//! (`progress.ndjson` + `live.json`), and — when a turn-database client is
//! configured — as a typed, versioned turn appended to the run's context
//! chain. The local journal is the source of truth for offline tools; the
//! remote one for fleet-wide observation. Either may be absent without
//! affecting routing correctness, and remote append failures are logged but
//! never fail a run.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use kilroy_cxdb::AppendTurnRequest;
use kilroy_types::Outcome;

use crate::progress::ProgressJournal;

const TYPE_PREFIX: &str = "com.kilroy.attractor.";

pub struct CxdbSink {
    client: kilroy_cxdb::Client,
    context_id: String,
    head_turn_id: Mutex<String>,
}

impl CxdbSink {
    /// Create a fresh context chain for this run and publish the field-tag
    /// registry bundle (best-effort — consumers may already have it).
    pub async fn create(base_url: &str) -> kilroy_types::Result<Self> {
        let client = kilroy_cxdb::Client::new(base_url)?;
        let info = client.create_context("0").await?;
        if let Err(e) = client
            .publish_registry_bundle(kilroy_cxdb::BUNDLE_ID, kilroy_cxdb::registry_bundle())
            .await
        {
            tracing::warn!(error = %e, "registry bundle publish failed; continuing");
        }
        Ok(Self {
            client,
            context_id: info.context_id,
            head_turn_id: Mutex::new(info.head_turn_id),
        })
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn head_turn_id(&self) -> String {
        self.head_turn_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn append(&self, event: &str, data: HashMap<String, Value>) {
        let req = AppendTurnRequest {
            type_id: format!("{TYPE_PREFIX}{event}"),
            type_version: 1,
            data,
            parent_turn_id: None,
            idempotency_key: None,
        };
        match self.client.append_turn(&self.context_id, req).await {
            Ok(resp) => {
                let mut head = self.head_turn_id.lock().unwrap_or_else(|e| e.into_inner());
                *head = resp.turn_id;
            }
            Err(e) => {
                tracing::warn!(event, error = %e, "cxdb append failed; continuing");
            }
        }
    }
}

/// One journal per engine (parallel branches get their own, pointed at the
/// branch logs root but sharing the cxdb sink).
pub struct EventJournal {
    progress: ProgressJournal,
    cxdb: Option<std::sync::Arc<CxdbSink>>,
    run_id: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl EventJournal {
    pub fn new(
        progress: ProgressJournal,
        cxdb: Option<std::sync::Arc<CxdbSink>>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            progress,
            cxdb,
            run_id: run_id.into(),
        }
    }

    pub fn progress(&self) -> &ProgressJournal {
        &self.progress
    }

    pub fn cxdb(&self) -> Option<&std::sync::Arc<CxdbSink>> {
        self.cxdb.as_ref()
    }

    fn base(&self, node_id: Option<&str>) -> HashMap<String, Value> {
        let mut data = HashMap::new();
        data.insert("run_id".to_string(), json!(self.run_id));
        data.insert("timestamp_ms".to_string(), json!(now_ms()));
        if let Some(node_id) = node_id {
            data.insert("node_id".to_string(), json!(node_id));
        }
        data
    }

    /// Append to both journals. `event` is the snake_case local name; the
    /// remote type is its PascalCase counterpart.
    async fn emit(&self, local_event: &str, remote_event: Option<&str>, data: HashMap<String, Value>) {
        let map: serde_json::Map<String, Value> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.progress.append(local_event, map);
        if let (Some(sink), Some(remote)) = (&self.cxdb, remote_event) {
            sink.append(remote, data).await;
        }
    }

    // --- run boundaries ---

    pub async fn run_started(
        &self,
        repo_path: &str,
        base_sha: &str,
        run_branch: &str,
        logs_root: &str,
        worktree_dir: &str,
        graph_name: &str,
        goal: &str,
        dot_source: &str,
    ) {
        let mut data = self.base(None);
        data.insert("repo_path".to_string(), json!(repo_path));
        data.insert("base_sha".to_string(), json!(base_sha));
        data.insert("run_branch".to_string(), json!(run_branch));
        data.insert("logs_root".to_string(), json!(logs_root));
        data.insert("worktree_dir".to_string(), json!(worktree_dir));
        data.insert("graph_name".to_string(), json!(graph_name));
        data.insert("goal".to_string(), json!(goal));
        if !dot_source.is_empty() {
            data.insert("graph_dot".to_string(), json!(dot_source));
        }
        self.emit("run_started", Some("RunStarted"), data).await;
    }

    pub async fn run_completed(&self, final_sha: &str) {
        let mut data = self.base(None);
        data.insert("final_status".to_string(), json!("success"));
        data.insert("final_git_commit_sha".to_string(), json!(final_sha));
        if let Some(sink) = &self.cxdb {
            data.insert("cxdb_context_id".to_string(), json!(sink.context_id()));
            data.insert("cxdb_head_turn_id".to_string(), json!(sink.head_turn_id()));
        }
        self.emit("run_completed", Some("RunCompleted"), data).await;
    }

    pub async fn run_failed(&self, node_id: &str, sha: &str, reason: &str) {
        let mut data = self.base(Some(node_id));
        data.insert("reason".to_string(), json!(reason));
        data.insert("git_commit_sha".to_string(), json!(sha));
        self.emit("run_failed", Some("RunFailed"), data).await;
    }

    // --- stage lifecycle ---

    pub async fn prompt(&self, node_id: &str, text: &str) {
        let mut data = self.base(Some(node_id));
        data.insert("text".to_string(), json!(text));
        self.emit("prompt", Some("Prompt"), data).await;
    }

    pub async fn stage_started(&self, node_id: &str, handler_type: &str) {
        let mut data = self.base(Some(node_id));
        data.insert("handler_type".to_string(), json!(handler_type));
        self.emit("stage_started", Some("StageStarted"), data).await;
    }

    pub async fn stage_heartbeat(&self, node_id: &str, elapsed_s: u64, stdout_bytes: u64) {
        let mut data = self.base(Some(node_id));
        data.insert("elapsed_s".to_string(), json!(elapsed_s));
        data.insert("stdout_bytes".to_string(), json!(stdout_bytes));
        self.emit("stage_heartbeat", Some("StageHeartbeat"), data).await;
    }

    pub async fn stage_failed(
        &self,
        node_id: &str,
        failure_reason: &str,
        will_retry: bool,
        attempt: usize,
    ) {
        let mut data = self.base(Some(node_id));
        data.insert("failure_reason".to_string(), json!(failure_reason));
        data.insert("will_retry".to_string(), json!(will_retry));
        data.insert("attempt".to_string(), json!(attempt));
        self.emit("stage_failed", Some("StageFailed"), data).await;
    }

    pub async fn stage_retrying(&self, node_id: &str, attempt: usize, delay_ms: u64) {
        let mut data = self.base(Some(node_id));
        data.insert("attempt".to_string(), json!(attempt));
        data.insert("delay_ms".to_string(), json!(delay_ms));
        self.emit("stage_retrying", Some("StageRetrying"), data).await;
    }

    pub async fn stage_finished(&self, node_id: &str, outcome: &Outcome) {
        let mut data = self.base(Some(node_id));
        data.insert("status".to_string(), json!(outcome.status.as_str()));
        data.insert(
            "preferred_label".to_string(),
            json!(outcome.preferred_label.clone().unwrap_or_default()),
        );
        data.insert(
            "failure_reason".to_string(),
            json!(outcome.failure_reason.clone().unwrap_or_default()),
        );
        data.insert("notes".to_string(), json!(outcome.notes));
        data.insert(
            "suggested_next_ids".to_string(),
            json!(outcome.suggested_next_ids),
        );
        self.emit("stage_finished", Some("StageFinished"), data).await;
    }

    pub async fn edge_selected(&self, from_node: &str, to_node: &str, label: Option<&str>) {
        let mut data = self.base(None);
        data.insert("from_node".to_string(), json!(from_node));
        data.insert("to_node".to_string(), json!(to_node));
        data.insert("edge_label".to_string(), json!(label.unwrap_or_default()));
        self.emit("edge_selected", None, data).await;
    }

    // --- checkpoints ---

    pub async fn git_checkpoint(&self, node_id: &str, status: &str, sha: &str) {
        let mut data = self.base(Some(node_id));
        data.insert("status".to_string(), json!(status));
        data.insert("git_commit_sha".to_string(), json!(sha));
        self.emit("git_checkpoint", Some("GitCheckpoint"), data).await;
    }

    pub async fn checkpoint_saved(&self, node_id: &str, checkpoint_path: &str) {
        let mut data = self.base(Some(node_id));
        data.insert("checkpoint_path".to_string(), json!(checkpoint_path));
        if let Some(sink) = &self.cxdb {
            data.insert("cxdb_context_id".to_string(), json!(sink.context_id()));
            data.insert("cxdb_head_turn_id".to_string(), json!(sink.head_turn_id()));
        }
        self.emit("checkpoint_saved", Some("CheckpointSaved"), data)
            .await;
    }

    // --- parallel fan-out ---

    pub async fn parallel_started(
        &self,
        node_id: &str,
        branch_count: usize,
        join_policy: &str,
        error_policy: &str,
    ) {
        let mut data = self.base(Some(node_id));
        data.insert("branch_count".to_string(), json!(branch_count));
        data.insert("join_policy".to_string(), json!(join_policy));
        data.insert("error_policy".to_string(), json!(error_policy));
        self.emit("parallel_started", Some("ParallelStarted"), data)
            .await;
    }

    pub async fn parallel_branch_started(&self, node_id: &str, branch_key: &str, branch_index: usize) {
        let mut data = self.base(Some(node_id));
        data.insert("branch_key".to_string(), json!(branch_key));
        data.insert("branch_index".to_string(), json!(branch_index));
        self.emit("parallel_branch_started", Some("ParallelBranchStarted"), data)
            .await;
    }

    pub async fn parallel_branch_completed(
        &self,
        node_id: &str,
        branch_key: &str,
        branch_index: usize,
        status: &str,
        duration_ms: u64,
    ) {
        let mut data = self.base(Some(node_id));
        data.insert("branch_key".to_string(), json!(branch_key));
        data.insert("branch_index".to_string(), json!(branch_index));
        data.insert("status".to_string(), json!(status));
        data.insert("duration_ms".to_string(), json!(duration_ms));
        self.emit(
            "parallel_branch_completed",
            Some("ParallelBranchCompleted"),
            data,
        )
        .await;
    }

    pub async fn parallel_completed(
        &self,
        node_id: &str,
        success_count: usize,
        failure_count: usize,
        duration_ms: u64,
    ) {
        let mut data = self.base(Some(node_id));
        data.insert("success_count".to_string(), json!(success_count));
        data.insert("failure_count".to_string(), json!(failure_count));
        data.insert("duration_ms".to_string(), json!(duration_ms));
        self.emit("parallel_completed", Some("ParallelCompleted"), data)
            .await;
    }

    // --- manager loop ---

    pub async fn manager_loop_cycle(&self, node_id: &str, cycle: usize, max_cycles: usize) {
        let mut data = self.base(Some(node_id));
        data.insert("cycle".to_string(), json!(cycle));
        data.insert("max_cycles".to_string(), json!(max_cycles));
        self.emit("manager_loop_cycle", None, data).await;
    }

    // --- interviews ---

    pub async fn interview_started(&self, node_id: &str, question_text: &str, question_type: &str) {
        let mut data = self.base(Some(node_id));
        data.insert("question_text".to_string(), json!(question_text));
        data.insert("question_type".to_string(), json!(question_type));
        self.emit("interview_started", Some("InterviewStarted"), data)
            .await;
    }

    pub async fn interview_completed(&self, node_id: &str, answer_value: &str, duration_ms: u64) {
        let mut data = self.base(Some(node_id));
        data.insert("answer_value".to_string(), json!(answer_value));
        data.insert("duration_ms".to_string(), json!(duration_ms));
        self.emit("interview_completed", Some("InterviewCompleted"), data)
            .await;
    }

    pub async fn interview_timeout(&self, node_id: &str, question_text: &str, duration_ms: u64) {
        let mut data = self.base(Some(node_id));
        data.insert("question_text".to_string(), json!(question_text));
        data.insert("duration_ms".to_string(), json!(duration_ms));
        self.emit("interview_timeout", Some("InterviewTimeout"), data)
            .await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
