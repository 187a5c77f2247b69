//! Parallel fan-out (`component` shape) and fan-in join (`tripleoctagon`).
//!
//! Each eligible edge becomes a branch with its own detached worktree, its
//! own run branch, a deep-copied context, and a branch-local logs root. The
//! join waits for all branches; when every branch fails the join outcome is
//! terminal, and context updates from successful branches merge back in
//! branch-index order (lower index wins).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kilroy_types::{Outcome, Result, StageStatus};

use crate::edge_selection::select_all_eligible_edges;
use crate::engine::{run_subgraph_until, Engine};
use crate::graph::{PipelineNode, SHAPE_FAN_IN};
use crate::handler::{Execution, Handler};
use crate::vcs::parallel_branch_name;

pub const DEFAULT_JOIN_POLICY: &str = "wait_all";
pub const DEFAULT_ERROR_POLICY: &str = "fail";

/// Per-branch record persisted to `parallel_results.json` and handed to the
/// join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchResult {
    pub branch_key: String,
    pub branch_index: usize,
    pub worktree_dir: PathBuf,
    pub logs_root: PathBuf,
    pub branch_name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Final branch context, carried in memory for the join merge; not part
    /// of the JSON record.
    #[serde(skip)]
    pub context_snapshot: HashMap<String, serde_json::Value>,
}

/// Results parked between the fan-out node and its join.
#[derive(Debug, Clone)]
pub struct ParallelJoinData {
    pub parallel_node: String,
    pub results: Vec<BranchResult>,
}

// ---------------------------------------------------------------------------
// ParallelHandler — fan-out
// ---------------------------------------------------------------------------

pub struct ParallelHandler;

#[async_trait]
impl Handler for ParallelHandler {
    fn handler_type(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, exec: &Execution, node: &PipelineNode) -> Result<Outcome> {
        let engine = &exec.engine;
        let snapshot = engine.context.snapshot().await;
        let probe = Outcome::success("fan-out");
        let eligible = select_all_eligible_edges(&engine.graph, &node.id, &probe, &snapshot);
        if eligible.is_empty() {
            return Ok(Outcome::fail(format!(
                "parallel node '{}' has no eligible branches",
                node.id
            )));
        }

        let join_policy = node.attr("parallel.join_policy", DEFAULT_JOIN_POLICY);
        let error_policy = node.attr("parallel.error_policy", DEFAULT_ERROR_POLICY);
        let branch_targets: Vec<String> = eligible.iter().map(|e| e.to.clone()).collect();
        let branch_count = branch_targets.len();

        let Some(vcs) = engine.vcs.clone() else {
            return Ok(Outcome::fail(
                "parallel fan-out requires a VCS-backed run (no repository configured)".to_string(),
            ));
        };
        let parent_sha = engine.current_sha().await;

        tracing::info!(
            node = %node.id,
            branches = branch_count,
            targets = ?branch_targets,
            "parallel fan-out"
        );
        engine
            .journal
            .parallel_started(&node.id, branch_count, &join_policy, &error_policy)
            .await;

        // All branch-started events precede any branch work.
        let mut branch_names = Vec::with_capacity(branch_count);
        for (index, _target) in branch_targets.iter().enumerate() {
            let branch_key = format!("branch-{index}");
            let branch_name = parallel_branch_name(
                &engine.options.run_branch_prefix,
                &engine.options.run_id,
                &branch_key,
            )?;
            engine
                .journal
                .parallel_branch_started(&node.id, &branch_key, index)
                .await;
            branch_names.push((branch_key, branch_name));
        }

        // Worktree checkouts go through the shared repository lock; set them
        // up sequentially, then let the branches run concurrently.
        let fanout_started = std::time::Instant::now();
        let mut tasks = Vec::with_capacity(branch_count);
        let mut setup_failures: Vec<BranchResult> = Vec::new();
        for (index, target) in branch_targets.iter().enumerate() {
            let (branch_key, branch_name) = branch_names[index].clone();
            let branch_root = exec.logs_root.join(&node.id).join(&branch_key);
            let branch_worktree = branch_root.join("worktree");
            let started = std::time::Instant::now();

            if let Err(e) = tokio::fs::create_dir_all(&branch_root).await {
                setup_failures.push(branch_failure(
                    branch_key,
                    index,
                    branch_worktree,
                    branch_root,
                    branch_name,
                    started,
                    format!("create branch logs root: {e}"),
                ));
                continue;
            }
            if let Err(e) = vcs
                .add_worktree(&branch_worktree, &parent_sha, &branch_name)
                .await
            {
                setup_failures.push(branch_failure(
                    branch_key,
                    index,
                    branch_worktree,
                    branch_root,
                    branch_name,
                    started,
                    format!("branch worktree checkout: {e}"),
                ));
                continue;
            }

            let branch_context = engine.context.clone_isolated().await;
            let branch_engine =
                Arc::new(engine.for_branch(&branch_root, &branch_worktree, branch_context));
            let target = target.clone();
            let cancel = exec.cancel.child();

            tasks.push(tokio::spawn(async move {
                let result = run_subgraph_until(
                    branch_engine.clone(),
                    target,
                    StopAt::JoinOrTerminal,
                    cancel,
                )
                .await;

                match result {
                    Ok(sub) => BranchResult {
                        branch_key,
                        branch_index: index,
                        worktree_dir: branch_worktree,
                        logs_root: branch_root,
                        branch_name,
                        status: sub.outcome.status,
                        duration_ms: started.elapsed().as_millis() as u64,
                        failure_reason: sub.outcome.failure_reason.clone(),
                        context_snapshot: branch_engine.context.snapshot().await,
                    },
                    Err(e) => branch_failure(
                        branch_key,
                        index,
                        branch_worktree,
                        branch_root,
                        branch_name,
                        started,
                        e.to_string(),
                    ),
                }
            }));
        }

        let mut results: Vec<BranchResult> = setup_failures;
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    return Ok(Outcome::fail(format!("parallel branch task panicked: {e}")))
                }
            }
        }
        results.sort_by_key(|r| r.branch_index);

        // Completion events in branch-index order, all after the work.
        for r in &results {
            engine
                .journal
                .parallel_branch_completed(
                    &node.id,
                    &r.branch_key,
                    r.branch_index,
                    r.status.as_str(),
                    r.duration_ms,
                )
                .await;
        }
        let success_count = results.iter().filter(|r| r.status.is_success()).count();
        let failure_count = results.len() - success_count;
        engine
            .journal
            .parallel_completed(
                &node.id,
                success_count,
                failure_count,
                fanout_started.elapsed().as_millis() as u64,
            )
            .await;

        // Persist per-branch outcomes for offline tools and resume checks.
        let stage_dir = exec.stage_logs_dir(&node.id);
        if let Ok(json) = serde_json::to_vec_pretty(&results) {
            let _ = std::fs::write(stage_dir.join("parallel_results.json"), json);
        }

        // Park the results for the join and point routing at it.
        let join_node = find_join_node(engine, &node.id);
        engine
            .park_parallel_results(ParallelJoinData {
                parallel_node: node.id.clone(),
                results,
            })
            .await;

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: join_node.into_iter().collect(),
            failure_reason: None,
            notes: format!("fan-out across {branch_count} branches"),
            context_updates: HashMap::new(),
        })
    }
}

fn branch_failure(
    branch_key: String,
    branch_index: usize,
    worktree_dir: PathBuf,
    logs_root: PathBuf,
    branch_name: String,
    started: std::time::Instant,
    reason: String,
) -> BranchResult {
    BranchResult {
        branch_key,
        branch_index,
        worktree_dir,
        logs_root,
        branch_name,
        status: StageStatus::Fail,
        duration_ms: started.elapsed().as_millis() as u64,
        failure_reason: Some(reason),
        context_snapshot: HashMap::new(),
    }
}

/// The join a fan-out feeds: the unique `tripleoctagon` reachable from the
/// branch targets (any branch path leads there), falling back to the only
/// join in the graph.
fn find_join_node(engine: &Engine, _parallel_node: &str) -> Option<String> {
    let joins: Vec<String> = engine
        .graph
        .nodes_in_order()
        .filter(|n| n.shape == SHAPE_FAN_IN)
        .map(|n| n.id.clone())
        .collect();
    match joins.as_slice() {
        [only] => Some(only.clone()),
        _ => joins.first().cloned(),
    }
}

/// Where a branch driver stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAt {
    /// Stop when the next node would be a fan-in join, or on a terminal.
    JoinOrTerminal,
    /// Run to a terminal node.
    Terminal,
}

// ---------------------------------------------------------------------------
// FanInHandler — join
// ---------------------------------------------------------------------------

pub struct FanInHandler;

#[async_trait]
impl Handler for FanInHandler {
    fn handler_type(&self) -> &str {
        "parallel.fan_in"
    }

    async fn execute(&self, exec: &Execution, node: &PipelineNode) -> Result<Outcome> {
        let engine = &exec.engine;
        let Some(data) = engine.take_parallel_results().await else {
            // A join with no recorded fan-out is a pass-through.
            return Ok(Outcome::success("fan-in: no parallel results to join"));
        };

        let total = data.results.len();
        let successes: Vec<&BranchResult> = data
            .results
            .iter()
            .filter(|r| r.status.is_success())
            .collect();

        tracing::info!(
            node = %node.id,
            parallel_node = %data.parallel_node,
            total,
            successes = successes.len(),
            "fan-in join"
        );

        if successes.is_empty() {
            return Ok(Outcome::fail(format!(
                "all parallel branches failed ({total}/{total})"
            )));
        }

        // Merge successful branch contexts in ascending branch index; the
        // first writer of a key wins. Two branches writing the same key at
        // the same index cannot happen (indices are unique); that case is
        // left undefined.
        let parent_snapshot = engine.context.snapshot().await;
        let mut merged: HashMap<String, serde_json::Value> = HashMap::new();
        for branch in &successes {
            for (k, v) in &branch.context_snapshot {
                if parent_snapshot.get(k) == Some(v) {
                    continue;
                }
                merged.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: vec![],
            failure_reason: None,
            notes: format!(
                "joined {} of {} branches from '{}'",
                successes.len(),
                total,
                data.parallel_node
            ),
            context_updates: merged,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::test_execution;

    fn fan_in_node(id: &str) -> PipelineNode {
        PipelineNode {
            id: id.to_string(),
            label: id.to_string(),
            shape: SHAPE_FAN_IN.to_string(),
            node_type: None,
            classes: Vec::new(),
            prompt: None,
            prompt_file: None,
            tool_command: None,
            llm_provider: None,
            llm_model: None,
            reasoning_effort: None,
            timeout: None,
            max_retries: None,
            raw_attrs: HashMap::new(),
        }
    }

    fn branch(index: usize, status: StageStatus, ctx: &[(&str, &str)]) -> BranchResult {
        BranchResult {
            branch_key: format!("branch-{index}"),
            branch_index: index,
            worktree_dir: PathBuf::from("/tmp/wt"),
            logs_root: PathBuf::from("/tmp/logs"),
            branch_name: format!("attractor/run/parallel/r1/branch-{index}"),
            status,
            duration_ms: 5,
            failure_reason: None,
            context_snapshot: ctx
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn join_all_failed_is_terminal_failure() {
        let (exec, _dirs) = test_execution().await;
        exec.engine
            .park_parallel_results(ParallelJoinData {
                parallel_node: "par".into(),
                results: vec![
                    branch(0, StageStatus::Fail, &[]),
                    branch(1, StageStatus::Fail, &[]),
                    branch(2, StageStatus::Fail, &[]),
                ],
            })
            .await;

        let outcome = FanInHandler.execute(&exec, &fan_in_node("join")).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        let reason = outcome.failure_reason.unwrap();
        assert!(reason.contains("all parallel branches failed"));
        assert!(reason.contains("3/3"));
    }

    #[tokio::test]
    async fn join_merges_lower_index_wins() {
        let (exec, _dirs) = test_execution().await;
        exec.engine
            .park_parallel_results(ParallelJoinData {
                parallel_node: "par".into(),
                results: vec![
                    branch(0, StageStatus::Success, &[("shared", "from-zero"), ("a", "1")]),
                    branch(1, StageStatus::Success, &[("shared", "from-one"), ("b", "2")]),
                    branch(2, StageStatus::Fail, &[("shared", "from-two")]),
                ],
            })
            .await;

        let outcome = FanInHandler.execute(&exec, &fan_in_node("join")).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("shared"),
            Some(&serde_json::json!("from-zero"))
        );
        assert_eq!(outcome.context_updates.get("a"), Some(&serde_json::json!("1")));
        assert_eq!(outcome.context_updates.get("b"), Some(&serde_json::json!("2")));
    }

    #[tokio::test]
    async fn join_without_fanout_is_pass_through() {
        let (exec, _dirs) = test_execution().await;
        let outcome = FanInHandler.execute(&exec, &fan_in_node("join")).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.notes.contains("no parallel results"));
    }

    #[tokio::test]
    async fn partial_success_counts_as_success() {
        let (exec, _dirs) = test_execution().await;
        exec.engine
            .park_parallel_results(ParallelJoinData {
                parallel_node: "par".into(),
                results: vec![
                    branch(0, StageStatus::Fail, &[]),
                    branch(1, StageStatus::PartialSuccess, &[("x", "y")]),
                ],
            })
            .await;

        let outcome = FanInHandler.execute(&exec, &fan_in_node("join")).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.context_updates.get("x"), Some(&serde_json::json!("y")));
    }
}
