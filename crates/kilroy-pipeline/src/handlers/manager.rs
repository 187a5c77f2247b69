//! Manager loop handler (`house` shape): an observe/wait meta-stage that
//! supervises a child pipeline and evaluates a stop condition each cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use kilroy_types::{Outcome, Result, StageStatus};

use crate::condition::check_condition;
use crate::engine::{run_subgraph_until, Engine};
use crate::graph::PipelineNode;
use crate::handler::{Execution, Handler};
use crate::handlers::parallel::StopAt;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(45);
const DEFAULT_MAX_CYCLES: usize = 1000;
const DEFAULT_ACTIONS: &str = "observe,wait";

pub struct ManagerLoopHandler;

struct ChildResult {
    outcome: Outcome,
}

#[async_trait]
impl Handler for ManagerLoopHandler {
    fn handler_type(&self) -> &str {
        "stack.manager_loop"
    }

    async fn execute(&self, exec: &Execution, node: &PipelineNode) -> Result<Outcome> {
        let engine = &exec.engine;

        let poll_interval =
            parse_duration_attr(&node.attr("manager.poll_interval", ""), DEFAULT_POLL_INTERVAL);
        let mut max_cycles: usize = node
            .attr_opt("manager.max_cycles")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CYCLES);
        if max_cycles == 0 {
            max_cycles = DEFAULT_MAX_CYCLES;
        }
        let stop_condition = node.attr("manager.stop_condition", "").trim().to_string();
        let actions = parse_manager_actions(&node.attr("manager.actions", DEFAULT_ACTIONS));

        // `steer` is reserved.
        if actions.contains("steer") {
            tracing::warn!(node = %node.id, "manager_loop 'steer' action is not yet implemented");
        }

        // Child dotfile: graph attrs first, node attrs second.
        let child_dotfile = engine
            .graph
            .attrs
            .get("stack.child_dotfile")
            .map(|v| v.as_text())
            .filter(|s| !s.trim().is_empty())
            .or_else(|| node.attr_opt("stack.child_dotfile"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let autostart = node
            .attr("stack.child_autostart", "true")
            .eq_ignore_ascii_case("true");

        // Fast-fail: autostart with no child dotfile would otherwise sit in
        // the observation loop for the full cycle budget before reporting
        // anything.
        if autostart && child_dotfile.is_empty() {
            return Ok(Outcome::fail(
                "stack.child_autostart is true but stack.child_dotfile is not configured",
            ));
        }

        let child_cancel = exec.cancel.child();
        let mut child_done: Option<tokio::sync::mpsc::Receiver<ChildResult>> = None;
        if autostart && !child_dotfile.is_empty() {
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            child_done = Some(rx);
            let engine = engine.clone();
            let exec = exec.clone();
            let node_id = node.id.clone();
            let dotfile = child_dotfile.clone();
            let cancel = child_cancel.clone();
            tokio::spawn(async move {
                let result = run_child_pipeline(&engine, &exec, &dotfile, &node_id, cancel).await;
                let _ = tx.send(result).await;
            });
        }

        for cycle in 1..=max_cycles {
            if exec.cancel.is_cancelled() {
                child_cancel.cancel("manager loop canceled");
                return Ok(Outcome::fail("manager loop canceled"));
            }

            engine.journal.manager_loop_cycle(&node.id, cycle, max_cycles).await;

            // Observe: propagate the child pipeline's result when available.
            if actions.contains("observe") {
                if let Some(rx) = child_done.as_mut() {
                    if let Ok(result) = rx.try_recv() {
                        child_done = None;
                        let child_status = result.outcome.status;
                        let mut updates = HashMap::new();
                        updates.insert(
                            "stack.child.outcome".to_string(),
                            serde_json::json!(child_status.as_str()),
                        );
                        if child_status.is_success() {
                            updates.insert(
                                "stack.child.status".to_string(),
                                serde_json::json!("completed"),
                            );
                            return Ok(Outcome {
                                status: StageStatus::Success,
                                preferred_label: None,
                                suggested_next_ids: vec![],
                                failure_reason: None,
                                notes: format!(
                                    "child pipeline completed successfully at cycle {cycle}"
                                ),
                                context_updates: updates,
                            });
                        }
                        updates.insert(
                            "stack.child.status".to_string(),
                            serde_json::json!("failed"),
                        );
                        return Ok(Outcome {
                            status: StageStatus::Fail,
                            preferred_label: None,
                            suggested_next_ids: vec![],
                            failure_reason: Some(format!(
                                "child pipeline failed: {}",
                                result.outcome.failure_reason.unwrap_or_default()
                            )),
                            notes: String::new(),
                            context_updates: updates,
                        });
                    }
                }
            }

            // Stop condition over the shared context.
            if !stop_condition.is_empty() {
                let snapshot = engine.context.snapshot().await;
                let resolve = |key: &str| -> String {
                    let bare = key.strip_prefix("context.").unwrap_or(key);
                    snapshot
                        .get(bare)
                        .map(|v| match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_default()
                };
                match check_condition(&stop_condition, &resolve) {
                    Err(e) => {
                        tracing::warn!(node = %node.id, error = %e, "manager_loop stop_condition evaluation error");
                        child_cancel.cancel("invalid stop_condition");
                        return Ok(Outcome::fail(format!(
                            "invalid stop_condition {:?}: {e}",
                            stop_condition
                        )));
                    }
                    Ok(true) => {
                        child_cancel.cancel("stop condition satisfied");
                        return Ok(Outcome::success(format!(
                            "stop condition satisfied at cycle {cycle}"
                        )));
                    }
                    Ok(false) => {}
                }
            }

            if actions.contains("wait") && cycle < max_cycles {
                if !exec.cancel.sleep(poll_interval).await {
                    child_cancel.cancel("manager loop canceled during wait");
                    return Ok(Outcome::fail("manager loop canceled during wait"));
                }
            }
        }

        child_cancel.cancel("manager loop max cycles exceeded");
        Ok(Outcome::fail(format!(
            "manager loop max cycles exceeded ({max_cycles})"
        )))
    }
}

/// Comma-separated actions into a lookup set (lowercased, blanks dropped).
fn parse_manager_actions(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|a| a.trim().to_ascii_lowercase())
        .filter(|a| !a.is_empty())
        .collect()
}

fn parse_duration_attr(raw: &str, default: Duration) -> Duration {
    let raw = raw.trim();
    if raw.is_empty() {
        return default;
    }
    for (suffix, unit_ms) in [("ms", 1u64), ("s", 1000), ("m", 60_000), ("h", 3_600_000)] {
        if let Some(num) = raw.strip_suffix(suffix) {
            if let Ok(n) = num.trim().parse::<u64>() {
                return Duration::from_millis(n * unit_ms);
            }
        }
    }
    // Bare number reads as seconds.
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Load and execute a child DOT pipeline under the manager's cancel scope.
/// The dotfile resolves against the active worktree first (earlier stages
/// may generate it there), then the source repo.
async fn run_child_pipeline(
    engine: &Arc<Engine>,
    exec: &Execution,
    child_dotfile: &str,
    manager_node_id: &str,
    cancel: crate::cancel::CancelToken,
) -> ChildResult {
    let dot_path = {
        let raw = std::path::Path::new(child_dotfile);
        if raw.is_absolute() {
            raw.to_path_buf()
        } else if exec.worktree_dir.join(raw).is_file() {
            exec.worktree_dir.join(raw)
        } else {
            engine.options.repo_path.join(raw)
        }
    };

    let dot_source = match tokio::fs::read_to_string(&dot_path).await {
        Ok(s) => s,
        Err(e) => {
            return ChildResult {
                outcome: Outcome::fail(format!("read child dotfile: {e}")),
            }
        }
    };

    let child_graph = match crate::graph::build_graph(&dot_source) {
        Ok(g) => g,
        Err(e) => {
            return ChildResult {
                outcome: Outcome::fail(format!("prepare child graph: {e}")),
            }
        }
    };
    if let Err(e) = child_graph.validate() {
        return ChildResult {
            outcome: Outcome::fail(format!("prepare child graph: {e}")),
        };
    }

    let start_id = match child_graph.start_node() {
        Some(n) => n.id.clone(),
        None => {
            return ChildResult {
                outcome: Outcome::fail("child graph has no start node"),
            }
        }
    };

    let child_logs_root = exec.logs_root.join(manager_node_id).join("child");
    let _ = tokio::fs::create_dir_all(&child_logs_root).await;
    let child_context = engine.context.clone_isolated().await;
    let child_engine = Arc::new(engine.for_child_pipeline(
        Arc::new(child_graph),
        &child_logs_root,
        &exec.worktree_dir,
        child_context,
    ));

    match run_subgraph_until(child_engine, start_id, StopAt::Terminal, cancel).await {
        Ok(sub) => ChildResult {
            outcome: sub.outcome,
        },
        Err(e) => ChildResult {
            outcome: Outcome::fail(e.to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::test_execution;
    use kilroy_dot::AttributeValue;

    fn manager_node(id: &str, attrs: &[(&str, &str)]) -> PipelineNode {
        PipelineNode {
            id: id.to_string(),
            label: id.to_string(),
            shape: "house".to_string(),
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
            raw_attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), AttributeValue::String(v.to_string())))
                .collect(),
        }
    }

    #[test]
    fn parse_manager_actions_splits_and_normalizes() {
        let actions = parse_manager_actions(" Observe , wait ,, steer ");
        assert!(actions.contains("observe"));
        assert!(actions.contains("wait"));
        assert!(actions.contains("steer"));
        assert_eq!(actions.len(), 3);
    }

    #[test]
    fn parse_duration_attr_units() {
        assert_eq!(parse_duration_attr("45s", DEFAULT_POLL_INTERVAL), Duration::from_secs(45));
        assert_eq!(parse_duration_attr("250ms", DEFAULT_POLL_INTERVAL), Duration::from_millis(250));
        assert_eq!(parse_duration_attr("2m", DEFAULT_POLL_INTERVAL), Duration::from_secs(120));
        assert_eq!(parse_duration_attr("10", DEFAULT_POLL_INTERVAL), Duration::from_secs(10));
        assert_eq!(parse_duration_attr("", DEFAULT_POLL_INTERVAL), DEFAULT_POLL_INTERVAL);
        assert_eq!(parse_duration_attr("junk", DEFAULT_POLL_INTERVAL), DEFAULT_POLL_INTERVAL);
    }

    // Fast-fail invariant: autostart with no child dotfile fails immediately
    // rather than observing for the full cycle budget.
    #[tokio::test]
    async fn autostart_without_dotfile_fails_immediately() {
        let (exec, _dirs) = test_execution().await;
        let node = manager_node("mgr", &[]);

        let started = std::time::Instant::now();
        let outcome = ManagerLoopHandler.execute(&exec, &node).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome
            .failure_reason
            .unwrap()
            .contains("stack.child_dotfile is not configured"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn invalid_stop_condition_fails_with_reason() {
        let (exec, _dirs) = test_execution().await;
        let node = manager_node(
            "mgr",
            &[
                ("stack.child_autostart", "false"),
                ("manager.stop_condition", "not a condition"),
                ("manager.poll_interval", "10ms"),
            ],
        );
        let outcome = ManagerLoopHandler.execute(&exec, &node).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome.failure_reason.unwrap().contains("invalid stop_condition"));
    }

    #[tokio::test]
    async fn stop_condition_satisfied_returns_success() {
        let (exec, _dirs) = test_execution().await;
        exec.engine
            .context
            .set("workers_idle", serde_json::json!("true"))
            .await;
        let node = manager_node(
            "mgr",
            &[
                ("stack.child_autostart", "false"),
                ("manager.stop_condition", "workers_idle=true"),
                ("manager.poll_interval", "10ms"),
            ],
        );
        let outcome = ManagerLoopHandler.execute(&exec, &node).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.notes.contains("stop condition satisfied at cycle 1"));
    }

    #[tokio::test]
    async fn max_cycles_exceeded_fails() {
        let (exec, _dirs) = test_execution().await;
        let node = manager_node(
            "mgr",
            &[
                ("stack.child_autostart", "false"),
                ("manager.max_cycles", "3"),
                ("manager.poll_interval", "5ms"),
            ],
        );
        let outcome = ManagerLoopHandler.execute(&exec, &node).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome
            .failure_reason
            .unwrap()
            .contains("manager loop max cycles exceeded (3)"));
    }

    #[tokio::test]
    async fn observe_propagates_child_success() {
        let (exec, _dirs) = test_execution().await;
        // Child pipeline: a start, one quick tool stage, an exit.
        let child = r#"digraph Child {
            start [shape=Mdiamond]
            work [shape=parallelogram, tool_command="echo child-ran > child.txt"]
            exit [shape=Msquare]
            start -> work -> exit
        }"#;
        std::fs::write(exec.worktree_dir.join("child.dot"), child).unwrap();

        let node = manager_node(
            "mgr",
            &[
                ("stack.child_dotfile", "child.dot"),
                ("manager.poll_interval", "20ms"),
                ("manager.max_cycles", "200"),
            ],
        );
        let outcome = ManagerLoopHandler.execute(&exec, &node).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success, "{:?}", outcome.failure_reason);
        assert_eq!(
            outcome.context_updates.get("stack.child.status"),
            Some(&serde_json::json!("completed"))
        );
        assert!(exec.worktree_dir.join("child.txt").exists());
    }

    #[tokio::test]
    async fn observe_propagates_child_failure() {
        let (exec, _dirs) = test_execution().await;
        // The worker keeps reporting retry; with no retry budget the child
        // driver exhausts immediately and the child pipeline fails.
        let child = r#"digraph Child {
            start [shape=Mdiamond]
            work [shape=parallelogram, tool_command="echo '{\"status\":\"retry\",\"failure_reason\":\"doomed\"}' > \"$KILROY_STAGE_STATUS_PATH\""]
            exit [shape=Msquare]
            start -> work
            work -> exit [condition="outcome=success"]
        }"#;
        std::fs::write(exec.worktree_dir.join("child.dot"), child).unwrap();

        let node = manager_node(
            "mgr",
            &[
                ("stack.child_dotfile", "child.dot"),
                ("manager.poll_interval", "20ms"),
                ("manager.max_cycles", "200"),
            ],
        );
        let outcome = ManagerLoopHandler.execute(&exec, &node).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome.failure_reason.unwrap().contains("child pipeline failed"));
        assert_eq!(
            outcome.context_updates.get("stack.child.status"),
            Some(&serde_json::json!("failed"))
        );
    }
}
