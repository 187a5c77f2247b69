//! Stage executor: dispatch, timeouts, stall watchdog, heartbeat, the stage
//! status contract, and the retry/escalation policy.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use kilroy_types::{KilroyError, Outcome, Result, StageStatus};

use crate::failure::{classify_failure, FailureClass};
use crate::graph::PipelineNode;
use crate::handler::Execution;

pub const STAGE_STATUS_PATH_ENV: &str = "KILROY_STAGE_STATUS_PATH";
pub const STAGE_STATUS_FALLBACK_PATH_ENV: &str = "KILROY_STAGE_STATUS_FALLBACK_PATH";
pub const STAGE_LOGS_DIR_ENV: &str = "KILROY_STAGE_LOGS_DIR";

const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRIES_BEFORE_ESCALATION: usize = 1;

// ---------------------------------------------------------------------------
// Stage status contract
// ---------------------------------------------------------------------------

/// Environment a worker process receives so it can fulfill the status
/// contract: where to write status.json, the fallback path, and the stage
/// logs directory.
pub fn stage_status_env(worktree: &Path, stage_logs_dir: &Path) -> Vec<(String, String)> {
    vec![
        (
            STAGE_STATUS_PATH_ENV.to_string(),
            worktree.join("status.json").to_string_lossy().into_owned(),
        ),
        (
            STAGE_STATUS_FALLBACK_PATH_ENV.to_string(),
            worktree
                .join(".ai")
                .join("status.json")
                .to_string_lossy()
                .into_owned(),
        ),
        (
            STAGE_LOGS_DIR_ENV.to_string(),
            stage_logs_dir.to_string_lossy().into_owned(),
        ),
    ]
}

/// Read the stage status contract: `<worktree>/status.json`, then
/// `<worktree>/.ai/status.json`, then a JSON block embedded in stdout.
/// Consumed status files are moved into the stage logs directory so a later
/// stage cannot re-read a stale report.
fn read_stage_status(worktree: &Path, stage_logs_dir: &Path, stdout_log: &Path) -> Option<Outcome> {
    for candidate in [
        worktree.join("status.json"),
        worktree.join(".ai").join("status.json"),
    ] {
        if let Ok(bytes) = std::fs::read(&candidate) {
            let parsed = Outcome::decode_json(&bytes).ok();
            let _ = std::fs::write(stage_logs_dir.join("status.json"), &bytes);
            let _ = std::fs::remove_file(&candidate);
            if parsed.is_some() {
                return parsed;
            }
        }
    }

    let stdout = std::fs::read_to_string(stdout_log).ok()?;
    extract_embedded_status(&stdout)
}

/// Find a status JSON object embedded in worker stdout: a fenced ```json
/// block first, then the last line that parses as an object with a `status`
/// key.
pub fn extract_embedded_status(stdout: &str) -> Option<Outcome> {
    if let Some(start) = stdout.find("```json") {
        let rest = &stdout[start + 7..];
        if let Some(end) = rest.find("```") {
            if let Ok(outcome) = Outcome::decode_json(rest[..end].trim().as_bytes()) {
                return Some(outcome);
            }
        }
    }
    for line in stdout.lines().rev() {
        let line = line.trim();
        if line.starts_with('{') && line.contains("\"status\"") {
            if let Ok(outcome) = Outcome::decode_json(line.as_bytes()) {
                return Some(outcome);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Timeout and retry policy resolution
// ---------------------------------------------------------------------------

/// Effective stage timeout: min of the node attribute and the global option.
/// Absent on both sides means no cap.
pub fn effective_timeout(node: &PipelineNode, global: Option<Duration>) -> Option<Duration> {
    match (node.timeout, global) {
        (Some(n), Some(g)) => Some(n.min(g)),
        (Some(n), None) => Some(n),
        (None, Some(g)) => Some(g),
        (None, None) => None,
    }
}

/// Retry budget resolution: node attribute, then the graph-level
/// `default_max_retry`, then the LLM default for codergen stages.
pub fn effective_max_retries(
    node: &PipelineNode,
    graph_default: Option<usize>,
    handler_type: &str,
    max_llm_retries: Option<usize>,
) -> usize {
    if let Some(n) = node.max_retries {
        return n;
    }
    if let Some(g) = graph_default {
        return g;
    }
    if handler_type == "codergen" {
        return max_llm_retries.unwrap_or(6);
    }
    0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderModel {
    pub provider: String,
    pub model: String,
}

/// Parse a `provider:model, provider:model` escalation chain. Entries
/// without a colon-separated pair are skipped.
pub fn parse_escalation_models(raw: &str) -> Vec<ProviderModel> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (provider, model) = entry.split_once(':')?;
            let provider = provider.trim();
            let model = model.trim();
            if provider.is_empty() || model.is_empty() {
                return None;
            }
            Some(ProviderModel {
                provider: provider.to_string(),
                model: model.to_string(),
            })
        })
        .collect()
}

/// How many retries happen before escalation starts substituting models.
pub fn retries_before_escalation(node: Option<&PipelineNode>) -> usize {
    node.and_then(|n| n.attr_opt("retry.retries_before_escalation"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_RETRIES_BEFORE_ESCALATION)
}

/// Escalation override for a given retry number (1-based), if any. Past the
/// end of the chain the last entry stays in effect.
pub fn escalation_for_retry(
    chain: &[ProviderModel],
    retry_n: usize,
    before: usize,
) -> Option<&ProviderModel> {
    if chain.is_empty() || retry_n <= before {
        return None;
    }
    let idx = (retry_n - before - 1).min(chain.len() - 1);
    chain.get(idx)
}

/// Exponential backoff with jitter: `initial * 2^(attempt-1)` plus up to
/// half of that again.
fn backoff_delay(initial_ms: u64, attempt: usize) -> Duration {
    let base = initial_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1) as u32));
    let jitter = if base == 0 {
        0
    } else {
        rand::random::<u64>() % (base / 2 + 1)
    };
    Duration::from_millis(base + jitter)
}

// ---------------------------------------------------------------------------
// execute_with_retry
// ---------------------------------------------------------------------------

/// Run a node through its handler with the full stage policy applied:
/// timeout, stall watchdog, heartbeat, status contract, retries, and
/// escalation. Handler errors become synthetic `fail` outcomes that
/// participate in routing; the error itself is logged, not propagated.
pub async fn execute_with_retry(
    exec: &Execution,
    node: &PipelineNode,
    retries: &mut HashMap<String, usize>,
) -> Result<Outcome> {
    let engine = &exec.engine;
    let handler_type = engine.registry.resolve_type(node);
    let handler = engine
        .registry
        .get(&handler_type)
        .ok_or_else(|| KilroyError::HandlerError {
            handler: handler_type.clone(),
            node: node.id.clone(),
            message: format!("no handler registered for type '{handler_type}'"),
        })?;

    engine.journal.stage_started(&node.id, &handler_type).await;

    let graph_default: Option<usize> = engine
        .graph
        .attrs
        .get("default_max_retry")
        .and_then(|v| v.as_text().parse().ok());
    let max_retries = effective_max_retries(
        node,
        graph_default,
        &handler_type,
        engine.options.max_llm_retries,
    );
    let initial_delay_ms: u64 = node
        .attr_opt("retry.backoff.initial_delay_ms")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_INITIAL_RETRY_DELAY_MS);
    let escalation_raw = node
        .attr_opt("retry.escalation.models")
        .or_else(|| engine.graph.attrs.get("retry.escalation.models").map(|v| v.as_text()))
        .unwrap_or_default();
    let escalation_chain = parse_escalation_models(&escalation_raw);
    let before_escalation = retries_before_escalation(Some(node));

    let mut attempt = 1usize;
    let final_outcome = loop {
        // Escalation substitutes the LLM provider/model on the attempt's
        // private copy of the node; the graph node stays immutable.
        let retry_n = *retries.get(&node.id).unwrap_or(&0);
        let mut attempt_node = node.clone();
        if let Some(pm) = escalation_for_retry(&escalation_chain, retry_n, before_escalation) {
            tracing::info!(
                node = %node.id,
                provider = %pm.provider,
                model = %pm.model,
                retry = retry_n,
                "escalating stage model"
            );
            attempt_node.llm_provider = Some(pm.provider.clone());
            attempt_node.llm_model = Some(pm.model.clone());
        }

        let outcome = match run_attempt(exec, handler.as_ref(), &attempt_node).await {
            AttemptResult::Completed(outcome) => outcome,
            // Stage timeout, stall watchdog, parent cancellation: the stage
            // is dead, the run aborts. Routing never sees these.
            AttemptResult::Aborted(err) => {
                let reason = err.to_string();
                finish_stage(exec, node, &Outcome::fail(reason.clone()), attempt).await;
                return Err(err);
            }
        };

        let wants_retry = match outcome.status {
            StageStatus::Retry => true,
            // A failed join is a policy verdict over branch results, not a
            // flake; re-running it cannot change the branches.
            StageStatus::Fail if handler_type == "parallel.fan_in" => false,
            StageStatus::Fail => {
                let reason = outcome.failure_reason.as_deref().unwrap_or_default();
                classify_failure(reason) == FailureClass::Transient && max_retries > 0
            }
            _ => false,
        };

        if wants_retry {
            let count = retries.entry(node.id.clone()).or_insert(0);
            *count += 1;
            let count = *count;
            if count > max_retries {
                // Exhausted budget is a terminal run failure, not a routed
                // outcome.
                let exhausted = Outcome {
                    status: StageStatus::Fail,
                    failure_reason: Some(format!(
                        "max retries exhausted for node '{}' after {} attempts: {}",
                        node.id,
                        attempt,
                        outcome.failure_reason.as_deref().unwrap_or("status=retry")
                    )),
                    ..outcome
                };
                finish_stage(exec, node, &exhausted, attempt).await;
                return Err(KilroyError::RetriesExhausted {
                    node: node.id.clone(),
                    attempts: attempt,
                });
            }

            let reason = outcome
                .failure_reason
                .clone()
                .unwrap_or_else(|| format!("stage requested retry (attempt {attempt})"));
            engine.journal.stage_failed(&node.id, &reason, true, attempt).await;
            let delay = backoff_delay(initial_delay_ms, attempt);
            engine
                .journal
                .stage_retrying(&node.id, attempt, delay.as_millis() as u64)
                .await;
            if !exec.cancel.sleep(delay).await {
                let canceled =
                    Outcome::fail(format!("canceled while waiting to retry node '{}'", node.id));
                finish_stage(exec, node, &canceled, attempt).await;
                return Err(KilroyError::Other(
                    exec.cancel
                        .reason()
                        .unwrap_or_else(|| "canceled during retry backoff".to_string()),
                ));
            }
            attempt += 1;
            continue;
        }

        break outcome;
    };

    finish_stage(exec, node, &final_outcome, attempt).await;
    Ok(final_outcome)
}

/// Persist the stage outcome and emit the terminal stage event: exactly one
/// of StageFinished / StageFailed(final) per node per run.
async fn finish_stage(exec: &Execution, node: &PipelineNode, outcome: &Outcome, attempt: usize) {
    let stage_dir = exec.stage_logs_dir(&node.id);
    if let Ok(json) = serde_json::to_vec_pretty(outcome) {
        if let Err(e) = std::fs::write(stage_dir.join("status.json"), json) {
            tracing::warn!(node = %node.id, error = %e, "stage status.json write failed");
        }
    }

    if outcome.status == StageStatus::Fail {
        exec.engine
            .journal
            .stage_failed(
                &node.id,
                outcome.failure_reason.as_deref().unwrap_or_default(),
                false,
                attempt,
            )
            .await;
    } else {
        exec.engine.journal.stage_finished(&node.id, outcome).await;
    }
}

/// What one attempt produced: a routable outcome, or an abort that must
/// surface as a run error.
enum AttemptResult {
    Completed(Outcome),
    Aborted(KilroyError),
}

/// One attempt: handler under a cancelable scope with the effective timeout,
/// a stall watchdog, and a heartbeat.
async fn run_attempt(
    exec: &Execution,
    handler: &dyn crate::handler::Handler,
    node: &PipelineNode,
) -> AttemptResult {
    let engine = &exec.engine;
    let scope = exec.cancel.child();
    let timeout = effective_timeout(node, engine.options.stage_timeout);

    let stage_dir = exec.stage_logs_dir(&node.id);
    let stdout_log = stage_dir.join("stdout.log");

    // Heartbeat: elapsed seconds and observed stdout bytes, on an interval.
    let heartbeat = {
        let engine = engine.clone();
        let node_id = node.id.clone();
        let stdout_log = stdout_log.clone();
        let scope = scope.clone();
        let interval = engine.options.heartbeat_interval;
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            loop {
                if !scope.sleep(interval).await {
                    return;
                }
                let stdout_bytes = std::fs::metadata(&stdout_log)
                    .map(|m| m.len())
                    .unwrap_or(0);
                engine
                    .journal
                    .stage_heartbeat(&node_id, started.elapsed().as_secs(), stdout_bytes)
                    .await;
            }
        })
    };

    // Stall watchdog: cancel the scope when no progress event lands for
    // longer than the configured stall timeout.
    let watchdog = engine.options.stall_timeout.map(|stall_timeout| {
        let engine = engine.clone();
        let scope = scope.clone();
        let node_id = node.id.clone();
        let check_interval = engine.options.stall_check_interval;
        tokio::spawn(async move {
            loop {
                if !scope.sleep(check_interval).await {
                    return;
                }
                let idle = engine.journal.progress().idle_for();
                if idle > stall_timeout {
                    tracing::warn!(node = %node_id, idle_ms = idle.as_millis() as u64, "stall watchdog fired");
                    scope.cancel(format!(
                        "stall watchdog: no progress for {}ms on node '{}'",
                        idle.as_millis(),
                        node_id
                    ));
                    return;
                }
            }
        })
    });

    let handler_exec = Execution {
        engine: engine.clone(),
        worktree_dir: exec.worktree_dir.clone(),
        logs_root: exec.logs_root.clone(),
        cancel: scope.clone(),
    };

    let attempt_result = {
        let work = handler.execute(&handler_exec, node);
        tokio::pin!(work);
        let timed_out = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            res = &mut work => {
                // A handler may observe the cancellation and return before
                // this select does; the abort still wins over routing.
                if scope.is_cancelled() {
                    AttemptResult::Aborted(KilroyError::Other(
                        scope.reason().unwrap_or_else(|| "execution canceled".to_string()),
                    ))
                } else {
                    match res {
                        Ok(outcome) => AttemptResult::Completed(outcome),
                        Err(e) => {
                            tracing::warn!(node = %node.id, error = %e, "handler error converted to fail outcome");
                            AttemptResult::Completed(Outcome::fail(e.to_string()))
                        }
                    }
                }
            },
            _ = timed_out => {
                let timeout_ms = timeout.unwrap_or_default().as_millis() as u64;
                scope.cancel(format!("stage timeout after {timeout_ms}ms"));
                AttemptResult::Aborted(KilroyError::StageTimeout {
                    node: node.id.clone(),
                    timeout_ms,
                })
            }
            _ = scope.cancelled() => {
                let reason = scope
                    .reason()
                    .unwrap_or_else(|| "execution canceled".to_string());
                AttemptResult::Aborted(KilroyError::Other(reason))
            }
        }
    };

    heartbeat.abort();
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    let raw_outcome = match attempt_result {
        AttemptResult::Completed(outcome) => outcome,
        aborted => return aborted,
    };

    // Stage status contract: a worker-written report overrides the handler
    // outcome; handler notes survive when the report has none.
    let merged = match read_stage_status(&exec.worktree_dir, &stage_dir, &stdout_log) {
        Some(mut reported) => {
            if reported.notes.is_empty() {
                reported.notes = raw_outcome.notes.clone();
            }
            if reported.context_updates.is_empty() {
                reported.context_updates = raw_outcome.context_updates.clone();
            }
            reported
        }
        None => raw_outcome,
    };

    AttemptResult::Completed(merged)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
