//! LLM stage handler (`box` shape): renders the prompt, invokes the
//! configured backend (API provider or worker CLI), and records the
//! exchange under the stage logs directory.
//!
//! Supported node attributes:
//!   - `prompt` / `prompt_file`: the task prompt (file paths resolve against
//!     the worktree first, then the source repo)
//!   - `llm_provider`: API provider name, or a worker CLI ("claude",
//!     "codex", "gemini"); default "claude"
//!   - `llm_model`: model override (falls back to the graph-level `model`)
//!   - `reasoning_effort`: passed through to API backends
//!
//! The worker is expected to fulfill the stage status contract
//! (`status.json` in the worktree); the executor merges that report after
//! this handler returns.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;

use kilroy_types::{KilroyError, Outcome, Result, StageStatus};

use crate::graph::{PipelineNode, SHAPE_DECISION};
use crate::handler::{Execution, Handler};

pub struct CodergenHandler;

// ---------------------------------------------------------------------------
// Worker CLI selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerCli {
    Claude,
    Codex,
    Gemini,
}

impl WorkerCli {
    fn from_provider(provider: Option<&str>) -> Self {
        match provider.map(|p| p.to_ascii_lowercase()).as_deref() {
            Some("codex") | Some("openai") => Self::Codex,
            Some("gemini") | Some("google") => Self::Gemini,
            Some("claude") | Some("anthropic") | None => Self::Claude,
            Some(other) => {
                tracing::warn!(provider = other, "unknown llm_provider, defaulting to claude CLI");
                Self::Claude
            }
        }
    }

    fn binary(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

/// Result shape from `claude -p --output-format json`.
#[derive(serde::Deserialize)]
struct ClaudeOutput {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: String,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[async_trait]
impl Handler for CodergenHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(&self, exec: &Execution, node: &PipelineNode) -> Result<Outcome> {
        let stage_dir = exec.stage_logs_dir(&node.id);

        // Refresh the stage's input closure before rendering the prompt so
        // the worker sees the per-stage manifest.
        if let Some(materializer) = &exec.engine.materializer {
            if let Err(e) = materializer
                .materialize_into(&exec.worktree_dir, Some((&node.id, &stage_dir)))
                .await
            {
                tracing::warn!(node = %node.id, error = %e, "stage input materialization failed");
            }
        }

        let prompt = render_prompt(exec, node)?;
        let _ = std::fs::write(stage_dir.join("prompt.md"), &prompt);
        exec.engine.journal.prompt(&node.id, &prompt).await;

        if exec.engine.options.dry_run {
            let mut updates = HashMap::new();
            updates.insert(format!("{}.dry_run", node.id), serde_json::json!(true));
            return Ok(Outcome {
                status: StageStatus::Success,
                preferred_label: None,
                suggested_next_ids: vec![],
                failure_reason: None,
                notes: format!("dry run: prompt not sent for node '{}'", node.id),
                context_updates: updates,
            });
        }

        // API backend when the provider is registered with the LLM client;
        // otherwise shell out to the worker CLI.
        if let (Some(client), Some(provider)) =
            (exec.engine.llm.as_ref(), node.llm_provider.as_deref())
        {
            if client.has_provider(provider) {
                let client = client.clone();
                return self.run_api(exec, node, client, provider, &prompt).await;
            }
        }
        self.run_cli(exec, node, &prompt).await
    }
}

impl CodergenHandler {
    async fn run_api(
        &self,
        exec: &Execution,
        node: &PipelineNode,
        client: std::sync::Arc<kilroy_llm::Client>,
        provider: &str,
        prompt: &str,
    ) -> Result<Outcome> {
        let stage_dir = exec.stage_logs_dir(&node.id);

        let mut request = kilroy_llm::Request::new(provider, resolve_model(exec, node));
        request.reasoning_effort = node.reasoning_effort.clone();
        request
            .messages
            .push(kilroy_llm::Message::system(status_contract_preamble(exec)));
        request.messages.push(kilroy_llm::Message::user(prompt));
        let _ = std::fs::write(
            stage_dir.join("api_request.json"),
            serde_json::to_vec_pretty(&request).unwrap_or_default(),
        );

        let response = tokio::select! {
            resp = client.complete(request) => resp,
            _ = exec.cancel.cancelled() => {
                return Ok(Outcome::fail(
                    exec.cancel.reason().unwrap_or_else(|| "llm call canceled".into()),
                ));
            }
        };

        match response {
            Ok(resp) => {
                let _ = std::fs::write(
                    stage_dir.join("api_response.json"),
                    serde_json::to_vec_pretty(&resp).unwrap_or_default(),
                );
                let _ = std::fs::write(stage_dir.join("response.md"), &resp.text);
                Ok(outcome_from_text(exec, node, &resp.text, false))
            }
            Err(e) => Ok(Outcome::fail(e.to_string())),
        }
    }

    async fn run_cli(&self, exec: &Execution, node: &PipelineNode, prompt: &str) -> Result<Outcome> {
        let cli = WorkerCli::from_provider(node.llm_provider.as_deref());
        let stage_dir = exec.stage_logs_dir(&node.id);
        let model = resolve_model(exec, node);

        let mut cmd = tokio::process::Command::new(cli.binary());
        match cli {
            WorkerCli::Claude => {
                cmd.arg("-p")
                    .arg(prompt)
                    .arg("--output-format")
                    .arg("json")
                    .arg("--dangerously-skip-permissions");
                if !model.is_empty() {
                    cmd.arg("--model").arg(&model);
                }
            }
            WorkerCli::Codex => {
                cmd.arg("--json").arg("--skip-git-repo-check");
                if !model.is_empty() {
                    cmd.arg("--model").arg(&model);
                }
                // Prompt is positional for Codex.
                cmd.arg(prompt);
            }
            WorkerCli::Gemini => {
                cmd.arg("--output-format").arg("json");
                if !model.is_empty() {
                    cmd.arg("--model").arg(&model);
                }
                cmd.arg(prompt);
            }
        }
        cmd.current_dir(&exec.worktree_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in exec.engine.worker_env(&exec.worktree_dir, &stage_dir) {
            cmd.env(k, v);
        }
        cmd.env_remove("CLAUDECODE");

        let invocation = serde_json::json!({
            "binary": cli.binary(),
            "model": model,
            "workdir": exec.worktree_dir,
        });
        let _ = std::fs::write(
            stage_dir.join("cli_invocation.json"),
            serde_json::to_vec_pretty(&invocation).unwrap_or_default(),
        );

        let started = std::time::Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KilroyError::HandlerError {
                    handler: "codergen".into(),
                    node: node.id.clone(),
                    message: format!("{}: command not found", cli.binary()),
                }
            } else {
                KilroyError::HandlerError {
                    handler: "codergen".into(),
                    node: node.id.clone(),
                    message: format!("failed to spawn {}: {e}", cli.binary()),
                }
            }
        })?;

        let output = tokio::select! {
            out = child.wait_with_output_shim() => out?,
            _ = exec.cancel.cancelled() => {
                return Ok(Outcome::fail(
                    exec.cancel.reason().unwrap_or_else(|| "worker CLI canceled".into()),
                ));
            }
        };
        let _ = std::fs::write(
            stage_dir.join("cli_timing.json"),
            serde_json::to_vec_pretty(&serde_json::json!({
                "duration_ms": started.elapsed().as_millis() as u64,
                "exit_code": output.code,
            }))
            .unwrap_or_default(),
        );
        let _ = std::fs::write(stage_dir.join("stdout.log"), &output.stdout);

        if output.stdout.trim().is_empty() {
            return Ok(Outcome::fail(format!(
                "{} produced no output: {}",
                cli.binary(),
                output.stderr.chars().take(500).collect::<String>()
            )));
        }

        let (text, is_error) = match cli {
            WorkerCli::Claude => match serde_json::from_str::<ClaudeOutput>(&output.stdout) {
                Ok(parsed) => {
                    let is_error = parsed.is_error || parsed.subtype == "error";
                    (parsed.result, is_error)
                }
                // Raw text output still counts; the status contract file is
                // the authoritative report anyway.
                Err(_) => (output.stdout.clone(), output.code != 0),
            },
            WorkerCli::Codex | WorkerCli::Gemini => (output.stdout.clone(), output.code != 0),
        };
        let _ = std::fs::write(stage_dir.join("response.md"), &text);

        Ok(outcome_from_text(exec, node, &text, is_error))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Render the stage prompt: status contract preamble, inputs contract
/// preamble when materialization is on, pipeline goal, then the node prompt
/// (inline or from file).
fn render_prompt(exec: &Execution, node: &PipelineNode) -> Result<String> {
    let body = match (&node.prompt, &node.prompt_file) {
        (Some(p), _) => p.clone(),
        (None, Some(file)) => {
            let candidates = [
                exec.worktree_dir.join(file),
                exec.engine.options.repo_path.join(file),
            ];
            let found = candidates.iter().find(|p| p.is_file());
            match found {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    return Err(KilroyError::HandlerError {
                        handler: "codergen".into(),
                        node: node.id.clone(),
                        message: format!("prompt_file not found: {file}"),
                    })
                }
            }
        }
        (None, None) => String::new(),
    };

    let mut out = String::new();
    if let Some(materializer) = &exec.engine.materializer {
        out.push_str(materializer.prompt_preamble());
        out.push_str("\n\n");
    }
    if !exec.engine.graph.goal.is_empty() {
        out.push_str(&format!("Pipeline goal: {}\n\n", exec.engine.graph.goal));
    }
    out.push_str(&format!("Task ({}): {}", node.label, body));

    // Decision nodes must end with one of the edge labels so routing can
    // extract a preferred label.
    if node.shape == SHAPE_DECISION || node.node_type.as_deref() == Some("conditional") {
        let labels: Vec<&str> = exec
            .engine
            .graph
            .outgoing_edges(&node.id)
            .iter()
            .filter_map(|e| e.label.as_deref())
            .collect();
        if !labels.is_empty() {
            out.push_str(&format!(
                "\n\nEnd your response with exactly one of these labels on its own line: {}",
                labels.join(", ")
            ));
        }
    }
    Ok(out)
}

fn status_contract_preamble(exec: &Execution) -> String {
    format!(
        "When the task is complete, write a JSON status report to {} (fallback: {}) with fields: \
         status (success|partial_success|fail|retry), notes, failure_reason, preferred_label, \
         suggested_next_ids, context_updates.",
        exec.worktree_dir.join("status.json").display(),
        exec.worktree_dir.join(".ai/status.json").display(),
    )
}

fn resolve_model(exec: &Execution, node: &PipelineNode) -> String {
    node.llm_model
        .clone()
        .or_else(|| exec.engine.graph.attrs.get("model").map(|v| v.as_text()))
        .unwrap_or_default()
}

fn outcome_from_text(exec: &Execution, node: &PipelineNode, text: &str, is_error: bool) -> Outcome {
    // Responses become run artifacts; large ones spill to disk.
    if let Err(e) = exec.engine.artifacts.store(
        &format!("{}-response", node.id),
        "response.md",
        text.as_bytes(),
    ) {
        tracing::warn!(node = %node.id, error = %e, "response artifact store failed");
    }

    let preferred_label =
        if node.shape == SHAPE_DECISION || node.node_type.as_deref() == Some("conditional") {
            let labels: Vec<String> = exec
                .engine
                .graph
                .outgoing_edges(&node.id)
                .iter()
                .filter_map(|e| e.label.clone())
                .collect();
            extract_label(text, &labels)
        } else {
            None
        };

    let mut updates = HashMap::new();
    updates.insert(
        format!("{}.result", node.id),
        serde_json::Value::String(text.to_string()),
    );

    Outcome {
        status: if is_error {
            StageStatus::Fail
        } else {
            StageStatus::Success
        },
        preferred_label,
        suggested_next_ids: vec![],
        failure_reason: if is_error {
            Some("worker returned an error".into())
        } else {
            None
        },
        notes: text.to_string(),
        context_updates: updates,
    }
}

/// Scan the response for one of the expected edge labels: the last few
/// lines first (where the prompt asked for it), then the full text.
fn extract_label(response: &str, labels: &[String]) -> Option<String> {
    for line in response.lines().rev().take(5) {
        let trimmed = line.trim();
        for label in labels {
            if trimmed.eq_ignore_ascii_case(label) {
                return Some(label.clone());
            }
        }
    }
    let upper = response.to_uppercase();
    labels
        .iter()
        .find(|label| upper.contains(&label.to_uppercase()))
        .cloned()
}

/// `wait_with_output` that keeps `kill_on_drop` semantics and surfaces both
/// streams as strings.
struct CliOutput {
    stdout: String,
    stderr: String,
    code: i32,
}

trait WaitWithOutputShim {
    async fn wait_with_output_shim(self) -> kilroy_types::Result<CliOutput>;
}

impl WaitWithOutputShim for tokio::process::Child {
    async fn wait_with_output_shim(self) -> kilroy_types::Result<CliOutput> {
        let output = self
            .wait_with_output()
            .await
            .map_err(|e| KilroyError::Other(format!("worker CLI wait failed: {e}")))?;
        Ok(CliOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
