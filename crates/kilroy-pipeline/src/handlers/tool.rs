//! Tool stage handler (`parallelogram` shape): runs `tool_command` under a
//! shell in the stage worktree, captures stdout/stderr to the stage logs
//! directory, and derives the outcome from the exit status.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;

use kilroy_types::{KilroyError, Outcome, Result, StageStatus};

use crate::failure::extract_missing_executables;
use crate::graph::PipelineNode;
use crate::handler::{Execution, Handler};

pub const TOOL_STDERR_FILE: &str = "tool_stderr";

pub struct ToolHandler;

#[async_trait]
impl Handler for ToolHandler {
    fn handler_type(&self) -> &str {
        "tool"
    }

    async fn execute(&self, exec: &Execution, node: &PipelineNode) -> Result<Outcome> {
        let command = node
            .tool_command
            .clone()
            .ok_or_else(|| KilroyError::HandlerError {
                handler: "tool".into(),
                node: node.id.clone(),
                message: "missing tool_command attribute".into(),
            })?;

        tracing::info!(node = %node.id, label = %node.label, command = %command, "executing tool command");

        if exec.engine.options.dry_run {
            return Ok(dry_run_outcome(node, &command));
        }

        let stage_dir = exec.stage_logs_dir(&node.id);

        // Record the invocation for offline inspection.
        let invocation = serde_json::json!({
            "command": command,
            "shell": "sh -c",
            "workdir": exec.worktree_dir,
        });
        let _ = std::fs::write(
            stage_dir.join("cli_invocation.json"),
            serde_json::to_vec_pretty(&invocation).unwrap_or_default(),
        );

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&exec.worktree_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in exec.engine.worker_env(&exec.worktree_dir, &stage_dir) {
            cmd.env(k, v);
        }
        cmd.env_remove("CLAUDECODE");

        let started = std::time::Instant::now();
        let mut child = cmd.spawn().map_err(|e| KilroyError::HandlerError {
            handler: "tool".into(),
            node: node.id.clone(),
            message: format!("failed to spawn command: {e}"),
        })?;

        // Pump stdout/stderr into the stage logs as they arrive so the
        // heartbeat's byte counter and the live view stay current.
        let stdout_pump = pump(
            child.stdout.take(),
            stage_dir.join("stdout.log"),
            exec.engine.clone(),
        );
        let stderr_pump = pump(
            child.stderr.take(),
            stage_dir.join(TOOL_STDERR_FILE),
            exec.engine.clone(),
        );

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| KilroyError::HandlerError {
                handler: "tool".into(),
                node: node.id.clone(),
                message: format!("command wait failed: {e}"),
            })?,
            _ = exec.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let reason = exec
                    .cancel
                    .reason()
                    .unwrap_or_else(|| "tool execution canceled".to_string());
                return Ok(Outcome::fail(reason));
            }
        };

        let stdout = stdout_pump.await.unwrap_or_default();
        let stderr = stderr_pump.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = started.elapsed().as_millis() as u64;

        let _ = std::fs::write(
            stage_dir.join("cli_timing.json"),
            serde_json::to_vec_pretty(&serde_json::json!({
                "duration_ms": duration_ms,
                "exit_code": exit_code,
            }))
            .unwrap_or_default(),
        );

        tracing::info!(
            node = %node.id,
            exit_code,
            duration_ms,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "tool command completed"
        );

        let mut updates = HashMap::new();
        updates.insert(
            format!("{}.exit_code", node.id),
            serde_json::json!(exit_code),
        );
        let missing = extract_missing_executables(&stderr);
        if !missing.is_empty() {
            updates.insert("missing_executables".into(), serde_json::json!(missing));
        }

        if status.success() {
            Ok(Outcome {
                status: StageStatus::Success,
                preferred_label: None,
                suggested_next_ids: vec![],
                failure_reason: None,
                notes: truncate_for_notes(&stdout),
                context_updates: updates,
            })
        } else {
            let reason = if stderr.trim().is_empty() {
                format!("command exited with code {exit_code}")
            } else {
                format!(
                    "command exited with code {exit_code}: {}",
                    truncate_for_notes(stderr.trim())
                )
            };
            Ok(Outcome {
                status: StageStatus::Fail,
                preferred_label: None,
                suggested_next_ids: vec![],
                failure_reason: Some(reason),
                notes: truncate_for_notes(&stdout),
                context_updates: updates,
            })
        }
    }
}

fn dry_run_outcome(node: &PipelineNode, command: &str) -> Outcome {
    let mut updates = HashMap::new();
    updates.insert(format!("{}.dry_run", node.id), serde_json::json!(true));
    Outcome {
        status: StageStatus::Success,
        preferred_label: None,
        suggested_next_ids: vec![],
        failure_reason: None,
        notes: format!("dry run: command not executed: {command}"),
        context_updates: updates,
    }
}

/// Stream a child pipe into a file, touching the progress clock on every
/// chunk, and return the collected text.
fn pump(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    path: std::path::PathBuf,
    engine: std::sync::Arc<crate::engine::Engine>,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let Some(mut pipe) = pipe else {
            return String::new();
        };
        let mut collected = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    engine.journal.progress().touch();
                    if let Err(e) = std::fs::write(&path, &collected) {
                        tracing::debug!(error = %e, path = %path.display(), "stage log write failed");
                    }
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    })
}

/// Bound stdout/stderr mirrored into notes to a sane size, on a char
/// boundary.
fn truncate_for_notes(text: &str) -> String {
    const LIMIT: usize = 4096;
    if text.len() <= LIMIT {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= LIMIT)
        .last()
        .unwrap_or(0);
    format!("{}...(truncated)", &text[..cut])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
