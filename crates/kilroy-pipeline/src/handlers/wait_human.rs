//! Human gate handler (`hexagon` shape): poses a question through the
//! configured interviewer and routes on the answer.
//!
//! The interviewer trait is blocking; the handler hops through
//! `spawn_blocking` so a slow human never wedges the driver. A timeout falls
//! back to the node's `interview.default_choice` when present, else the
//! stage reports `retry`.

use std::time::Duration;

use async_trait::async_trait;

use kilroy_types::{Outcome, Result, StageStatus};

use crate::graph::PipelineNode;
use crate::handler::{Execution, Handler};
use crate::interviewer::{Question, QuestionOption, QuestionType};

pub struct WaitHumanHandler;

#[async_trait]
impl Handler for WaitHumanHandler {
    fn handler_type(&self) -> &str {
        "wait.human"
    }

    async fn execute(&self, exec: &Execution, node: &PipelineNode) -> Result<Outcome> {
        let engine = &exec.engine;

        // Outgoing edge labels become the selectable options.
        let options: Vec<QuestionOption> = engine
            .graph
            .outgoing_edges(&node.id)
            .iter()
            .filter_map(|e| e.label.clone())
            .map(|label| QuestionOption {
                key: crate::interviewer::accelerator_key(&label),
                label,
            })
            .collect();

        let question_type = if options.is_empty() {
            QuestionType::Confirm
        } else {
            QuestionType::SingleSelect
        };
        let timeout = node
            .attr_opt("interview.timeout")
            .and_then(|v| parse_timeout(&v))
            .or(node.timeout);
        let text = node
            .prompt
            .clone()
            .unwrap_or_else(|| format!("Review stage '{}' and choose how to proceed.", node.label));

        let question = Question {
            stage: node.id.clone(),
            text: text.clone(),
            question_type,
            options: options.clone(),
            default_choice: node.attr_opt("interview.default_choice"),
            timeout,
        };

        engine
            .journal
            .interview_started(&node.id, &text, question_type.as_str())
            .await;
        let started = std::time::Instant::now();

        let interviewer = engine.interviewer.clone();
        let q = question.clone();
        let answer = tokio::task::spawn_blocking(move || interviewer.ask(&q))
            .await
            .map_err(|e| kilroy_types::KilroyError::HandlerError {
                handler: "wait.human".into(),
                node: node.id.clone(),
                message: format!("interviewer task failed: {e}"),
            })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        if answer.timed_out {
            engine
                .journal
                .interview_timeout(&node.id, &text, duration_ms)
                .await;
            if let Some(default_choice) = &question.default_choice {
                return Ok(Outcome {
                    status: StageStatus::Success,
                    preferred_label: resolve_option_label(&options, default_choice),
                    suggested_next_ids: vec![],
                    failure_reason: None,
                    notes: format!("interview timed out; default choice '{default_choice}' applied"),
                    context_updates: Default::default(),
                });
            }
            let mut outcome = Outcome::success("interview timed out; stage will retry");
            outcome.status = StageStatus::Retry;
            outcome.failure_reason = Some("interview timed out".into());
            return Ok(outcome);
        }

        if answer.skipped {
            engine
                .journal
                .interview_completed(&node.id, "(skipped)", duration_ms)
                .await;
            let mut outcome = Outcome::success("interview skipped");
            outcome.status = StageStatus::Skipped;
            return Ok(outcome);
        }

        let display = answer.display_value();
        engine
            .journal
            .interview_completed(&node.id, &display, duration_ms)
            .await;

        // Map the accelerator key (or raw value) back to a full edge label
        // so routing can match it.
        let preferred_label = resolve_option_label(&options, &display)
            .or_else(|| (!display.is_empty()).then(|| display.clone()));

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label,
            suggested_next_ids: vec![],
            failure_reason: None,
            notes: format!("human answered: {display}"),
            context_updates: Default::default(),
        })
    }
}

fn parse_timeout(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(s) = raw.strip_suffix('s') {
        return s.trim().parse().ok().map(Duration::from_secs);
    }
    raw.parse().ok().map(Duration::from_secs)
}

/// Match an answer (accelerator key or full text) against the option list.
fn resolve_option_label(options: &[QuestionOption], answer: &str) -> Option<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        return None;
    }
    options
        .iter()
        .find(|o| o.key.eq_ignore_ascii_case(answer) || o.label.eq_ignore_ascii_case(answer))
        .map(|o| o.label.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{test_execution, test_execution_with_graph};
    use crate::interviewer::{Answer, QueueInterviewer};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn human_node(id: &str) -> PipelineNode {
        PipelineNode {
            id: id.to_string(),
            label: id.to_string(),
            shape: "hexagon".to_string(),
            node_type: None,
            classes: Vec::new(),
            prompt: Some("Approve the diff?".into()),
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

    const GATE_DOT: &str = r#"digraph G {
        start [shape=Mdiamond]
        gate [shape=hexagon]
        fix [shape=box]
        ship [shape=box]
        exit [shape=Msquare]
        start -> gate
        gate -> ship [label="[A] Approve"]
        gate -> fix [label="[R] Reject"]
        ship -> exit
        fix -> exit
    }"#;

    #[tokio::test]
    async fn answer_key_maps_to_edge_label() {
        let (exec, _dirs) = test_execution_with_graph(
            GATE_DOT,
            Arc::new(QueueInterviewer::new(vec![Answer {
                value: "A".into(),
                ..Default::default()
            }])),
        )
        .await;

        let outcome = WaitHumanHandler.execute(&exec, &human_node("gate")).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.preferred_label.as_deref(), Some("[A] Approve"));
    }

    #[tokio::test]
    async fn exhausted_queue_yields_skipped_stage() {
        let (exec, _dirs) =
            test_execution_with_graph(GATE_DOT, Arc::new(QueueInterviewer::new(vec![]))).await;
        let outcome = WaitHumanHandler.execute(&exec, &human_node("gate")).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn timeout_without_default_requests_retry() {
        let (exec, _dirs) = test_execution_with_graph(
            GATE_DOT,
            Arc::new(crate::interviewer::CallbackInterviewer::new(|_| Answer::timed_out())),
        )
        .await;
        let outcome = WaitHumanHandler.execute(&exec, &human_node("gate")).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Retry);
    }

    #[tokio::test]
    async fn timeout_with_default_choice_applies_it() {
        let (exec, _dirs) = test_execution_with_graph(
            GATE_DOT,
            Arc::new(crate::interviewer::CallbackInterviewer::new(|_| Answer::timed_out())),
        )
        .await;
        let mut node = human_node("gate");
        node.raw_attrs.insert(
            "interview.default_choice".into(),
            kilroy_dot::AttributeValue::String("A".into()),
        );
        let outcome = WaitHumanHandler.execute(&exec, &node).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.preferred_label.as_deref(), Some("[A] Approve"));
    }

    #[tokio::test]
    async fn confirm_without_options_uses_answer_value() {
        let (exec, _dirs) = test_execution().await;
        let mut engine = (*exec.engine).clone();
        engine.interviewer = Arc::new(QueueInterviewer::new(vec![Answer {
            value: "YES".into(),
            ..Default::default()
        }]));
        let exec = Execution {
            engine: Arc::new(engine),
            ..exec
        };
        let outcome = WaitHumanHandler.execute(&exec, &human_node("solo")).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.preferred_label.as_deref(), Some("YES"));
    }

    #[test]
    fn parse_timeout_units() {
        assert_eq!(parse_timeout("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_timeout("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_timeout("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_timeout("abc"), None);
    }
}
