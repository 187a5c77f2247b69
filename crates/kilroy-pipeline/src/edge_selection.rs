//! Edge selection: the routing cascade applied after a node completes.
//!
//! Candidate set construction:
//! 1. Outgoing edges in declaration order.
//! 2. Condition filter — if any condition evaluates true, the conditional
//!    winners are the candidate set.
//! 3. Conditional-failure fallback — with only conditional edges and no
//!    match, ALL outgoing edges become candidates; with a mix, the
//!    unconditional subset does.
//! 4. Preferred-label narrowing searches ALL outgoing edges, not just the
//!    current candidates.
//! 5. Suggested-next-ID narrowing likewise searches ALL outgoing edges.
//!
//! [`best_edge`] then breaks ties: weight descending (missing = 0), target
//! ID lexically ascending, declaration order ascending. It panics on empty
//! input — callers guard.

use std::collections::HashMap;

use kilroy_types::Outcome;

use crate::condition::check_condition;
use crate::graph::{PipelineEdge, PipelineGraph};

/// Build the resolver used for edge conditions from a stage outcome and a
/// context snapshot. `outcome` and `preferred_label` come from the outcome;
/// `context.<key>` and bare keys read the snapshot.
pub fn outcome_resolver<'a>(
    outcome: &'a Outcome,
    snapshot: &'a HashMap<String, serde_json::Value>,
) -> impl Fn(&str) -> String + 'a {
    move |key: &str| match key {
        "outcome" => outcome.status.as_str().to_string(),
        "preferred_label" => outcome.preferred_label.clone().unwrap_or_default(),
        _ => {
            let bare = key.strip_prefix("context.").unwrap_or(key);
            snapshot
                .get(bare)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        }
    }
}

/// Steps 1–5: compute the candidate edge set for a completed node.
pub fn select_edges<'a>(
    graph: &'a PipelineGraph,
    from_node_id: &str,
    outcome: &Outcome,
    resolve: &dyn Fn(&str) -> String,
) -> Vec<&'a PipelineEdge> {
    let edges: Vec<&PipelineEdge> = graph.outgoing_edges(from_node_id).iter().collect();
    if edges.is_empty() {
        return edges;
    }

    // Step 2: conditional winners. A condition that fails to parse counts
    // as not matching rather than aborting routing.
    let conditional_winners: Vec<&PipelineEdge> = edges
        .iter()
        .copied()
        .filter(|e| {
            e.condition
                .as_deref()
                .is_some_and(|cond| check_condition(cond, resolve).unwrap_or(false))
        })
        .collect();

    let mut candidates: Vec<&PipelineEdge> = if !conditional_winners.is_empty() {
        conditional_winners
    } else {
        // Step 3: fallback. All-conditional and nothing matched: every edge
        // stays in play and the tiebreak picks the fallback. Mixed: the
        // unconditional subset.
        let unconditional: Vec<&PipelineEdge> = edges
            .iter()
            .copied()
            .filter(|e| e.condition.is_none())
            .collect();
        if unconditional.is_empty() {
            edges.clone()
        } else {
            unconditional
        }
    };

    // Step 4: preferred-label narrowing over ALL outgoing edges.
    if let Some(preferred) = outcome
        .preferred_label
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let want = normalize_label(preferred);
        let matches: Vec<&PipelineEdge> = edges
            .iter()
            .copied()
            .filter(|e| {
                e.label.as_deref().is_some_and(|l| {
                    let have = normalize_label(l);
                    have == want || have.contains(&want)
                })
            })
            .collect();
        if !matches.is_empty() {
            candidates = matches;
        }
    }

    // Step 5: suggested-next-ID narrowing over ALL outgoing edges.
    if !outcome.suggested_next_ids.is_empty() {
        let matches: Vec<&PipelineEdge> = edges
            .iter()
            .copied()
            .filter(|e| outcome.suggested_next_ids.iter().any(|id| *id == e.to))
            .collect();
        if !matches.is_empty() {
            candidates = matches;
        }
    }

    candidates
}

/// The full candidate set (used by parallel fan-out).
pub fn select_all_eligible_edges<'a>(
    graph: &'a PipelineGraph,
    from_node_id: &str,
    outcome: &Outcome,
    snapshot: &HashMap<String, serde_json::Value>,
) -> Vec<&'a PipelineEdge> {
    let resolve = outcome_resolver(outcome, snapshot);
    select_edges(graph, from_node_id, outcome, &resolve)
}

/// Candidate set reduced to a single edge by the tiebreak, or `None` when
/// the node has no outgoing edges.
pub fn select_next_edge<'a>(
    graph: &'a PipelineGraph,
    from_node_id: &str,
    outcome: &Outcome,
    snapshot: &HashMap<String, serde_json::Value>,
) -> Option<&'a PipelineEdge> {
    let candidates = select_all_eligible_edges(graph, from_node_id, outcome, snapshot);
    if candidates.is_empty() {
        return None;
    }
    Some(best_edge(&candidates))
}

/// Tiebreak: weight descending (missing = 0), then `to` lexically
/// ascending, then declaration order ascending.
///
/// # Panics
/// Panics on an empty slice; that is a caller bug, and callers guard.
pub fn best_edge<'a>(edges: &[&'a PipelineEdge]) -> &'a PipelineEdge {
    assert!(!edges.is_empty(), "best_edge called with no edges");
    let mut sorted: Vec<&PipelineEdge> = edges.to_vec();
    sorted.sort_by(|a, b| {
        b.weight_or_zero()
            .cmp(&a.weight_or_zero())
            .then_with(|| a.to.cmp(&b.to))
            .then_with(|| a.order.cmp(&b.order))
    });
    sorted[0]
}

/// Normalize a label for comparison: trim, lowercase, strip accelerator
/// prefixes like `[Y] `, `Y) `, `Y- `.
fn normalize_label(label: &str) -> String {
    let s = label.trim().to_lowercase();
    regex_accelerator()
        .replace(&s, "")
        .trim()
        .to_string()
}

fn regex_accelerator() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^(?:\[\w\]\s*|\w\)\s*|\w-\s*)").unwrap())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
