//! `kilroy attractor review`: offline graph walker. Reports structural
//! diagnostics and cycles before a pipeline ever runs. Cycles are legal at
//! execution time (retry-restart loops, postmortem arcs); the review lists
//! them so authors can confirm each one is intentional.

use std::collections::{HashMap, HashSet};

use kilroy_pipeline::PipelineGraph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

/// Walk the graph and collect review findings: validation errors,
/// unreachable nodes, cycles, and suspicious edge conditions.
pub fn review_graph(graph: &PipelineGraph) -> Vec<Finding> {
    let mut findings = Vec::new();

    if let Err(e) = graph.validate() {
        findings.push(Finding {
            severity: Severity::Error,
            message: e.to_string(),
        });
    }

    // Reachability from the start node.
    if let Some(start) = graph.start_node() {
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack = vec![start.id.clone()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for edge in graph.outgoing_edges(&id) {
                stack.push(edge.to.clone());
            }
        }
        for node in graph.nodes_in_order() {
            if !seen.contains(&node.id) {
                findings.push(Finding {
                    severity: Severity::Warning,
                    message: format!("node '{}' is unreachable from the start node", node.id),
                });
            }
        }
    }

    // Cycle enumeration via iterative DFS coloring.
    for cycle in find_cycles(graph) {
        findings.push(Finding {
            severity: Severity::Info,
            message: format!("cycle: {}", cycle.join(" -> ")),
        });
    }

    // Conditions that cannot parse will never match at run time.
    for edge in graph.all_edges() {
        if let Some(cond) = &edge.condition {
            if kilroy_pipeline::parse_condition(cond).is_err() {
                findings.push(Finding {
                    severity: Severity::Warning,
                    message: format!(
                        "edge {} -> {} has an unparseable condition {:?}; it will never match",
                        edge.from, edge.to, cond
                    ),
                });
            }
        }
    }

    findings
}

/// Back edges found by DFS, reported as the cycle path they close.
fn find_cycles(graph: &PipelineGraph) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<String, Color> = graph
        .nodes_in_order()
        .map(|n| (n.id.clone(), Color::White))
        .collect();
    let mut cycles = Vec::new();

    fn visit(
        graph: &PipelineGraph,
        id: &str,
        color: &mut HashMap<String, Color>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        color.insert(id.to_string(), Color::Gray);
        path.push(id.to_string());
        for edge in graph.outgoing_edges(id) {
            match color.get(&edge.to).copied().unwrap_or(Color::White) {
                Color::White => visit(graph, &edge.to, color, path, cycles),
                Color::Gray => {
                    if let Some(pos) = path.iter().position(|p| p == &edge.to) {
                        let mut cycle = path[pos..].to_vec();
                        cycle.push(edge.to.clone());
                        cycles.push(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        path.pop();
        color.insert(id.to_string(), Color::Black);
    }

    let ids: Vec<String> = graph.nodes_in_order().map(|n| n.id.clone()).collect();
    for id in ids {
        if color.get(&id).copied() == Some(Color::White) {
            let mut path = Vec::new();
            visit(graph, &id, &mut color, &mut path, &mut cycles);
        }
    }
    cycles
}
