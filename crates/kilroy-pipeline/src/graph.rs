//! Typed pipeline graph built from the parsed DOT AST.
//!
//! Nodes are immutable once the graph is built; the engine only reads them.
//! Edges keep their declaration order, which is the final tiebreak in edge
//! selection.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use kilroy_dot::{AttributeValue, DotGraph, EdgeDef, NodeDef};
use kilroy_types::{KilroyError, Result};

/// Shape markers that drive handler dispatch.
pub const SHAPE_START: &str = "Mdiamond";
pub const SHAPE_EXIT: &str = "Msquare";
pub const SHAPE_LLM: &str = "box";
pub const SHAPE_TOOL: &str = "parallelogram";
pub const SHAPE_PARALLEL: &str = "component";
pub const SHAPE_FAN_IN: &str = "tripleoctagon";
pub const SHAPE_DECISION: &str = "diamond";
pub const SHAPE_MANAGER_LOOP: &str = "house";
pub const SHAPE_WAIT_HUMAN: &str = "hexagon";

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub name: String,
    pub goal: String,
    pub attrs: HashMap<String, AttributeValue>,
    nodes: HashMap<String, PipelineNode>,
    node_order: Vec<String>,
    edges: Vec<PipelineEdge>,
    /// node_id -> (start, count) into `edges`; edges are stably sorted by
    /// `from` so each node's outgoing edges are contiguous and keep their
    /// declaration order.
    adjacency: HashMap<String, (usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: String,
    pub label: String,
    pub shape: String,
    pub node_type: Option<String>,
    pub classes: Vec<String>,
    pub prompt: Option<String>,
    pub prompt_file: Option<String>,
    pub tool_command: Option<String>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<usize>,
    pub raw_attrs: HashMap<String, AttributeValue>,
}

impl PipelineNode {
    /// Textual attribute lookup with a default, over the merged attribute set.
    pub fn attr(&self, key: &str, default: &str) -> String {
        self.raw_attrs
            .get(key)
            .map(|v| v.as_text())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn attr_opt(&self, key: &str) -> Option<String> {
        self.raw_attrs.get(key).map(|v| v.as_text())
    }

    pub fn is_start(&self) -> bool {
        self.shape == SHAPE_START
    }

    pub fn is_terminal(&self) -> bool {
        self.shape == SHAPE_EXIT
    }
}

#[derive(Debug, Clone)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    /// Declaration order, monotonic across the graph.
    pub order: usize,
    pub label: Option<String>,
    pub condition: Option<String>,
    /// Missing weight behaves exactly like an explicit 0.
    pub weight: Option<i64>,
    pub loop_restart: bool,
}

impl PipelineEdge {
    pub fn weight_or_zero(&self) -> i64 {
        self.weight.unwrap_or(0)
    }
}

// --- Attribute extraction helpers ---

fn get_string_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    attrs.get(key).map(|v| v.as_text()).filter(|s| !s.is_empty())
}

fn get_bool_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<bool> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Boolean(b) => Some(*b),
        AttributeValue::String(s) => Some(s == "true"),
        _ => None,
    })
}

fn get_int_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Integer(i) => Some(*i),
        AttributeValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn get_duration_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<Duration> {
    attrs.get(key).and_then(|v| match v {
        AttributeValue::Duration(d) => Some(*d),
        AttributeValue::Integer(i) if *i >= 0 => Some(Duration::from_secs(*i as u64)),
        _ => None,
    })
}

// --- Conversions ---

fn node_def_to_pipeline_node(
    id: &str,
    node_def: &NodeDef,
    graph_defaults: &HashMap<String, AttributeValue>,
    subgraph_class: Option<&str>,
) -> PipelineNode {
    // Layer defaults below explicit node attrs.
    let mut attrs = graph_defaults.clone();
    attrs.extend(node_def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    let shape = get_string_attr(&attrs, "shape").unwrap_or_else(|| SHAPE_LLM.to_string());
    let label = get_string_attr(&attrs, "label").unwrap_or_else(|| id.to_string());
    let mut classes: Vec<String> = get_string_attr(&attrs, "class")
        .map(|s| s.split_whitespace().map(String::from).collect())
        .unwrap_or_default();
    // A subgraph label becomes an implicit class on contained nodes.
    if let Some(sg_class) = subgraph_class {
        if !sg_class.is_empty() && !classes.iter().any(|c| c == sg_class) {
            classes.push(sg_class.to_string());
        }
    }

    PipelineNode {
        id: id.to_string(),
        label,
        shape,
        node_type: get_string_attr(&attrs, "type"),
        classes,
        prompt: get_string_attr(&attrs, "prompt"),
        prompt_file: get_string_attr(&attrs, "prompt_file"),
        tool_command: get_string_attr(&attrs, "tool_command"),
        llm_provider: get_string_attr(&attrs, "llm_provider"),
        llm_model: get_string_attr(&attrs, "llm_model"),
        reasoning_effort: get_string_attr(&attrs, "reasoning_effort"),
        timeout: get_duration_attr(&attrs, "timeout"),
        max_retries: get_int_attr(&attrs, "max_retries").map(|v| v.max(0) as usize),
        raw_attrs: attrs,
    }
}

fn edge_def_to_pipeline_edge(edge_def: &EdgeDef, order: usize) -> PipelineEdge {
    PipelineEdge {
        from: edge_def.from.clone(),
        to: edge_def.to.clone(),
        order,
        label: get_string_attr(&edge_def.attrs, "label"),
        condition: get_string_attr(&edge_def.attrs, "condition"),
        weight: get_int_attr(&edge_def.attrs, "weight"),
        loop_restart: get_bool_attr(&edge_def.attrs, "loop_restart").unwrap_or(false),
    }
}

impl PipelineGraph {
    pub fn from_dot(graph: DotGraph) -> Result<Self> {
        let mut nodes = HashMap::new();
        let mut node_order = Vec::new();
        let mut all_edges = Vec::new();
        let mut order = 0usize;

        let mut insert_node = |nodes: &mut HashMap<String, PipelineNode>,
                               node_order: &mut Vec<String>,
                               pn: PipelineNode| {
            if !nodes.contains_key(&pn.id) {
                node_order.push(pn.id.clone());
            }
            nodes.insert(pn.id.clone(), pn);
        };

        for id in &graph.node_order {
            if let Some(node_def) = graph.nodes.get(id) {
                let pn = node_def_to_pipeline_node(id, node_def, &graph.node_defaults, None);
                insert_node(&mut nodes, &mut node_order, pn);
            }
        }

        for sg in &graph.subgraphs {
            let sg_class = sg
                .attrs
                .get("label")
                .map(|v| v.as_text())
                .filter(|s| !s.is_empty());
            for id in &sg.node_order {
                if let Some(node_def) = sg.nodes.get(id) {
                    let pn = node_def_to_pipeline_node(
                        id,
                        node_def,
                        &graph.node_defaults,
                        sg_class.as_deref(),
                    );
                    insert_node(&mut nodes, &mut node_order, pn);
                }
            }
        }

        for edge_def in &graph.edges {
            all_edges.push(edge_def_to_pipeline_edge(edge_def, order));
            order += 1;
        }
        for sg in &graph.subgraphs {
            for edge_def in &sg.edges {
                all_edges.push(edge_def_to_pipeline_edge(edge_def, order));
                order += 1;
            }
        }

        // Stable sort by `from` keeps declaration order within each node.
        all_edges.sort_by(|a, b| a.from.cmp(&b.from));

        let mut adjacency: HashMap<String, (usize, usize)> = HashMap::new();
        let mut i = 0;
        while i < all_edges.len() {
            let start = i;
            let from = all_edges[i].from.clone();
            while i < all_edges.len() && all_edges[i].from == from {
                i += 1;
            }
            adjacency.insert(from, (start, i - start));
        }

        let goal = get_string_attr(&graph.attrs, "goal").unwrap_or_default();

        Ok(PipelineGraph {
            name: graph.name,
            goal,
            attrs: graph.attrs,
            nodes,
            node_order,
            edges: all_edges,
            adjacency,
        })
    }

    /// Structural validation per the graph invariants: exactly one start
    /// node, at least one terminal, every non-terminal has an outgoing edge,
    /// and every edge endpoint exists. Returned before any side effect.
    pub fn validate(&self) -> Result<()> {
        let starts: Vec<_> = self
            .nodes_in_order()
            .filter(|n| n.is_start())
            .map(|n| n.id.clone())
            .collect();
        if starts.is_empty() {
            return Err(KilroyError::ValidationError(
                "graph has no start node (shape=Mdiamond)".into(),
            ));
        }
        if starts.len() > 1 {
            return Err(KilroyError::ValidationError(format!(
                "graph has {} start nodes ({}); expected exactly one",
                starts.len(),
                starts.join(", ")
            )));
        }

        if !self.nodes.values().any(|n| n.is_terminal()) {
            return Err(KilroyError::ValidationError(
                "graph has no terminal node (shape=Msquare)".into(),
            ));
        }

        let ids: HashSet<&str> = self.nodes.keys().map(String::as_str).collect();
        for edge in &self.edges {
            if !ids.contains(edge.from.as_str()) {
                return Err(KilroyError::ValidationError(format!(
                    "edge {} -> {} references unknown source node",
                    edge.from, edge.to
                )));
            }
            if !ids.contains(edge.to.as_str()) {
                return Err(KilroyError::ValidationError(format!(
                    "edge {} -> {} references unknown target node",
                    edge.from, edge.to
                )));
            }
        }

        for node in self.nodes.values() {
            if !node.is_terminal() && self.outgoing_edges(&node.id).is_empty() {
                return Err(KilroyError::ValidationError(format!(
                    "non-terminal node '{}' has no outgoing edge",
                    node.id
                )));
            }
        }

        Ok(())
    }

    /// The unique entry node (shape == Mdiamond).
    pub fn start_node(&self) -> Option<&PipelineNode> {
        self.nodes_in_order().find(|n| n.is_start())
    }

    /// A terminal node (shape == Msquare).
    pub fn exit_node(&self) -> Option<&PipelineNode> {
        self.nodes_in_order().find(|n| n.is_terminal())
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[PipelineEdge] {
        match self.adjacency.get(node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    /// Nodes in first-declared order.
    pub fn nodes_in_order(&self) -> impl Iterator<Item = &PipelineNode> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }
}

/// Parse DOT source and build the typed graph in one step.
pub fn build_graph(dot_source: &str) -> Result<PipelineGraph> {
    let parsed = kilroy_dot::parse(dot_source)?;
    PipelineGraph::from_dot(parsed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_and_build(dot: &str) -> PipelineGraph {
        build_graph(dot).unwrap()
    }

    #[test]
    fn from_dot_simple_linear_pipeline() {
        let pg = parse_and_build(
            r#"digraph Pipeline {
            start [shape=Mdiamond]
            process [label="Process Data"]
            done [shape=Msquare]
            start -> process -> done
        }"#,
        );

        assert_eq!(pg.name, "Pipeline");
        assert_eq!(pg.all_edges().len(), 2);
        assert_eq!(pg.node("process").unwrap().label, "Process Data");
        assert!(pg.validate().is_ok());
    }

    #[test]
    fn start_and_exit_nodes_found_by_shape() {
        let pg = parse_and_build(
            r#"digraph G {
            begin [shape=Mdiamond]
            work [shape=box]
            finish [shape=Msquare]
            begin -> work -> finish
        }"#,
        );
        assert_eq!(pg.start_node().unwrap().id, "begin");
        assert_eq!(pg.exit_node().unwrap().id, "finish");
    }

    #[test]
    fn outgoing_edges_keep_declaration_order() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            exit [shape=Msquare]
            a [shape=box]
            start -> a
            a -> exit [label="first"]
            a -> exit [label="second"]
        }"#,
        );
        let edges = pg.outgoing_edges("a");
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].label.as_deref(), Some("first"));
        assert_eq!(edges[1].label.as_deref(), Some("second"));
        assert!(edges[0].order < edges[1].order);
    }

    #[test]
    fn typed_attribute_extraction() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            exit [shape=Msquare]
            step [shape=box, max_retries=3, timeout=30s, llm_provider=openai, llm_model=gpt-5.2, prompt="do it"]
            start -> step -> exit
        }"#,
        );
        let node = pg.node("step").unwrap();
        assert_eq!(node.max_retries, Some(3));
        assert_eq!(node.timeout, Some(Duration::from_secs(30)));
        assert_eq!(node.llm_provider.as_deref(), Some("openai"));
        assert_eq!(node.llm_model.as_deref(), Some("gpt-5.2"));
        assert_eq!(node.prompt.as_deref(), Some("do it"));
        assert_eq!(node.max_retries, Some(3));
    }

    #[test]
    fn subgraph_label_becomes_class() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            exit [shape=Msquare]
            start -> a
            subgraph cluster_review {
                label = "review"
                a -> b
            }
            b -> exit
        }"#,
        );
        assert!(pg.node("a").unwrap().classes.contains(&"review".to_string()));
        assert!(pg.node("b").unwrap().classes.contains(&"review".to_string()));
    }

    #[test]
    fn edge_weight_condition_and_loop_restart() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            exit [shape=Msquare]
            a [shape=box]
            start -> a
            a -> exit [weight=5, condition="outcome=success", loop_restart=true]
        }"#,
        );
        let edges = pg.outgoing_edges("a");
        assert_eq!(edges[0].weight, Some(5));
        assert_eq!(edges[0].weight_or_zero(), 5);
        assert_eq!(edges[0].condition.as_deref(), Some("outcome=success"));
        assert!(edges[0].loop_restart);
    }

    #[test]
    fn missing_weight_reads_as_zero() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            exit [shape=Msquare]
            start -> exit
        }"#,
        );
        assert_eq!(pg.outgoing_edges("start")[0].weight, None);
        assert_eq!(pg.outgoing_edges("start")[0].weight_or_zero(), 0);
    }

    #[test]
    fn default_shape_is_box() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            exit [shape=Msquare]
            plain -> exit
            start -> plain
        }"#,
        );
        assert_eq!(pg.node("plain").unwrap().shape, "box");
    }

    #[test]
    fn nodes_in_order_matches_declaration() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            zeta [shape=box]
            alpha [shape=box]
            exit [shape=Msquare]
            start -> zeta -> alpha -> exit
        }"#,
        );
        let ids: Vec<_> = pg.nodes_in_order().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["start", "zeta", "alpha", "exit"]);
    }

    // --- validation ---

    #[test]
    fn validate_requires_exactly_one_start() {
        let pg = parse_and_build(
            r#"digraph G {
            a [shape=Mdiamond]
            b [shape=Mdiamond]
            exit [shape=Msquare]
            a -> exit
            b -> exit
        }"#,
        );
        let err = pg.validate().unwrap_err();
        assert!(err.to_string().contains("start nodes"));

        let pg2 = parse_and_build(
            r#"digraph G {
            a [shape=box]
            exit [shape=Msquare]
            a -> exit
        }"#,
        );
        assert!(pg2.validate().unwrap_err().to_string().contains("no start node"));
    }

    #[test]
    fn validate_requires_terminal_node() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            a [shape=box]
            start -> a
            a -> start
        }"#,
        );
        assert!(pg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("no terminal node"));
    }

    #[test]
    fn validate_requires_outgoing_edge_on_non_terminal() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            stuck [shape=box]
            exit [shape=Msquare]
            start -> exit
            stuck [label="dangling"]
        }"#,
        );
        let err = pg.validate().unwrap_err();
        assert!(err.to_string().contains("no outgoing edge"));
        assert!(err.to_string().contains("stuck"));
    }

    #[test]
    fn validate_accepts_cycles() {
        let pg = parse_and_build(
            r#"digraph G {
            start [shape=Mdiamond]
            a [shape=box]
            b [shape=box]
            exit [shape=Msquare]
            start -> a
            a -> b
            b -> a [label="loop back"]
            b -> exit
        }"#,
        );
        assert!(pg.validate().is_ok());
    }
}
