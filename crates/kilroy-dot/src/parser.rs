use std::collections::HashMap;

use winnow::ascii::multispace0;
use winnow::combinator::{alt, opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;
use crate::duration_serde::parse_duration_str;

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Strip `//` line comments and `/* */` block comments from the input.
/// Newlines are preserved so error positions keep their line numbers, and
/// quoted strings are copied verbatim (a `//` inside quotes is content).
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '"' => {
                out.push('"');
                let mut escaped = false;
                for c in chars.by_ref() {
                    out.push(c);
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        break;
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Whitespace consumer (including newlines).
fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse an identifier: `[A-Za-z_][A-Za-z0-9_]*`. ASCII only; Unicode
/// identifiers do not match and surface as parse errors.
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Parse a qualified id: identifier ( '.' identifier )* as one dotted string.
/// Attribute keys like `manager.poll_interval` use this form.
fn qualified_or_plain_id(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    if rest.is_empty() {
        Ok(first.to_string())
    } else {
        let mut s = first.to_string();
        for part in rest {
            s.push('.');
            s.push_str(part);
        }
        Ok(s)
    }
}

/// Parse a double-quoted string. Multi-line content is allowed. `\"` embeds a
/// quote; every other backslash escape is retained literally as the two
/// characters, so `\n` stays `\` + `n` for the caller to interpret (or not).
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any
            .parse_next(input)
            .map_err(|_: ErrMode<ContextError<StrContext>>| {
                make_cut_error("closing '\"' for string value")
            })?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any
                    .parse_next(input)
                    .map_err(|_: ErrMode<ContextError<StrContext>>| {
                        make_cut_error("escape character after '\\'")
                    })?;
                if esc == '"' {
                    s.push('"');
                } else {
                    s.push('\\');
                    s.push(esc);
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Classify a bare (unquoted) value token as boolean, integer, float,
/// duration, or plain string. Bare tokens may contain dots, dashes, and plus
/// signs (`gpt-5.2`, `claude-opus-4-6`), which is why classification happens
/// after taking the whole token.
fn bare_value(input: &mut &str) -> ModalResult<AttributeValue> {
    let token: &str = take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+')
    })
    .parse_next(input)?;

    if token == "true" {
        return Ok(AttributeValue::Boolean(true));
    }
    if token == "false" {
        return Ok(AttributeValue::Boolean(false));
    }
    if let Ok(i) = token.parse::<i64>() {
        return Ok(AttributeValue::Integer(i));
    }
    if token.contains('.') {
        if let Ok(f) = token.parse::<f64>() {
            return Ok(AttributeValue::Float(f));
        }
    }
    if token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        if let Ok(d) = parse_duration_str(token) {
            return Ok(AttributeValue::Duration(d));
        }
    }
    Ok(AttributeValue::String(token.to_string()))
}

/// Parse an attribute value: quoted string or bare token.
fn attr_value(input: &mut &str) -> ModalResult<AttributeValue> {
    alt((quoted_string.map(AttributeValue::String), bare_value)).parse_next(input)
}

/// Parse a single attribute: key '=' value.
fn attr(input: &mut &str) -> ModalResult<(String, AttributeValue)> {
    let key = qualified_or_plain_id.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = attr_value
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute value",
        )))
        .parse_next(input)?;
    Ok((key, value))
}

/// Parse an attribute block: '[' attr ( (','|';') attr )* ']'.
/// The separator is required; two attributes with nothing but whitespace
/// between them are a parse error. A trailing separator before ']' is fine.
fn attr_block(input: &mut &str) -> ModalResult<HashMap<String, AttributeValue>> {
    let _ = '['.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let mut attrs = HashMap::new();
    if let Some(first) = opt(attr).parse_next(input)? {
        attrs.insert(first.0, first.1);
        loop {
            let _ = ws.parse_next(input)?;
            if input.starts_with(']') {
                break;
            }
            if opt(alt((',', ';'))).parse_next(input)?.is_none() {
                return Err(make_cut_error(
                    "',' between attributes or ']' closing the attribute list",
                ));
            }
            let _ = ws.parse_next(input)?;
            if input.starts_with(']') {
                break;
            }
            let a = attr
                .parse_next(input)
                .map_err(|_: ErrMode<ContextError<StrContext>>| {
                    make_cut_error("attribute after separator")
                })?;
            attrs.insert(a.0, a.1);
        }
    }

    let _ = ws.parse_next(input)?;
    let _ = ']'.parse_next(input)?;
    Ok(attrs)
}

/// Intermediate representation of a parsed statement, before the merge into
/// a DotGraph.
enum Statement {
    GraphAttrs(HashMap<String, AttributeValue>),
    NodeDefaults(HashMap<String, AttributeValue>),
    EdgeDefaults(HashMap<String, AttributeValue>),
    Node(String, HashMap<String, AttributeValue>),
    Edge(Vec<String>, HashMap<String, AttributeValue>),
    Subgraph(Option<String>, Vec<Statement>),
    GraphAttrDecl(String, AttributeValue),
}

/// Parse 'graph' '[' ... ']' ';'?
fn graph_attr_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("graph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let attrs = attr_block.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::GraphAttrs(attrs))
}

/// Parse 'node' '[' ... ']' ';'?
fn node_defaults_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("node").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let attrs = attr_block.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::NodeDefaults(attrs))
}

/// Parse 'edge' '[' ... ']' ';'?
fn edge_defaults_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("edge").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let attrs = attr_block.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::EdgeDefaults(attrs))
}

/// Parse 'subgraph' identifier? '{' statement* '}' ';'?
fn subgraph_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("subgraph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = opt(identifier).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Subgraph(name.map(|s| s.to_string()), stmts))
}

/// Parse a node statement, an edge chain, or a bare `key = value` graph
/// attribute declaration. All three start with an identifier.
fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Statement> {
    let first = identifier.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if opt(literal("->")).parse_next(input)?.is_some() {
        // Edge statement — collect the chain a -> b -> c.
        let mut chain = vec![first.to_string()];
        let _ = ws.parse_next(input)?;
        let next = identifier
            .context(StrContext::Expected(StrContextValue::Description(
                "edge target identifier",
            )))
            .parse_next(input)?;
        chain.push(next.to_string());

        loop {
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_some() {
                let _ = ws.parse_next(input)?;
                let n = identifier
                    .context(StrContext::Expected(StrContextValue::Description(
                        "edge target identifier",
                    )))
                    .parse_next(input)?;
                chain.push(n.to_string());
            } else {
                break;
            }
        }

        let _ = ws.parse_next(input)?;
        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Edge(chain, attrs));
    }

    // Undirected edge syntax gets a targeted rejection.
    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(make_cut_error(
            "only directed edges (->); undirected edges (--) are not supported",
        ));
    }

    let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
    let _ = ws.parse_next(input)?;

    if !attrs.is_empty() {
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Node(first.to_string(), attrs));
    }

    // `key = value` graph attribute declaration.
    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let val = attr_value.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::GraphAttrDecl(first.to_string(), val));
    }

    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Node(first.to_string(), attrs))
}

/// Parse a single statement.
fn statement(input: &mut &str) -> ModalResult<Statement> {
    let _ = ws.parse_next(input)?;
    alt((
        graph_attr_stmt,
        node_defaults_stmt,
        edge_defaults_stmt,
        subgraph_stmt,
        node_or_edge_stmt,
    ))
    .parse_next(input)
}

/// Parse zero or more statements up to '}' or end of input.
fn statements(input: &mut &str) -> ModalResult<Vec<Statement>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        let stmt = statement.parse_next(input)?;
        stmts.push(stmt);
    }
    Ok(stmts)
}

struct MergedStatements {
    graph_attrs: HashMap<String, AttributeValue>,
    nodes: HashMap<String, NodeDef>,
    node_order: Vec<String>,
    edges: Vec<EdgeDef>,
    subgraphs: Vec<SubgraphDef>,
    node_defaults: HashMap<String, AttributeValue>,
    edge_defaults: HashMap<String, AttributeValue>,
}

/// Merge statements into graph structure, preserving node first-seen order
/// and edge declaration order.
fn merge_statements(
    stmts: Vec<Statement>,
    parent_node_defaults: &HashMap<String, AttributeValue>,
    parent_edge_defaults: &HashMap<String, AttributeValue>,
) -> MergedStatements {
    let mut out = MergedStatements {
        graph_attrs: HashMap::new(),
        nodes: HashMap::new(),
        node_order: Vec::new(),
        edges: Vec::new(),
        subgraphs: Vec::new(),
        node_defaults: parent_node_defaults.clone(),
        edge_defaults: parent_edge_defaults.clone(),
    };

    let mut note_node = |nodes: &mut HashMap<String, NodeDef>,
                         order: &mut Vec<String>,
                         id: &str,
                         def: NodeDef| {
        if !nodes.contains_key(id) {
            order.push(id.to_string());
        }
        nodes.insert(id.to_string(), def);
    };

    for stmt in stmts {
        match stmt {
            Statement::GraphAttrs(attrs) => {
                out.graph_attrs.extend(attrs);
            }
            Statement::NodeDefaults(attrs) => {
                out.node_defaults.extend(attrs);
            }
            Statement::EdgeDefaults(attrs) => {
                out.edge_defaults.extend(attrs);
            }
            Statement::Node(id, mut attrs) => {
                for (k, v) in &out.node_defaults {
                    attrs.entry(k.clone()).or_insert_with(|| v.clone());
                }
                let def = NodeDef {
                    id: id.clone(),
                    attrs,
                };
                note_node(&mut out.nodes, &mut out.node_order, &id, def);
            }
            Statement::Edge(chain, attrs) => {
                // Expand chained edges: A -> B -> C => (A,B), (B,C),
                // in declaration order.
                for pair in chain.windows(2) {
                    let mut merged = out.edge_defaults.clone();
                    merged.extend(attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
                    out.edges.push(EdgeDef {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs: merged,
                    });
                }
                // Materialize nodes referenced only by edges.
                for node_id in &chain {
                    if !out.nodes.contains_key(node_id) {
                        let mut na = HashMap::new();
                        for (k, v) in &out.node_defaults {
                            na.insert(k.clone(), v.clone());
                        }
                        let def = NodeDef {
                            id: node_id.clone(),
                            attrs: na,
                        };
                        note_node(&mut out.nodes, &mut out.node_order, node_id, def);
                    }
                }
            }
            Statement::Subgraph(name, inner_stmts) => {
                let inner =
                    merge_statements(inner_stmts, &out.node_defaults, &out.edge_defaults);
                out.subgraphs.push(SubgraphDef {
                    name,
                    attrs: inner.graph_attrs,
                    nodes: inner.nodes,
                    node_order: inner.node_order,
                    edges: inner.edges,
                    node_defaults: inner.node_defaults,
                    edge_defaults: inner.edge_defaults,
                });
                for nested in inner.subgraphs {
                    out.subgraphs.push(nested);
                }
            }
            Statement::GraphAttrDecl(key, val) => {
                out.graph_attrs.insert(key, val);
            }
        }
    }

    out
}

/// Top-level parser: 'digraph' identifier '{' statements '}' ';'? EOF.
fn parse_digraph(input: &mut &str) -> ModalResult<DotGraph> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(make_cut_error(
            "'digraph' keyword (strict graphs are not supported)",
        ));
    }

    // Reject undirected 'graph G {'. 'graph [' would be a graph-attrs
    // statement and cannot appear at top level anyway.
    if let Some(after) = input.strip_prefix("graph") {
        let trimmed = after.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(make_cut_error(
                "'digraph' keyword (undirected graphs are not supported)",
            ));
        }
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral(
            "digraph",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = identifier
        .context(StrContext::Expected(StrContextValue::Description(
            "graph name identifier",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'
        .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    // Permissive: a single trailing semicolon after the closing brace.
    let _ = opt(';').parse_next(input)?;
    let _ = ws.parse_next(input)?;
    if !input.is_empty() {
        return Err(make_cut_error(
            "end of input (at most one graph per input)",
        ));
    }

    let empty = HashMap::new();
    let merged = merge_statements(stmts, &empty, &empty);

    Ok(DotGraph {
        name: name.to_string(),
        attrs: merged.graph_attrs,
        nodes: merged.nodes,
        node_order: merged.node_order,
        edges: merged.edges,
        subgraphs: merged.subgraphs,
        node_defaults: merged.node_defaults,
        edge_defaults: merged.edge_defaults,
    })
}

/// Compute (line, col) from the unconsumed tail length in the stripped text.
/// strip_comments preserves newlines, so line numbers match the original.
fn offset_to_line_col(stripped: &str, remaining_len: usize) -> (usize, usize) {
    let consumed = stripped.len().saturating_sub(remaining_len);
    let prefix = &stripped[..consumed.min(stripped.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

/// Public entry point. Pure: consumes the text, returns a graph or a
/// structured error. Never panics on any input.
pub fn parse(input: &str) -> std::result::Result<DotGraph, kilroy_types::KilroyError> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();

    parse_digraph.parse_next(&mut remaining).map_err(|e| {
        let (line, col) = offset_to_line_col(&stripped, remaining.len());
        let message = format!("{}", e);
        let snippet: String = remaining.chars().take(40).collect();
        kilroy_types::KilroyError::ParseError {
            line,
            col,
            message,
            source_snippet: if snippet.is_empty() {
                None
            } else {
                Some(snippet)
            },
        }
    })
}

/// Byte-slice entry point. Invalid UTF-8 is a structured parse error, not a
/// panic — the fuzz harness drives this path with arbitrary bytes.
pub fn parse_bytes(input: &[u8]) -> std::result::Result<DotGraph, kilroy_types::KilroyError> {
    let text = std::str::from_utf8(input).map_err(|e| kilroy_types::KilroyError::ParseError {
        line: 1,
        col: e.valid_up_to() + 1,
        message: format!("input is not valid UTF-8: {}", e),
        source_snippet: None,
    })?;
    parse(text)
}
