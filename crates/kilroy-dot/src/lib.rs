//! DOT parser for the restricted Graphviz subset used by Kilroy attractor
//! pipelines.
//!
//! Parses `digraph Name { ... }` with nodes, edges, subgraphs, and typed
//! attributes. Produces a typed AST: [`DotGraph`], [`NodeDef`], [`EdgeDef`],
//! [`SubgraphDef`], [`AttributeValue`].
//!
//! Grammar contract highlights:
//! - only directed graphs; `--` edges and `strict` are rejected
//! - at most one graph per input (a trailing `;` after `}` is tolerated)
//! - ASCII identifiers only
//! - attribute lists require `,` (or `;`) separators
//! - `\n` inside quoted strings is retained literally
//!
//! # Example
//! ```
//! let dot = r#"digraph Pipeline { start -> process -> done }"#;
//! let graph = kilroy_dot::parse(dot).unwrap();
//! assert_eq!(graph.name, "Pipeline");
//! assert_eq!(graph.edges.len(), 2);
//! ```

pub mod ast;
mod duration_serde;
mod parser;

pub use ast::*;
pub use parser::{parse, parse_bytes};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_simple_linear_pipeline() {
        let input = "digraph Test { start -> plan -> done }";
        let graph = parse(input).unwrap();
        assert_eq!(graph.name, "Test");
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[0].from, "start");
        assert_eq!(graph.edges[0].to, "plan");
        assert_eq!(graph.edges[1].from, "plan");
        assert_eq!(graph.edges[1].to, "done");
        assert!(graph.nodes.contains_key("start"));
        assert!(graph.nodes.contains_key("plan"));
        assert!(graph.nodes.contains_key("done"));
    }

    #[test]
    fn node_order_is_first_seen_order() {
        let input = r#"digraph G {
            zulu [shape=box]
            alpha [shape=box]
            zulu -> alpha -> mike
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.node_order, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn parse_node_with_attributes() {
        let input = r#"digraph G {
            start [shape="Mdiamond", label="Begin"]
        }"#;
        let graph = parse(input).unwrap();
        let node = graph.nodes.get("start").unwrap();
        assert_eq!(
            node.attrs.get("shape"),
            Some(&AttributeValue::String("Mdiamond".to_string()))
        );
        assert_eq!(
            node.attrs.get("label"),
            Some(&AttributeValue::String("Begin".to_string()))
        );
    }

    #[test]
    fn bare_attribute_values_classified() {
        let input = r#"digraph G {
            a [shape=box, llm_provider=openai, llm_model=gpt-5.2, weight=-3, ratio=0.5, flag=true, timeout=30s]
        }"#;
        let graph = parse(input).unwrap();
        let node = graph.nodes.get("a").unwrap();
        assert_eq!(
            node.attrs.get("shape"),
            Some(&AttributeValue::String("box".into()))
        );
        assert_eq!(
            node.attrs.get("llm_model"),
            Some(&AttributeValue::String("gpt-5.2".into()))
        );
        assert_eq!(node.attrs.get("weight"), Some(&AttributeValue::Integer(-3)));
        assert_eq!(node.attrs.get("ratio"), Some(&AttributeValue::Float(0.5)));
        assert_eq!(
            node.attrs.get("flag"),
            Some(&AttributeValue::Boolean(true))
        );
        assert_eq!(
            node.attrs.get("timeout"),
            Some(&AttributeValue::Duration(Duration::from_secs(30)))
        );
    }

    #[test]
    fn missing_comma_between_attributes_is_error() {
        let input = r#"digraph G {
            a [shape=box label="oops"]
        }"#;
        assert!(parse(input).is_err());
    }

    #[test]
    fn trailing_separator_in_attr_block_accepted() {
        let input = r#"digraph G {
            a [shape=box, label="ok",]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.nodes.get("a").unwrap().attrs.len(), 2);
    }

    #[test]
    fn parse_edge_with_attributes() {
        let input = r#"digraph G {
            A -> B [label="ok", weight=10]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(
            graph.edges[0].attrs.get("label"),
            Some(&AttributeValue::String("ok".to_string()))
        );
        assert_eq!(
            graph.edges[0].attrs.get("weight"),
            Some(&AttributeValue::Integer(10))
        );
    }

    #[test]
    fn chained_edge_expansion_preserves_order() {
        let input = r#"digraph G {
            A -> B -> C [label="chain"]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(
            (graph.edges[0].from.as_str(), graph.edges[0].to.as_str()),
            ("A", "B")
        );
        assert_eq!(
            (graph.edges[1].from.as_str(), graph.edges[1].to.as_str()),
            ("B", "C")
        );
        for e in &graph.edges {
            assert_eq!(
                e.attrs.get("label"),
                Some(&AttributeValue::String("chain".to_string()))
            );
        }
    }

    #[test]
    fn parse_subgraph_with_label() {
        let input = r#"digraph G {
            subgraph cluster_inner {
                label = "review"
                node [shape="box"]
                A -> B
            }
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.subgraphs.len(), 1);
        let sg = &graph.subgraphs[0];
        assert_eq!(sg.name.as_deref(), Some("cluster_inner"));
        assert_eq!(
            sg.attrs.get("label"),
            Some(&AttributeValue::String("review".to_string()))
        );
        assert!(sg.nodes.contains_key("A"));
        assert!(sg.nodes.contains_key("B"));
        assert_eq!(sg.edges.len(), 1);
        assert_eq!(
            sg.nodes.get("A").unwrap().attrs.get("shape"),
            Some(&AttributeValue::String("box".to_string()))
        );
    }

    #[test]
    fn duration_value_parsing() {
        let input = r#"digraph G {
            step [timeout=900s, delay=250ms, interval=15m, ttl=2h, retention=7d]
        }"#;
        let graph = parse(input).unwrap();
        let node = graph.nodes.get("step").unwrap();
        assert_eq!(
            node.attrs.get("timeout"),
            Some(&AttributeValue::Duration(Duration::from_secs(900)))
        );
        assert_eq!(
            node.attrs.get("delay"),
            Some(&AttributeValue::Duration(Duration::from_millis(250)))
        );
        assert_eq!(
            node.attrs.get("interval"),
            Some(&AttributeValue::Duration(Duration::from_secs(15 * 60)))
        );
        assert_eq!(
            node.attrs.get("ttl"),
            Some(&AttributeValue::Duration(Duration::from_secs(2 * 3600)))
        );
        assert_eq!(
            node.attrs.get("retention"),
            Some(&AttributeValue::Duration(Duration::from_secs(7 * 86400)))
        );
    }

    #[test]
    fn comment_stripping() {
        let input = r#"
            // leading comment
            digraph G {
                /* block comment */
                A -> B // inline comment
                /* multi
                   line */
                B -> C
            }
        "#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.edges.len(), 2);
    }

    #[test]
    fn comment_markers_inside_strings_are_content() {
        let input = r#"digraph G {
            a [label="http://example.com /* not a comment */"]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.nodes.get("a").unwrap().attrs.get("label"),
            Some(&AttributeValue::String(
                "http://example.com /* not a comment */".to_string()
            ))
        );
    }

    #[test]
    fn reject_undirected_graph() {
        assert!(parse("graph G { A -- B }").is_err());
    }

    #[test]
    fn reject_undirected_edges() {
        assert!(parse("digraph G { A -- B }").is_err());
    }

    #[test]
    fn reject_strict_graphs() {
        assert!(parse("strict digraph G { A -> B }").is_err());
    }

    #[test]
    fn reject_second_graph() {
        let input = "digraph A { x -> y } digraph B { y -> z }";
        assert!(parse(input).is_err());
    }

    #[test]
    fn trailing_semicolon_after_closing_brace_accepted() {
        let graph = parse("digraph G { A -> B };").unwrap();
        assert_eq!(graph.edges.len(), 1);
        let graph2 = parse("digraph G { A -> B } ;\n").unwrap();
        assert_eq!(graph2.edges.len(), 1);
    }

    #[test]
    fn reject_unicode_identifiers() {
        assert!(parse("digraph G { ü -> b }").is_err());
        assert!(parse("digraph Gé { a -> b }").is_err());
    }

    #[test]
    fn parse_graph_attrs() {
        let input = r#"digraph G {
            graph [rankdir="LR"]
            goal = "Ship the feature"
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.attrs.get("rankdir"),
            Some(&AttributeValue::String("LR".to_string()))
        );
        assert_eq!(
            graph.attrs.get("goal"),
            Some(&AttributeValue::String("Ship the feature".to_string()))
        );
    }

    #[test]
    fn parse_node_and_edge_defaults() {
        let input = r#"digraph G {
            node [shape="ellipse"]
            edge [weight=2]
            A -> B
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.nodes.get("A").unwrap().attrs.get("shape"),
            Some(&AttributeValue::String("ellipse".to_string()))
        );
        assert_eq!(
            graph.edges[0].attrs.get("weight"),
            Some(&AttributeValue::Integer(2))
        );
    }

    #[test]
    fn parse_qualified_key() {
        let input = r#"digraph G {
            A [manager.poll_interval=45s, stack.child_dotfile="child.dot"]
        }"#;
        let graph = parse(input).unwrap();
        let node = graph.nodes.get("A").unwrap();
        assert_eq!(
            node.attrs.get("manager.poll_interval"),
            Some(&AttributeValue::Duration(Duration::from_secs(45)))
        );
        assert_eq!(
            node.attrs.get("stack.child_dotfile"),
            Some(&AttributeValue::String("child.dot".to_string()))
        );
    }

    #[test]
    fn backslash_n_retained_literally() {
        let input = r#"digraph G {
            A [prompt="first line\nsecond line"]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.nodes.get("A").unwrap().attrs.get("prompt"),
            Some(&AttributeValue::String(
                "first line\\nsecond line".to_string()
            ))
        );
    }

    #[test]
    fn escaped_quote_embeds_quote() {
        let input = r#"digraph G {
            A [label="say \"hello\""]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.nodes.get("A").unwrap().attrs.get("label"),
            Some(&AttributeValue::String("say \"hello\"".to_string()))
        );
    }

    #[test]
    fn multiline_string_value_accepted() {
        let input = "digraph G {\n  A [prompt=\"line one\nline two\"]\n}";
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.nodes.get("A").unwrap().attrs.get("prompt"),
            Some(&AttributeValue::String("line one\nline two".to_string()))
        );
    }

    #[test]
    fn error_includes_line_and_col() {
        let input = "not_a_graph { }";
        match parse(input).unwrap_err() {
            kilroy_types::KilroyError::ParseError { line, col, .. } => {
                assert!(line >= 1);
                assert!(col >= 1);
            }
            other => panic!("expected ParseError, got {other:?}"),
        }
    }

    #[test]
    fn semicolons_optional_between_statements() {
        let input = r#"digraph G {
            A [label="first"];
            B [label="second"]
            A -> B;
            B -> C
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
    }

    #[test]
    fn parse_bytes_rejects_invalid_utf8() {
        let err = parse_bytes(&[0x64, 0x69, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(
            err,
            kilroy_types::KilroyError::ParseError { .. }
        ));
    }

    // -----------------------------------------------------------------------
    // Fuzz harness: for all byte inputs, parse_bytes returns a graph or a
    // structured error and never panics. Deterministic seeded corpus so CI
    // failures reproduce.
    // -----------------------------------------------------------------------

    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            // Numerical Recipes LCG constants.
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0
        }

        fn byte(&mut self) -> u8 {
            (self.next() >> 33) as u8
        }

        fn range(&mut self, n: usize) -> usize {
            (self.next() >> 32) as usize % n.max(1)
        }
    }

    #[test]
    fn fuzz_random_bytes_never_panic() {
        let mut rng = Lcg(0x4b494c524f59); // "KILROY"
        for _ in 0..500 {
            let len = rng.range(256);
            let bytes: Vec<u8> = (0..len).map(|_| rng.byte()).collect();
            let _ = parse_bytes(&bytes);
        }
    }

    #[test]
    fn fuzz_structured_fragments_never_panic() {
        let fragments = [
            "digraph", "graph", "strict", "subgraph", "node", "edge", "{", "}", "[", "]", "->",
            "--", "=", ",", ";", "\"", "\\", "a", "G", "label", "weight=1", "condition=\"x=y\"",
            "\"unterminated", "/*", "*/", "//", "\n", " ", "0xff", "-42", "3.14", "45s",
        ];
        let mut rng = Lcg(0xA77AC70A);
        for _ in 0..500 {
            let n = rng.range(24);
            let mut input = String::new();
            for _ in 0..n {
                input.push_str(fragments[rng.range(fragments.len())]);
                if rng.range(3) == 0 {
                    input.push(' ');
                }
            }
            let _ = parse(&input);
        }
    }

    #[test]
    fn fuzz_mutated_valid_input_never_panics() {
        let seed = r#"digraph G {
            graph [goal="fuzz"]
            start [shape=Mdiamond]
            work [shape=box, prompt="do it", timeout=30s]
            done [shape=Msquare]
            start -> work [condition="outcome=success", weight=5]
            work -> done
        }"#;
        let mut rng = Lcg(0xDEADBEEF);
        for _ in 0..500 {
            let mut bytes = seed.as_bytes().to_vec();
            for _ in 0..rng.range(8) + 1 {
                if bytes.is_empty() {
                    break;
                }
                let idx = rng.range(bytes.len());
                match rng.range(3) {
                    0 => bytes[idx] = rng.byte(),
                    1 => {
                        bytes.remove(idx);
                    }
                    _ => bytes.insert(idx, rng.byte()),
                }
            }
            let _ = parse_bytes(&bytes);
        }
    }
}
