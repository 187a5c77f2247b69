//! Condition expression language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! ConditionExpr  ::= AndGroup ( '||' AndGroup )*
//! AndGroup       ::= Clause ( '&&' Clause )*
//! Clause         ::= Key Operator Literal
//! Key            ::= identifier ( '.' identifier )*
//! Operator       ::= '=' | '==' | '!='
//! Literal        ::= QuotedString | BareWord
//! ```
//!
//! Keys resolve through a caller-supplied function; `outcome`,
//! `preferred_label`, and `context.<key>` are the conventional names. Missing
//! keys resolve to the empty string.

use kilroy_types::KilroyError;

/// A parsed condition: a disjunction of conjunction groups.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub groups: Vec<Vec<Clause>>,
}

/// A single comparison clause: `key op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

/// Parse a condition string into a [`ConditionExpr`].
///
/// An empty or whitespace-only input produces an expression with zero
/// groups, which [`evaluate_condition`] treats as always true.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, KilroyError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr { groups: Vec::new() });
    }

    let mut groups = Vec::new();
    for group in split_outside_quotes(trimmed, "||") {
        let group = group.trim();
        if group.is_empty() {
            return Err(make_error("empty clause group around '||'"));
        }
        let mut clauses = Vec::new();
        for part in split_outside_quotes(group, "&&") {
            clauses.push(parse_clause(part.trim())?);
        }
        groups.push(clauses);
    }

    Ok(ConditionExpr { groups })
}

/// Split on a two-character separator, skipping quoted regions.
fn split_outside_quotes<'a>(input: &'a str, sep: &str) -> Vec<&'a str> {
    let bytes = input.as_bytes();
    let sep_bytes = sep.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            _ if bytes[i..].starts_with(sep_bytes) => {
                parts.push(&input[start..i]);
                i += sep_bytes.len();
                start = i;
            }
            _ => i += 1,
        }
    }
    parts.push(&input[start.min(input.len())..]);
    parts
}

fn parse_clause(input: &str) -> Result<Clause, KilroyError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    let (key_end, operator, op_len) = find_operator(input)?;

    let key = input[..key_end].trim().to_string();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid key segment: '{seg}'")));
        }
    }

    let raw_value = input[key_end + op_len..].trim();
    if raw_value.is_empty() {
        return Err(make_error(&format!(
            "missing value after operator in '{input}'"
        )));
    }

    Ok(Clause {
        key,
        operator,
        value: strip_quotes(raw_value),
    })
}

fn find_operator(input: &str) -> Result<(usize, Operator, usize), KilroyError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Ok((i, Operator::NotEq, 2));
            }
            b'=' => {
                let len = if i + 1 < bytes.len() && bytes[i + 1] == b'=' {
                    2
                } else {
                    1
                };
                return Ok((i, Operator::Eq, len));
            }
            _ => i += 1,
        }
    }
    Err(make_error(&format!("no operator found in '{input}'")))
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn make_error(msg: &str) -> KilroyError {
    KilroyError::ValidationError(format!("condition parse error: {msg}"))
}

/// Evaluate a condition expression against values provided by a resolver.
///
/// The `resolve` function maps a key (e.g. `"outcome"`, `"context.env"`) to
/// its string value; missing keys resolve to an empty string. An expression
/// with zero groups evaluates to `true`.
pub fn evaluate_condition(expr: &ConditionExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    if expr.groups.is_empty() {
        return true;
    }

    expr.groups.iter().any(|clauses| {
        clauses.iter().all(|clause| {
            let actual = resolve(&clause.key);
            match clause.operator {
                Operator::Eq => actual == clause.value,
                Operator::NotEq => actual != clause.value,
            }
        })
    })
}

/// Parse-and-evaluate convenience used by edge selection and the manager
/// loop stop condition.
pub fn check_condition(
    input: &str,
    resolve: &dyn Fn(&str) -> String,
) -> Result<bool, KilroyError> {
    let expr = parse_condition(input)?;
    Ok(evaluate_condition(&expr, resolve))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
