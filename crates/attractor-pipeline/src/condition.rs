//! Condition expression language: parser and evaluator.
//!
//! Grammar:
//! ```text
//! ConditionExpr  ::= Clause ( '&&' Clause )*
//! Clause         ::= Key Operator Literal
//! Key            ::= identifier ( '.' identifier )*
//! Operator       ::= '=' | '!='
//! Literal        ::= QuotedString | BareWord | Integer | Boolean
//! ```

use attractor_types::AttractorError;

/// A parsed condition expression consisting of one or more clauses joined by `&&`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub clauses: Vec<Clause>,
}

/// A single comparison clause: `key op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

/// Parse a condition string into a [`ConditionExpr`].
///
/// An empty or whitespace-only input produces an expression with zero clauses,
/// which [`evaluate_condition`] treats as always true.
pub fn parse_condition(input: &str) -> Result<ConditionExpr, AttractorError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr {
            clauses: Vec::new(),
        });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        let clause = parse_clause(part.trim())?;
        clauses.push(clause);
    }

    Ok(ConditionExpr { clauses })
}

fn parse_clause(input: &str) -> Result<Clause, AttractorError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    // Find the operator position. We need to distinguish `!=` from `=`.
    let (key_end, operator, op_len) = find_operator(input)?;

    let key = input[..key_end].trim().to_string();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    // Validate key: identifier segments separated by dots.
    for seg in key.split('.') {
        if seg.is_empty() || !seg.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(make_error(&format!("invalid key segment: '{seg}'")));
        }
    }

    let raw_value = input[key_end + op_len..].trim();
    // An empty value is legal (e.g. `context.a.k=` compiled from `!exists("a.k")`
    // by the expression compiler) and matches the empty string a missing
    // context key resolves to.
    let value = strip_quotes(raw_value);

    Ok(Clause {
        key,
        operator,
        value,
    })
}

fn find_operator(input: &str) -> Result<(usize, Operator, usize), AttractorError> {
    // Scan for `!=` or `=`, skipping quoted regions.
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                // Skip quoted string.
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1; // skip closing quote
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Ok((i, Operator::NotEq, 2));
            }
            b'=' => {
                return Ok((i, Operator::Eq, 1));
            }
            _ => {
                i += 1;
            }
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

fn make_error(msg: &str) -> AttractorError {
    AttractorError::ValidationError(format!("condition parse error: {msg}"))
}

/// Evaluate a condition expression against values provided by a resolver function.
///
/// The `resolve` function maps a key (e.g. `"outcome"`, `"context.env"`) to its
/// string value. Keys not found should resolve to an empty string.
///
/// An expression with zero clauses (from an empty input) evaluates to `true`.
pub fn evaluate_condition(expr: &ConditionExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    // Empty expression → always true.
    if expr.clauses.is_empty() {
        return true;
    }

    expr.clauses.iter().all(|clause| {
        let actual = resolve(&clause.key);
        match clause.operator {
            Operator::Eq => actual == clause.value,
            Operator::NotEq => actual != clause.value,
        }
    })
}
