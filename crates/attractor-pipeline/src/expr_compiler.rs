//! Edge-guard expression compiler.
//!
//! Edge guards are written with a small boolean expression language over
//! three atoms:
//!
//! ```text
//! outcome("stageId") == "value"   // compares the terminal status of a stage
//! output("stageId.key") != "v"    // compares a context value produced by a stage
//! exists("stageId.key")           // true when a context value is present/non-empty
//! ```
//!
//! combined with `&&`, `||`, `!`, and parentheses. Rather than evaluating this
//! tree at edge-selection time, we compile it once into disjunctive normal
//! form (DNF) and lower each conjunctive clause to the flat `key op value`
//! string syntax [`crate::condition`] already knows how to evaluate. This
//! keeps the hot edge-selection path — which runs once per node per pipeline
//! step — free of tree-walking.
use attractor_types::AttractorError;

/// Disjuncts beyond this count make an expression impractical to schedule
/// against (each disjunct becomes a candidate edge) and are rejected.
pub const MAX_DISJUNCTS: usize = 128;

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    LParen,
    RParen,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Comma,
    Eof,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn err(&self, pos: usize, msg: impl Into<String>) -> AttractorError {
        AttractorError::ExpressionError {
            pos,
            message: msg.into(),
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<(Tok, usize), AttractorError> {
        self.skip_ws();
        let start = self.pos;
        let Some(b) = self.peek_byte() else {
            return Ok((Tok::Eof, start));
        };
        match b {
            b'(' => {
                self.pos += 1;
                Ok((Tok::LParen, start))
            }
            b')' => {
                self.pos += 1;
                Ok((Tok::RParen, start))
            }
            b',' => {
                self.pos += 1;
                Ok((Tok::Comma, start))
            }
            b'!' => {
                self.pos += 1;
                if self.peek_byte() == Some(b'=') {
                    self.pos += 1;
                    Ok((Tok::NotEq, start))
                } else {
                    Ok((Tok::Bang, start))
                }
            }
            b'=' => {
                self.pos += 1;
                if self.peek_byte() == Some(b'=') {
                    self.pos += 1;
                    Ok((Tok::EqEq, start))
                } else {
                    Err(self.err(start, "expected '==', found single '='"))
                }
            }
            b'&' => {
                self.pos += 1;
                if self.peek_byte() == Some(b'&') {
                    self.pos += 1;
                    Ok((Tok::AndAnd, start))
                } else {
                    Err(self.err(start, "expected '&&', found single '&'"))
                }
            }
            b'|' => {
                self.pos += 1;
                if self.peek_byte() == Some(b'|') {
                    self.pos += 1;
                    Ok((Tok::OrOr, start))
                } else {
                    Err(self.err(start, "expected '||', found single '|'"))
                }
            }
            b'"' => self.lex_string(start),
            b'0'..=b'9' => self.lex_number(start),
            c if c == b'_' || c.is_ascii_alphabetic() => self.lex_ident(start),
            _ => Err(self.err(start, format!("unexpected character '{}'", b as char))),
        }
    }

    fn lex_string(&mut self, start: usize) -> Result<(Tok, usize), AttractorError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.peek_byte() {
                None => return Err(self.err(start, "unterminated string literal")),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek_byte() {
                        Some(b'n') => {
                            out.push('\n');
                            self.pos += 1;
                        }
                        Some(b't') => {
                            out.push('\t');
                            self.pos += 1;
                        }
                        Some(b'\\') => {
                            out.push('\\');
                            self.pos += 1;
                        }
                        Some(b'"') => {
                            out.push('"');
                            self.pos += 1;
                        }
                        Some(c) => {
                            out.push(c as char);
                            self.pos += 1;
                        }
                        None => return Err(self.err(start, "unterminated string literal")),
                    }
                }
                Some(_) => {
                    // Advance by one UTF-8 char, not just one byte.
                    let rest = &self.src[self.pos..];
                    let ch = rest.chars().next().unwrap();
                    out.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
        Ok((Tok::Str(out), start))
    }

    fn lex_number(&mut self, start: usize) -> Result<(Tok, usize), AttractorError> {
        let begin = self.pos;
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_digit() || b == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.src[begin..self.pos];
        text.parse::<f64>()
            .map(|n| (Tok::Num(n), start))
            .map_err(|_| self.err(start, format!("invalid number literal '{text}'")))
    }

    fn lex_ident(&mut self, start: usize) -> Result<(Tok, usize), AttractorError> {
        let begin = self.pos;
        while let Some(b) = self.peek_byte() {
            if b == b'_' || b.is_ascii_alphanumeric() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.src[begin..self.pos];
        Ok((
            match text {
                "true" => Tok::True,
                "false" => Tok::False,
                _ => Tok::Ident(text.to_string()),
            },
            start,
        ))
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
}

impl CmpOp {
    fn negate(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::NotEq,
            CmpOp::NotEq => CmpOp::Eq,
        }
    }
}

/// The two functions usable in a comparison. `exists` is handled separately
/// since it can't be compared against a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpFunc {
    Outcome,
    Output,
}

/// A single atomic proposition, already resolved to the exact clause shape
/// it lowers to.
#[derive(Debug, Clone, PartialEq)]
enum Atom {
    Exists { stage_key: String, negated: bool },
    Compare {
        func: CmpFunc,
        stage_key: String,
        op: CmpOp,
        value: String,
    },
    /// A literal boolean, kept through NNF so constant-false branches can be
    /// pruned during DNF expansion.
    Bool(bool),
}

impl Atom {
    fn negate(self) -> Atom {
        match self {
            Atom::Exists { stage_key, negated } => Atom::Exists {
                stage_key,
                negated: !negated,
            },
            Atom::Compare {
                func,
                stage_key,
                op,
                value,
            } => Atom::Compare {
                func,
                stage_key,
                op: op.negate(),
                value,
            },
            Atom::Bool(b) => Atom::Bool(!b),
        }
    }

    /// Lower to the flat clause-string syntax `crate::condition` understands.
    fn to_clause_string(&self) -> String {
        match self {
            Atom::Exists { stage_key, negated } => {
                if *negated {
                    format!("context.{stage_key}=")
                } else {
                    format!("context.{stage_key}!=")
                }
            }
            Atom::Compare {
                func,
                stage_key,
                op,
                value,
            } => {
                let key = match func {
                    CmpFunc::Outcome => format!("context.{stage_key}.status"),
                    CmpFunc::Output => format!("context.{stage_key}"),
                };
                let op_str = match op {
                    CmpOp::Eq => "=",
                    CmpOp::NotEq => "!=",
                };
                format!("{key}{op_str}{value}")
            }
            Atom::Bool(true) => "__always_true__=__always_true__".to_string(),
            Atom::Bool(false) => "outcome=__never_matches__".to_string(),
        }
    }
}

/// Parsed expression tree, before NNF/DNF transformation.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Atom(Atom),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

// ---------------------------------------------------------------------------
// Parser (recursive descent: OR -> AND -> UNARY -> PRIMARY -> FNCALL)
// ---------------------------------------------------------------------------

struct Parser<'a> {
    lexer: Lexer<'a>,
    cur: Tok,
    cur_pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Result<Self, AttractorError> {
        let mut lexer = Lexer::new(src);
        let (cur, cur_pos) = lexer.next_token()?;
        Ok(Parser { lexer, cur, cur_pos })
    }

    fn err(&self, msg: impl Into<String>) -> AttractorError {
        AttractorError::ExpressionError {
            pos: self.cur_pos,
            message: msg.into(),
        }
    }

    fn advance(&mut self) -> Result<(), AttractorError> {
        let (tok, pos) = self.lexer.next_token()?;
        self.cur = tok;
        self.cur_pos = pos;
        Ok(())
    }

    fn expect(&mut self, tok: Tok) -> Result<(), AttractorError> {
        if self.cur == tok {
            self.advance()
        } else {
            Err(self.err(format!("expected {tok:?}, found {:?}", self.cur)))
        }
    }

    fn parse(src: &'a str) -> Result<Expr, AttractorError> {
        let mut p = Parser::new(src)?;
        let expr = p.parse_or()?;
        if p.cur != Tok::Eof {
            return Err(p.err(format!("unexpected trailing token {:?}", p.cur)));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, AttractorError> {
        let mut lhs = self.parse_and()?;
        while self.cur == Tok::OrOr {
            self.advance()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, AttractorError> {
        let mut lhs = self.parse_unary()?;
        while self.cur == Tok::AndAnd {
            self.advance()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, AttractorError> {
        if self.cur == Tok::Bang {
            self.advance()?;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, AttractorError> {
        match &self.cur {
            Tok::LParen => {
                self.advance()?;
                let inner = self.parse_or()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Tok::True => {
                self.advance()?;
                Ok(Expr::Atom(Atom::Bool(true)))
            }
            Tok::False => {
                self.advance()?;
                Ok(Expr::Atom(Atom::Bool(false)))
            }
            Tok::Ident(name) => {
                let name = name.clone();
                self.advance()?;
                self.parse_fncall(&name)
            }
            other => Err(self.err(format!("expected expression, found {other:?}"))),
        }
    }

    fn parse_fncall(&mut self, name: &str) -> Result<Expr, AttractorError> {
        if name != "outcome" && name != "output" && name != "exists" {
            return Err(self.err(format!("unknown function '{name}'")));
        }
        self.expect(Tok::LParen)?;
        let arg = match &self.cur {
            Tok::Str(s) => s.clone(),
            other => return Err(self.err(format!("expected string literal argument, found {other:?}"))),
        };
        self.advance()?;
        self.expect(Tok::RParen)?;

        if name == "exists" {
            if matches!(self.cur, Tok::EqEq | Tok::NotEq) {
                return Err(self.err("exists(...) cannot be compared to a value"));
            }
            return Ok(Expr::Atom(Atom::Exists {
                stage_key: arg,
                negated: false,
            }));
        }

        let func = if name == "outcome" {
            CmpFunc::Outcome
        } else {
            CmpFunc::Output
        };

        let op = match self.cur {
            Tok::EqEq => CmpOp::Eq,
            Tok::NotEq => CmpOp::NotEq,
            _ => {
                return Err(self.err(format!(
                    "'{name}(...)' must be compared with == or !="
                )))
            }
        };
        self.advance()?;
        let value = match &self.cur {
            Tok::Str(s) => s.clone(),
            Tok::Num(n) => format_num(*n),
            Tok::True => "true".to_string(),
            Tok::False => "false".to_string(),
            other => return Err(self.err(format!("expected literal, found {other:?}"))),
        };
        self.advance()?;

        Ok(Expr::Atom(Atom::Compare {
            func,
            stage_key: arg,
            op,
            value,
        }))
    }
}

fn format_num(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

// ---------------------------------------------------------------------------
// NNF (negation normal form)
// ---------------------------------------------------------------------------

fn to_nnf(expr: Expr, negate: bool) -> Expr {
    match expr {
        Expr::Atom(a) => {
            if negate {
                Expr::Atom(a.negate())
            } else {
                Expr::Atom(a)
            }
        }
        Expr::Not(inner) => to_nnf(*inner, !negate),
        Expr::And(a, b) => {
            if negate {
                Expr::Or(Box::new(to_nnf(*a, true)), Box::new(to_nnf(*b, true)))
            } else {
                Expr::And(Box::new(to_nnf(*a, false)), Box::new(to_nnf(*b, false)))
            }
        }
        Expr::Or(a, b) => {
            if negate {
                Expr::And(Box::new(to_nnf(*a, true)), Box::new(to_nnf(*b, true)))
            } else {
                Expr::Or(Box::new(to_nnf(*a, false)), Box::new(to_nnf(*b, false)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DNF distribution: Vec<Vec<Atom>> = OR of AND-conjunctions
// ---------------------------------------------------------------------------

fn to_dnf(expr: &Expr, limit: usize) -> Result<Vec<Vec<Atom>>, AttractorError> {
    let disjuncts = match expr {
        Expr::Atom(a) => vec![vec![a.clone()]],
        Expr::Or(a, b) => {
            let mut left = to_dnf(a, limit)?;
            let right = to_dnf(b, limit)?;
            left.extend(right);
            left
        }
        Expr::And(a, b) => {
            let left = to_dnf(a, limit)?;
            let right = to_dnf(b, limit)?;
            let mut out = Vec::with_capacity(left.len() * right.len());
            for l in &left {
                for r in &right {
                    let mut combined = l.clone();
                    combined.extend(r.clone());
                    out.push(combined);
                }
            }
            out
        }
        Expr::Not(_) => unreachable!("NNF removes all Not nodes before DNF distribution"),
    };
    if disjuncts.len() > limit {
        return Err(AttractorError::DnfOverflow { limit });
    }
    Ok(disjuncts)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// The outcome of compiling an edge guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledGuard {
    /// The expression is a tautology (e.g. literal `true`, or every disjunct
    /// degenerated to one after dropping constant-true atoms). The edge
    /// should be treated as unconditional.
    Unconditional,
    /// The expression can never be satisfied (e.g. literal `false`, or every
    /// disjunct contained a constant-false atom). No edge should be
    /// generated for it.
    Unsatisfiable,
    /// One or more clause strings, each independently consumable by
    /// [`crate::condition::parse_condition`]. Each string is a standalone
    /// disjunct (an AND of atoms joined with `&&` where the disjunct has more
    /// than one atom).
    Disjunction(Vec<String>),
}

/// A reference to a stage made by an `outcome()`/`output()`/`exists()` atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRef {
    pub stage_id: String,
    pub kind: StageRefKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRefKind {
    Outcome,
    Output,
    Exists,
}

/// Compile an edge guard expression into DNF.
pub fn compile(src: &str) -> Result<CompiledGuard, AttractorError> {
    let trimmed = src.trim();
    if trimmed.is_empty() {
        return Ok(CompiledGuard::Unconditional);
    }

    let ast = Parser::parse(trimmed)?;
    let nnf = to_nnf(ast, false);
    let dnf = to_dnf(&nnf, MAX_DISJUNCTS)?;

    // Drop any disjunct containing a constant-false atom (unsatisfiable),
    // and strip constant-true atoms from the rest (they're identities).
    let mut clauses = Vec::new();
    for conjunct in dnf {
        if conjunct.iter().any(|a| matches!(a, Atom::Bool(false))) {
            continue;
        }
        let kept: Vec<&Atom> = conjunct
            .iter()
            .filter(|a| !matches!(a, Atom::Bool(true)))
            .collect();
        if kept.is_empty() {
            // Disjunct was all constant-true atoms: the whole expression is
            // a tautology via this branch.
            return Ok(CompiledGuard::Unconditional);
        }
        let clause_str = kept
            .iter()
            .map(|a| a.to_clause_string())
            .collect::<Vec<_>>()
            .join(" && ");
        clauses.push(clause_str);
    }

    if clauses.is_empty() {
        Ok(CompiledGuard::Unsatisfiable)
    } else {
        Ok(CompiledGuard::Disjunction(clauses))
    }
}

/// Collect every stage reference made by an expression, for validation's
/// `workflow_expression_stage_ref` rule. Does not require the expression to
/// compile successfully past parsing.
pub fn stage_refs(src: &str) -> Result<Vec<StageRef>, AttractorError> {
    let trimmed = src.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let ast = Parser::parse(trimmed)?;
    let mut out = Vec::new();
    collect_refs(&ast, &mut out);
    Ok(out)
}

fn collect_refs(expr: &Expr, out: &mut Vec<StageRef>) {
    match expr {
        Expr::Atom(Atom::Bool(_)) => {}
        Expr::Atom(Atom::Exists { stage_key, .. }) => {
            out.push(StageRef {
                stage_id: stage_key.split('.').next().unwrap_or(stage_key).to_string(),
                kind: StageRefKind::Exists,
            });
        }
        Expr::Atom(Atom::Compare { func, stage_key, .. }) => {
            out.push(StageRef {
                stage_id: stage_key.split('.').next().unwrap_or(stage_key).to_string(),
                kind: match func {
                    CmpFunc::Outcome => StageRefKind::Outcome,
                    CmpFunc::Output => StageRefKind::Output,
                },
            });
        }
        Expr::Not(inner) => collect_refs(inner, out),
        Expr::And(a, b) | Expr::Or(a, b) => {
            collect_refs(a, out);
            collect_refs(b, out);
        }
    }
}
