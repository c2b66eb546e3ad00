//! # WHERE Clause Conditions
//!
//! A small SQL-like filter language compiled against a [`TableSchema`] and
//! evaluated directly on encoded rows, without decoding them.
//!
//! ## Grammar
//!
//! ```text
//! or_expr   := and_expr ( OR and_expr )*
//! and_expr  := term ( AND term )*
//! term      := '(' or_expr ')'
//!            | column op value
//!            | column IN '(' value ( ',' value )* ')'
//! column    := ident | '`' ident '`'
//! value     := bare word | '\'' text '\'' | '?'
//! op        := = | != | > | >= | < | <=
//! ```
//!
//! `AND`, `OR` and `IN` are case-insensitive. Every parenthesized group is one
//! nesting level deeper than its surroundings.
//!
//! ## Shard Rules
//!
//! Multi-row operations are scoped to one shard, so the shard column may appear
//! at most once, only at level 0, only with `=`, and only compared with the
//! caller's shard value. `OR` is not allowed at level 0, which keeps a level-0
//! shard predicate binding for the whole clause.
//!
//! ## Casting
//!
//! Literals are cast to the column type at compile time. A comparison literal
//! that cannot be cast makes that comparison always false; an `IN` element that
//! cannot be cast is a compile error. Row values that fail to cast never match.

use std::cmp::Ordering;

use crate::codec::{is_key_only, parse_datetime, value_at};
use crate::error::{Error, Result};
use crate::schema::{ColumnSchema, ColumnType, TableSchema};

// =============================================================================
// Tokens
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    /// Bare word: a column name or an unquoted value.
    Word(&'a str),
    /// Backtick-quoted column name.
    Quoted(&'a str),
    /// Single-quoted literal, quotes stripped.
    Literal(&'a str),
    Param,
    Op(CmpOp),
    And,
    Or,
    In,
    LParen,
    RParen,
    Comma,
}

fn tokenize(clause: &str) -> Result<Vec<Token<'_>>> {
    let bytes = clause.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            b',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            b'?' => {
                tokens.push(Token::Param);
                i += 1;
            }
            b'\'' | b'`' => {
                let end = clause[i + 1..]
                    .find(c as char)
                    .ok_or_else(|| Error::Condition(format!("sign '{}' mismatched", c as char)))?;
                let text = &clause[i + 1..i + 1 + end];
                tokens.push(if c == b'`' {
                    Token::Quoted(text)
                } else {
                    Token::Literal(text)
                });
                i += end + 2;
            }
            b'=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            b'!' | b'<' | b'>' => {
                let has_eq = bytes.get(i + 1) == Some(&b'=');
                let op = match (c, has_eq) {
                    (b'!', true) => CmpOp::Ne,
                    (b'<', true) => CmpOp::Le,
                    (b'<', false) => CmpOp::Lt,
                    (b'>', true) => CmpOp::Ge,
                    (b'>', false) => CmpOp::Gt,
                    _ => return Err(Error::Condition(format!("nonsupport operator at {}", i))),
                };
                tokens.push(Token::Op(op));
                i += if has_eq { 2 } else { 1 };
            }
            _ => {
                let start = i;
                while i < bytes.len() && !is_delimiter(bytes[i]) {
                    i += 1;
                }
                let word = &clause[start..i];
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "IN" => Token::In,
                    _ => Token::Word(word),
                });
            }
        }
    }

    Ok(tokens)
}

fn is_delimiter(c: u8) -> bool {
    matches!(
        c,
        b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')' | b',' | b'?' | b'\'' | b'`' | b'=' | b'!' | b'<' | b'>'
    )
}

// =============================================================================
// Values
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    fn cast(value: &str, column_type: ColumnType) -> Option<Value> {
        match column_type {
            ColumnType::Int => value.parse().ok().map(Value::Int),
            ColumnType::Float => value.parse().ok().map(Value::Float),
            ColumnType::Time => parse_datetime(value).map(Value::Int),
            ColumnType::String => Some(Value::Str(value.to_string())),
        }
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

// =============================================================================
// Expression Tree
// =============================================================================

#[derive(Debug, Clone)]
enum Node {
    Compare {
        column: usize,
        column_type: ColumnType,
        op: CmpOp,
        /// `None` when the literal did not cast; the comparison never holds.
        expected: Option<Value>,
    },
    In {
        column: usize,
        column_type: ColumnType,
        values: Vec<Value>,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn check(&self, schema: &TableSchema, row: &[u8]) -> bool {
        match self {
            Node::Compare {
                column,
                column_type,
                op,
                expected,
            } => {
                let Some(expected) = expected else {
                    return false;
                };
                Value::cast(value_at(schema, row, *column), *column_type)
                    .and_then(|actual| actual.compare(expected))
                    .map_or(false, |ordering| op.holds(ordering))
            }
            Node::In {
                column,
                column_type,
                values,
            } => match Value::cast(value_at(schema, row, *column), *column_type) {
                Some(actual) => values
                    .iter()
                    .any(|v| actual.compare(v) == Some(Ordering::Equal)),
                None => false,
            },
            Node::And(left, right) => left.check(schema, row) && right.check(schema, row),
            Node::Or(left, right) => left.check(schema, row) || right.check(schema, row),
        }
    }
}

// =============================================================================
// Condition
// =============================================================================

/// A compiled WHERE clause bound to one table schema.
#[derive(Debug, Clone)]
pub struct Condition<'a> {
    schema: &'a TableSchema,
    root: Node,
    has_shard: bool,
}

impl<'a> Condition<'a> {
    /// Compiles `where_clause`, substituting `params` for `?` left to right.
    ///
    /// Returns `Ok(None)` for an empty clause. `shard_key` is the shard value
    /// the operation is scoped to.
    pub fn compile<S: AsRef<str>>(
        schema: &'a TableSchema,
        shard_key: &str,
        where_clause: &str,
        params: &[S],
    ) -> Result<Option<Condition<'a>>> {
        if where_clause.trim().is_empty() {
            if !params.is_empty() {
                return Err(Error::Condition("condition mismatch parameter num".to_string()));
            }
            return Ok(None);
        }

        let tokens = tokenize(where_clause)?;
        let mut compiler = Compiler {
            schema,
            shard_key,
            params,
            param_idx: 0,
            tokens,
            pos: 0,
            has_shard: false,
        };

        let root = compiler.parse_or(0)?;
        match compiler.peek() {
            None => {}
            Some(Token::RParen) => {
                return Err(Error::Condition(format!(
                    "unbalanced parentheses: {}",
                    where_clause
                )))
            }
            Some(_) => return Err(Error::Condition(format!("invalid condition: {}", where_clause))),
        }

        if compiler.param_idx != params.len() {
            return Err(Error::Condition("condition mismatch parameter num".to_string()));
        }

        Ok(Some(Condition {
            schema,
            root,
            has_shard: compiler.has_shard,
        }))
    }

    /// Evaluates the clause against one encoded row. Key-only and empty
    /// buffers never match.
    pub fn check(&self, row: &[u8]) -> bool {
        if row.len() < 2 || is_key_only(row) {
            return false;
        }
        self.root.check(self.schema, row)
    }

    /// Whether the clause pinned the shard column to the caller's shard value.
    pub fn valid_shard(&self) -> bool {
        self.has_shard
    }
}

// =============================================================================
// Compiler
// =============================================================================

struct Compiler<'s, 'p, S> {
    schema: &'s TableSchema,
    shard_key: &'p str,
    params: &'p [S],
    param_idx: usize,
    tokens: Vec<Token<'p>>,
    pos: usize,
    has_shard: bool,
}

impl<'s, 'p, S: AsRef<str>> Compiler<'s, 'p, S> {
    fn peek(&self) -> Option<Token<'p>> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token<'p>> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self, level: usize) -> Result<Node> {
        let mut left = self.parse_and(level)?;
        while self.peek() == Some(Token::Or) {
            if level == 0 {
                return Err(Error::Condition("OR can not be in level 0".to_string()));
            }
            self.pos += 1;
            let right = self.parse_and(level)?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self, level: usize) -> Result<Node> {
        let mut left = self.parse_term(level)?;
        while self.peek() == Some(Token::And) {
            self.pos += 1;
            let right = self.parse_term(level)?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self, level: usize) -> Result<Node> {
        let column = match self.next() {
            Some(Token::LParen) => {
                let node = self.parse_or(level + 1)?;
                if self.next() != Some(Token::RParen) {
                    return Err(Error::Condition("unbalanced parentheses".to_string()));
                }
                return Ok(node);
            }
            Some(Token::Word(name)) | Some(Token::Quoted(name)) => self.column(name)?,
            Some(Token::RParen) => return Err(Error::Condition("unbalanced parentheses".to_string())),
            Some(other) => return Err(Error::Condition(format!("unexpected {:?}", other))),
            None => return Err(Error::Condition("empty condition".to_string())),
        };

        match self.next() {
            Some(Token::Op(op)) => self.comparison(column, op, level),
            Some(Token::In) => self.in_list(column),
            _ => Err(Error::Condition(format!(
                "missing operator after column '{}'",
                column.name
            ))),
        }
    }

    fn comparison(&mut self, column: &ColumnSchema, op: CmpOp, level: usize) -> Result<Node> {
        let value = self.value()?;

        if column.index == self.schema.shard_index() {
            if self.has_shard {
                return Err(Error::Condition(format!(
                    "shard key '{}' used more than once",
                    column.name
                )));
            }
            if op != CmpOp::Eq || value != self.shard_key {
                return Err(Error::Condition(format!("invalid shard condition: {}", value)));
            }
            if level != 0 {
                return Err(Error::Condition(format!("shard key MUST be level 0: {}", value)));
            }
            self.has_shard = true;
        }

        Ok(Node::Compare {
            column: column.index,
            column_type: column.column_type,
            op,
            expected: Value::cast(value, column.column_type),
        })
    }

    fn in_list(&mut self, column: &ColumnSchema) -> Result<Node> {
        if column.index == self.schema.shard_index() {
            return Err(Error::Condition(format!(
                "invalid shard condition: {} IN",
                column.name
            )));
        }
        if self.next() != Some(Token::LParen) {
            return Err(Error::Condition(format!("invalid IN condition on '{}'", column.name)));
        }

        let mut values = Vec::new();
        loop {
            let raw = self.value()?;
            let value = Value::cast(raw, column.column_type).ok_or_else(|| {
                Error::Condition(format!("invalid column type: '{}' for '{}'", raw, column.name))
            })?;
            values.push(value);

            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => {
                    return Err(Error::Condition(format!(
                        "invalid IN condition on '{}'",
                        column.name
                    )))
                }
            }
        }

        Ok(Node::In {
            column: column.index,
            column_type: column.column_type,
            values,
        })
    }

    fn column(&self, name: &str) -> Result<&'s ColumnSchema> {
        let schema: &'s TableSchema = self.schema;
        schema
            .column_by_name(name)
            .ok_or_else(|| Error::Condition(format!("invalid column: {}", name)))
    }

    fn value(&mut self) -> Result<&'p str> {
        match self.next() {
            Some(Token::Word(v)) | Some(Token::Literal(v)) => Ok(v),
            Some(Token::Param) => {
                let params: &'p [S] = self.params;
                let param = params
                    .get(self.param_idx)
                    .ok_or_else(|| Error::Condition("condition mismatch parameter num".to_string()))?;
                self.param_idx += 1;
                Ok(param.as_ref())
            }
            _ => Err(Error::Condition("missing value".to_string())),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
