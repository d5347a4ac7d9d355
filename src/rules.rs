// ============================================================================
// PATTERN / RULE ENGINE
// ============================================================================
// Boolean conditions over record attributes, written as small expressions:
//
//   avg_duration_ms > 1000
//   db.query.plan.has_seq_scan && db.query.plan.rows > 10000
//   !(db.system == 'mysql') || exists(query_text)
//   query_text matches '(?i)^select'
//
// Expressions are compiled once at configuration load. Evaluation uses
// three-valued logic: a comparison against a missing or incomparable
// attribute is "unknown", and unknown at the top level never matches.
// ============================================================================

use std::fmt::{self, Display, Formatter};

use compact_str::CompactString;
use regex::Regex;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{AttributeValue, Record};

// ----------------------------------------------------------------------------
// Syntax Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSyntaxError {
    pub position: usize,
    pub message: String,
}

impl Display for RuleSyntaxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

impl std::error::Error for RuleSyntaxError {}

fn syntax_error(position: usize, message: impl Into<String>) -> RuleSyntaxError {
    RuleSyntaxError {
        position,
        message: message.into(),
    }
}

// ----------------------------------------------------------------------------
// Condition Tree
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    Matches,
}

impl CompareOp {
    fn from_word(word: &str) -> Option<Self> {
        match word {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "gte" => Some(CompareOp::Gte),
            "lt" => Some(CompareOp::Lt),
            "lte" => Some(CompareOp::Lte),
            "contains" => Some(CompareOp::Contains),
            "startswith" | "starts_with" => Some(CompareOp::StartsWith),
            "matches" => Some(CompareOp::Matches),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Bool(bool),
    Text(CompactString),
}

#[derive(Debug, Clone)]
enum Node {
    Always,
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Exists(CompactString),
    Compare {
        attribute: CompactString,
        op: CompareOp,
        literal: Literal,
        regex: Option<Regex>,
    },
}

/// A compiled boolean condition.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    root: Node,
}

impl Condition {
    /// A condition that matches every record.
    pub fn always() -> Self {
        Self {
            source: String::new(),
            root: Node::Always,
        }
    }

    /// Parse an expression.
    pub fn parse(source: &str) -> Result<Self, RuleSyntaxError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Ok(Self::always());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(syntax_error(tok.offset, "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Parse an expression owned by the named rule, mapping syntax errors
    /// into configuration errors.
    pub fn compile(rule: &str, source: Option<&str>) -> ConfigResult<Self> {
        match source {
            None => Ok(Self::always()),
            Some(src) => {
                Self::parse(src).map_err(|e| ConfigError::invalid_rule(rule, e.to_string()))
            }
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Three-valued evaluation; `None` means unknown.
    pub fn evaluate(&self, record: &Record) -> Option<bool> {
        eval(&self.root, record)
    }

    /// Whether the condition definitely holds for this record.
    #[inline]
    pub fn matches(&self, record: &Record) -> bool {
        self.evaluate(record) == Some(true)
    }

    /// Attributes referenced anywhere in the condition.
    pub fn attributes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_attributes(&self.root, &mut out);
        out.sort_unstable();
        out.dedup();
        out
    }
}

fn collect_attributes<'a>(node: &'a Node, out: &mut Vec<&'a str>) {
    match node {
        Node::Always => {}
        Node::And(children) | Node::Or(children) => {
            for child in children {
                collect_attributes(child, out);
            }
        }
        Node::Not(inner) => collect_attributes(inner, out),
        Node::Exists(attr) => out.push(attr.as_str()),
        Node::Compare { attribute, .. } => out.push(attribute.as_str()),
    }
}

// ----------------------------------------------------------------------------
// Evaluation
// ----------------------------------------------------------------------------

fn eval(node: &Node, record: &Record) -> Option<bool> {
    match node {
        Node::Always => Some(true),
        Node::And(children) => {
            let mut unknown = false;
            for child in children {
                match eval(child, record) {
                    Some(false) => return Some(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(true)
            }
        }
        Node::Or(children) => {
            let mut unknown = false;
            for child in children {
                match eval(child, record) {
                    Some(true) => return Some(true),
                    None => unknown = true,
                    Some(false) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(false)
            }
        }
        Node::Not(inner) => eval(inner, record).map(|v| !v),
        Node::Exists(attr) => Some(record.contains(attr)),
        Node::Compare {
            attribute,
            op,
            literal,
            regex,
        } => {
            let value = record.get(attribute)?;
            compare(value, *op, literal, regex.as_ref())
        }
    }
}

fn compare(value: &AttributeValue, op: CompareOp, literal: &Literal, regex: Option<&Regex>) -> Option<bool> {
    match op {
        CompareOp::Eq => equals(value, literal),
        CompareOp::Ne => equals(value, literal).map(|v| !v),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let Literal::Number(rhs) = literal else {
                return None;
            };
            let lhs = value.as_f64()?;
            Some(match op {
                CompareOp::Gt => lhs > *rhs,
                CompareOp::Gte => lhs >= *rhs,
                CompareOp::Lt => lhs < *rhs,
                _ => lhs <= *rhs,
            })
        }
        CompareOp::Contains => Some(value.render().contains(literal_text(literal).as_str())),
        CompareOp::StartsWith => Some(value.render().starts_with(literal_text(literal).as_str())),
        CompareOp::Matches => regex.map(|re| re.is_match(&value.render())),
    }
}

fn equals(value: &AttributeValue, literal: &Literal) -> Option<bool> {
    match literal {
        Literal::Number(rhs) => value.as_f64().map(|lhs| (lhs - rhs).abs() < f64::EPSILON),
        Literal::Bool(rhs) => value.as_bool().map(|lhs| lhs == *rhs),
        Literal::Text(rhs) => Some(value.render() == *rhs),
    }
}

fn literal_text(literal: &Literal) -> CompactString {
    match literal {
        Literal::Text(s) => s.clone(),
        Literal::Number(n) => AttributeValue::Float(*n).render(),
        Literal::Bool(b) => AttributeValue::Bool(*b).render(),
    }
}

// ----------------------------------------------------------------------------
// Lexer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word(String),
    Text(String),
    Number(f64),
    Op(CompareOp),
    And,
    Or,
    Bang,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, RuleSyntaxError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let two = bytes.get(i..i + 2);
        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b'&' if two == Some(b"&&") => {
                i += 2;
                TokenKind::And
            }
            b'|' if two == Some(b"||") => {
                i += 2;
                TokenKind::Or
            }
            b'=' if two == Some(b"==") => {
                i += 2;
                TokenKind::Op(CompareOp::Eq)
            }
            b'!' if two == Some(b"!=") => {
                i += 2;
                TokenKind::Op(CompareOp::Ne)
            }
            b'!' => {
                i += 1;
                TokenKind::Bang
            }
            b'>' if two == Some(b">=") => {
                i += 2;
                TokenKind::Op(CompareOp::Gte)
            }
            b'>' => {
                i += 1;
                TokenKind::Op(CompareOp::Gt)
            }
            b'<' if two == Some(b"<=") => {
                i += 2;
                TokenKind::Op(CompareOp::Lte)
            }
            b'<' => {
                i += 1;
                TokenKind::Op(CompareOp::Lt)
            }
            b'\'' | b'"' => {
                let (text, next) = lex_string(source, i)?;
                i = next;
                TokenKind::Text(text)
            }
            b'0'..=b'9' | b'-' | b'+' => {
                let mut end = i + 1;
                while end < bytes.len()
                    && matches!(bytes[end], b'0'..=b'9' | b'.' | b'e' | b'E' | b'_')
                {
                    end += 1;
                }
                let raw = source[i..end].replace('_', "");
                let number = raw
                    .parse::<f64>()
                    .map_err(|_| syntax_error(i, format!("invalid number '{}'", &source[i..end])))?;
                i = end;
                TokenKind::Number(number)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let mut end = i + 1;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric() || matches!(bytes[end], b'_' | b'.' | b'-' | b'/'))
                {
                    end += 1;
                }
                let word = &source[i..end];
                i = end;
                match word {
                    "and" | "AND" => TokenKind::And,
                    "or" | "OR" => TokenKind::Or,
                    "not" | "NOT" => TokenKind::Bang,
                    _ => TokenKind::Word(word.to_string()),
                }
            }
            _ => {
                return Err(syntax_error(i, format!("unexpected character '{}'", c as char)));
            }
        };
        tokens.push(Token { kind, offset: start });
    }

    Ok(tokens)
}

fn lex_string(source: &str, start: usize) -> Result<(String, usize), RuleSyntaxError> {
    let quote = source.as_bytes()[start] as char;
    let mut out = String::new();
    let mut chars = source[start + 1..].char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            c if c == quote => return Ok((out, start + 1 + idx + c.len_utf8())),
            c => out.push(c),
        }
    }
    Err(syntax_error(start, "unterminated string literal"))
}

// ----------------------------------------------------------------------------
// Parser
// ----------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|t| t.offset + 1).unwrap_or(0)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), RuleSyntaxError> {
        match self.next() {
            Some(tok) if tok.kind == kind => Ok(()),
            Some(tok) => Err(syntax_error(tok.offset, format!("expected {}", what))),
            None => Err(syntax_error(self.end_offset(), format!("expected {}", what))),
        }
    }

    fn parse_or(&mut self) -> Result<Node, RuleSyntaxError> {
        let mut children = vec![self.parse_and()?];
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Or)) {
            self.pos += 1;
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Node::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<Node, RuleSyntaxError> {
        let mut children = vec![self.parse_unary()?];
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            self.pos += 1;
            children.push(self.parse_unary()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Node::And(children)
        })
    }

    fn parse_unary(&mut self) -> Result<Node, RuleSyntaxError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Bang)) {
            self.pos += 1;
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, RuleSyntaxError> {
        let tok = self
            .next()
            .ok_or_else(|| syntax_error(self.end_offset(), "unexpected end of expression"))?;

        match tok.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Word(word)
                if word == "exists"
                    && matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen)) =>
            {
                self.pos += 1;
                let attr = match self.next() {
                    Some(Token {
                        kind: TokenKind::Word(attr),
                        ..
                    }) => attr,
                    Some(t) => return Err(syntax_error(t.offset, "expected attribute name")),
                    None => return Err(syntax_error(self.end_offset(), "expected attribute name")),
                };
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Node::Exists(CompactString::from(attr)))
            }
            TokenKind::Word(attribute) => self.parse_comparison(attribute),
            _ => Err(syntax_error(tok.offset, "expected attribute, '(' or '!'")),
        }
    }

    fn parse_comparison(&mut self, attribute: String) -> Result<Node, RuleSyntaxError> {
        let op = match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Op(op)) => Some(op),
            Some(TokenKind::Word(word)) => CompareOp::from_word(&word),
            _ => None,
        };

        let Some(op) = op else {
            // A bare attribute reads as a boolean flag.
            return Ok(Node::Compare {
                attribute: CompactString::from(attribute),
                op: CompareOp::Eq,
                literal: Literal::Bool(true),
                regex: None,
            });
        };
        self.pos += 1;

        let tok = self
            .next()
            .ok_or_else(|| syntax_error(self.end_offset(), "expected literal value"))?;
        let literal = match tok.kind {
            TokenKind::Number(n) => Literal::Number(n),
            TokenKind::Text(s) => Literal::Text(CompactString::from(s)),
            TokenKind::Word(w) if w == "true" => Literal::Bool(true),
            TokenKind::Word(w) if w == "false" => Literal::Bool(false),
            _ => return Err(syntax_error(tok.offset, "expected literal value")),
        };

        let regex = if op == CompareOp::Matches {
            let Literal::Text(pattern) = &literal else {
                return Err(syntax_error(tok.offset, "'matches' requires a string pattern"));
            };
            Some(Regex::new(pattern).map_err(|e| syntax_error(tok.offset, format!("invalid regex: {}", e)))?)
        } else {
            None
        };

        if matches!(op, CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte)
            && !matches!(literal, Literal::Number(_))
        {
            return Err(syntax_error(tok.offset, "ordering comparison requires a number"));
        }

        Ok(Node::Compare {
            attribute: CompactString::from(attribute),
            op,
            literal,
            regex,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record() -> Record {
        Record::metric()
            .with_attr("duration_ms", 1500i64)
            .with_attr("db.system", "postgresql")
            .with_attr("db.query.plan.has_seq_scan", true)
            .with_attr("db.query.plan.rows", "25000")
            .with_attr("query_text", "SELECT * FROM orders")
    }

    #[rstest]
    #[case("duration_ms > 1000", Some(true))]
    #[case("duration_ms gt 2000", Some(false))]
    #[case("duration_ms >= 1500 && duration_ms <= 1500", Some(true))]
    #[case("db.system == 'postgresql'", Some(true))]
    #[case("db.system != \"mysql\"", Some(true))]
    #[case("db.query.plan.has_seq_scan && db.query.plan.rows > 10000", Some(true))]
    #[case("query_text contains 'orders'", Some(true))]
    #[case("query_text matches '(?i)^select'", Some(true))]
    #[case("query_text startswith 'DELETE'", Some(false))]
    #[case("exists(query_text) and not exists(missing)", Some(true))]
    #[case("missing > 5", None)]
    #[case("missing > 5 || duration_ms > 1000", Some(true))]
    #[case("missing > 5 && duration_ms > 10000", Some(false))]
    #[case("!(missing > 5)", None)]
    #[case("db.system > 3", None)]
    fn test_evaluate(#[case] expr: &str, #[case] expected: Option<bool>) {
        let condition = Condition::parse(expr).unwrap();
        assert_eq!(condition.evaluate(&record()), expected, "{}", expr);
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let condition = Condition::parse("!(avg_duration_ms > 1000)").unwrap();
        assert!(!condition.matches(&Record::metric()));
    }

    #[rstest]
    #[case("duration_ms >")]
    #[case("(duration_ms > 1")]
    #[case("duration_ms > 'abc'")]
    #[case("query_text matches '('")]
    #[case("a == 'unterminated")]
    #[case("a == 1 b")]
    #[case("&& a")]
    fn test_syntax_errors(#[case] expr: &str) {
        assert!(Condition::parse(expr).is_err(), "{}", expr);
    }

    #[test]
    fn test_compile_maps_to_config_error() {
        let err = Condition::compile("broken", Some("a >")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule { ref rule, .. } if rule == "broken"));
        assert!(Condition::compile("none", None).unwrap().matches(&Record::metric()));
    }

    #[test]
    fn test_referenced_attributes() {
        let condition = Condition::parse("b > 1 || (a == 'x' && exists(c)) || b < 0").unwrap();
        assert_eq!(condition.attributes(), vec!["a", "b", "c"]);
    }
}
