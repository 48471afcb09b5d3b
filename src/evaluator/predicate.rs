//! Convergence predicate grammar.
//!
//! A small boolean expression over named scalar fields of a cycle group's
//! latest output snapshot, e.g. `score >= 0.95` or
//! `converged == true || attempts >= 3`. Parsed once when the group is
//! declared; evaluation is side-effect-free. A field absent from the
//! snapshot makes its comparison false (the loop keeps iterating) rather
//! than raising an error.
//!
//! Grammar:
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | primary
//! primary := "(" expr ")" | "true" | "false" | path op literal
//! op      := "==" | "!=" | ">=" | "<=" | ">" | "<"
//! literal := number | string | "true" | "false" | "null"
//! path    := identifier ("." segment)*
//! ```

use serde_json::Value;

use super::operators::{compare, ComparisonOperator};
use crate::error::WorkflowError;
use crate::resolver::{resolve, OutputBundle, PathExpr};

/// A parsed convergence predicate.
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        path: PathExpr,
        op: ComparisonOperator,
        value: Value,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Literal(bool),
}

impl Predicate {
    /// Parse an expression string.
    pub fn parse(expr: &str) -> Result<Self, WorkflowError> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(WorkflowError::PredicateParse(format!(
                "unexpected trailing input at token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(predicate)
    }

    /// Evaluate against the latest snapshot.
    pub fn evaluate(&self, snapshot: &OutputBundle) -> bool {
        match self {
            Predicate::Compare { path, op, value } => match resolve(snapshot, path) {
                Some(actual) => compare(*op, actual, value),
                // Absent field: not converged yet.
                None => false,
            },
            Predicate::And(a, b) => a.evaluate(snapshot) && b.evaluate(snapshot),
            Predicate::Or(a, b) => a.evaluate(snapshot) || b.evaluate(snapshot),
            Predicate::Not(inner) => !inner.evaluate(snapshot),
            Predicate::Literal(b) => *b,
        }
    }

    /// Top-level field names referenced by the predicate, for build-time
    /// validation against the group's declared outputs.
    pub fn referenced_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields.dedup();
        fields
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Predicate::Compare { path, .. } => {
                if let Some(head) = path.head() {
                    out.push(head.to_string());
                }
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
            Predicate::Not(inner) => inner.collect_fields(out),
            Predicate::Literal(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(ComparisonOperator),
    And,
    Or,
    Not,
    True,
    False,
    Null,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, WorkflowError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '>' | '<' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c == '>', eq) {
                    (true, true) => ComparisonOperator::GreaterOrEqual,
                    (true, false) => ComparisonOperator::GreaterThan,
                    (false, true) => ComparisonOperator::LessOrEqual,
                    (false, false) => ComparisonOperator::LessThan,
                };
                tokens.push(Token::Op(op));
                i += if eq { 2 } else { 1 };
            }
            '=' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(WorkflowError::PredicateParse(
                        "single '=' is not an operator, use '=='".to_string(),
                    ));
                }
                tokens.push(Token::Op(ComparisonOperator::Equal));
                i += 2;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(ComparisonOperator::NotEqual));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(WorkflowError::PredicateParse(
                        "unterminated string literal".to_string(),
                    ));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().map_err(|_| {
                    WorkflowError::PredicateParse(format!("invalid number: {}", text))
                })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(WorkflowError::PredicateParse(format!(
                    "unexpected character: {:?}",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Predicate, WorkflowError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, WorkflowError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate, WorkflowError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate, WorkflowError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(WorkflowError::PredicateParse(
                        "expected closing parenthesis".to_string(),
                    )),
                }
            }
            Some(Token::True) => Ok(Predicate::Literal(true)),
            Some(Token::False) => Ok(Predicate::Literal(false)),
            Some(Token::Ident(name)) => {
                let path = PathExpr::parse(&name).ok_or_else(|| {
                    WorkflowError::PredicateParse(format!("invalid field path: {}", name))
                })?;
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    other => {
                        return Err(WorkflowError::PredicateParse(format!(
                            "expected comparison operator after '{}', found {:?}",
                            name, other
                        )));
                    }
                };
                let value = self.parse_literal()?;
                Ok(Predicate::Compare { path, op, value })
            }
            other => Err(WorkflowError::PredicateParse(format!(
                "unexpected token: {:?}",
                other
            ))),
        }
    }

    fn parse_literal(&mut self) -> Result<Value, WorkflowError> {
        match self.next() {
            Some(Token::Number(n)) => {
                // Keep integral literals integral for exact reporting.
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Ok(Value::from(n as i64))
                } else {
                    Ok(Value::from(n))
                }
            }
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Null) => Ok(Value::Null),
            other => Err(WorkflowError::PredicateParse(format!(
                "expected literal, found {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn snapshot(pairs: &[(&str, Value)]) -> OutputBundle {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_simple_comparison() {
        let p = Predicate::parse("score >= 0.95").unwrap();
        assert!(p.evaluate(&snapshot(&[("score", json!(0.97))])));
        assert!(!p.evaluate(&snapshot(&[("score", json!(0.5))])));
    }

    #[test]
    fn test_missing_field_is_false() {
        let p = Predicate::parse("score >= 0.95").unwrap();
        assert!(!p.evaluate(&HashMap::new()));
    }

    #[test]
    fn test_boolean_connectives() {
        let p = Predicate::parse("done == true || attempts >= 3").unwrap();
        assert!(p.evaluate(&snapshot(&[("done", json!(true)), ("attempts", json!(0))])));
        assert!(p.evaluate(&snapshot(&[("done", json!(false)), ("attempts", json!(3))])));
        assert!(!p.evaluate(&snapshot(&[("done", json!(false)), ("attempts", json!(1))])));

        let p = Predicate::parse("a > 1 && b < 2").unwrap();
        assert!(p.evaluate(&snapshot(&[("a", json!(2)), ("b", json!(1))])));
        assert!(!p.evaluate(&snapshot(&[("a", json!(2)), ("b", json!(5))])));
    }

    #[test]
    fn test_word_connectives_and_not() {
        let p = Predicate::parse("not (status == 'pending') and count >= 1").unwrap();
        assert!(p.evaluate(&snapshot(&[("status", json!("done")), ("count", json!(2))])));
        assert!(!p.evaluate(&snapshot(&[("status", json!("pending")), ("count", json!(2))])));
    }

    #[test]
    fn test_string_and_null_literals() {
        let p = Predicate::parse("state == \"converged\"").unwrap();
        assert!(p.evaluate(&snapshot(&[("state", json!("converged"))])));

        let p = Predicate::parse("error == null").unwrap();
        assert!(p.evaluate(&snapshot(&[("error", json!(null))])));
        assert!(!p.evaluate(&snapshot(&[("error", json!("boom"))])));
    }

    #[test]
    fn test_dotted_path() {
        let p = Predicate::parse("metrics.loss <= 0.01").unwrap();
        assert!(p.evaluate(&snapshot(&[("metrics", json!({"loss": 0.005}))])));
        assert_eq!(p.referenced_fields(), vec!["metrics".to_string()]);
    }

    #[test]
    fn test_referenced_fields() {
        let p = Predicate::parse("a >= 1 && (b == 'x' || a < 5)").unwrap();
        let mut fields = p.referenced_fields();
        fields.sort();
        fields.dedup();
        assert_eq!(fields, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Predicate::parse("score >").is_err());
        assert!(Predicate::parse("score = 5").is_err());
        assert!(Predicate::parse("(score >= 5").is_err());
        assert!(Predicate::parse("score >= 5 extra").is_err());
        assert!(Predicate::parse("'lonely'").is_err());
        assert!(Predicate::parse("score >= 'unterminated").is_err());
    }

    #[test]
    fn test_negative_number_literal() {
        let p = Predicate::parse("delta <= -0.5").unwrap();
        assert!(p.evaluate(&snapshot(&[("delta", json!(-1.0))])));
        assert!(!p.evaluate(&snapshot(&[("delta", json!(0.0))])));
    }
}
