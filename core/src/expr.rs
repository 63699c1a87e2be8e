//! Check expressions
//!
//! Checks, and the optional `run_if` predicate of probes, only rely on the
//! [`Expression`] trait. [`CompiledExpression`] is the built-in engine: a
//! small precedence-climbing parser over scalars, booleans and strings.

use chrono::{Datelike, Local, Timelike};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

use crate::{Error, Result, Scalar};

/// Evaluation environment: variable name to value
pub type Env = HashMap<String, Scalar>;

/// Evaluable expression
pub trait Expression: fmt::Debug + fmt::Display + Send + Sync {
    /// Evaluate against an environment
    fn evaluate(&self, env: &Env) -> Result<Scalar>;

    /// Names of the variables the expression references
    fn vars(&self) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Scalar),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 17] = [
    "||", "&&", "==", "!=", "=~", "!~", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "=",
];

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&x| x == c)
                    .ok_or_else(|| Error::Expression(format!("unterminated string in '{}'", source)))?;
                let text: String = chars[i + 1..i + 1 + end].iter().collect();
                tokens.push(Token::Literal(Scalar::String(text)));
                i += end + 2;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.contains('.') {
                    text.parse::<f64>().map(Scalar::Float).ok()
                } else {
                    text.parse::<i64>().map(Scalar::Integer).ok()
                };
                let value = value
                    .ok_or_else(|| Error::Expression(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Scalar::Boolean(true)),
                    "false" => Token::Literal(Scalar::Boolean(false)),
                    _ => Token::Ident(word),
                });
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(*op))
                    .ok_or_else(|| {
                        Error::Expression(format!("unexpected character '{}' in '{}'", c, source))
                    })?;
                if *op == "=" {
                    return Err(Error::Expression(format!(
                        "single '=' is not an operator (use '==') in '{}'",
                        source
                    )));
                }
                tokens.push(Token::Op(op));
                i += op.len();
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Node {
    Literal(Scalar),
    Var(String),
    Unary(&'static str, Box<Node>),
    Binary(&'static str, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

/// Binary operator levels, loosest first
const LEVELS: [&[&str]; 6] = [
    &["||"],
    &["&&"],
    &["==", "!=", "=~", "!~"],
    &["<", "<=", ">", ">="],
    &["+", "-"],
    &["*", "/", "%"],
];

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
        self.pos += 1;
        token
    }

    fn binary(&mut self, level: usize) -> Result<Node> {
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut left = self.binary(level + 1)?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if !LEVELS[level].contains(&op) {
                break;
            }
            self.pos += 1;
            let right = self.binary(level + 1)?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Node> {
        if let Some(Token::Op(op @ ("!" | "-"))) = self.peek() {
            let op = *op;
            self.pos += 1;
            return Ok(Node::Unary(op, Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Node::Literal(value)),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Node::Var(name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(Node::Call(name, args));
                }
                loop {
                    args.push(self.binary(0)?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        other => {
                            return Err(Error::Expression(format!(
                                "expected ',' or ')' in call to {}, found {:?}",
                                name, other
                            )))
                        }
                    }
                }
                Ok(Node::Call(name, args))
            }
            Some(Token::LParen) => {
                let inner = self.binary(0)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(Error::Expression(format!("expected ')', found {:?}", other))),
                }
            }
            other => Err(Error::Expression(format!("unexpected token {:?}", other))),
        }
    }
}

/// Expression parsed by the built-in engine
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: String,
    root: Node,
}

impl CompiledExpression {
    /// Parse an expression
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(Error::Expression("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.binary(0)?;
        if let Some(token) = parser.peek() {
            return Err(Error::Expression(format!(
                "unexpected trailing {:?} in '{}'",
                token, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }
}

impl fmt::Display for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Expression for CompiledExpression {
    fn evaluate(&self, env: &Env) -> Result<Scalar> {
        eval(&self.root, env)
    }

    fn vars(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_vars(&self.root, &mut names);
        names
    }
}

fn collect_vars(node: &Node, names: &mut Vec<String>) {
    match node {
        Node::Literal(_) => {}
        Node::Var(name) => {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        Node::Unary(_, inner) => collect_vars(inner, names),
        Node::Binary(_, left, right) => {
            collect_vars(left, names);
            collect_vars(right, names);
        }
        Node::Call(_, args) => args.iter().for_each(|a| collect_vars(a, names)),
    }
}

fn as_bool(value: Scalar, op: &str) -> Result<bool> {
    match value {
        Scalar::Boolean(b) => Ok(b),
        other => Err(Error::Expression(format!(
            "operator '{}' needs a boolean, got '{}'",
            op, other
        ))),
    }
}

fn as_f64(value: &Scalar) -> Option<f64> {
    match value {
        Scalar::Integer(v) => Some(*v as f64),
        Scalar::Float(v) => Some(*v),
        _ => None,
    }
}

fn eval(node: &Node, env: &Env) -> Result<Scalar> {
    match node {
        Node::Literal(value) => Ok(value.clone()),
        Node::Var(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Expression(format!("no parameter '{}' found", name))),
        Node::Unary("!", inner) => Ok(Scalar::Boolean(!as_bool(eval(inner, env)?, "!")?)),
        Node::Unary(_, inner) => match eval(inner, env)? {
            Scalar::Integer(v) => Ok(Scalar::Integer(-v)),
            Scalar::Float(v) => Ok(Scalar::Float(-v)),
            other => Err(Error::Expression(format!("can't negate '{}'", other))),
        },
        Node::Binary("&&", left, right) => {
            let value = as_bool(eval(left, env)?, "&&")? && as_bool(eval(right, env)?, "&&")?;
            Ok(Scalar::Boolean(value))
        }
        Node::Binary("||", left, right) => {
            let value = as_bool(eval(left, env)?, "||")? || as_bool(eval(right, env)?, "||")?;
            Ok(Scalar::Boolean(value))
        }
        Node::Binary(op, left, right) => binary(op, eval(left, env)?, eval(right, env)?),
        Node::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, env))
                .collect::<Result<Vec<_>>>()?;
            call(name, values)
        }
    }
}

fn binary(op: &str, left: Scalar, right: Scalar) -> Result<Scalar> {
    match op {
        "==" => return Ok(Scalar::Boolean(scalar_eq(&left, &right))),
        "!=" => return Ok(Scalar::Boolean(!scalar_eq(&left, &right))),
        "=~" | "!~" => {
            let re = Regex::new(&right.to_string())
                .map_err(|e| Error::Expression(format!("invalid regex '{}': {}", right, e)))?;
            let found = re.is_match(&left.to_string());
            return Ok(Scalar::Boolean(if op == "=~" { found } else { !found }));
        }
        _ => {}
    }

    if op == "+" {
        if let (Scalar::String(_), _) | (_, Scalar::String(_)) = (&left, &right) {
            return Ok(Scalar::String(format!("{}{}", left, right)));
        }
    }

    if let (Scalar::String(l), Scalar::String(r)) = (&left, &right) {
        return match op {
            "<" => Ok(Scalar::Boolean(l < r)),
            "<=" => Ok(Scalar::Boolean(l <= r)),
            ">" => Ok(Scalar::Boolean(l > r)),
            ">=" => Ok(Scalar::Boolean(l >= r)),
            _ => Err(Error::Expression(format!("operator '{}' can't apply to strings", op))),
        };
    }

    if let (Scalar::Integer(l), Scalar::Integer(r)) = (&left, &right) {
        let (l, r) = (*l, *r);
        let overflow = || Error::Expression(format!("integer overflow in {} {} {}", l, op, r));
        match op {
            "+" => return l.checked_add(r).map(Scalar::Integer).ok_or_else(overflow),
            "-" => return l.checked_sub(r).map(Scalar::Integer).ok_or_else(overflow),
            "*" => return l.checked_mul(r).map(Scalar::Integer).ok_or_else(overflow),
            "%" if r == 0 => return Err(Error::Expression("modulo by zero".to_string())),
            "%" => return l.checked_rem(r).map(Scalar::Integer).ok_or_else(overflow),
            _ => {}
        }
    }

    let (l, r) = match (as_f64(&left), as_f64(&right)) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(Error::Expression(format!(
                "operator '{}' can't apply to '{}' and '{}'",
                op, left, right
            )))
        }
    };
    match op {
        "<" => Ok(Scalar::Boolean(l < r)),
        "<=" => Ok(Scalar::Boolean(l <= r)),
        ">" => Ok(Scalar::Boolean(l > r)),
        ">=" => Ok(Scalar::Boolean(l >= r)),
        "+" => Ok(Scalar::Float(l + r)),
        "-" => Ok(Scalar::Float(l - r)),
        "*" => Ok(Scalar::Float(l * r)),
        "/" if r == 0.0 => Err(Error::Expression("division by zero".to_string())),
        "/" => Ok(Scalar::Float(l / r)),
        "%" => Ok(Scalar::Float(l % r)),
        _ => Err(Error::Expression(format!("unknown operator '{}'", op))),
    }
}

fn scalar_eq(left: &Scalar, right: &Scalar) -> bool {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn call(name: &str, args: Vec<Scalar>) -> Result<Scalar> {
    let now = Local::now();
    match (name, args.as_slice()) {
        ("strlen", [value]) => Ok(Scalar::Integer(value.to_string().chars().count() as i64)),
        ("hour", []) => Ok(Scalar::Integer(now.hour() as i64)),
        ("minute", []) => Ok(Scalar::Integer(now.minute() as i64)),
        ("weekday", []) => Ok(Scalar::Integer(now.weekday().num_days_from_sunday() as i64)),
        ("strlen" | "hour" | "minute" | "weekday", _) => Err(Error::Expression(format!(
            "wrong argument count for {}()",
            name
        ))),
        _ => Err(Error::Expression(format!("unknown function '{}'", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, Scalar)]) -> Env {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval_str(source: &str, env: &Env) -> Result<Scalar> {
        CompiledExpression::parse(source)?.evaluate(env)
    }

    #[test]
    fn test_comparison_with_defaults() {
        let env = env(&[
            ("LOAD", Scalar::Float(3.5)),
            ("warn_load", Scalar::Integer(2)),
        ]);
        assert_eq!(eval_str("LOAD > warn_load", &env).unwrap(), Scalar::Boolean(true));
        assert_eq!(
            eval_str("LOAD > warn_load * 2", &env).unwrap(),
            Scalar::Boolean(false)
        );
    }

    #[test]
    fn test_precedence_and_logic() {
        let env = env(&[("A", Scalar::Integer(1)), ("B", Scalar::Integer(5))]);
        assert_eq!(
            eval_str("A == 1 && (B < 3 || B >= 5)", &env).unwrap(),
            Scalar::Boolean(true)
        );
        assert_eq!(eval_str("!(A == 1)", &env).unwrap(), Scalar::Boolean(false));
        assert_eq!(eval_str("1 + 2 * 3", &env).unwrap(), Scalar::Integer(7));
        assert_eq!(eval_str("-A + 4", &env).unwrap(), Scalar::Integer(3));
    }

    #[test]
    fn test_strings_and_regex() {
        let env = env(&[("STATE", Scalar::from("degraded"))]);
        assert_eq!(
            eval_str("STATE != 'ok'", &env).unwrap(),
            Scalar::Boolean(true)
        );
        assert_eq!(
            eval_str("STATE =~ \"^deg\"", &env).unwrap(),
            Scalar::Boolean(true)
        );
        assert_eq!(eval_str("strlen(STATE)", &env).unwrap(), Scalar::Integer(8));
        assert_eq!(
            eval_str("STATE + '!'", &env).unwrap(),
            Scalar::from("degraded!")
        );
    }

    #[test]
    fn test_vars_are_deduplicated_in_order() {
        let expr = CompiledExpression::parse("DISK > limit || DISK_INODES > limit").unwrap();
        assert_eq!(expr.vars(), vec!["DISK", "limit", "DISK_INODES"]);
        assert_eq!(expr.to_string(), "DISK > limit || DISK_INODES > limit");
    }

    #[test]
    fn test_errors() {
        let empty = Env::new();
        assert!(eval_str("MISSING > 1", &empty).is_err());
        assert!(eval_str("1 && true", &empty).is_err());
        assert!(eval_str("1 / 0", &empty).is_err());
        assert!(CompiledExpression::parse("A = 1").is_err());
        assert!(CompiledExpression::parse("(A > 1").is_err());
        assert!(CompiledExpression::parse("A > 1 )").is_err());
        assert!(CompiledExpression::parse("").is_err());
        assert!(eval_str("nope()", &empty).is_err());
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let env = env(&[("LOW", Scalar::Integer(i64::MIN))]);
        let err = eval_str("LOW % -1", &env).unwrap_err();
        assert!(err.to_string().contains("integer overflow"), "{}", err);
        assert!(eval_str("LOW - 1", &env).is_err());
        assert_eq!(eval_str("7 % -3", &env).unwrap(), Scalar::Integer(1));
    }

    #[test]
    fn test_non_boolean_result_is_a_value() {
        let env = env(&[("CPU", Scalar::Integer(42))]);
        assert_eq!(eval_str("CPU", &env).unwrap(), Scalar::Integer(42));
    }
}
