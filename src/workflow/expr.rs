//! Sandboxed expressions for conditions and template holes.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or       := and ("or" and)*
//! and      := not ("and" not)*
//! not      := "not" not | compare
//! compare  := filtered (op filtered)?      op: == != < <= > >= in "not in" contains
//! filtered := primary ("|" filter)*
//! primary  := number | string | true | false | null | path | "(" or ")" | "[" list "]"
//! path     := ident ("." (ident | digits))*
//! ```
//!
//! Paths only read from the variable map. There are no function calls; the
//! filters are a fixed list.

use super::Variables;
use crate::{Error, ErrorContext, Result};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Length,
    Lower,
    Upper,
    Trim,
    First,
    Last,
    Json,
    String,
    Int,
}

impl Filter {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "length" => Self::Length,
            "lower" => Self::Lower,
            "upper" => Self::Upper,
            "trim" => Self::Trim,
            "first" => Self::First,
            "last" => Self::Last,
            "json" => Self::Json,
            "string" => Self::String,
            "int" => Self::Int,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Root variable and the segments below it.
    Path(String, Vec<PathSegment>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Filter(Box<Expr>, Filter),
}

fn expr_error(source: &str, msg: impl Into<String>) -> Error {
    Error::workflow_with_context(
        msg,
        ErrorContext::new()
            .with_details(source.to_string())
            .with_source("expression"),
    )
}

impl Expr {
    /// Parse a bare expression or one wrapped in `{{ }}`.
    pub fn parse(source: &str) -> Result<Self> {
        let trimmed = source.trim();
        let inner = trimmed
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);
        let tokens = lex(inner).map_err(|m| expr_error(source, m))?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or().map_err(|m| expr_error(source, m))?;
        if parser.pos != parser.tokens.len() {
            return Err(expr_error(
                source,
                format!("unexpected {}", parser.tokens[parser.pos]),
            ));
        }
        Ok(expr)
    }

    /// Root variable names this expression reads.
    pub fn roots(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(root, _) => {
                out.insert(root.clone());
            }
            Expr::List(items) => items.iter().for_each(|e| e.roots(out)),
            Expr::Not(e) | Expr::Filter(e, _) => e.roots(out),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) => {
                a.roots(out);
                b.roots(out);
            }
        }
    }

    pub fn eval(&self, vars: &Variables) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(root, segments) => {
                let mut cur = vars.get(root).ok_or_else(|| {
                    Error::workflow_with_context(
                        format!("undefined variable '{}'", root),
                        ErrorContext::new().with_field_path(root.clone()),
                    )
                })?;
                for seg in segments {
                    let next = match (seg, cur) {
                        (PathSegment::Key(k), Value::Object(m)) => m.get(k),
                        (PathSegment::Index(i), Value::Array(a)) => a.get(*i),
                        _ => None,
                    };
                    match next {
                        Some(v) => cur = v,
                        None => return Ok(Value::Null),
                    }
                }
                Ok(cur.clone())
            }
            Expr::List(items) => items
                .iter()
                .map(|e| e.eval(vars))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Not(e) => Ok(Value::Bool(!truthy(&e.eval(vars)?))),
            Expr::And(a, b) => {
                Ok(Value::Bool(truthy(&a.eval(vars)?) && truthy(&b.eval(vars)?)))
            }
            Expr::Or(a, b) => Ok(Value::Bool(truthy(&a.eval(vars)?) || truthy(&b.eval(vars)?))),
            Expr::Compare(op, a, b) => compare(*op, &a.eval(vars)?, &b.eval(vars)?).map(Value::Bool),
            Expr::Filter(e, f) => apply_filter(*f, e.eval(vars)?),
        }
    }

    pub fn eval_bool(&self, vars: &Variables) -> Result<bool> {
        self.eval(vars).map(|v| truthy(&v))
    }
}

/// `null`, `false`, `0`, and empty strings, arrays and objects are false.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Text form used when a value lands in a prompt.
pub fn display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> Result<bool> {
    use std::cmp::Ordering;
    let ordering = || -> Result<Ordering> {
        let ord = match (a, b) {
            (Value::Number(_), Value::Number(_)) => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y)
            }
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        };
        ord.ok_or_else(|| {
            Error::workflow_with_context(
                format!("cannot order {} and {}", type_name(a), type_name(b)),
                ErrorContext::new().with_source("expression"),
            )
        })
    };
    Ok(match op {
        CompareOp::Eq => loose_eq(a, b),
        CompareOp::Ne => !loose_eq(a, b),
        CompareOp::Lt => ordering()? == Ordering::Less,
        CompareOp::Le => ordering()? != Ordering::Greater,
        CompareOp::Gt => ordering()? == Ordering::Greater,
        CompareOp::Ge => ordering()? != Ordering::Less,
        CompareOp::In => member(a, b)?,
        CompareOp::NotIn => !member(a, b)?,
        CompareOp::Contains => member(b, a)?,
    })
}

/// Whether `needle` is in `haystack` (array element, substring or object key).
fn member(needle: &Value, haystack: &Value) -> Result<bool> {
    match (needle, haystack) {
        (n, Value::Array(items)) => Ok(items.iter().any(|i| loose_eq(n, i))),
        (Value::String(n), Value::String(h)) => Ok(h.contains(n.as_str())),
        (Value::String(n), Value::Object(m)) => Ok(m.contains_key(n)),
        (_, Value::Null) => Ok(false),
        _ => Err(Error::workflow_with_context(
            format!("cannot test {} membership in {}", type_name(needle), type_name(haystack)),
            ErrorContext::new().with_source("expression"),
        )),
    }
}

fn apply_filter(filter: Filter, v: Value) -> Result<Value> {
    let mismatch = |v: &Value| {
        Error::workflow_with_context(
            format!("filter {:?} does not apply to {}", filter, type_name(v)),
            ErrorContext::new().with_source("expression"),
        )
    };
    Ok(match filter {
        Filter::Length => match &v {
            Value::Array(a) => Value::from(a.len()),
            Value::String(s) => Value::from(s.chars().count()),
            Value::Object(o) => Value::from(o.len()),
            Value::Null => Value::from(0),
            _ => return Err(mismatch(&v)),
        },
        Filter::Lower => Value::String(display(&v).to_lowercase()),
        Filter::Upper => Value::String(display(&v).to_uppercase()),
        Filter::Trim => Value::String(display(&v).trim().to_string()),
        Filter::First => match v {
            Value::Array(a) => a.into_iter().next().unwrap_or(Value::Null),
            Value::String(s) => s.chars().next().map_or(Value::Null, |c| Value::String(c.into())),
            other => return Err(mismatch(&other)),
        },
        Filter::Last => match v {
            Value::Array(a) => a.into_iter().last().unwrap_or(Value::Null),
            Value::String(s) => s.chars().last().map_or(Value::Null, |c| Value::String(c.into())),
            other => return Err(mismatch(&other)),
        },
        Filter::Json => Value::String(v.to_string()),
        Filter::String => Value::String(display(&v)),
        Filter::Int => match &v {
            Value::Number(n) => Value::from(n.as_f64().unwrap_or(0.0).trunc() as i64),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch(&v))?,
            Value::Bool(b) => Value::from(*b as i64),
            _ => return Err(mismatch(&v)),
        },
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Digits(usize),
    Str(String),
    Op(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Number(n) => write!(f, "{}", n),
            Token::Digits(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Op(o) => write!(f, "'{}'", o),
        }
    }
}

const OPERATORS: [&str; 13] = [
    "==", "!=", "<=", ">=", "<", ">", "|", "(", ")", "[", "]", ",", ".",
];

fn lex(src: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let after_dot = matches!(tokens.last(), Some(Token::Op(".")));
        let negative = c == '-'
            && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit())
            && !matches!(
                tokens.last(),
                Some(Token::Number(_) | Token::Digits(_) | Token::Ident(_) | Token::Str(_))
                    | Some(Token::Op(")" | "]"))
            );
        if c.is_ascii_digit() || negative {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if after_dot {
                let digits: String = chars[start..i].iter().collect();
                let n = digits.parse::<usize>().map_err(|e| e.to_string())?;
                tokens.push(Token::Digits(n));
                continue;
            }
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let n = text.parse::<f64>().map_err(|e| e.to_string())?;
            tokens.push(Token::Number(n));
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string".to_string()),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(&other) => s.push(other),
                            None => return Err("unterminated string".to_string()),
                        }
                        i += 2;
                    }
                    Some(&ch) => {
                        s.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(*op));
                i += op.len();
            }
            None => return Err(format!("unexpected character '{}'", c)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type PResult<T> = std::result::Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(match self.peek() {
                Some(t) => format!("expected '{}', found {}", op, t),
                None => format!("expected '{}' at end of expression", op),
            })
        }
    }

    fn or(&mut self) -> PResult<Expr> {
        let mut left = self.and()?;
        while self.eat_word("or") {
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> PResult<Expr> {
        let mut left = self.not()?;
        while self.eat_word("and") {
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> PResult<Expr> {
        if self.eat_word("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> PResult<Expr> {
        let left = self.filtered()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => CompareOp::Eq,
            Some(Token::Op("!=")) => CompareOp::Ne,
            Some(Token::Op("<")) => CompareOp::Lt,
            Some(Token::Op("<=")) => CompareOp::Le,
            Some(Token::Op(">")) => CompareOp::Gt,
            Some(Token::Op(">=")) => CompareOp::Ge,
            Some(Token::Ident(w)) if w == "in" => CompareOp::In,
            Some(Token::Ident(w)) if w == "contains" => CompareOp::Contains,
            Some(Token::Ident(w))
                if w == "not" && matches!(self.peek_at(1), Some(Token::Ident(n)) if n == "in") =>
            {
                self.pos += 1;
                CompareOp::NotIn
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.filtered()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn filtered(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        while self.eat_op("|") {
            let name = match self.peek() {
                Some(Token::Ident(n)) => n.clone(),
                Some(t) => return Err(format!("expected filter name, found {}", t)),
                None => return Err("expected filter name".to_string()),
            };
            let filter = Filter::from_name(&name).ok_or_else(|| format!("unknown filter '{}'", name))?;
            self.pos += 1;
            if matches!(self.peek(), Some(Token::Op("("))) {
                return Err(format!("filter '{}' takes no arguments", name));
            }
            expr = Expr::Filter(Box::new(expr), filter);
        }
        Ok(expr)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Digits(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Op("(") => {
                let inner = self.or()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Token::Op("[") => {
                let mut items = Vec::new();
                if !self.eat_op("]") {
                    loop {
                        items.push(self.or()?);
                        if self.eat_op("]") {
                            break;
                        }
                        self.expect_op(",")?;
                    }
                }
                Ok(Expr::List(items))
            }
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "none" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "in" | "contains" => {
                    Err(format!("unexpected keyword '{}'", word))
                }
                _ => {
                    if matches!(self.peek(), Some(Token::Op("("))) {
                        return Err(format!("function calls are not allowed ('{}')", word));
                    }
                    let mut segments = Vec::new();
                    while self.eat_op(".") {
                        match self.peek().cloned() {
                            Some(Token::Ident(k)) => segments.push(PathSegment::Key(k)),
                            Some(Token::Digits(i)) => segments.push(PathSegment::Index(i)),
                            _ => return Err(format!("bad path after '{}'", word)),
                        }
                        self.pos += 1;
                    }
                    Ok(Expr::Path(word, segments))
                }
            },
            other => Err(format!("unexpected {}", other)),
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: Value) -> Variables {
        v.as_object().cloned().unwrap()
    }

    fn eval(src: &str, v: Value) -> Value {
        Expr::parse(src).unwrap().eval(&vars(v)).unwrap()
    }

    #[test]
    fn test_filter_binds_tighter_than_compare() {
        assert_eq!(eval("{{ results | length > 2 }}", json!({"results": [1, 2, 3]})), json!(true));
        assert_eq!(eval("results | length > 2", json!({"results": [1]})), json!(false));
    }

    #[test]
    fn test_logic_and_membership() {
        let v = json!({"user": {"role": "admin", "tags": ["a", "b"]}, "n": 3});
        assert_eq!(eval("user.role == 'admin' and n >= 3", v.clone()), json!(true));
        assert_eq!(eval("not (n < 2) or false", v.clone()), json!(true));
        assert_eq!(eval("'a' in user.tags", v.clone()), json!(true));
        assert_eq!(eval("'z' not in user.tags", v.clone()), json!(true));
        assert_eq!(eval("user.tags contains 'b'", v.clone()), json!(true));
        assert_eq!(eval("'dm' in user.role", v.clone()), json!(true));
        assert_eq!(eval("user.tags.1 == 'b'", v.clone()), json!(true));
        assert_eq!(eval("user.missing == null", v), json!(true));
    }

    #[test]
    fn test_numbers_compare_loosely() {
        assert_eq!(eval("n == 3.0", json!({"n": 3})), json!(true));
        assert_eq!(eval("n > -1", json!({"n": 0})), json!(true));
        assert!(Expr::parse("n - 1").is_err());
    }

    #[test]
    fn test_roots() {
        let mut roots = BTreeSet::new();
        Expr::parse("a.b > 1 and c | length == 0 or [d, 1] contains 2")
            .unwrap()
            .roots(&mut roots);
        assert_eq!(roots.into_iter().collect::<Vec<_>>(), vec!["a", "c", "d"]);
    }

    #[test]
    fn test_sandbox_rejects_calls_and_unknown_filters() {
        assert!(Expr::parse("os.system('rm')").is_err());
        assert!(Expr::parse("x | eval").is_err());
        assert!(Expr::parse("x | length(1)").is_err());
        assert!(Expr::parse("a ==").is_err());
        assert!(Expr::parse("a b").is_err());
    }

    #[test]
    fn test_undefined_root_is_error() {
        let e = Expr::parse("missing > 1").unwrap().eval(&Variables::new()).unwrap_err();
        assert!(e.to_string().contains("undefined variable"));
    }

    #[test]
    fn test_ordering_type_mismatch_is_error() {
        assert!(Expr::parse("a < 'x'").unwrap().eval(&vars(json!({"a": 1}))).is_err());
    }
}
