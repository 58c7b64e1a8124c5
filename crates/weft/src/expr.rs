// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Expression mini-language for template data binding.
//!
//! Directive arguments and interpolation tags carry expressions over the
//! layered data context: literals (including array/object literals, so
//! include attributes keep structured types), dotted member paths, indexing,
//! comparison/logic/arithmetic operators and a small builtin set.
//!
//! The grammar is a nom recursive-descent parser with conventional
//! precedence climbing. Lookup is lenient: an unknown variable evaluates to
//! `null` rather than failing, which is what `isset`/`empty` predicates rely
//! on.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::{alpha1, alphanumeric1, char, multispace0};
use nom::combinator::{all_consuming, map, opt, recognize};
use nom::multi::{many0, separated_list0};
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, separated_pair};
use nom::{IResult, Parser};
use serde_json::{Map, Number, Value};

/// A parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal JSON value (string, number, bool, null).
    Literal(Value),
    /// A variable reference.
    Var(String),
    /// Member access `base.field`.
    Member(Box<Expr>, String),
    /// Index access `base[expr]`.
    Index(Box<Expr>, Box<Expr>),
    /// Unary operator application.
    Unary(UnaryOp, Box<Expr>),
    /// Binary operator application.
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Builtin function call.
    Call(String, Vec<Expr>),
    /// Array literal.
    Array(Vec<Expr>),
    /// Object literal; entries keep declaration order of evaluation.
    Object(Vec<(String, Expr)>),
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation (`not` / `!`).
    Not,
    /// Arithmetic negation.
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&` / `and`
    And,
    /// `||` / `or`
    Or,
    /// `+` (numeric add or string concat)
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
}

type PResult<'a, T> = IResult<&'a str, T>;

fn identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))
    .parse(input)
}

fn string_literal(input: &str) -> PResult<'_, &str> {
    alt((
        delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        delimited(char('"'), take_while(|c| c != '"'), char('"')),
    ))
    .parse(input)
}

/// Stores a float as an integer JSON number when it is whole, so rendered
/// indexes read `0` rather than `0.0`.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn array_literal(input: &str) -> PResult<'_, Expr> {
    map(
        delimited(
            char('['),
            separated_list0(char(','), expression),
            preceded(multispace0, char(']')),
        ),
        Expr::Array,
    )
    .parse(input)
}

fn object_key(input: &str) -> PResult<'_, String> {
    alt((
        map(string_literal, |s: &str| s.to_string()),
        map(identifier, |s: &str| s.to_string()),
    ))
    .parse(input)
}

fn object_literal(input: &str) -> PResult<'_, Expr> {
    map(
        delimited(
            char('{'),
            separated_list0(
                char(','),
                separated_pair(
                    delimited(multispace0, object_key, multispace0),
                    char(':'),
                    expression,
                ),
            ),
            preceded(multispace0, char('}')),
        ),
        Expr::Object,
    )
    .parse(input)
}

fn primary(input: &str) -> PResult<'_, Expr> {
    let (input, _) = multispace0.parse(input)?;
    if let Ok((rest, s)) = string_literal(input) {
        return Ok((rest, Expr::Literal(Value::String(s.to_string()))));
    }
    if input.starts_with('[') {
        return array_literal(input);
    }
    if input.starts_with('{') {
        return object_literal(input);
    }
    if input.starts_with('(') {
        return delimited(char('('), expression, preceded(multispace0, char(')')))
            .parse(input);
    }
    if let Ok((rest, ident)) = identifier(input) {
        return match ident {
            "true" => Ok((rest, Expr::Literal(Value::Bool(true)))),
            "false" => Ok((rest, Expr::Literal(Value::Bool(false)))),
            "null" => Ok((rest, Expr::Literal(Value::Null))),
            _ => {
                // A trailing '(' turns the identifier into a builtin call.
                let (rest, args) = opt(delimited(
                    preceded(multispace0, char('(')),
                    separated_list0(char(','), expression),
                    preceded(multispace0, char(')')),
                ))
                .parse(rest)?;
                match args {
                    Some(args) => Ok((rest, Expr::Call(ident.to_string(), args))),
                    None => Ok((rest, Expr::Var(ident.to_string()))),
                }
            }
        };
    }
    map(double, |n| Expr::Literal(number_value(n))).parse(input)
}

fn postfix(input: &str) -> PResult<'_, Expr> {
    let (mut input, mut expr) = primary(input)?;
    loop {
        let trimmed = input.trim_start();
        if let Some(rest) = trimmed.strip_prefix('.') {
            let (rest, field) = identifier(rest)?;
            expr = Expr::Member(Box::new(expr), field.to_string());
            input = rest;
        } else if trimmed.starts_with('[') {
            let (rest, index) =
                delimited(char('['), expression, preceded(multispace0, char(']')))
                    .parse(trimmed)?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
            input = rest;
        } else {
            return Ok((input, expr));
        }
    }
}

fn unary(input: &str) -> PResult<'_, Expr> {
    let (input, _) = multispace0.parse(input)?;
    if let Some(rest) = input.strip_prefix("!=") {
        // Not a unary bang; let the equality level see it.
        let _ = rest;
    } else if let Some(rest) = input.strip_prefix('!') {
        let (rest, inner) = unary(rest)?;
        return Ok((rest, Expr::Unary(UnaryOp::Not, Box::new(inner))));
    }
    if let Some(rest) = input.strip_prefix("not") {
        if !rest.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
            let (rest, inner) = unary(rest)?;
            return Ok((rest, Expr::Unary(UnaryOp::Not, Box::new(inner))));
        }
    }
    if let Some(rest) = input.strip_prefix('-') {
        let (rest, inner) = unary(rest)?;
        return Ok((rest, Expr::Unary(UnaryOp::Neg, Box::new(inner))));
    }
    postfix(input)
}

/// One precedence level: parses `next (op next)*` left-associatively.
fn binary_level<'a>(
    input: &'a str,
    ops: &[(&str, BinOp)],
    next: fn(&'a str) -> PResult<'a, Expr>,
) -> PResult<'a, Expr> {
    let (mut input, mut lhs) = next(input)?;
    'outer: loop {
        let trimmed = input.trim_start();
        let ws = input.len() - trimmed.len();
        for (token, op) in ops {
            if let Some(rest) = trimmed.strip_prefix(token) {
                // Word operators need a boundary so `order` is not `or der`.
                if token.ends_with(|c: char| c.is_alphabetic())
                    && rest.starts_with(|c: char| c.is_alphanumeric() || c == '_')
                {
                    continue;
                }
                let after = &input[ws + token.len()..];
                let (rest_input, rhs) = next(after)?;
                lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                input = rest_input;
                continue 'outer;
            }
        }
        return Ok((input, lhs));
    }
}

fn multiplicative(input: &str) -> PResult<'_, Expr> {
    binary_level(
        input,
        &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
        unary,
    )
}

fn additive(input: &str) -> PResult<'_, Expr> {
    binary_level(input, &[("+", BinOp::Add), ("-", BinOp::Sub)], multiplicative)
}

fn comparison(input: &str) -> PResult<'_, Expr> {
    binary_level(
        input,
        &[
            ("<=", BinOp::Le),
            (">=", BinOp::Ge),
            ("<", BinOp::Lt),
            (">", BinOp::Gt),
        ],
        additive,
    )
}

fn equality(input: &str) -> PResult<'_, Expr> {
    binary_level(input, &[("==", BinOp::Eq), ("!=", BinOp::Ne)], comparison)
}

fn and_expr(input: &str) -> PResult<'_, Expr> {
    binary_level(input, &[("&&", BinOp::And), ("and", BinOp::And)], equality)
}

fn or_expr(input: &str) -> PResult<'_, Expr> {
    binary_level(input, &[("||", BinOp::Or), ("or", BinOp::Or)], and_expr)
}

fn expression(input: &str) -> PResult<'_, Expr> {
    or_expr(input)
}

/// Parses a complete expression, requiring all input to be consumed.
pub fn parse_expression(input: &str) -> Result<Expr, String> {
    match all_consuming(delimited(multispace0, expression, multispace0)).parse(input) {
        Ok((_, expr)) => Ok(expr),
        Err(e) => Err(format!("cannot parse expression '{}': {}", input.trim(), e)),
    }
}

/// Variable lookup callback threaded through evaluation.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<Value>;

/// JSON truthiness: `null`, `false`, `0`, `""` and `[]` are falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn builtin_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        _ => 0,
    }
}

fn builtin_class(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if !s.is_empty() => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                builtin_class(item, out);
            }
        }
        Value::Object(map) => {
            for (name, cond) in map {
                if truthy(cond) {
                    out.push(name.clone());
                }
            }
        }
        _ => {}
    }
}

/// Evaluates an expression against a variable lookup.
pub fn eval(expr: &Expr, lookup: Lookup) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => Ok(lookup(name).unwrap_or(Value::Null)),
        Expr::Member(base, field) => {
            let base = eval(base, lookup)?;
            Ok(base.get(field.as_str()).cloned().unwrap_or(Value::Null))
        }
        Expr::Index(base, index) => {
            let base = eval(base, lookup)?;
            let index = eval(index, lookup)?;
            let value = match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned(),
                (Value::Object(map), Value::String(key)) => map.get(key).cloned(),
                _ => None,
            };
            Ok(value.unwrap_or(Value::Null))
        }
        Expr::Unary(op, inner) => {
            let inner = eval(inner, lookup)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&inner))),
                UnaryOp::Neg => match as_f64(&inner) {
                    Some(n) => Ok(number_value(-n)),
                    None => Err("cannot negate a non-number".to_string()),
                },
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, lookup),
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, lookup)?);
            }
            eval_builtin(name, &values)
        }
        Expr::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, lookup)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Object(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval(value, lookup)?);
            }
            Ok(Value::Object(map))
        }
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, lookup: Lookup) -> Result<Value, String> {
    // Short-circuit forms first.
    match op {
        BinOp::And => {
            let left = eval(lhs, lookup)?;
            if !truthy(&left) {
                return Ok(Value::Bool(false));
            }
            let right = eval(rhs, lookup)?;
            return Ok(Value::Bool(truthy(&right)));
        }
        BinOp::Or => {
            let left = eval(lhs, lookup)?;
            if truthy(&left) {
                return Ok(Value::Bool(true));
            }
            let right = eval(rhs, lookup)?;
            return Ok(Value::Bool(truthy(&right)));
        }
        _ => {}
    }

    let left = eval(lhs, lookup)?;
    let right = eval(rhs, lookup)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(value_eq(&left, &right))),
        BinOp::Ne => Ok(Value::Bool(!value_eq(&left, &right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (as_f64(&left), as_f64(&right)) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => match (&left, &right) {
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => None,
                },
            };
            let ordering =
                ordering.ok_or_else(|| "cannot compare these values".to_string())?;
            let result = match op {
                BinOp::Lt => ordering == std::cmp::Ordering::Less,
                BinOp::Le => ordering != std::cmp::Ordering::Greater,
                BinOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Add => {
            if let (Some(x), Some(y)) = (as_f64(&left), as_f64(&right)) {
                Ok(number_value(x + y))
            } else if left.is_string() || right.is_string() {
                Ok(Value::String(format!(
                    "{}{}",
                    stringify(&left),
                    stringify(&right)
                )))
            } else {
                Err("cannot add these values".to_string())
            }
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            let (x, y) = match (as_f64(&left), as_f64(&right)) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err("arithmetic needs numeric operands".to_string()),
            };
            let result = match op {
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => x / y,
                BinOp::Rem => x % y,
                _ => unreachable!(),
            };
            Ok(number_value(result))
        }
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn eval_builtin(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "len" => Ok(Value::Number(Number::from(
            args.first().map(builtin_len).unwrap_or(0) as i64,
        ))),
        "isset" => Ok(Value::Bool(
            args.first().map(|v| !v.is_null()).unwrap_or(false),
        )),
        "empty" => Ok(Value::Bool(
            args.first().map(|v| !truthy(v)).unwrap_or(true),
        )),
        "json" => {
            let value = args.first().cloned().unwrap_or(Value::Null);
            serde_json::to_string(&value).map(Value::String).map_err(|e| e.to_string())
        }
        "class" => {
            let mut classes = Vec::new();
            for arg in args {
                builtin_class(arg, &mut classes);
            }
            Ok(Value::String(classes.join(" ")))
        }
        other => Err(format!("unknown function '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_with(input: &str, data: Value) -> Value {
        let expr = parse_expression(input).unwrap();
        let lookup = move |name: &str| data.get(name).cloned();
        eval(&expr, &lookup).unwrap()
    }

    #[test]
    fn test_literals_and_paths() {
        assert_eq!(eval_with("'hi'", json!({})), json!("hi"));
        assert_eq!(eval_with("42", json!({})), json!(42));
        assert_eq!(eval_with("user.name", json!({"user": {"name": "ada"}})), json!("ada"));
        assert_eq!(eval_with("items[1]", json!({"items": ["a", "b"]})), json!("b"));
        assert_eq!(eval_with("missing.deep", json!({})), json!(null));
    }

    #[test]
    fn test_operators() {
        assert_eq!(eval_with("1 + 2 * 3", json!({})), json!(7));
        assert_eq!(eval_with("n != 0", json!({"n": 2})), json!(true));
        assert_eq!(eval_with("not active", json!({"active": false})), json!(true));
        assert_eq!(eval_with("a and b", json!({"a": 1, "b": 0})), json!(false));
        assert_eq!(eval_with("a or b", json!({"a": 0, "b": 1})), json!(true));
        assert_eq!(eval_with("'a' + 'b'", json!({})), json!("ab"));
        assert_eq!(eval_with("count >= 2", json!({"count": 2})), json!(true));
    }

    #[test]
    fn test_structured_literals() {
        assert_eq!(
            eval_with("[1, 'two', flag]", json!({"flag": true})),
            json!([1, "two", true])
        );
        assert_eq!(
            eval_with("{ a: 1, 'b c': x }", json!({"x": 2})),
            json!({"a": 1, "b c": 2})
        );
    }

    #[test]
    fn test_builtins() {
        assert_eq!(eval_with("len(items)", json!({"items": [1, 2, 3]})), json!(3));
        assert_eq!(eval_with("isset(x)", json!({"x": 0})), json!(true));
        assert_eq!(eval_with("isset(x)", json!({})), json!(false));
        assert_eq!(eval_with("empty(items)", json!({"items": []})), json!(true));
        assert_eq!(eval_with("json(x)", json!({"x": {"a": 1}})), json!("{\"a\":1}"));
        assert_eq!(
            eval_with("class({ active: on, hidden: off })", json!({"on": true, "off": false})),
            json!("active")
        );
    }

    #[test]
    fn test_word_operator_boundary() {
        // `order` must stay a single variable, not `or der`.
        assert_eq!(eval_with("order", json!({"order": 5})), json!(5));
        assert_eq!(eval_with("nothing", json!({"nothing": 1})), json!(1));
    }

    #[test]
    fn test_parse_failure_is_reported() {
        assert!(parse_expression("a ++").is_err());
        assert!(parse_expression("").is_err());
    }
}
