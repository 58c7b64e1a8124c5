// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Expression evaluator adapter: contract and default backend.
//!
//! The composition engine depends only on the [`Evaluator`] trait:
//! `compile(text, options)` yields a [`CompiledTemplate`] whose
//! `render(context)` produces the final text. [`ExprEvaluator`] is the
//! built-in backend understanding the canonical control syntax the directive
//! transformer emits:
//!
//! - `{{ expr }}` escaped interpolation (delimiters configurable)
//! - `{{! expr !}}` raw interpolation
//! - `{{#if e}} ... {{#elseif e}} ... {{#else}} ... {{/if}}`
//! - `{{#each list as item with loop}} ... {{/each}}`
//! - `{{#raw}} ... {{/raw}}` literal region, no interpolation
//!
//! The `with loop` binding exposes loop metadata (index, iteration, count,
//! remaining, first, last, even, odd, depth, parent) with a parent chain for
//! nested loops.

use crate::context::DataContext;
use crate::expr::{self, Expr};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Typed failure from the evaluator backend.
#[derive(Error, Debug)]
pub enum EvalError {
    /// The template text could not be parsed into a compiled form.
    #[error("compile error: {0}")]
    Compile(String),
    /// Evaluation of a compiled template failed.
    #[error("render error: {0}")]
    Render(String),
}

/// Options handed to [`Evaluator::compile`].
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Opening interpolation delimiter.
    pub open: String,
    /// Closing interpolation delimiter.
    pub close: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            open: "{{".to_string(),
            close: "}}".to_string(),
        }
    }
}

/// A template compiled by an [`Evaluator`], ready to render repeatedly.
pub trait CompiledTemplate: Send + Sync {
    /// Renders the template against a data context.
    fn render(&self, context: &DataContext) -> Result<String, EvalError>;
}

/// Contract for the expression/template backend.
///
/// Implementations must be restricted: no host process or filesystem access
/// from inside template expressions.
pub trait Evaluator: Send + Sync {
    /// Compiles template text into a renderable form.
    fn compile(
        &self,
        text: &str,
        options: &CompileOptions,
    ) -> Result<Box<dyn CompiledTemplate>, EvalError>;

    /// Creates a boxed clone (for use in closures).
    fn clone_box(&self) -> Box<dyn Evaluator>;
}

impl Clone for Box<dyn Evaluator> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Escapes `& < > " '` for HTML output.
pub(crate) fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Interp { expr: Expr, raw: bool },
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        fallback: Option<Vec<Node>>,
    },
    Each {
        list: Expr,
        item: String,
        meta: Option<String>,
        body: Vec<Node>,
    },
}

#[derive(Debug)]
enum Piece {
    Text(String),
    If(Expr),
    ElseIf(Expr),
    Else,
    EndIf,
    Each { list: Expr, item: String, meta: Option<String> },
    EndEach,
    Interp { expr: Expr, raw: bool },
}

/// Finds the end of `close` at brace depth zero, so object literals inside
/// tags (`{{ json({a: 1}) }}`) do not terminate the tag early.
fn find_close(s: &str, close: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth: i32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        if !s.is_char_boundary(i) {
            i += 1;
            continue;
        }
        if depth == 0 && s[i..].starts_with(close) {
            return Some(i);
        }
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => depth = (depth - 1).max(0),
            _ => {}
        }
        i += 1;
    }
    None
}

fn parse_expr(text: &str) -> Result<Expr, EvalError> {
    expr::parse_expression(text).map_err(EvalError::Compile)
}

/// Splits `list as item [with meta]` on the last top-level ` as `.
fn parse_each_header(header: &str) -> Result<(Expr, String, Option<String>), EvalError> {
    let mut depth = 0i32;
    let mut split = None;
    let bytes = header.as_bytes();
    for i in 0..header.len() {
        if !header.is_char_boundary(i) {
            continue;
        }
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            _ => {}
        }
        if depth == 0 && header[i..].starts_with(" as ") {
            split = Some(i);
        }
    }
    let split = split
        .ok_or_else(|| EvalError::Compile(format!("each tag needs 'as': '{}'", header)))?;
    let list = parse_expr(&header[..split])?;
    let binding = header[split + 4..].trim();
    let mut words = binding.split_whitespace();
    let item = words
        .next()
        .ok_or_else(|| EvalError::Compile("each tag is missing an item name".to_string()))?
        .to_string();
    let meta = match (words.next(), words.next()) {
        (None, _) => None,
        (Some("with"), Some(name)) => Some(name.to_string()),
        _ => {
            return Err(EvalError::Compile(format!(
                "malformed each binding: '{}'",
                binding
            )))
        }
    };
    Ok((list, item, meta))
}

fn scan(text: &str, options: &CompileOptions) -> Result<Vec<Piece>, EvalError> {
    let mut pieces = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let ctrl = ["{{#", "{{/", "{{!"]
            .iter()
            .filter_map(|m| rest.find(m))
            .min();
        let interp = rest.find(options.open.as_str());
        let next = match (ctrl, interp) {
            (Some(c), Some(i)) => Some(c.min(i)),
            (Some(c), None) => Some(c),
            (None, Some(i)) => Some(i),
            (None, None) => None,
        };
        let Some(at) = next else {
            pieces.push(Piece::Text(rest.to_string()));
            break;
        };
        if at > 0 {
            pieces.push(Piece::Text(rest[..at].to_string()));
            rest = &rest[at..];
        }

        if rest.starts_with("{{#raw}}") {
            let after = &rest["{{#raw}}".len()..];
            let end = after
                .find("{{/raw}}")
                .ok_or_else(|| EvalError::Compile("unterminated raw block".to_string()))?;
            pieces.push(Piece::Text(after[..end].to_string()));
            rest = &after[end + "{{/raw}}".len()..];
        } else if let Some(tag) = rest.strip_prefix("{{#") {
            let end = find_close(tag, "}}")
                .ok_or_else(|| EvalError::Compile("unterminated control tag".to_string()))?;
            let inner = tag[..end].trim();
            rest = &tag[end + 2..];
            if let Some(cond) = inner.strip_prefix("if ") {
                pieces.push(Piece::If(parse_expr(cond)?));
            } else if let Some(cond) = inner.strip_prefix("elseif ") {
                pieces.push(Piece::ElseIf(parse_expr(cond)?));
            } else if inner == "else" {
                pieces.push(Piece::Else);
            } else if let Some(header) = inner.strip_prefix("each ") {
                let (list, item, meta) = parse_each_header(header)?;
                pieces.push(Piece::Each { list, item, meta });
            } else {
                return Err(EvalError::Compile(format!("unknown control tag '{}'", inner)));
            }
        } else if let Some(tag) = rest.strip_prefix("{{/") {
            let end = tag
                .find("}}")
                .ok_or_else(|| EvalError::Compile("unterminated close tag".to_string()))?;
            match tag[..end].trim() {
                "if" => pieces.push(Piece::EndIf),
                "each" => pieces.push(Piece::EndEach),
                other => {
                    return Err(EvalError::Compile(format!("unknown close tag '{}'", other)))
                }
            }
            rest = &tag[end + 2..];
        } else if let Some(tag) = rest.strip_prefix("{{!") {
            let end = tag
                .find("!}}")
                .ok_or_else(|| EvalError::Compile("unterminated raw interpolation".to_string()))?;
            pieces.push(Piece::Interp {
                expr: parse_expr(&tag[..end])?,
                raw: true,
            });
            rest = &tag[end + 3..];
        } else {
            // Plain interpolation with the configured delimiters.
            let tag = &rest[options.open.len()..];
            let end = find_close(tag, &options.close).ok_or_else(|| {
                EvalError::Compile(format!("unterminated '{}' interpolation", options.open))
            })?;
            pieces.push(Piece::Interp {
                expr: parse_expr(&tag[..end])?,
                raw: false,
            });
            rest = &tag[end + options.close.len()..];
        }
    }
    Ok(pieces)
}

struct NodeParser {
    pieces: Vec<Piece>,
    pos: usize,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Stop {
    End,
    ElseLike,
    EndEach,
}

impl NodeParser {
    fn parse_nodes(&mut self, stop: Stop) -> Result<Vec<Node>, EvalError> {
        let mut nodes = Vec::new();
        loop {
            match self.pieces.get(self.pos) {
                None => {
                    if stop == Stop::End {
                        return Ok(nodes);
                    }
                    return Err(EvalError::Compile("unterminated block".to_string()));
                }
                Some(Piece::ElseIf(_)) | Some(Piece::Else) | Some(Piece::EndIf) => {
                    if stop == Stop::ElseLike {
                        return Ok(nodes);
                    }
                    return Err(EvalError::Compile("unexpected if-close tag".to_string()));
                }
                Some(Piece::EndEach) => {
                    if stop == Stop::EndEach {
                        return Ok(nodes);
                    }
                    return Err(EvalError::Compile("unexpected {{/each}}".to_string()));
                }
                Some(_) => {}
            }
            let piece = std::mem::replace(&mut self.pieces[self.pos], Piece::Else);
            self.pos += 1;
            match piece {
                Piece::Text(t) => nodes.push(Node::Text(t)),
                Piece::Interp { expr, raw } => nodes.push(Node::Interp { expr, raw }),
                Piece::If(cond) => nodes.push(self.parse_if(cond)?),
                Piece::Each { list, item, meta } => {
                    let body = self.parse_nodes(Stop::EndEach)?;
                    self.pos += 1; // consume {{/each}}
                    nodes.push(Node::Each { list, item, meta, body });
                }
                Piece::ElseIf(_) | Piece::Else | Piece::EndIf | Piece::EndEach => {
                    unreachable!("handled above")
                }
            }
        }
    }

    fn parse_if(&mut self, cond: Expr) -> Result<Node, EvalError> {
        let mut branches = Vec::new();
        let mut fallback = None;
        let body = self.parse_nodes(Stop::ElseLike)?;
        branches.push((cond, body));
        loop {
            let piece = std::mem::replace(&mut self.pieces[self.pos], Piece::Else);
            self.pos += 1;
            match piece {
                Piece::EndIf => return Ok(Node::If { branches, fallback }),
                Piece::ElseIf(cond) => {
                    let body = self.parse_nodes(Stop::ElseLike)?;
                    branches.push((cond, body));
                }
                Piece::Else => {
                    let body = self.parse_nodes(Stop::ElseLike)?;
                    if fallback.is_some() {
                        return Err(EvalError::Compile("duplicate else branch".to_string()));
                    }
                    fallback = Some(body);
                    // Next piece must be EndIf.
                    match self.pieces.get(self.pos) {
                        Some(Piece::EndIf) => {
                            self.pos += 1;
                            return Ok(Node::If { branches, fallback });
                        }
                        _ => {
                            return Err(EvalError::Compile(
                                "else branch must be last in an if block".to_string(),
                            ))
                        }
                    }
                }
                _ => unreachable!("parse_nodes stops only at if-close tags"),
            }
        }
    }
}

/// Default expression-template backend.
#[derive(Debug, Clone, Default)]
pub struct ExprEvaluator;

impl ExprEvaluator {
    /// Creates the default backend.
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for ExprEvaluator {
    fn compile(
        &self,
        text: &str,
        options: &CompileOptions,
    ) -> Result<Box<dyn CompiledTemplate>, EvalError> {
        let pieces = scan(text, options)?;
        let mut parser = NodeParser { pieces, pos: 0 };
        let nodes = parser.parse_nodes(Stop::End)?;
        Ok(Box::new(Compiled { nodes }))
    }

    fn clone_box(&self) -> Box<dyn Evaluator> {
        Box::new(self.clone())
    }
}

struct Compiled {
    nodes: Vec<Node>,
}

impl CompiledTemplate for Compiled {
    fn render(&self, context: &DataContext) -> Result<String, EvalError> {
        let mut scopes: Vec<HashMap<String, Value>> = Vec::new();
        let mut out = String::new();
        render_nodes(&self.nodes, context, &mut scopes, &mut out)?;
        Ok(out)
    }
}

fn lookup_var(
    name: &str,
    context: &DataContext,
    scopes: &[HashMap<String, Value>],
) -> Option<Value> {
    for scope in scopes.iter().rev() {
        if let Some(value) = scope.get(name) {
            return Some(value.clone());
        }
    }
    context.get(name).cloned()
}

fn iterable_items(value: &Value) -> Result<Vec<Value>, EvalError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map.values().cloned().collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(EvalError::Render(format!(
            "cannot iterate over {}",
            render_value(other)
        ))),
    }
}

fn loop_metadata(index: usize, count: usize, parent: Option<&Value>) -> Value {
    let depth = parent
        .and_then(|p| p.get("depth"))
        .and_then(Value::as_i64)
        .unwrap_or(0)
        + 1;
    let iteration = index + 1;
    json!({
        "index": index,
        "iteration": iteration,
        "count": count,
        "remaining": count - iteration,
        "first": index == 0,
        "last": iteration == count,
        "even": iteration % 2 == 0,
        "odd": iteration % 2 == 1,
        "depth": depth,
        "parent": parent.cloned().unwrap_or(Value::Null),
    })
}

fn render_nodes(
    nodes: &[Node],
    context: &DataContext,
    scopes: &mut Vec<HashMap<String, Value>>,
    out: &mut String,
) -> Result<(), EvalError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Interp { expr, raw } => {
                let value = {
                    let lookup = |name: &str| lookup_var(name, context, scopes);
                    expr::eval(expr, &lookup).map_err(EvalError::Render)?
                };
                let text = render_value(&value);
                if *raw {
                    out.push_str(&text);
                } else {
                    out.push_str(&html_escape(&text));
                }
            }
            Node::If { branches, fallback } => {
                let mut taken = false;
                for (cond, body) in branches {
                    let value = {
                        let lookup = |name: &str| lookup_var(name, context, scopes);
                        expr::eval(cond, &lookup).map_err(EvalError::Render)?
                    };
                    if expr::truthy(&value) {
                        render_nodes(body, context, scopes, out)?;
                        taken = true;
                        break;
                    }
                }
                if !taken {
                    if let Some(body) = fallback {
                        render_nodes(body, context, scopes, out)?;
                    }
                }
            }
            Node::Each { list, item, meta, body } => {
                let value = {
                    let lookup = |name: &str| lookup_var(name, context, scopes);
                    expr::eval(list, &lookup).map_err(EvalError::Render)?
                };
                let items = iterable_items(&value)?;
                let count = items.len();
                let parent = meta
                    .as_ref()
                    .and_then(|name| lookup_var(name, context, scopes))
                    .filter(|v| v.is_object());
                for (index, element) in items.into_iter().enumerate() {
                    let mut scope = HashMap::new();
                    scope.insert(item.clone(), element);
                    if let Some(meta_name) = meta {
                        scope.insert(
                            meta_name.clone(),
                            loop_metadata(index, count, parent.as_ref()),
                        );
                    }
                    scopes.push(scope);
                    let result = render_nodes(body, context, scopes, out);
                    scopes.pop();
                    result?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(text: &str, data: Value) -> String {
        let evaluator = ExprEvaluator::new();
        let compiled = evaluator.compile(text, &CompileOptions::default()).unwrap();
        compiled.render(&DataContext::from_value(data)).unwrap()
    }

    #[test]
    fn test_plain_text_identity() {
        assert_eq!(render("just text", json!({})), "just text");
    }

    #[test]
    fn test_interpolation_and_escaping() {
        assert_eq!(render("hi {{name}}", json!({"name": "ada"})), "hi ada");
        assert_eq!(
            render("{{value}}", json!({"value": "<b>"})),
            "&lt;b&gt;"
        );
        assert_eq!(render("{{! value !}}", json!({"value": "<b>"})), "<b>");
    }

    #[test]
    fn test_if_chain_first_match_wins() {
        let tpl = "{{#if n == 1}}one{{#elseif n == 2}}two{{#else}}many{{/if}}";
        assert_eq!(render(tpl, json!({"n": 1})), "one");
        assert_eq!(render(tpl, json!({"n": 2})), "two");
        assert_eq!(render(tpl, json!({"n": 9})), "many");
    }

    #[test]
    fn test_each_with_loop_metadata() {
        let tpl = "{{#each items as i with loop}}{{loop.index}}:{{i}};{{/each}}";
        assert_eq!(
            render(tpl, json!({"items": ["a", "b", "c"]})),
            "0:a;1:b;2:c;"
        );
        let tpl = "{{#each items as i with loop}}{{loop.iteration}}/{{loop.remaining}}/{{loop.first}}/{{loop.last}};{{/each}}";
        assert_eq!(
            render(tpl, json!({"items": ["a", "b", "c"]})),
            "1/2/true/false;2/1/false/false;3/0/false/true;"
        );
    }

    #[test]
    fn test_nested_loop_depth_and_parent() {
        let tpl = "{{#each outer as o with loop}}{{#each o as i with loop}}{{loop.depth}}:{{loop.parent.index}};{{/each}}{{/each}}";
        assert_eq!(
            render(tpl, json!({"outer": [["x"], ["y"]]})),
            "2:0;2:1;"
        );
    }

    #[test]
    fn test_raw_block_is_untouched() {
        assert_eq!(
            render("{{#raw}}{{not evaluated}}{{/raw}}", json!({})),
            "{{not evaluated}}"
        );
    }

    #[test]
    fn test_custom_delimiters() {
        let evaluator = ExprEvaluator::new();
        let options = CompileOptions {
            open: "[[".to_string(),
            close: "]]".to_string(),
        };
        let compiled = evaluator.compile("hi [[name]]", &options).unwrap();
        let out = compiled
            .render(&DataContext::from_value(json!({"name": "ada"})))
            .unwrap();
        assert_eq!(out, "hi ada");
    }

    #[test]
    fn test_compile_errors_are_typed() {
        let evaluator = ExprEvaluator::new();
        let err = match evaluator.compile("{{#if x}}unclosed", &CompileOptions::default()) {
            Err(err) => err,
            Ok(_) => panic!("unterminated block must not compile"),
        };
        assert!(matches!(err, EvalError::Compile(_)));
    }

    #[test]
    fn test_render_error_on_non_iterable() {
        let evaluator = ExprEvaluator::new();
        let compiled = evaluator
            .compile("{{#each n as i}}{{i}}{{/each}}", &CompileOptions::default())
            .unwrap();
        let err = compiled
            .render(&DataContext::from_value(json!({"n": 5})))
            .unwrap_err();
        assert!(matches!(err, EvalError::Render(_)));
    }
}
