// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Recursive include resolution.
//!
//! After layout flattening and the directive transform, a template body
//! contains canonical `<include src="…"/>` tags. Each tag is lifted out of
//! the body before evaluation and replaced by an opaque marker pair; the
//! tag's attribute expressions stay behind inside the pair as a raw
//! interpolation, so they are evaluated in place with whatever loop or
//! branch scope is live at that point. Once the caller's body has been
//! evaluated, every surviving marker is resolved depth-first: the child
//! template is flattened, transformed and evaluated against its own context
//! (globals, then the caller's context, then the tag's attributes, rightmost
//! wins). A marker inside a false conditional branch disappears with the
//! branch, so a conditional include is never resolved and contributes
//! neither output nor stack fragments; a marker inside a loop body is
//! resolved once per iteration with that iteration's attribute values.
//!
//! Failures below the entry template are branch-local: the failing include
//! collapses to inline diagnostic markup and the rest of the page renders.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::context::DataContext;
use crate::directives::{
    find_bare, find_directive, marker, split_args, unquote, MARK_CLOSE, MARK_OPEN,
};
use crate::error::{Diagnostic, DiagnosticsReporter, Result, WeftError};
use crate::evaluator::{CompileOptions, Evaluator};
use crate::expr;
use crate::layout;
use crate::resolver::TemplateResolver;

lazy_static! {
    static ref RAW_REGION_RE: Regex =
        Regex::new(r"(?s)\{\{#raw\}\}.*?\{\{/raw\}\}").unwrap();
    static ref PENDING_RE: Regex = Regex::new(&format!(
        "(?s){open}inc:([0-9]+){close}(.*?){open}incend{close}",
        open = MARK_OPEN,
        close = MARK_CLOSE,
    ))
    .unwrap();
}

/// Per-render mutable state shared across the whole resolution tree.
///
/// Both stacks are per render, never per engine; renders must not observe
/// each other.
#[derive(Debug, Default)]
pub(crate) struct RenderState {
    /// Layout chain currently being flattened.
    pub layout_stack: Vec<String>,
    /// Include chain currently being resolved; the entry template occupies
    /// the first slot.
    pub include_stack: Vec<String>,
}

/// Borrowed engine facilities threaded through the recursion.
pub(crate) struct RenderSupport<'a, R: TemplateResolver> {
    pub resolver: &'a R,
    pub evaluator: &'a dyn Evaluator,
    pub options: &'a CompileOptions,
    pub reporter: &'a dyn DiagnosticsReporter,
    pub globals: &'a Map<String, Value>,
    pub max_depth: usize,
    /// Fingerprint-cached directive transform.
    pub transform: &'a dyn Fn(&str) -> String,
}

/// Renders one template and, recursively, everything it includes.
///
/// `slots` carries the caller-provided slot fragments for this template;
/// the entry template gets an empty map.
pub(crate) fn render_tree<R: TemplateResolver>(
    support: &RenderSupport<'_, R>,
    source: &str,
    path: &str,
    ctx: &DataContext,
    state: &mut RenderState,
    slots: &HashMap<String, String>,
) -> Result<String> {
    if state.include_stack.iter().any(|entry| entry == path) {
        let mut chain = state.include_stack.clone();
        chain.push(path.to_string());
        return Err(WeftError::Cycle { chain });
    }
    if state.include_stack.len() > support.max_depth {
        return Err(WeftError::DepthExceeded {
            path: path.to_string(),
            max: support.max_depth,
        });
    }
    state.include_stack.push(path.to_string());
    let result = render_node(support, source, path, ctx, state, slots);
    state.include_stack.pop();
    result
}

fn render_node<R: TemplateResolver>(
    support: &RenderSupport<'_, R>,
    source: &str,
    path: &str,
    ctx: &DataContext,
    state: &mut RenderState,
    slots: &HashMap<String, String>,
) -> Result<String> {
    let flattened = layout::flatten(
        source,
        path,
        support.resolver,
        &mut state.layout_stack,
        support.max_depth,
    )?;
    let text = (support.transform)(&flattened);
    let text = apply_slots(&text, slots);

    // Lift include tags out before evaluation. Attribute expressions stay
    // behind inside the marker pair so they see live loop and branch scope.
    let raw_spans: Vec<(usize, usize)> = RAW_REGION_RE
        .find_iter(&text)
        .map(|m| (m.start(), m.end()))
        .collect();
    let mut pending: Vec<PendingInclude> = Vec::new();
    let mut lifted = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(tag) = next_include_tag(&text, pos) {
        if raw_spans
            .iter()
            .any(|&(start, end)| tag.start >= start && tag.start < end)
        {
            lifted.push_str(&text[pos..tag.head_end]);
            pos = tag.head_end;
            continue;
        }
        lifted.push_str(&text[pos..tag.start]);
        pos = tag.end;
        lift_tag(support, tag, path, &mut pending, &mut lifted);
    }
    lifted.push_str(&text[pos..]);

    let evaluated = support
        .evaluator
        .compile(&lifted, support.options)
        .and_then(|compiled| compiled.render(ctx));
    let output = match evaluated {
        Ok(output) => output,
        Err(eval_err) => {
            let err = WeftError::Expression {
                path: path.to_string(),
                message: eval_err.to_string(),
            };
            if state.include_stack.len() > 1 {
                return Err(err);
            }
            // Entry template: degrade to the unevaluated text plus a
            // diagnostic instead of failing the whole render. Leftover
            // include markers are stripped by the final stack flush.
            let diag = Diagnostic::from_error(&err, path);
            support.reporter.report(&diag);
            return Ok(format!("{}{}", lifted, diag.inline_markup()));
        }
    };
    Ok(resolve_markers(support, &output, &pending, path, ctx, state))
}

/// An include tag lifted out of the caller's body, waiting for the caller's
/// evaluation pass to materialise its attribute expressions.
struct PendingInclude {
    attrs: Vec<(String, AttrSource)>,
    body: Option<String>,
}

/// Where an attribute's value comes from at resolution time.
enum AttrSource {
    /// Quoted literal, used verbatim.
    Literal(String),
    /// Expression attribute; the value arrives through the evaluated
    /// argument array, in attribute order.
    Evaluated,
}

/// Replaces one include tag with a marker pair, recording its attributes
/// and body for resolution after the caller's evaluation pass. Expression
/// attributes are re-emitted between the markers as one raw interpolation
/// serialising their values as a JSON array.
fn lift_tag<R: TemplateResolver>(
    support: &RenderSupport<'_, R>,
    tag: IncludeTag,
    path: &str,
    pending: &mut Vec<PendingInclude>,
    out: &mut String,
) {
    let mut attrs = Vec::with_capacity(tag.attrs.len());
    let mut exprs: Vec<String> = Vec::new();
    for (name, raw) in tag.attrs {
        let inner = raw
            .trim()
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"));
        match inner {
            Some(inner) => {
                let inner = inner.trim();
                if let Err(message) = expr::parse_expression(inner) {
                    let err = WeftError::Expression {
                        path: path.to_string(),
                        message,
                    };
                    let diag = Diagnostic::from_error(&err, path);
                    support.reporter.report(&diag);
                    out.push_str(&diag.inline_markup());
                    return;
                }
                exprs.push(inner.to_string());
                attrs.push((name, AttrSource::Evaluated));
            }
            None => attrs.push((name, AttrSource::Literal(raw))),
        }
    }
    out.push_str(&marker(&format!("inc:{}", pending.len())));
    if !exprs.is_empty() {
        out.push_str(&format!("{{{{! json([{}]) !}}}}", exprs.join(", ")));
    }
    out.push_str(&marker("incend"));
    pending.push(PendingInclude {
        attrs,
        body: tag.body,
    });
}

/// Resolves every include marker that survived the caller's evaluation
/// pass. Markers dropped with a false branch are simply absent; markers
/// duplicated by a loop body are resolved once per occurrence.
fn resolve_markers<R: TemplateResolver>(
    support: &RenderSupport<'_, R>,
    output: &str,
    pending: &[PendingInclude],
    caller_path: &str,
    caller: &DataContext,
    state: &mut RenderState,
) -> String {
    let mut out = String::with_capacity(output.len());
    let mut cursor = 0;
    while let Some(caps) = PENDING_RE.captures(&output[cursor..]) {
        let Some(whole) = caps.get(0) else { break };
        out.push_str(&output[cursor..cursor + whole.start()]);
        let index = caps.get(1).and_then(|g| g.as_str().parse::<usize>().ok());
        let args = caps.get(2).map(|g| g.as_str()).unwrap_or("");
        if let Some(tag) = index.and_then(|i| pending.get(i)) {
            out.push_str(&render_include(support, tag, args, caller_path, caller, state));
        }
        cursor += whole.end();
    }
    out.push_str(&output[cursor..]);
    out
}

fn render_include<R: TemplateResolver>(
    support: &RenderSupport<'_, R>,
    tag: &PendingInclude,
    args_json: &str,
    caller_path: &str,
    caller: &DataContext,
    state: &mut RenderState,
) -> String {
    match try_include(support, tag, args_json, caller_path, caller, state) {
        Ok(Some(output)) => output,
        Ok(None) => String::new(),
        Err(err) => {
            let diag = Diagnostic::from_error(&err, caller_path);
            support.reporter.report(&diag);
            diag.inline_markup()
        }
    }
}

fn try_include<R: TemplateResolver>(
    support: &RenderSupport<'_, R>,
    tag: &PendingInclude,
    args_json: &str,
    caller_path: &str,
    caller: &DataContext,
    state: &mut RenderState,
) -> Result<Option<String>> {
    let args: Vec<Value> = if args_json.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(args_json.trim()).map_err(|err| WeftError::Expression {
            path: caller_path.to_string(),
            message: format!("include attribute produced malformed data: {}", err),
        })?
    };
    let mut args = args.into_iter();
    let mut src: Option<String> = None;
    let mut optional = false;
    let mut locals: Map<String, Value> = Map::new();
    for (name, source) in &tag.attrs {
        let value = match source {
            AttrSource::Literal(text) => Value::String(text.clone()),
            AttrSource::Evaluated => args.next().ok_or_else(|| WeftError::Expression {
                path: caller_path.to_string(),
                message: "include attribute values out of step with the tag".to_string(),
            })?,
        };
        match name.as_str() {
            "src" => {
                src = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            "optional" => optional = expr::truthy(&value),
            "data" => {
                // A data object spreads into the callee's locals.
                match value {
                    Value::Object(map) => locals.extend(map),
                    other => {
                        locals.insert("data".to_string(), other);
                    }
                }
            }
            other => {
                locals.insert(other.to_string(), value);
            }
        }
    }
    let src = src.ok_or_else(|| {
        WeftError::MalformedDirective("include tag without a src attribute".to_string())
    })?;

    let loaded = match support.resolver.load(&src) {
        Ok(loaded) => loaded,
        Err(WeftError::NotFound { .. }) if optional => {
            tracing::debug!(path = %src, "optional include missing, skipped");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    let slots = capture_slots(tag.body.as_deref().unwrap_or(""));
    let callee_ctx = DataContext::for_include(support.globals, caller, &locals);
    // The resolver's normalised path keys the cycle check, so two spellings
    // of one template cannot slip past it.
    let output = render_tree(
        support,
        &loaded.source,
        &loaded.path,
        &callee_ctx,
        state,
        &slots,
    )?;
    Ok(Some(output))
}

/// Captures `@slot('name') … @endslot` fragments from a paired include
/// body. Content outside slot blocks is ignored.
fn capture_slots(body: &str) -> HashMap<String, String> {
    let mut slots = HashMap::new();
    let mut pos = 0;
    while let Some(m) = find_directive(body, "slot", pos) {
        let Some(name) = split_args(&m.args).first().and_then(|p| unquote(p)) else {
            pos = m.end;
            continue;
        };
        let Some((close_start, close_end)) = find_bare(body, "endslot", m.end) else {
            break;
        };
        slots.insert(name, body[m.end..close_start].to_string());
        pos = close_end;
    }
    slots
}

/// Substitutes `@slot('name'[, 'default'])` placeholders in a callee body.
/// Placeholders inside raw regions and inside the bodies of this template's
/// own include tags are left alone; those belong to a template further down.
/// Runs after the directive transform; fragments arrive already transformed
/// by the caller's pass and are evaluated in the callee's context.
fn apply_slots(source: &str, slots: &HashMap<String, String>) -> String {
    let protected = protected_spans(source);
    let mut out = String::with_capacity(source.len());
    let mut pos = 0;
    while let Some(m) = find_directive(source, "slot", pos) {
        if protected
            .iter()
            .any(|&(start, end)| m.start >= start && m.start < end)
        {
            out.push_str(&source[pos..m.end]);
            pos = m.end;
            continue;
        }
        out.push_str(&source[pos..m.start]);
        let parts = split_args(&m.args);
        match parts.first().and_then(|p| unquote(p)) {
            Some(name) => {
                if let Some(fragment) = slots.get(&name) {
                    out.push_str(fragment);
                } else if let Some(default) = parts.get(1) {
                    out.push_str(&unquote(default).unwrap_or_else(|| default.clone()));
                }
            }
            None => out.push_str(&source[m.start..m.end]),
        }
        pos = m.end;
    }
    out.push_str(&source[pos..]);
    out
}

/// Byte spans slot substitution must not touch: raw regions and the bodies
/// of paired include tags.
fn protected_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans: Vec<(usize, usize)> = RAW_REGION_RE
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect();
    let mut pos = 0;
    while let Some(tag) = next_include_tag(text, pos) {
        if tag.body.is_some() {
            spans.push((tag.head_end, tag.end));
        }
        pos = tag.end;
    }
    spans
}

/// A parsed canonical include tag.
#[derive(Debug)]
struct IncludeTag {
    /// Byte offset of `<include`.
    start: usize,
    /// Byte offset just past the opening tag's `>`.
    head_end: usize,
    /// Byte offset just past the whole tag, closing form included.
    end: usize,
    attrs: Vec<(String, String)>,
    /// Inner body for the paired form.
    body: Option<String>,
}

fn is_attr_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Parses the head of an include tag starting at `start`.
/// Returns (offset past `>`, self-closing, attributes).
fn scan_tag_head(text: &str, start: usize) -> Option<(usize, bool, Vec<(String, String)>)> {
    let mut pos = start + "<include".len();
    let mut attrs = Vec::new();
    loop {
        let rest = &text[pos..];
        let ws = rest.len() - rest.trim_start().len();
        pos += ws;
        let rest = &text[pos..];
        if rest.starts_with("/>") {
            return Some((pos + 2, true, attrs));
        }
        if rest.starts_with('>') {
            return Some((pos + 1, false, attrs));
        }
        let name_len = rest.chars().take_while(|&c| is_attr_char(c)).count();
        if name_len == 0 {
            return None;
        }
        let name_bytes: usize = rest.chars().take(name_len).map(|c| c.len_utf8()).sum();
        let name = rest[..name_bytes].to_string();
        pos += name_bytes;
        let rest = &text[pos..];
        if let Some(after_eq) = rest.strip_prefix('=') {
            let quote = after_eq.chars().next()?;
            if quote != '"' && quote != '\'' {
                return None;
            }
            let value_start = pos + 1 + quote.len_utf8();
            let value_len = text[value_start..].find(quote)?;
            attrs.push((name, text[value_start..value_start + value_len].to_string()));
            pos = value_start + value_len + quote.len_utf8();
        } else {
            // Bare attribute, treated as a true flag.
            attrs.push((name, "true".to_string()));
        }
    }
}

/// Finds the next include tag at or after `from`. Paired tags are scanned
/// depth-aware so a nested include inside the body does not end it early.
fn next_include_tag(text: &str, from: usize) -> Option<IncludeTag> {
    let mut search = from;
    loop {
        let rel = text.get(search..)?.find("<include")?;
        let start = search + rel;
        let after = &text[start + "<include".len()..];
        let boundary_ok = after
            .chars()
            .next()
            .map(|c| c.is_whitespace() || c == '/' || c == '>')
            .unwrap_or(false);
        if !boundary_ok {
            search = start + 1;
            continue;
        }
        let Some((head_end, self_closing, attrs)) = scan_tag_head(text, start) else {
            search = start + 1;
            continue;
        };
        if self_closing {
            return Some(IncludeTag {
                start,
                head_end,
                end: head_end,
                attrs,
                body: None,
            });
        }
        // Paired form: find the matching close, skipping nested tags.
        let mut pos = head_end;
        let mut depth = 1;
        loop {
            let open = text[pos..].find("<include").map(|i| pos + i);
            let close = text[pos..].find("</include>").map(|i| pos + i);
            match (open, close) {
                (Some(o), Some(c)) if o < c => {
                    match scan_tag_head(text, o) {
                        Some((inner_end, inner_self_closing, _)) => {
                            if !inner_self_closing {
                                depth += 1;
                            }
                            pos = inner_end;
                        }
                        None => pos = o + 1,
                    }
                }
                (_, Some(c)) => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(IncludeTag {
                            start,
                            head_end,
                            end: c + "</include>".len(),
                            attrs,
                            body: Some(text[head_end..c].to_string()),
                        });
                    }
                    pos = c + "</include>".len();
                }
                // No matching close; treat the head as self-closing.
                (_, None) => {
                    return Some(IncludeTag {
                        start,
                        head_end,
                        end: head_end,
                        attrs,
                        body: None,
                    });
                }
            }
        }
    }
}
