// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Directive transformer: rewrites the `@`-directive syntax into the
//! canonical control syntax consumed by the evaluator backend.
//!
//! This is a pure, fixed-order pipeline of text-to-text passes; later rules
//! depend on earlier rewrites (the `@empty(e)` predicate must be gone before
//! `@forelse` looks for its bare `@empty` branch). No data context, no I/O.
//!
//! Pass order:
//!
//! 1. strip `{{-- … --}}` comments, directive-looking content included
//! 2. guard `@@` escapes behind a sentinel, restored last
//! 3. guard `@verbatim` regions behind opaque placeholders, restored into
//!    `{{#raw}}…{{/raw}}` after every other pass ran
//! 4. conditional family (`@if`/`@elseif`/`@else`/`@endif`, `@unless` as a
//!    negated if, `@isset`/`@empty(e)` predicates)
//! 5. `@switch` family as an explicit first-match `if` chain
//! 6. loop family (`@forelse` with a runtime `len()` emptiness test, then
//!    `@foreach` in both spellings)
//! 7. loop-metadata binding injection (`with loop` on every each tag)
//! 8. `@json` / `@class` as inline builtin calls
//! 9. alternate include spellings canonicalized to `<include …/>` tags
//! 10. `@push`/`@prepend`/`@stack`/`@once` rewritten to opaque markers that
//!     ride through evaluation and are collected once per whole render
//!
//! Malformed arguments are tolerated: a directive whose parentheses never
//! balance is left untouched rather than aborting the transform.

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Sentinel for `@@` escapes, restored to a literal `@` at the end.
const ESC_AT: char = '\u{E000}';
/// Delimiter for verbatim-region placeholders.
const HOLE: char = '\u{E001}';
/// Opens an opaque pass-through marker (stacks, once, pending includes).
pub(crate) const MARK_OPEN: char = '\u{E002}';
/// Closes an opaque pass-through marker.
pub(crate) const MARK_CLOSE: char = '\u{E003}';

lazy_static! {
    static ref COMMENT_RE: Regex = Regex::new(r"(?s)\{\{--.*?--\}\}").unwrap();
    static ref VERBATIM_RE: Regex = Regex::new(r"(?s)@verbatim(.*?)@endverbatim").unwrap();
    static ref BREAK_RE: Regex = Regex::new(r"@break\b").unwrap();
}

/// Wraps marker content in the opaque marker delimiters.
pub(crate) fn marker(content: &str) -> String {
    format!("{}{}{}", MARK_OPEN, content, MARK_CLOSE)
}

fn tag(inner: String) -> String {
    format!("{{{{{}}}}}", inner)
}

/// A matched `@name(args)` directive with balanced-argument capture.
#[derive(Debug, Clone)]
pub(crate) struct DirectiveMatch {
    /// Byte offset of the `@`.
    pub start: usize,
    /// Byte offset just past the closing parenthesis.
    pub end: usize,
    /// Raw argument text between the parentheses.
    pub args: String,
}

fn ident_follows(text: &str) -> bool {
    text.starts_with(|c: char| c.is_alphanumeric() || c == '_')
}

/// Scans `s` (which starts with `(`) for the matching close parenthesis,
/// quote-aware. Returns the byte index of the closing `)`.
fn scan_balanced(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// Finds the next `@name(args)` occurrence at or after `from`.
pub(crate) fn find_directive(text: &str, name: &str, from: usize) -> Option<DirectiveMatch> {
    let pat = format!("@{}", name);
    let mut search = from;
    while let Some(rel) = text.get(search..)?.find(&pat) {
        let start = search + rel;
        let after_name = start + pat.len();
        let tail = &text[after_name..];
        if ident_follows(tail) {
            search = after_name;
            continue;
        }
        let ws = tail.len() - tail.trim_start_matches(' ').len();
        let parens = &tail[ws..];
        if !parens.starts_with('(') {
            search = after_name;
            continue;
        }
        match scan_balanced(parens) {
            Some(close) => {
                return Some(DirectiveMatch {
                    start,
                    end: after_name + ws + close + 1,
                    args: parens[1..close].to_string(),
                });
            }
            None => {
                // Unbalanced arguments; tolerate and move on.
                search = after_name;
            }
        }
    }
    None
}

/// Finds the last `@name(args)` occurrence, used to rewrite nested block
/// directives innermost-first.
fn find_last_directive(text: &str, name: &str) -> Option<DirectiveMatch> {
    let mut last = None;
    let mut from = 0;
    while let Some(m) = find_directive(text, name, from) {
        from = m.start + 1;
        last = Some(m);
    }
    last
}

/// Finds a bare `@name` (no arguments) at or after `from`.
/// Returns the byte span of the directive.
pub(crate) fn find_bare(text: &str, name: &str, from: usize) -> Option<(usize, usize)> {
    let pat = format!("@{}", name);
    let mut search = from;
    while let Some(rel) = text.get(search..)?.find(&pat) {
        let start = search + rel;
        let end = start + pat.len();
        if ident_follows(&text[end..]) {
            search = end;
            continue;
        }
        return Some((start, end));
    }
    None
}

/// Splits directive arguments on top-level commas, quote- and bracket-aware.
pub(crate) fn split_args(args: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut current = String::new();
    for c in args.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' | '[' | '{' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | ']' | '}' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    parts.push(current.trim().to_string());
                    current = String::new();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Strips matching quotes from a literal argument, if present.
pub(crate) fn unquote(s: &str) -> Option<String> {
    let s = s.trim();
    for quote in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return Some(s[1..s.len() - 1].to_string());
        }
    }
    None
}

fn rewrite_paren(text: &str, name: &str, f: &mut dyn FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(m) = find_directive(text, name, pos) {
        out.push_str(&text[pos..m.start]);
        out.push_str(&f(&m.args));
        pos = m.end;
    }
    out.push_str(&text[pos..]);
    out
}

fn rewrite_bare(text: &str, name: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some((start, end)) = find_bare(text, name, pos) {
        out.push_str(&text[pos..start]);
        out.push_str(replacement);
        pos = end;
    }
    out.push_str(&text[pos..]);
    out
}

/// Splits `coll as item` / `item of coll` loop headers, best-effort.
fn parse_loop_header(args: &str) -> (String, String) {
    if let Some(at) = find_keyword(args, " of ") {
        let item = args[..at].trim().to_string();
        let list = args[at + 4..].trim().to_string();
        return (list, item);
    }
    if let Some(at) = find_keyword_last(args, " as ") {
        let list = args[..at].trim().to_string();
        let item = args[at + 4..].trim().to_string();
        return (list, item);
    }
    (args.trim().to_string(), "item".to_string())
}

fn find_keyword(args: &str, keyword: &str) -> Option<usize> {
    keyword_positions(args, keyword).into_iter().next()
}

fn find_keyword_last(args: &str, keyword: &str) -> Option<usize> {
    keyword_positions(args, keyword).into_iter().last()
}

fn keyword_positions(args: &str, keyword: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in args.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {
                    if depth == 0 && args[i..].starts_with(keyword) {
                        positions.push(i);
                    }
                }
            },
        }
    }
    positions
}

fn rewrite_conditionals(mut text: String) -> String {
    text = rewrite_paren(&text, "elseif", &mut |args| {
        tag(format!("#elseif {}", args.trim()))
    });
    text = rewrite_paren(&text, "if", &mut |args| tag(format!("#if {}", args.trim())));
    text = rewrite_paren(&text, "unless", &mut |args| {
        tag(format!("#if not ({})", args.trim()))
    });
    text = rewrite_paren(&text, "isset", &mut |args| {
        tag(format!("#if isset({})", args.trim()))
    });
    text = rewrite_paren(&text, "empty", &mut |args| {
        tag(format!("#if empty({})", args.trim()))
    });
    text = rewrite_bare(&text, "endunless", "{{/if}}");
    text = rewrite_bare(&text, "endisset", "{{/if}}");
    text = rewrite_bare(&text, "endempty", "{{/if}}");
    text = rewrite_bare(&text, "endif", "{{/if}}");
    text = rewrite_bare(&text, "else", "{{#else}}");
    text
}

fn rewrite_switch_body(subject: &str, body: &str) -> String {
    let mut segments: Vec<(Option<String>, String)> = Vec::new();
    let mut open: Option<Option<String>> = None;
    let mut seg_start = 0;
    let mut pos = 0;
    loop {
        let next_case = find_directive(body, "case", pos);
        let next_default = find_bare(body, "default", pos);
        let next = match (&next_case, &next_default) {
            (Some(c), Some(d)) => {
                if c.start < d.0 {
                    Some((c.start, c.end, Some(c.args.clone())))
                } else {
                    Some((d.0, d.1, None))
                }
            }
            (Some(c), None) => Some((c.start, c.end, Some(c.args.clone()))),
            (None, Some(d)) => Some((d.0, d.1, None)),
            (None, None) => None,
        };
        match next {
            Some((start, end, label)) => {
                if let Some(current) = open.take() {
                    segments.push((current, body[seg_start..start].to_string()));
                }
                open = Some(label);
                seg_start = end;
                pos = end;
            }
            None => {
                if let Some(current) = open.take() {
                    segments.push((current, body[seg_start..].to_string()));
                }
                break;
            }
        }
    }

    let mut out = String::new();
    let mut emitted_case = false;
    let mut default_content: Option<String> = None;
    for (label, content) in segments {
        let content = BREAK_RE.replace_all(&content, "").into_owned();
        match label {
            Some(value) => {
                let keyword = if emitted_case { "#elseif" } else { "#if" };
                out.push_str(&tag(format!(
                    "{} ({}) == ({})",
                    keyword,
                    subject,
                    value.trim()
                )));
                out.push_str(&content);
                emitted_case = true;
            }
            None => default_content = Some(content),
        }
    }
    match (emitted_case, default_content) {
        (true, Some(default)) => {
            out.push_str("{{#else}}");
            out.push_str(&default);
            out.push_str("{{/if}}");
        }
        (true, None) => out.push_str("{{/if}}"),
        (false, Some(default)) => out = default,
        (false, None) => {}
    }
    out
}

fn rewrite_switches(mut text: String) -> String {
    // Innermost-first: the last `@switch` cannot contain another one.
    while let Some(open) = find_last_directive(&text, "switch") {
        let Some((close_start, close_end)) = find_bare(&text, "endswitch", open.end) else {
            break;
        };
        let body = text[open.end..close_start].to_string();
        let rewritten = rewrite_switch_body(open.args.trim(), &body);
        text.replace_range(open.start..close_end, &rewritten);
    }
    text
}

fn rewrite_forelse(mut text: String) -> String {
    while let Some(open) = find_last_directive(&text, "forelse") {
        let Some((close_start, close_end)) = find_bare(&text, "endforelse", open.end) else {
            break;
        };
        let body = text[open.end..close_start].to_string();
        let (list, item) = parse_loop_header(&open.args);
        let (loop_body, empty_body) = match find_bare(&body, "empty", 0) {
            Some((estart, eend)) => (
                body[..estart].to_string(),
                Some(body[eend..].to_string()),
            ),
            None => (body, None),
        };
        let mut rewritten = tag(format!("#if len({}) != 0", list));
        rewritten.push_str(&tag(format!("#each {} as {} with loop", list, item)));
        rewritten.push_str(&loop_body);
        rewritten.push_str("{{/each}}");
        if let Some(empty_body) = empty_body {
            rewritten.push_str("{{#else}}");
            rewritten.push_str(&empty_body);
        }
        rewritten.push_str("{{/if}}");
        text.replace_range(open.start..close_end, &rewritten);
    }
    text
}

fn rewrite_foreach(mut text: String) -> String {
    text = rewrite_paren(&text, "foreach", &mut |args| {
        let (list, item) = parse_loop_header(args);
        tag(format!("#each {} as {} with loop", list, item))
    });
    rewrite_bare(&text, "endforeach", "{{/each}}")
}

fn include_tag(path: &str, data: Option<&str>, optional: bool) -> String {
    let mut out = format!("<include src=\"{}\"", path);
    if optional {
        out.push_str(" optional=\"true\"");
    }
    if let Some(expr) = data {
        out.push_str(&format!(" data=\"{{{{ {} }}}}\"", expr));
    }
    out.push_str("/>");
    out
}

fn rewrite_includes(mut text: String) -> String {
    text = rewrite_paren(&text, "includeWhen", &mut |args| {
        let parts = split_args(args);
        match (parts.first(), parts.get(1).and_then(|p| unquote(p))) {
            (Some(cond), Some(path)) => format!(
                "{}{}{}",
                tag(format!("#if {}", cond)),
                include_tag(&path, parts.get(2).map(|s| s.as_str()), false),
                "{{/if}}"
            ),
            _ => format!("@includeWhen({})", args),
        }
    });
    text = rewrite_paren(&text, "includeUnless", &mut |args| {
        let parts = split_args(args);
        match (parts.first(), parts.get(1).and_then(|p| unquote(p))) {
            (Some(cond), Some(path)) => format!(
                "{}{}{}",
                tag(format!("#if not ({})", cond)),
                include_tag(&path, parts.get(2).map(|s| s.as_str()), false),
                "{{/if}}"
            ),
            _ => format!("@includeUnless({})", args),
        }
    });
    text = rewrite_paren(&text, "includeIf", &mut |args| {
        let parts = split_args(args);
        match parts.first().and_then(|p| unquote(p)) {
            Some(path) => include_tag(&path, parts.get(1).map(|s| s.as_str()), true),
            None => format!("@includeIf({})", args),
        }
    });
    text = rewrite_paren(&text, "include", &mut |args| {
        let parts = split_args(args);
        match parts.first().and_then(|p| unquote(p)) {
            Some(path) => include_tag(&path, parts.get(1).map(|s| s.as_str()), false),
            None => format!("@include({})", args),
        }
    });
    text
}

fn rewrite_stacks(mut text: String) -> String {
    text = rewrite_paren(&text, "push", &mut |args| {
        let name = unquote(args).unwrap_or_else(|| args.trim().to_string());
        marker(&format!("push:{}", name))
    });
    text = rewrite_bare(&text, "endpush", &marker("endpush"));
    text = rewrite_paren(&text, "prepend", &mut |args| {
        let name = unquote(args).unwrap_or_else(|| args.trim().to_string());
        marker(&format!("prepend:{}", name))
    });
    text = rewrite_bare(&text, "endprepend", &marker("endprepend"));
    text = rewrite_paren(&text, "stack", &mut |args| {
        let name = unquote(args).unwrap_or_else(|| args.trim().to_string());
        marker(&format!("stack:{}", name))
    });
    text
}

/// Short content fingerprint used as the implicit `@once` identity.
pub(crate) fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    // 16 hex chars is plenty for per-render dedup.
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

fn rewrite_once(mut text: String) -> String {
    loop {
        // Last-open-first keeps nested blocks safe.
        let mut last: Option<(usize, usize, Option<String>)> = None;
        let mut from = 0;
        while let Some((start, end)) = find_bare(&text, "once", from) {
            from = start + 1;
            // A declared id may follow: @once('id').
            let tail = &text[end..];
            let ws = tail.len() - tail.trim_start_matches(' ').len();
            let (span_end, id) = if tail[ws..].starts_with('(') {
                match scan_balanced(&tail[ws..]) {
                    Some(close) => {
                        let args = &tail[ws + 1..ws + close];
                        (end + ws + close + 1, unquote(args))
                    }
                    None => (end, None),
                }
            } else {
                (end, None)
            };
            last = Some((start, span_end, id));
        }
        let Some((start, open_end, id)) = last else { break };
        let Some((close_start, close_end)) = find_bare(&text, "endonce", open_end) else {
            break;
        };
        let content = text[open_end..close_start].to_string();
        let id = id.unwrap_or_else(|| fingerprint(&content));
        let rewritten = format!(
            "{}{}{}",
            marker(&format!("once:{}", id)),
            content,
            marker("endonce")
        );
        text.replace_range(start..close_end, &rewritten);
    }
    text
}

/// Transforms raw directive syntax into the canonical control syntax.
///
/// Pure text-to-text; caching this by content hash is an optimization only
/// and disabling the cache must not change output.
pub fn transform(input: &str) -> String {
    let mut text = COMMENT_RE.replace_all(input, "").into_owned();
    text = text.replace("@@", &ESC_AT.to_string());

    let mut verbatims: Vec<String> = Vec::new();
    text = VERBATIM_RE
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            verbatims.push(caps[1].to_string());
            format!("{}{}{}", HOLE, verbatims.len() - 1, HOLE)
        })
        .into_owned();

    text = rewrite_conditionals(text);
    text = rewrite_switches(text);
    text = rewrite_forelse(text);
    text = rewrite_foreach(text);
    text = rewrite_paren(&text, "json", &mut |args| {
        format!("{{{{! json({}) !}}}}", args.trim())
    });
    text = rewrite_paren(&text, "class", &mut |args| {
        format!("{{{{! class({}) !}}}}", args.trim())
    });
    text = rewrite_includes(text);
    text = rewrite_once(text);
    text = rewrite_stacks(text);

    for (index, content) in verbatims.iter().enumerate() {
        let hole = format!("{}{}{}", HOLE, index, HOLE);
        let restored = format!("{{{{#raw}}}}{}{{{{/raw}}}}", content);
        text = text.replace(&hole, &restored);
    }
    text.replace(ESC_AT, "@")
}
