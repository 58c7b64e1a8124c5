// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Layout inheritance: flattens an `@extends` chain into a single document
//! before the directive transform runs.
//!
//! Each template's `@section` blocks are captured and carried up the chain;
//! the root layout's `@yield` slots are then filled with the most-derived
//! section content. Precedence per slot: descendant section, then the
//! layout's own section of the same name, then the yield's inline default,
//! then empty. A child's body outside any section does not survive
//! flattening.

use std::collections::HashMap;

use crate::directives::{find_bare, find_directive, split_args, unquote};
use crate::error::{Result, WeftError};
use crate::resolver::TemplateResolver;

/// Flattens `source` (loaded from `path`) through its `@extends` chain.
///
/// `layout_stack` carries the chain for cycle detection and depth limiting;
/// the engine shares one stack across a whole render so includes that
/// extend layouts count against the same limit.
pub(crate) fn flatten<R: TemplateResolver>(
    source: &str,
    path: &str,
    resolver: &R,
    layout_stack: &mut Vec<String>,
    max_depth: usize,
) -> Result<String> {
    flatten_with(source, path, resolver, layout_stack, max_depth, &HashMap::new())
}

fn flatten_with<R: TemplateResolver>(
    source: &str,
    path: &str,
    resolver: &R,
    layout_stack: &mut Vec<String>,
    max_depth: usize,
    inherited: &HashMap<String, String>,
) -> Result<String> {
    if layout_stack.iter().any(|entry| entry == path) {
        let mut chain = layout_stack.clone();
        chain.push(path.to_string());
        return Err(WeftError::Cycle { chain });
    }
    if layout_stack.len() >= max_depth {
        return Err(WeftError::DepthExceeded {
            path: path.to_string(),
            max: max_depth,
        });
    }
    layout_stack.push(path.to_string());
    let result = flatten_step(source, resolver, layout_stack, max_depth, inherited);
    layout_stack.pop();
    result
}

fn flatten_step<R: TemplateResolver>(
    source: &str,
    resolver: &R,
    layout_stack: &mut Vec<String>,
    max_depth: usize,
    inherited: &HashMap<String, String>,
) -> Result<String> {
    let (body, own) = capture_sections(source)?;

    // Sections declared deeper in the chain shadow this template's own.
    let mut merged = own;
    for (name, content) in inherited {
        merged.insert(name.clone(), content.clone());
    }

    match take_extends(&body)? {
        // The body outside sections is discarded; only sections travel up.
        Some(layout_path) => {
            // Key the chain on the resolver's normalized path so two
            // spellings of one layout still trip the cycle check.
            let layout = resolver.load(&layout_path)?;
            flatten_with(
                &layout.source,
                &layout.path,
                resolver,
                layout_stack,
                max_depth,
                &merged,
            )
        }
        None => Ok(substitute_yields(&body, &merged)),
    }
}

/// Captures `@section` content and returns the source with the section
/// markup removed. Supports both the block form and the one-line
/// `@section('name', 'literal')` form. A later section of the same name
/// replaces an earlier one.
fn capture_sections(source: &str) -> Result<(String, HashMap<String, String>)> {
    let mut sections = HashMap::new();
    let mut out = String::with_capacity(source.len());
    let mut pos = 0;
    while let Some(m) = find_directive(source, "section", pos) {
        out.push_str(&source[pos..m.start]);
        let parts = split_args(&m.args);
        let name = parts
            .first()
            .and_then(|p| unquote(p))
            .ok_or_else(|| WeftError::MalformedDirective(format!("@section({})", m.args)))?;
        if let Some(literal) = parts.get(1) {
            let value = unquote(literal).unwrap_or_else(|| literal.clone());
            sections.insert(name, value);
            pos = m.end;
        } else {
            let (close_start, close_end) =
                find_bare(source, "endsection", m.end).ok_or_else(|| {
                    WeftError::MalformedDirective(format!("@section('{}') without @endsection", name))
                })?;
            sections.insert(name, source[m.end..close_start].to_string());
            pos = close_end;
        }
    }
    out.push_str(&source[pos..]);
    Ok((out, sections))
}

/// Returns the layout path named by the first `@extends('path')`, if any.
fn take_extends(source: &str) -> Result<Option<String>> {
    let Some(m) = find_directive(source, "extends", 0) else {
        return Ok(None);
    };
    let path = unquote(m.args.trim())
        .ok_or_else(|| WeftError::MalformedDirective(format!("@extends({})", m.args)))?;
    Ok(Some(path))
}

/// Replaces every `@yield('name'[, 'default'])` with its resolved content.
fn substitute_yields(source: &str, sections: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(source.len());
    let mut pos = 0;
    while let Some(m) = find_directive(source, "yield", pos) {
        out.push_str(&source[pos..m.start]);
        let parts = split_args(&m.args);
        let name = parts.first().and_then(|p| unquote(p));
        match name {
            Some(name) => {
                if let Some(content) = sections.get(&name) {
                    out.push_str(content);
                } else if let Some(default) = parts.get(1) {
                    out.push_str(&unquote(default).unwrap_or_else(|| default.clone()));
                }
            }
            // Unquoted yield name; leave the directive text in place.
            None => out.push_str(&source[m.start..m.end]),
        }
        pos = m.end;
    }
    out.push_str(&source[pos..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MemoryResolver;

    fn flatten_entry(resolver: &MemoryResolver, path: &str) -> Result<String> {
        let loaded = resolver.load(path)?;
        let mut stack = Vec::new();
        flatten(&loaded.source, path, resolver, &mut stack, 50)
    }

    #[test]
    fn test_no_extends_is_identity() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("page.tpl", "<p>@if(x)A@endif</p>");
        assert_eq!(
            flatten_entry(&resolver, "page.tpl").unwrap(),
            "<p>@if(x)A@endif</p>"
        );
    }

    #[test]
    fn test_section_fills_yield() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("layout.tpl", "<title>@yield('title')</title>");
        resolver.insert(
            "page.tpl",
            "@extends('layout')@section('title')Home@endsection",
        );
        assert_eq!(
            flatten_entry(&resolver, "page.tpl").unwrap(),
            "<title>Home</title>"
        );
    }

    #[test]
    fn test_one_line_section() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("layout.tpl", "<t>@yield('title')</t>");
        resolver.insert("page.tpl", "@extends('layout')@section('title', 'Hi')");
        assert_eq!(flatten_entry(&resolver, "page.tpl").unwrap(), "<t>Hi</t>");
    }

    #[test]
    fn test_yield_default_and_empty() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("layout.tpl", "<t>@yield('title', 'Def')</t><m>@yield('meta')</m>");
        resolver.insert("page.tpl", "@extends('layout')");
        assert_eq!(
            flatten_entry(&resolver, "page.tpl").unwrap(),
            "<t>Def</t><m></m>"
        );
    }

    #[test]
    fn test_descendant_section_wins_over_intermediate() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("base.tpl", "[@yield('title')]");
        resolver.insert(
            "mid.tpl",
            "@extends('base')@section('title')Mid@endsection",
        );
        resolver.insert(
            "leaf.tpl",
            "@extends('mid')@section('title')Leaf@endsection",
        );
        assert_eq!(flatten_entry(&resolver, "leaf.tpl").unwrap(), "[Leaf]");
    }

    #[test]
    fn test_layout_own_section_is_fallback() {
        let mut resolver = MemoryResolver::new();
        resolver.insert(
            "base.tpl",
            "@section('title')Base@endsection[@yield('title')]",
        );
        resolver.insert("page.tpl", "@extends('base')");
        assert_eq!(flatten_entry(&resolver, "page.tpl").unwrap(), "[Base]");
    }

    #[test]
    fn test_body_outside_sections_discarded() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("layout.tpl", "L:@yield('a')");
        resolver.insert(
            "page.tpl",
            "stray text@extends('layout')@section('a')A@endsection more stray",
        );
        assert_eq!(flatten_entry(&resolver, "page.tpl").unwrap(), "L:A");
    }

    #[test]
    fn test_extends_cycle_detected() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("a.tpl", "@extends('b.tpl')");
        resolver.insert("b.tpl", "@extends('a.tpl')");
        let err = flatten_entry(&resolver, "a.tpl").unwrap_err();
        match err {
            WeftError::Cycle { chain } => {
                assert_eq!(chain, vec!["a.tpl", "b.tpl", "a.tpl"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_extends_cycle_across_spellings() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("a.tpl", "@extends('b')");
        resolver.insert("b.tpl", "@extends('a.tpl')");
        let err = flatten_entry(&resolver, "a.tpl").unwrap_err();
        assert_eq!(err.kind(), "cycle");
    }

    #[test]
    fn test_missing_layout_is_not_found() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("page.tpl", "@extends('ghost')");
        let err = flatten_entry(&resolver, "page.tpl").unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[test]
    fn test_depth_limit() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("l0.tpl", "deep");
        for i in 1..10 {
            resolver.insert(format!("l{}.tpl", i), format!("@extends('l{}.tpl')", i - 1));
        }
        let loaded = resolver.load("l9.tpl").unwrap();
        let mut stack = Vec::new();
        let err = flatten(&loaded.source, "l9.tpl", &resolver, &mut stack, 5).unwrap_err();
        assert_eq!(err.kind(), "depth-exceeded");
    }
}
