// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The composition engine: public entry point tying the pipeline together.
//!
//! A render runs layout flattening, the directive transform (content-hash
//! cached), recursive include resolution, expression evaluation and finally
//! the whole-render stack flush. All per-render state lives on the stack of
//! the render call; one engine is safe to share across threads.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::cache::FingerprintCache;
use crate::context::DataContext;
use crate::directives;
use crate::error::{Diagnostic, DiagnosticsReporter, Result, TracingReporter};
use crate::evaluator::{CompileOptions, Evaluator, ExprEvaluator};
use crate::include::{self, RenderState, RenderSupport};
use crate::resolver::TemplateResolver;
use crate::stacks;

/// Default maximum combined layout/include nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// Template composition engine.
///
/// Construct with [`Engine::new`], then chain `with_*` builders:
///
/// ```
/// use weft::{Engine, FileSystemResolver};
/// use serde_json::json;
///
/// let engine = Engine::new(FileSystemResolver::new("templates"))
///     .with_global("site", json!("My Site"))
///     .with_max_depth(20);
/// ```
pub struct Engine<R: TemplateResolver> {
    resolver: R,
    evaluator: Box<dyn Evaluator>,
    reporter: Box<dyn DiagnosticsReporter>,
    cache: FingerprintCache,
    options: CompileOptions,
    globals: Map<String, Value>,
    max_depth: usize,
}

impl<R: TemplateResolver> Engine<R> {
    /// Creates an engine with the default evaluator, a tracing diagnostics
    /// reporter and a moderate transform cache.
    pub fn new(resolver: R) -> Self {
        Engine {
            resolver,
            evaluator: Box::new(ExprEvaluator::new()),
            reporter: Box::new(TracingReporter),
            cache: FingerprintCache::default(),
            options: CompileOptions::default(),
            globals: Map::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Sets the maximum layout/include nesting depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Adds a global variable available to every template in every render.
    /// Globals sit below render data and include locals in precedence.
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Replaces the whole global variable map.
    pub fn with_globals(mut self, globals: Map<String, Value>) -> Self {
        self.globals = globals;
        self
    }

    /// Overrides the interpolation delimiters (default `{{` / `}}`).
    /// Control tags are not affected.
    pub fn with_delimiters(mut self, open: impl Into<String>, close: impl Into<String>) -> Self {
        self.options = CompileOptions {
            open: open.into(),
            close: close.into(),
        };
        self
    }

    /// Swaps in a custom expression evaluator backend.
    pub fn with_evaluator(mut self, evaluator: Box<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Swaps in a custom diagnostics reporter.
    pub fn with_reporter(mut self, reporter: Box<dyn DiagnosticsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replaces the transform cache. `FingerprintCache::new(0, …)` disables
    /// caching; output must be identical either way.
    pub fn with_cache(mut self, cache: FingerprintCache) -> Self {
        self.cache = cache;
        self
    }

    /// The configured resolver.
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// The transform cache.
    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Drops all cached transform results.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn transform_cached(&self, source: &str) -> String {
        if self.cache.disabled() {
            return directives::transform(source);
        }
        let key = FingerprintCache::fingerprint(source);
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }
        let transformed = directives::transform(source);
        self.cache.put(key, transformed.clone());
        transformed
    }

    /// Renders template `source`, registered under logical `path`, against
    /// `data`.
    ///
    /// Best-effort: failures below the entry template collapse to inline
    /// diagnostic markup and the rest of the page still renders. `data`
    /// should be a JSON object; any other value leaves only the globals in
    /// the entry context. Render data shadows globals of the same name.
    pub fn render(&self, source: &str, path: &str, data: Value) -> String {
        let base = DataContext::from_value(Value::Object(self.globals.clone()));
        let ctx = match data {
            Value::Object(map) => base.merged(&map),
            _ => base,
        };
        let mut state = RenderState::default();
        let transform = |text: &str| self.transform_cached(text);
        let support = RenderSupport {
            resolver: &self.resolver,
            evaluator: self.evaluator.as_ref(),
            options: &self.options,
            reporter: self.reporter.as_ref(),
            globals: &self.globals,
            max_depth: self.max_depth,
            transform: &transform,
        };
        tracing::debug!(path, "render start");
        let output = match include::render_tree(
            &support,
            source,
            path,
            &ctx,
            &mut state,
            &HashMap::new(),
        ) {
            Ok(output) => output,
            // Entry-level layout failures still produce a page.
            Err(err) => {
                let diag = Diagnostic::from_error(&err, path);
                self.reporter.report(&diag);
                diag.inline_markup()
            }
        };
        stacks::flush(&output)
    }

    /// Loads `path` through the resolver and renders it.
    ///
    /// Resolution failures for the entry template itself are hard errors;
    /// everything below renders best-effort like [`Engine::render`].
    pub fn render_file(&self, path: &str, data: Value) -> Result<String> {
        let loaded = self.resolver.load(path)?;
        Ok(self.render(&loaded.source, &loaded.path, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MemoryResolver;
    use serde_json::json;
    use std::time::Duration;

    fn engine(templates: &[(&str, &str)]) -> Engine<MemoryResolver> {
        let mut resolver = MemoryResolver::new();
        for (path, source) in templates {
            resolver.insert(*path, *source);
        }
        Engine::new(resolver)
    }

    #[test]
    fn test_render_plain_source() {
        let engine = engine(&[]);
        let out = engine.render("Hello {{ name }}", "inline", json!({"name": "World"}));
        assert_eq!(out, "Hello World");
    }

    #[test]
    fn test_render_file_missing_is_hard_error() {
        let engine = engine(&[]);
        let err = engine.render_file("ghost", json!({})).unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[test]
    fn test_entry_layout_failure_degrades() {
        let engine = engine(&[]);
        let out = engine.render("@extends('ghost')", "page", json!({}));
        assert!(out.contains("data-template-error=\"not-found\""));
    }

    #[test]
    fn test_globals_below_render_data() {
        let engine = engine(&[]).with_global("name", json!("G")).with_global("site", json!("S"));
        let out = engine.render("{{ site }}:{{ name }}", "inline", json!({"name": "D"}));
        assert_eq!(out, "S:D");
    }

    #[test]
    fn test_delimiter_override_is_interpolation_only() {
        let engine = engine(&[]).with_delimiters("[[", "]]");
        let out = engine.render(
            "@if(on)[[ name ]]@endif {{ name }}",
            "inline",
            json!({"on": true, "name": "x"}),
        );
        assert_eq!(out, "x {{ name }}");
    }

    #[test]
    fn test_disabled_cache_output_identical() {
        let templates = [("p.tpl", "@if(x)Y@endif")];
        let cached = engine(&templates);
        let uncached =
            engine(&templates).with_cache(FingerprintCache::new(0, Duration::from_secs(1)));
        let a = cached.render_file("p.tpl", json!({"x": true})).unwrap();
        let b = uncached.render_file("p.tpl", json!({"x": true})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "Y");
    }

    #[test]
    fn test_transform_cache_populated_and_cleared() {
        let engine = engine(&[("p.tpl", "@if(x)Y@endif")]);
        assert!(engine.cache().is_empty());
        engine.render_file("p.tpl", json!({"x": true})).unwrap();
        assert_eq!(engine.cache().len(), 1);
        // Same content renders from cache; no new entry.
        engine.render_file("p.tpl", json!({"x": false})).unwrap();
        assert_eq!(engine.cache().len(), 1);
        engine.clear_cache();
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn test_stacks_flush_across_layout_and_include() {
        let engine = engine(&[
            ("layout.tpl", "<head>@stack('scripts')</head>@yield('body')"),
            (
                "page.tpl",
                "@extends('layout')@section('body')<include src=\"widget\"/>@endsection",
            ),
            ("widget.tpl", "W@push('scripts')<s/>@endpush"),
        ]);
        let out = engine.render_file("page.tpl", json!({})).unwrap();
        assert_eq!(out, "<head><s/></head>W");
    }

    #[test]
    fn test_conditional_include_skips_pushes() {
        let engine = engine(&[
            ("page.tpl", "@stack('s')|@if(on)<include src=\"w\"/>@endif"),
            ("w.tpl", "W@push('s')X@endpush"),
        ]);
        assert_eq!(engine.render_file("page.tpl", json!({"on": false})).unwrap(), "|");
        assert_eq!(engine.render_file("page.tpl", json!({"on": true})).unwrap(), "X|W");
    }

    #[test]
    fn test_once_dedupes_across_includes() {
        let engine = engine(&[
            ("page.tpl", "<include src=\"w\"/><include src=\"w\"/>"),
            ("w.tpl", "@once('boot')B@endonce W"),
        ]);
        assert_eq!(engine.render_file("page.tpl", json!({})).unwrap(), "B W W");
    }
}
