// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # WEFT
//!
//! A Blade-inspired directive preprocessor and template composition engine.
//!
//! WEFT turns templates written with `@`-directives into final documents in
//! five stages:
//!
//! 1. **Layout flattening** resolves the `@extends` / `@section` / `@yield`
//!    inheritance chain into a single document.
//! 2. The **directive transform** rewrites every `@`-directive into a small
//!    canonical control syntax (`{{#if}}`, `{{#each}}`, `<include/>` tags,
//!    opaque stack markers). The transform is pure text-to-text and cached
//!    by content fingerprint.
//! 3. **Evaluation** runs the canonical syntax against the data context
//!    through a pluggable [`Evaluator`] backend; `<include/>` tags ride
//!    through it as opaque markers carrying their attribute expressions.
//! 4. **Include resolution** renders each surviving marker depth-first with
//!    its own data context, guarded against cycles, runaway depth and path
//!    traversal.
//! 5. The **stack flush** collects `@push` / `@prepend` fragments and
//!    `@once` regions across the whole finished document.
//!
//! Failures below the entry template are branch-local: the failing
//! construct collapses to inline diagnostic markup, the rest of the page
//! renders, and every diagnostic is also handed to the configured
//! [`DiagnosticsReporter`].
//!
//! ## Quick Start
//!
//! ```
//! use weft::{Engine, MemoryResolver};
//! use serde_json::json;
//!
//! let mut resolver = MemoryResolver::new();
//! resolver.insert("hello.tpl", "Hello @if(loud)LOUD@else {{ name }}@endif!");
//!
//! let engine = Engine::new(resolver);
//! let out = engine.render_file("hello.tpl", json!({"name": "World"})).unwrap();
//! assert_eq!(out, "Hello  World!");
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod context;
pub mod directives;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod expr;
mod include;
mod layout;
pub mod resolver;
mod stacks;

pub use cache::FingerprintCache;
pub use context::DataContext;
pub use directives::transform;
pub use engine::{Engine, DEFAULT_MAX_DEPTH};
pub use error::{
    Diagnostic, DiagnosticsReporter, NullReporter, Result, TracingReporter, WeftError,
};
pub use evaluator::{CompileOptions, CompiledTemplate, EvalError, Evaluator, ExprEvaluator};
pub use resolver::{FileSystemResolver, MemoryResolver, ResolvedTemplate, TemplateResolver};

#[cfg(test)]
mod tests;
