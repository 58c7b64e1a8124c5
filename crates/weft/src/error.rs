// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Error types for the WEFT composition engine.
//!
//! This module defines [`WeftError`], the main error enum, together with
//! [`Diagnostic`], the branch-local user-visible form of a failure, and
//! the [`DiagnosticsReporter`] trait used to surface diagnostics to the host.
//!
//! # Error Categories
//!
//! - **Cycle**: a layout or include chain revisits a path already in flight
//! - **DepthExceeded**: nesting beyond the configured maximum (distinct from a cycle)
//! - **PathRejected**: a resolved target escapes the permitted root (security boundary)
//! - **NotFound**: a missing layout or partial
//! - **Expression**: evaluator compile/render failure
//! - **MalformedDirective**: unparseable directive arguments
//!
//! Cycle, depth, path and not-found failures are branch-local: the engine
//! converts them to inline diagnostic markup at the failing construct and the
//! rest of the page still renders.

use serde::Serialize;
use thiserror::Error;

/// The main error type for WEFT operations.
///
/// All fallible WEFT functions return `Result<T, WeftError>`.
#[derive(Error, Debug)]
pub enum WeftError {
    /// A layout or include chain revisited a path already being resolved.
    #[error("cycle detected: {}", chain.join(" -> "))]
    Cycle {
        /// Every logical path in the failing resolution chain, in order.
        chain: Vec<String>,
    },

    /// Resolution nesting exceeded the configured maximum.
    #[error("maximum resolution depth {max} exceeded at '{path}'")]
    DepthExceeded {
        /// The path whose resolution tripped the guard.
        path: String,
        /// The configured depth limit.
        max: usize,
    },

    /// A resolved target escapes the configured template root.
    #[error("path '{path}' escapes the template root")]
    PathRejected {
        /// The offending logical path.
        path: String,
    },

    /// A layout or partial could not be located.
    #[error("template not found: {path}")]
    NotFound {
        /// The logical path that failed to resolve.
        path: String,
    },

    /// The evaluator failed to compile or render a template body.
    #[error("expression error in '{path}': {message}")]
    Expression {
        /// The template where the failure occurred.
        path: String,
        /// Evaluator message.
        message: String,
    },

    /// A directive carried arguments that could not be parsed.
    #[error("malformed directive: {0}")]
    MalformedDirective(String),

    /// File I/O error from a resolver.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WeftError {
    /// Short stable identifier for the error category, used in inline
    /// diagnostic markup and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            WeftError::Cycle { .. } => "cycle",
            WeftError::DepthExceeded { .. } => "depth-exceeded",
            WeftError::PathRejected { .. } => "path-rejected",
            WeftError::NotFound { .. } => "not-found",
            WeftError::Expression { .. } => "expression",
            WeftError::MalformedDirective(_) => "malformed-directive",
            WeftError::Io(_) => "io",
        }
    }
}

/// Convenience type alias for Results with [`WeftError`].
pub type Result<T> = std::result::Result<T, WeftError>;

/// A classified, locatable failure raised during one render.
///
/// Diagnostics are both rendered inline in place of the failing construct
/// and handed to the configured [`DiagnosticsReporter`]; the core never
/// decides final presentation.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Stable error category identifier (see [`WeftError::kind`]).
    pub kind: &'static str,
    /// Human-readable message. Cycle messages carry the full chain trail.
    pub message: String,
    /// Logical path of the template where the failure surfaced.
    pub path: String,
}

impl Diagnostic {
    /// Builds a diagnostic from an error raised while resolving `path`.
    pub fn from_error(error: &WeftError, path: &str) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            path: path.to_string(),
        }
    }

    /// Inline placeholder markup substituted for the failing construct.
    ///
    /// Visible during development; hosts that want silent failures can
    /// post-process on the `data-template-error` attribute.
    pub fn inline_markup(&self) -> String {
        format!(
            "<span data-template-error=\"{}\">{}</span>",
            self.kind,
            crate::evaluator::html_escape(&self.message)
        )
    }
}

/// Receiver for diagnostics raised during a render.
///
/// The engine emits every diagnostic here in addition to the inline
/// placeholder, so hosts can log or aggregate them.
pub trait DiagnosticsReporter: Send + Sync {
    /// Called once per diagnostic, in the order failures were detected.
    fn report(&self, diagnostic: &Diagnostic);
}

/// Default reporter that forwards diagnostics to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

impl DiagnosticsReporter for TracingReporter {
    fn report(&self, diagnostic: &Diagnostic) {
        tracing::warn!(
            kind = diagnostic.kind,
            path = %diagnostic.path,
            "{}",
            diagnostic.message
        );
    }
}

/// Reporter that drops every diagnostic. Useful in tests.
#[derive(Debug, Clone, Default)]
pub struct NullReporter;

impl DiagnosticsReporter for NullReporter {
    fn report(&self, _diagnostic: &Diagnostic) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_path() {
        let err = WeftError::Cycle {
            chain: vec!["a.tpl".into(), "b.tpl".into(), "a.tpl".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a.tpl -> b.tpl -> a.tpl"));
        assert_eq!(err.kind(), "cycle");
    }

    #[test]
    fn test_inline_markup_escapes_message() {
        let err = WeftError::NotFound {
            path: "<p>.tpl".into(),
        };
        let diag = Diagnostic::from_error(&err, "page.tpl");
        let markup = diag.inline_markup();
        assert!(markup.starts_with("<span data-template-error=\"not-found\">"));
        assert!(markup.contains("&lt;p&gt;"));
        assert!(!markup.contains("<p>"));
    }
}
