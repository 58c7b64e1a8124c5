// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Layered data context for template rendering.
//!
//! A [`DataContext`] is a flat variable map built by merging layers
//! rightmost-wins: global base data, then the parent template's variables,
//! then the locals of the current include call. Loop metadata is layered on
//! top of the context by the evaluator at render time and never lives here.

use serde_json::{Map, Value};

/// Variable -> value mapping handed to the evaluator for one template body.
///
/// Contexts are cheap to clone; include expansion builds a fresh merged
/// context per call so sibling branches cannot observe each other's locals.
#[derive(Debug, Clone, Default)]
pub struct DataContext {
    vars: Map<String, Value>,
}

impl DataContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self { vars: Map::new() }
    }

    /// Builds a context from a JSON value.
    ///
    /// Objects become the variable map directly; any other value (including
    /// `null`) yields an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(vars) => Self { vars },
            _ => Self::new(),
        }
    }

    /// Looks up a variable by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Sets a single variable, replacing any existing binding.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Number of bound variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True when no variables are bound.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Returns a new context with `overlay` merged on top (overlay wins).
    pub fn merged(&self, overlay: &Map<String, Value>) -> Self {
        let mut vars = self.vars.clone();
        for (k, v) in overlay {
            vars.insert(k.clone(), v.clone());
        }
        Self { vars }
    }

    /// Builds the callee context for an include call.
    ///
    /// Merge order, rightmost wins: globals < caller context < locals.
    pub fn for_include(
        globals: &Map<String, Value>,
        caller: &DataContext,
        locals: &Map<String, Value>,
    ) -> Self {
        let mut vars = globals.clone();
        for (k, v) in &caller.vars {
            vars.insert(k.clone(), v.clone());
        }
        for (k, v) in locals {
            vars.insert(k.clone(), v.clone());
        }
        Self { vars }
    }

    /// Borrowed view of the underlying map.
    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }
}
