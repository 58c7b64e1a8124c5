// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Whole-render collection pass for stacks and once regions.
//!
//! The transformer rewrites `@push`/`@prepend`/`@stack`/`@once` into opaque
//! marker pairs that survive evaluation unchanged. After the full document
//! (layouts and all includes) has been evaluated, [`flush`] runs exactly
//! once: it deduplicates once regions, lifts push and prepend fragments out
//! of the flow, injects them at their stack placeholders, and strips any
//! marker that is left over.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::directives::{MARK_CLOSE, MARK_OPEN};

lazy_static! {
    static ref ONCE_RE: Regex = Regex::new(&format!(
        "(?s){open}once:([^{close}]*){close}(.*?){open}endonce{close}",
        open = MARK_OPEN,
        close = MARK_CLOSE
    ))
    .unwrap();
    static ref PUSH_RE: Regex = Regex::new(&format!(
        "(?s){open}push:([^{close}]*){close}(.*?){open}endpush{close}",
        open = MARK_OPEN,
        close = MARK_CLOSE
    ))
    .unwrap();
    static ref PREPEND_RE: Regex = Regex::new(&format!(
        "(?s){open}prepend:([^{close}]*){close}(.*?){open}endprepend{close}",
        open = MARK_OPEN,
        close = MARK_CLOSE
    ))
    .unwrap();
    static ref STACK_RE: Regex = Regex::new(&format!(
        "{open}stack:([^{close}]*){close}",
        open = MARK_OPEN,
        close = MARK_CLOSE
    ))
    .unwrap();
    static ref STRAY_RE: Regex = Regex::new(&format!(
        "{open}[^{close}]*{close}",
        open = MARK_OPEN,
        close = MARK_CLOSE
    ))
    .unwrap();
}

/// Resolves all stack and once markers in an evaluated document.
///
/// Fragments are emitted at each stack placeholder in document order, every
/// prepend fragment ahead of every push fragment. Fragments pushed to a
/// stack that never appears are dropped silently, as is a stack with no
/// fragments.
pub(crate) fn flush(text: &str) -> String {
    // First occurrence of a once id keeps its content, repeats vanish
    // together with anything they pushed.
    let mut seen: HashSet<String> = HashSet::new();
    let text = ONCE_RE.replace_all(text, |caps: &Captures<'_>| {
        if seen.insert(caps[1].to_string()) {
            caps[2].to_string()
        } else {
            String::new()
        }
    });

    let mut pushes: HashMap<String, Vec<String>> = HashMap::new();
    let mut prepends: HashMap<String, Vec<String>> = HashMap::new();
    let text = PUSH_RE.replace_all(&text, |caps: &Captures<'_>| {
        pushes
            .entry(caps[1].to_string())
            .or_default()
            .push(caps[2].to_string());
        String::new()
    });
    let text = PREPEND_RE.replace_all(&text, |caps: &Captures<'_>| {
        prepends
            .entry(caps[1].to_string())
            .or_default()
            .push(caps[2].to_string());
        String::new()
    });

    let text = STACK_RE.replace_all(&text, |caps: &Captures<'_>| {
        let name = &caps[1];
        let mut out = String::new();
        if let Some(fragments) = prepends.get(name) {
            for fragment in fragments {
                out.push_str(fragment);
            }
        }
        if let Some(fragments) = pushes.get(name) {
            for fragment in fragments {
                out.push_str(fragment);
            }
        }
        out
    });

    STRAY_RE.replace_all(&text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::marker;

    fn push(name: &str, body: &str) -> String {
        format!("{}{}{}", marker(&format!("push:{}", name)), body, marker("endpush"))
    }

    fn prepend(name: &str, body: &str) -> String {
        format!(
            "{}{}{}",
            marker(&format!("prepend:{}", name)),
            body,
            marker("endprepend")
        )
    }

    fn once(id: &str, body: &str) -> String {
        format!("{}{}{}", marker(&format!("once:{}", id)), body, marker("endonce"))
    }

    #[test]
    fn test_push_fragments_collect_in_document_order() {
        let doc = format!("{}{}head:{}", push("s", "1"), push("s", "2"), marker("stack:s"));
        assert_eq!(flush(&doc), "head:12");
    }

    #[test]
    fn test_prepends_precede_pushes() {
        let doc = format!("{}{}{}", push("s", "A"), prepend("s", "B"), marker("stack:s"));
        assert_eq!(flush(&doc), "BA");
    }

    #[test]
    fn test_empty_stack_renders_nothing() {
        let doc = format!("x{}y", marker("stack:scripts"));
        assert_eq!(flush(&doc), "xy");
    }

    #[test]
    fn test_unclaimed_push_dropped() {
        let doc = format!("a{}b", push("nowhere", "X"));
        assert_eq!(flush(&doc), "ab");
    }

    #[test]
    fn test_once_dedupes_by_id() {
        let doc = format!("{}|{}", once("boot", "<s/>"), once("boot", "<s/>"));
        assert_eq!(flush(&doc), "<s/>|");
    }

    #[test]
    fn test_distinct_once_ids_both_survive() {
        let doc = format!("{}{}", once("a", "1"), once("b", "2"));
        assert_eq!(flush(&doc), "12");
    }

    #[test]
    fn test_duplicate_once_drops_inner_pushes_too() {
        let first = once("boot", &push("s", "X"));
        let second = once("boot", &push("s", "X"));
        let doc = format!("{}{}{}", first, second, marker("stack:s"));
        assert_eq!(flush(&doc), "X");
    }

    #[test]
    fn test_stray_markers_stripped() {
        let doc = format!("a{}b", marker("endpush"));
        assert_eq!(flush(&doc), "ab");
    }
}
