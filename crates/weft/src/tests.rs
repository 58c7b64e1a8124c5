// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! End-to-end tests driving the full pipeline through the public API.

use crate::{Engine, FileSystemResolver, MemoryResolver};
use serde_json::json;
use tracing_subscriber::EnvFilter;

// Diagnostics go through tracing; give test runs a subscriber so
// RUST_LOG=weft=debug shows the pipeline stages. Repeat calls no-op.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine(templates: &[(&str, &str)]) -> Engine<MemoryResolver> {
    init_tracing();
    let mut resolver = MemoryResolver::new();
    for (path, source) in templates {
        resolver.insert(*path, *source);
    }
    Engine::new(resolver)
}

mod transform_properties {
    use crate::directives::transform;

    #[test]
    fn test_transform_is_idempotent() {
        let source = "@extends? no: @if(user.admin)<b>{{ user.name }}</b>@else guest@endif \
                      @foreach(items as i){{ i }}@endforeach @push('s')x@endpush @stack('s')";
        let once = transform(source);
        let twice = transform(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_transform_of_canonical_syntax_is_identity() {
        let canonical = "{{#if x}}A{{#else}}B{{/if}}{{#each xs as x with loop}}{{ x }}{{/each}}";
        assert_eq!(transform(canonical), canonical);
    }
}

mod conditionals {
    use super::*;

    #[test]
    fn test_if_else_branches() {
        let engine = engine(&[("p.tpl", "@if(x)A@else B@endif")]);
        assert_eq!(engine.render_file("p.tpl", json!({"x": true})).unwrap(), "A");
        assert_eq!(engine.render_file("p.tpl", json!({"x": false})).unwrap(), " B");
    }

    #[test]
    fn test_truthiness_of_empty_collections() {
        let engine = engine(&[("p.tpl", "@if(items)some@else none@endif")]);
        assert_eq!(engine.render_file("p.tpl", json!({"items": []})).unwrap(), " none");
        assert_eq!(
            engine.render_file("p.tpl", json!({"items": [1]})).unwrap(),
            "some"
        );
    }

    #[test]
    fn test_unless_and_isset() {
        let engine = engine(&[("p.tpl", "@unless(on)off@endunless@isset(v)V@endisset")]);
        assert_eq!(engine.render_file("p.tpl", json!({"v": 1})).unwrap(), "offV");
        assert_eq!(engine.render_file("p.tpl", json!({"on": true})).unwrap(), "");
    }

    #[test]
    fn test_switch_first_match_no_fallthrough() {
        let engine = engine(&[(
            "p.tpl",
            "@switch(n)@case(1)one@break@case(2)two@break@default many@endswitch",
        )]);
        assert_eq!(engine.render_file("p.tpl", json!({"n": 2})).unwrap(), "two");
        assert_eq!(engine.render_file("p.tpl", json!({"n": 9})).unwrap(), " many");
    }
}

mod loops {
    use super::*;

    #[test]
    fn test_foreach_renders_items() {
        let engine = engine(&[("p.tpl", "@foreach(items as i)<li>{{ i }}</li>@endforeach")]);
        let out = engine
            .render_file("p.tpl", json!({"items": ["p", "q"]}))
            .unwrap();
        assert_eq!(out, "<li>p</li><li>q</li>");
    }

    #[test]
    fn test_loop_metadata_values() {
        let engine = engine(&[(
            "p.tpl",
            "@foreach(items as i)({{ loop.iteration }}/{{ loop.remaining }}/{{ loop.first }}/{{ loop.last }})@endforeach",
        )]);
        let out = engine
            .render_file("p.tpl", json!({"items": [10, 20, 30]}))
            .unwrap();
        assert_eq!(out, "(1/2/true/false)(2/1/false/false)(3/0/false/true)");
    }

    #[test]
    fn test_nested_loop_parent_chain() {
        let engine = engine(&[(
            "p.tpl",
            "@foreach(rows as r)@foreach(r as c){{ loop.depth }}:{{ loop.parent.index }};@endforeach@endforeach",
        )]);
        let out = engine
            .render_file("p.tpl", json!({"rows": [[1], [2]]}))
            .unwrap();
        assert_eq!(out, "2:0;2:1;");
    }

    #[test]
    fn test_forelse_empty_branch() {
        let engine = engine(&[(
            "p.tpl",
            "@forelse(items as i){{ i }}@empty nothing@endforelse",
        )]);
        assert_eq!(
            engine.render_file("p.tpl", json!({"items": []})).unwrap(),
            " nothing"
        );
        assert_eq!(
            engine.render_file("p.tpl", json!({"items": ["a"]})).unwrap(),
            "a"
        );
    }

    #[test]
    fn test_object_iteration_visits_values() {
        let engine = engine(&[("p.tpl", "@foreach(m as v){{ v }}@endforeach")]);
        let out = engine
            .render_file("p.tpl", json!({"m": {"a": 1, "b": 2}}))
            .unwrap();
        assert_eq!(out, "12");
    }
}

mod interpolation {
    use super::*;

    #[test]
    fn test_escaped_vs_raw() {
        let engine = engine(&[("p.tpl", "{{ html }}|{{! html !}}")]);
        let out = engine
            .render_file("p.tpl", json!({"html": "<b>&</b>"}))
            .unwrap();
        assert_eq!(out, "&lt;b&gt;&amp;&lt;/b&gt;|<b>&</b>");
    }

    #[test]
    fn test_json_directive_emits_raw_json() {
        let engine = engine(&[("p.tpl", "<script>let cfg = @json(cfg);</script>")]);
        let out = engine
            .render_file("p.tpl", json!({"cfg": {"debug": true}}))
            .unwrap();
        assert_eq!(out, "<script>let cfg = {\"debug\":true};</script>");
    }

    #[test]
    fn test_verbatim_survives_untouched() {
        let engine = engine(&[("p.tpl", "@verbatim{{ name }} @if(x)@endverbatim")]);
        let out = engine.render_file("p.tpl", json!({"name": "n"})).unwrap();
        assert_eq!(out, "{{ name }} @if(x)");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let engine = engine(&[("p.tpl", "[{{ ghost }}]")]);
        assert_eq!(engine.render_file("p.tpl", json!({})).unwrap(), "[]");
    }
}

mod composition {
    use super::*;

    #[test]
    fn test_layout_section_yield_precedence() {
        let engine = engine(&[
            ("base.tpl", "<t>@yield('title', 'Fallback')</t>"),
            ("mid.tpl", "@extends('base')@section('title')Mid@endsection"),
            ("leaf.tpl", "@extends('mid')@section('title')Leaf@endsection"),
            ("bare.tpl", "@extends('base')"),
        ]);
        assert_eq!(engine.render_file("leaf.tpl", json!({})).unwrap(), "<t>Leaf</t>");
        assert_eq!(engine.render_file("mid.tpl", json!({})).unwrap(), "<t>Mid</t>");
        assert_eq!(engine.render_file("bare.tpl", json!({})).unwrap(), "<t>Fallback</t>");
    }

    #[test]
    fn test_two_template_include_cycle_names_every_path() {
        let engine = engine(&[
            ("a.tpl", "<include src=\"b.tpl\"/>"),
            ("b.tpl", "<include src=\"a.tpl\"/>"),
        ]);
        let out = engine.render_file("a.tpl", json!({})).unwrap();
        assert!(out.contains("data-template-error=\"cycle\""));
        assert!(out.contains("a.tpl -&gt; b.tpl -&gt; a.tpl"));
    }

    #[test]
    fn test_three_template_cycle_names_every_path() {
        let engine = engine(&[
            ("a.tpl", "@include('b.tpl')"),
            ("b.tpl", "@include('c.tpl')"),
            ("c.tpl", "@include('a.tpl')"),
        ]);
        let out = engine.render_file("a.tpl", json!({})).unwrap();
        assert!(out.contains("a.tpl -&gt; b.tpl -&gt; c.tpl -&gt; a.tpl"));
    }

    #[test]
    fn test_diamond_dependency_is_allowed() {
        let engine = engine(&[
            ("root.tpl", "@include('left')@include('right')"),
            ("left.tpl", "L@include('shared')"),
            ("right.tpl", "R@include('shared')"),
            ("shared.tpl", "S"),
        ]);
        assert_eq!(engine.render_file("root.tpl", json!({})).unwrap(), "LSRS");
    }

    #[test]
    fn test_include_per_loop_iteration_passes_item() {
        let engine = engine(&[
            (
                "page.tpl",
                "@foreach(posts as post)@include('card', { p: post })@endforeach",
            ),
            ("card.tpl", "[{{ p.name }}]"),
        ]);
        let out = engine
            .render_file("page.tpl", json!({"posts": [{"name": "A"}, {"name": "B"}]}))
            .unwrap();
        assert_eq!(out, "[A][B]");
    }

    #[test]
    fn test_depth_boundary_is_exact() {
        // A chain of exactly max_depth includes renders; one more trips.
        let mut templates: Vec<(String, String)> = Vec::new();
        for i in 0..4 {
            templates.push((format!("t{}.tpl", i), format!("@include('t{}.tpl')", i + 1)));
        }
        templates.push(("t4.tpl".to_string(), "deep".to_string()));
        let mut resolver = MemoryResolver::new();
        for (path, source) in &templates {
            resolver.insert(path.clone(), source.clone());
        }
        let ok_engine = Engine::new(resolver.clone()).with_max_depth(4);
        assert_eq!(ok_engine.render_file("t0.tpl", json!({})).unwrap(), "deep");
        let tight_engine = Engine::new(resolver).with_max_depth(3);
        let out = tight_engine.render_file("t0.tpl", json!({})).unwrap();
        assert!(out.contains("data-template-error=\"depth-exceeded\""));
    }

    #[test]
    fn test_include_when_and_unless() {
        let engine = engine(&[
            ("p.tpl", "@includeWhen(on, 'w')@includeUnless(on, 'w')"),
            ("w.tpl", "W"),
        ]);
        assert_eq!(engine.render_file("p.tpl", json!({"on": true})).unwrap(), "W");
        assert_eq!(engine.render_file("p.tpl", json!({"on": false})).unwrap(), "W");
    }

    #[test]
    fn test_include_if_optional() {
        let engine = engine(&[("p.tpl", "a@includeIf('ghost')b")]);
        assert_eq!(engine.render_file("p.tpl", json!({})).unwrap(), "ab");
    }
}

mod stacks_and_once {
    use super::*;

    #[test]
    fn test_prepend_precedes_push() {
        let engine = engine(&[(
            "p.tpl",
            "@push('s')A@endpush@prepend('s')B@endprepend@stack('s')",
        )]);
        assert_eq!(engine.render_file("p.tpl", json!({})).unwrap(), "BA");
    }

    #[test]
    fn test_pushes_travel_from_include_to_layout_stack() {
        let engine = engine(&[
            ("layout.tpl", "@stack('js')|@yield('body')"),
            (
                "page.tpl",
                "@extends('layout')@section('body')@include('w')@endsection",
            ),
            ("w.tpl", "W@push('js')<s/>@endpush"),
        ]);
        assert_eq!(engine.render_file("page.tpl", json!({})).unwrap(), "<s/>|W");
    }

    #[test]
    fn test_once_renders_first_occurrence_only() {
        let engine = engine(&[
            ("p.tpl", "@include('w')@include('w')"),
            ("w.tpl", "@once('lib')L@endonce-"),
        ]);
        assert_eq!(engine.render_file("p.tpl", json!({})).unwrap(), "L--");
    }
}

mod filesystem {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_render_from_disk_with_layout_and_include() {
        let dir = TempDir::new().unwrap();
        write(&dir, "layout.tpl", "<html>@yield('body')</html>");
        write(
            &dir,
            "pages/home.tpl",
            "@extends('layout')@section('body')Hi @include('partials/name')@endsection",
        );
        write(&dir, "partials/name.tpl", "{{ name }}");
        let engine = Engine::new(FileSystemResolver::new(dir.path()));
        let out = engine
            .render_file("pages/home", json!({"name": "Ada"}))
            .unwrap();
        assert_eq!(out, "<html>Hi Ada</html>");
    }

    #[test]
    fn test_traversal_from_template_is_rejected() {
        let parent = TempDir::new().unwrap();
        fs::create_dir_all(parent.path().join("views")).unwrap();
        fs::create_dir_all(parent.path().join("views-secret")).unwrap();
        fs::write(parent.path().join("views-secret/key.tpl"), "KEY").unwrap();
        fs::write(
            parent.path().join("views/page.tpl"),
            "@include('../views-secret/key')",
        )
        .unwrap();
        let engine = Engine::new(FileSystemResolver::new(parent.path().join("views")));
        let out = engine.render_file("page", json!({})).unwrap();
        assert!(!out.contains("KEY"));
        assert!(out.contains("data-template-error=\"path-rejected\""));
    }
}
