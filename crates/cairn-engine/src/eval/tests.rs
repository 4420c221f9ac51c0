#![allow(clippy::expect_used, clippy::panic)]

use std::path::Path;
use std::sync::Arc;

use cairn_domain::{ResourceKey, Value};
use cairn_lang::parse;
use indexmap::IndexMap;

use super::Evaluator;
use super::directives::merge_values;
use crate::error::EvalError;
use crate::providers::TypeRegistry;
use crate::root::RootScope;

fn evaluate(source: &str) -> Result<RootScope, EvalError> {
    let file = parse(source, Path::new("main.cairn")).expect("source parses");
    let mut root = RootScope::new(Arc::new(TypeRegistry::builtin()));
    Evaluator::new(&mut root).evaluate(std::slice::from_ref(&file))?;
    Ok(root)
}

fn key(raw: &str) -> ResourceKey {
    ResourceKey::parse(raw).expect("valid key")
}

fn text(root: &RootScope, raw: &str, field: &str) -> Option<String> {
    root.resource(&key(raw))
        .and_then(|resource| resource.field(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[test]
fn statements_resolve_regardless_of_order() {
    let root = evaluate(
        "local::file b\n  path: '/tmp/b'\n  content: $(local::file a | content)\nend\n\
         local::file a\n  path: '/tmp/a'\n  content: $(greeting)\nend\n\
         greeting: 'hello'\n",
    )
    .expect("evaluates");

    assert_eq!(text(&root, "local::file b", "content").as_deref(), Some("hello"));
    let b = root.resource(&key("local::file b")).expect("b exists");
    assert!(b.depends_on().contains(&key("local::file a")));
    assert!(b.configured().contains("content"));
}

#[test]
fn every_statement_order_converges_to_the_same_scope() {
    let statements = [
        "local::file b\n  path: '/tmp/b'\n  content: $(local::file a | content)\nend\n",
        "local::file a\n  path: '/tmp/a'\n  content: $(greeting)\nend\n",
        "greeting: 'hello'\n",
    ];
    let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    for order in orders {
        let source: String = order.iter().map(|&index| statements[index]).collect();
        let root = evaluate(&source).unwrap_or_else(|error| panic!("{order:?}: {error}"));

        assert_eq!(root.resource_count(), 2, "{order:?}");
        for name in ["a", "b"] {
            let raw = format!("local::file {name}");
            assert_eq!(text(&root, &raw, "content").as_deref(), Some("hello"), "{order:?}");
            assert_eq!(
                text(&root, &raw, "path"),
                Some(format!("/tmp/{name}")),
                "{order:?}"
            );
        }
        let b = root.resource(&key("local::file b")).expect("b exists");
        assert!(b.depends_on().contains(&key("local::file a")), "{order:?}");
        let bindings = root
            .file(Path::new("main.cairn"))
            .expect("file scope")
            .bindings();
        assert_eq!(bindings.len(), 1, "{order:?}");
        assert_eq!(
            bindings.get("greeting"),
            Some(&Value::String("hello".into())),
            "{order:?}"
        );
    }
}

#[test]
fn for_loop_pads_the_last_chunk_and_keeps_variables_local() {
    let root = evaluate(
        "@for name, size in ['a', 1, 'b']\n\
         \x20 local::file $(name)\n    path: \"/tmp/$(name)\"\n    content: \"$(size)\"\n  end\n\
         @end\n",
    )
    .expect("evaluates");

    assert_eq!(root.resource_count(), 2);
    assert_eq!(text(&root, "local::file a", "content").as_deref(), Some("1"));
    assert_eq!(text(&root, "local::file b", "content").as_deref(), Some(""));
    let bindings = root
        .file(Path::new("main.cairn"))
        .expect("file scope")
        .bindings();
    assert!(!bindings.contains_key("name"));
    assert!(!bindings.contains_key("size"));
}

#[test]
fn for_loop_over_a_map_binds_keys_and_values() {
    let root = evaluate(
        "@for name, body in {first: 'one', second: 'two'}\n\
         \x20 local::file $(name)\n    path: \"/tmp/$(name)\"\n    content: $(body)\n  end\n\
         @end\n",
    )
    .expect("evaluates");

    assert_eq!(text(&root, "local::file first", "content").as_deref(), Some("one"));
    assert_eq!(text(&root, "local::file second", "content").as_deref(), Some("two"));
}

#[test]
fn for_loop_rejects_scalars() {
    let error = evaluate("@for item in 'text'\n@end\n").expect_err("strings do not iterate");
    assert!(matches!(error, EvalError::NotIterable { found: "string", .. }));
}

#[test]
fn if_runs_the_first_matching_branch() {
    let root = evaluate(
        "env: 'stage'\n\
         local::file sized\n  path: '/tmp/sized'\n\
         \x20 @if $(env) == 'prod'\n    content: 'three'\n\
         \x20 @else if $(env) == 'stage'\n    content: 'two'\n\
         \x20 @else\n    content: 'one'\n  @end\nend\n",
    )
    .expect("evaluates");

    assert_eq!(text(&root, "local::file sized", "content").as_deref(), Some("two"));
}

#[test]
fn if_falls_back_to_else_when_no_guard_holds() {
    let root = evaluate(
        "local::file sized\n  path: '/tmp/sized'\n\
         \x20 @if false\n    content: 'three'\n\
         \x20 @else if false\n    content: 'two'\n\
         \x20 @else\n    content: 'one'\n  @end\nend\n",
    )
    .expect("evaluates");

    assert_eq!(text(&root, "local::file sized", "content").as_deref(), Some("one"));
}

#[test]
fn extends_merges_without_overriding_explicit_fields() {
    let root = evaluate(
        "defaults: {mode: '644', content: 'base'}\n\
         local::file config\n  path: '/tmp/config'\n  content: 'override'\n\
         \x20 @extends: $(defaults) -exclude ['mode']\nend\n",
    )
    .expect("evaluates");

    let config = root.resource(&key("local::file config")).expect("config exists");
    assert_eq!(config.field("content"), Some(&Value::String("override".into())));
    assert!(config.field("mode").is_none());
}

#[test]
fn extends_a_resource_copies_configured_fields_and_depends_on_it() {
    let root = evaluate(
        "local::file base\n  path: '/tmp/base'\n  content: 'shared'\n  mode: '600'\nend\n\
         local::file derived\n  path: '/tmp/derived'\n  @extends: $(local::file base)\nend\n",
    )
    .expect("evaluates");

    let derived = root.resource(&key("local::file derived")).expect("derived exists");
    assert_eq!(text(&root, "local::file derived", "path").as_deref(), Some("/tmp/derived"));
    assert_eq!(text(&root, "local::file derived", "mode").as_deref(), Some("600"));
    assert!(derived.depends_on().contains(&key("local::file base")));
}

#[test]
fn merge_concatenates_lists_and_recurses_into_maps() {
    let existing = Value::Map(IndexMap::from([
        ("tags".to_string(), Value::List(vec![Value::String("a".into())])),
        ("name".to_string(), Value::String("kept".into())),
        ("empty".to_string(), Value::Null),
    ]));
    let incoming = Value::Map(IndexMap::from([
        ("tags".to_string(), Value::List(vec![Value::String("b".into())])),
        ("name".to_string(), Value::String("ignored".into())),
        ("empty".to_string(), Value::Number(1.0)),
    ]));

    let Value::Map(merged) = merge_values(existing, incoming) else {
        panic!("expected a map");
    };
    assert_eq!(
        merged["tags"],
        Value::List(vec![Value::String("a".into()), Value::String("b".into())])
    );
    assert_eq!(merged["name"], Value::String("kept".into()));
    assert_eq!(merged["empty"], Value::Number(1.0));
}

const SITE: &str = "@virtual 'web::site'\n  @param: domain\n\
    \x20 local::file index\n    path: \"/srv/$(domain)/index.html\"\n    content: 'hi'\n  end\n\
    @end\n";

#[test]
fn virtual_instances_prefix_the_resources_they_produce() {
    let root = evaluate(&format!("{SITE}web::site blog\n  domain: 'blog.example'\nend\n"))
        .expect("evaluates");

    assert_eq!(root.resource_count(), 1);
    assert_eq!(
        text(&root, "local::file blog/index", "path").as_deref(),
        Some("/srv/blog.example/index.html")
    );
}

#[test]
fn virtual_instances_require_every_parameter() {
    let error = evaluate(&format!("{SITE}web::site blog\nend\n")).expect_err("domain is missing");
    assert!(matches!(
        error,
        EvalError::MissingParameter { ref parameter, .. } if parameter == "domain"
    ));

    let error = evaluate(&format!(
        "{SITE}web::site blog\n  domain: 'a'\n  color: 'red'\nend\n"
    ))
    .expect_err("color is not a parameter");
    assert!(matches!(error, EvalError::UnknownParameter { .. }));
}

#[test]
fn mutual_references_report_every_statement_and_the_cycle() {
    let error = evaluate(
        "local::file a\n  path: '/tmp/a'\n  content: $(local::file b | content)\nend\n\
         local::file b\n  path: '/tmp/b'\n  content: $(local::file a | content)\nend\n",
    )
    .expect_err("cycle cannot resolve");

    let EvalError::Unresolvable { statements, cycles } = &error else {
        panic!("expected unresolvable, got {error:?}");
    };
    assert_eq!(statements.len(), 2);
    assert_eq!(cycles, &vec![vec![key("local::file a"), key("local::file b")]]);
    assert!(
        error
            .to_string()
            .contains("dependency cycle: local::file a -> local::file b -> local::file a")
    );
}

#[test]
fn undefined_variables_are_reported_with_their_location() {
    let error = evaluate("name: $(missing)\n").expect_err("variable is undefined");
    let message = error.to_string();
    assert!(message.contains("main.cairn:1"));
    assert!(message.contains("variable `missing` is not defined"));
}

#[test]
fn output_fields_cannot_be_configured() {
    let error = evaluate("local::file a\n  path: '/tmp/a'\n  content: ''\n  sha256: 'x'\nend\n")
        .expect_err("sha256 is computed");
    assert!(matches!(error, EvalError::OutputField { ref field, .. } if field == "sha256"));
}

#[test]
fn required_fields_must_be_set() {
    let error = evaluate("local::file a\n  path: '/tmp/a'\nend\n").expect_err("content missing");
    assert!(matches!(error, EvalError::MissingField { ref field, .. } if field == "content"));
}

#[test]
fn unknown_fields_and_types_are_rejected() {
    let error = evaluate("local::file a\n  path: '/tmp/a'\n  content: ''\n  owner: 'me'\nend\n")
        .expect_err("owner is not a field");
    assert!(matches!(error, EvalError::UnknownField { .. }));

    let error = evaluate("aws::bucket logs\nend\n").expect_err("aws is not registered");
    assert!(matches!(error, EvalError::UnknownType { .. }));
}

#[test]
fn duplicate_declarations_are_rejected() {
    let error = evaluate(
        "local::file a\n  path: '/tmp/a'\n  content: ''\nend\n\
         local::file a\n  path: '/tmp/b'\n  content: ''\nend\n",
    )
    .expect_err("a is declared twice");
    assert!(matches!(error, EvalError::DuplicateResource { .. }));
}

#[test]
fn loops_yielding_the_same_name_twice_are_rejected() {
    let error = evaluate(
        "@for name in ['a', 'a']\n\
         \x20 local::file $(name)\n    path: \"/tmp/$(name)\"\n    content: ''\n  end\n\
         @end\n",
    )
    .expect_err("a is produced twice");
    assert!(matches!(
        error,
        EvalError::DuplicateResource { key: ref duplicate, .. } if *duplicate == key("local::file a")
    ));
}

#[test]
fn repeated_virtual_instances_are_rejected() {
    let error = evaluate(&format!(
        "{SITE}web::site blog\n  domain: 'one'\nend\nweb::site blog\n  domain: 'two'\nend\n"
    ))
    .expect_err("blog is instantiated twice");
    assert!(matches!(error, EvalError::DuplicateResource { .. }));
}

#[test]
fn retried_loops_replace_their_own_earlier_iterations() {
    let root = evaluate(
        "@for n in ['a', 'b']\n\
         \x20 local::file $(n)\n    path: \"/tmp/$(n)\"\n\
         \x20   @if $(n) == 'a'\n      content: 'first'\n\
         \x20   @else\n      content: $(local::file z | path)\n    @end\n  end\n\
         @end\n\
         local::file z\n  path: '/tmp/z'\n  content: ''\nend\n",
    )
    .expect("evaluates");

    assert_eq!(root.resource_count(), 3);
    assert_eq!(text(&root, "local::file a", "content").as_deref(), Some("first"));
    assert_eq!(text(&root, "local::file b", "content").as_deref(), Some("/tmp/z"));
}

#[test]
fn type_queries_wait_for_every_declaration() {
    let root = evaluate(
        "paths: $(local::file | path)\n\
         local::file a\n  path: '/tmp/a'\n  content: ''\nend\n\
         local::file b\n  path: '/tmp/b'\n  content: ''\nend\n",
    )
    .expect("evaluates");

    let bindings = root
        .file(Path::new("main.cairn"))
        .expect("file scope")
        .bindings();
    assert_eq!(
        bindings.get("paths"),
        Some(&Value::List(vec![
            Value::String("/tmp/a".into()),
            Value::String("/tmp/b".into()),
        ]))
    );
}

#[test]
fn resources_querying_their_own_type_settle_on_what_is_registered() {
    let root = evaluate(
        "local::file a\n  path: '/tmp/a'\n  content: \"$(local::file | path)\"\nend\n\
         local::file b\n  path: '/tmp/b'\n  content: \"$(local::file | path)\"\nend\n",
    )
    .expect("type queries settle");

    assert_eq!(root.resource_count(), 2);
    let content = text(&root, "local::file b", "content").expect("b content");
    assert!(content.contains("/tmp/a"), "{content}");
}

#[test]
fn overflowing_arithmetic_is_rejected() {
    let huge = format!("1{}", "0".repeat(308));
    let error = evaluate(&format!("big: {huge} * 10\n")).expect_err("result is infinite");
    assert!(matches!(error, EvalError::InvalidOperands { op: "*", .. }));

    let root = evaluate(&format!("big: {huge} * 1\n")).expect("finite product");
    let bindings = root
        .file(Path::new("main.cairn"))
        .expect("file scope")
        .bindings();
    assert!(matches!(bindings.get("big"), Some(Value::Number(value)) if value.is_finite()));
}

#[test]
fn misplaced_and_unknown_directives_fail() {
    let error = evaluate("@uses-credentials: 'ops'\n").expect_err("needs a resource");
    assert!(matches!(error, EvalError::MisplacedDirective { .. }));

    let error = evaluate("@frobnicate: 1\n").expect_err("unknown directive");
    assert!(matches!(error, EvalError::UnknownDirective { .. }));
}

#[test]
fn credentials_apply_to_the_enclosing_resource() {
    let root = evaluate(
        "local::file a\n  path: '/tmp/a'\n  content: ''\n  @uses-credentials: 'ops'\nend\n",
    )
    .expect("evaluates");
    let resource = root.resource(&key("local::file a")).expect("a exists");
    assert_eq!(resource.credentials(), "ops");
}
