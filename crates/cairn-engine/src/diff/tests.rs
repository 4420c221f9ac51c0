#![allow(clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;

use cairn_domain::{ChangeKind, FieldChange, PlanReport, ResourceKey, Value};
use cairn_lang::parse;

use super::{RefreshFailures, classify, diff, refresh};
use crate::eval::Evaluator;
use crate::providers::TypeRegistry;
use crate::root::RootScope;

fn evaluate(source: &str) -> RootScope {
    let file = parse(source, Path::new("/work/main.cairn")).expect("source parses");
    let mut root = RootScope::new(Arc::new(TypeRegistry::builtin()));
    Evaluator::new(&mut root)
        .evaluate(std::slice::from_ref(&file))
        .expect("source evaluates");
    root
}

fn key(raw: &str) -> ResourceKey {
    ResourceKey::parse(raw).expect("valid key")
}

fn file(name: &str, path: &str, content: &str) -> String {
    format!("local::file {name}\n  path: '{path}'\n  content: '{content}'\nend\n")
}

fn kinds(plan: &PlanReport) -> Vec<(ChangeKind, String)> {
    plan.changes
        .iter()
        .map(|change| (change.kind, change.key.to_string()))
        .collect()
}

#[test]
fn identical_graphs_need_no_changes() {
    let source = file("a", "/srv/a", "hello");
    let plan = diff(&evaluate(&source), &evaluate(&source), &RefreshFailures::new())
        .expect("plan builds");
    assert!(!plan.has_changes());
    assert_eq!(plan.unchanged, 1);
}

#[test]
fn new_resource_is_created_with_its_configured_fields() {
    let plan = diff(
        &evaluate(&file("a", "/srv/a", "hello")),
        &evaluate(""),
        &RefreshFailures::new(),
    )
    .expect("plan builds");

    assert_eq!(kinds(&plan), vec![(ChangeKind::Create, "local::file a".to_string())]);
    let fields = plan.changes[0].changed_field_names();
    assert_eq!(fields, vec!["path", "content"]);
    assert_eq!(plan.changes[0].file, Path::new("/work/main.cairn"));
}

#[test]
fn removed_resource_is_deleted() {
    let plan = diff(
        &evaluate(""),
        &evaluate(&file("a", "/srv/a", "hello")),
        &RefreshFailures::new(),
    )
    .expect("plan builds");
    assert_eq!(kinds(&plan), vec![(ChangeKind::Delete, "local::file a".to_string())]);
}

#[test]
fn updatable_field_change_is_an_update() {
    let plan = diff(
        &evaluate(&file("a", "/srv/a", "new")),
        &evaluate(&file("a", "/srv/a", "old")),
        &RefreshFailures::new(),
    )
    .expect("plan builds");

    assert_eq!(kinds(&plan), vec![(ChangeKind::Update, "local::file a".to_string())]);
    let change = &plan.changes[0].fields[0];
    assert_eq!(change.field, "content");
    assert_eq!(change.current, Value::String("old".into()));
    assert_eq!(change.pending, Value::String("new".into()));
}

#[test]
fn identity_field_change_is_a_replace() {
    let plan = diff(
        &evaluate(&file("a", "/srv/moved", "same")),
        &evaluate(&file("a", "/srv/a", "same")),
        &RefreshFailures::new(),
    )
    .expect("plan builds");

    assert_eq!(kinds(&plan), vec![(ChangeKind::Replace, "local::file a".to_string())]);
    assert!(plan.changes[0].workflow.is_none());
    assert!(
        plan.changes[0]
            .hint
            .as_deref()
            .is_some_and(|hint| hint.contains("no workflow"))
    );
}

#[test]
fn symlink_replacement_uses_the_provider_workflow() {
    let link = |target: &str| {
        format!("local::symlink current\n  path: '/srv/current'\n  target: '{target}'\nend\n")
    };
    let plan = diff(
        &evaluate(&link("/srv/v2")),
        &evaluate(&link("/srv/v1")),
        &RefreshFailures::new(),
    )
    .expect("plan builds");

    assert_eq!(plan.changes[0].kind, ChangeKind::Replace);
    assert_eq!(plan.changes[0].workflow.as_deref(), Some("relink"));
}

#[test]
fn failed_refresh_forces_a_replace_with_the_diagnostic() {
    let source = file("a", "/srv/a", "same");
    let mut unknown = RefreshFailures::new();
    unknown.insert(key("local::file a"), "permission denied".to_string());

    let plan = diff(&evaluate(&source), &evaluate(&source), &unknown).expect("plan builds");

    assert_eq!(plan.changes[0].kind, ChangeKind::Replace);
    assert!(
        plan.changes[0]
            .hint
            .as_deref()
            .is_some_and(|hint| hint.contains("permission denied"))
    );
    assert_eq!(plan.warnings.len(), 1);
}

#[test]
fn creates_follow_dependencies_and_deletes_run_in_reverse() {
    let chained = "local::file app\n  path: '/srv/app'\n  content: $(local::file base | path)\nend\n\
                   local::file base\n  path: '/srv/base'\n  content: 'x'\nend\n";

    let plan = diff(&evaluate(chained), &evaluate(""), &RefreshFailures::new())
        .expect("plan builds");
    assert_eq!(
        kinds(&plan),
        vec![
            (ChangeKind::Create, "local::file base".to_string()),
            (ChangeKind::Create, "local::file app".to_string()),
        ]
    );
    assert_eq!(
        plan.changes.iter().map(|change| change.id).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let plan = diff(&evaluate(""), &evaluate(chained), &RefreshFailures::new())
        .expect("plan builds");
    assert_eq!(
        kinds(&plan),
        vec![
            (ChangeKind::Delete, "local::file app".to_string()),
            (ChangeKind::Delete, "local::file base".to_string()),
        ]
    );
}

#[test]
fn one_fixed_field_turns_an_update_into_a_replace() {
    let change = |updatable| FieldChange {
        field: "content".to_string(),
        current: Value::Null,
        pending: Value::Bool(true),
        updatable,
    };
    assert_eq!(classify(&[]), None);
    assert_eq!(
        classify(&[change(true), change(true)]),
        Some(ChangeKind::Update)
    );
    assert_eq!(
        classify(&[change(true), change(false)]),
        Some(ChangeKind::Replace)
    );
}

#[test]
fn refresh_drops_resources_that_no_longer_exist() {
    let temp = tempfile::tempdir().expect("tempdir");
    let present = temp.path().join("present.txt");
    std::fs::write(&present, "on disk").expect("write fixture");
    let missing = temp.path().join("missing.txt");

    let mut current = evaluate(&format!(
        "{}{}",
        file("present", &present.display().to_string(), "recorded"),
        file("missing", &missing.display().to_string(), "recorded"),
    ));
    let failures = refresh(&mut current);

    assert!(failures.is_empty());
    assert!(current.resource(&key("local::file missing")).is_none());
    let present = current.resource(&key("local::file present")).expect("still present");
    assert_eq!(present.field("content"), Some(&Value::String("on disk".into())));
    assert!(present.field("sha256").is_some());
}
