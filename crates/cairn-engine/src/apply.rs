use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_domain::{
    ApplyChangeResult, ApplyReport, ApplyStatus, ChangeGroup, ChangeKind, PlanReport,
    PlannedChange, ResourceKey,
};
use log::{debug, info, warn};

use crate::diff::changed_fields;
use crate::error::{ApplyError, StateError};
use crate::eval::reevaluate_resource;
use crate::root::RootScope;
use crate::state::StateBackend;
use crate::workflow::StageAction;

type ApplyResult<T> = std::result::Result<T, ApplyError>;

/// Decides whether a group of changes may run.
pub trait Approver {
    fn approve(&self, group: ChangeGroup, changes: &[&PlannedChange]) -> bool;
}

/// Approves every group without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

impl Approver for ApproveAll {
    fn approve(&self, _group: ChangeGroup, _changes: &[&PlannedChange]) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Stop the rest of a group after its first failing change.
    pub fail_fast: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { fail_fast: true }
    }
}

/// The graphs a run converges: `pending` is the evaluated configuration,
/// `state` the refreshed current graph that is persisted after every change.
pub struct ApplyContext<'a> {
    pub pending: &'a mut RootScope,
    pub state: &'a mut RootScope,
    pub backend: &'a dyn StateBackend,
}

enum Outcome {
    Applied,
    Skipped,
}

/// Execute `plan` one confirmed group at a time.
///
/// Applied changes are never rolled back. A failure ends its group (with
/// `fail_fast`); later groups still run.
#[must_use]
pub fn apply_plan(
    plan: &PlanReport,
    context: &mut ApplyContext<'_>,
    approver: &dyn Approver,
    options: ApplyOptions,
) -> ApplyReport {
    let mut results = Vec::with_capacity(plan.changes.len());
    let mut errors = Vec::new();

    for group in ChangeGroup::ALL {
        let changes: Vec<&PlannedChange> = plan.changes_in(group).collect();
        if changes.is_empty() {
            continue;
        }
        if !approver.approve(group, &changes) {
            info!("{} changes declined", group.describe());
            results.extend(
                changes
                    .iter()
                    .map(|change| result_for(change, ApplyStatus::Declined, Vec::new(), None)),
            );
            continue;
        }

        for (index, change) in changes.iter().enumerate() {
            let mut stages = Vec::new();
            match execute_change(change, context, &mut stages) {
                Ok(Outcome::Applied) => {
                    info!("{} {}", change.kind, change.key);
                    results.push(result_for(change, ApplyStatus::Applied, stages, None));
                }
                Ok(Outcome::Skipped) => {
                    warn!("skipped {} {}: no workflow", change.kind, change.key);
                    results.push(result_for(
                        change,
                        ApplyStatus::Skipped,
                        stages,
                        change.hint.clone(),
                    ));
                }
                Err(error) => {
                    let message = error.to_string();
                    errors.push(format!("change {} failed: {message}", change.id));
                    results.push(result_for(change, ApplyStatus::Failed, stages, Some(message)));
                    if options.fail_fast {
                        let rest = &changes[index + 1..];
                        push_fail_fast_abort_message(&mut errors, group, rest.len());
                        results.extend(rest.iter().map(|change| {
                            result_for(change, ApplyStatus::Skipped, Vec::new(), None)
                        }));
                        break;
                    }
                }
            }
        }
    }

    ApplyReport {
        plan: plan.clone(),
        results,
        errors,
    }
}

fn push_fail_fast_abort_message(errors: &mut Vec<String>, group: ChangeGroup, remaining: usize) {
    errors.push(format!(
        "{} changes aborted after first failure due to fail-fast ({remaining} change(s) not attempted)",
        group.describe()
    ));
}

fn result_for(
    change: &PlannedChange,
    status: ApplyStatus,
    stages: Vec<String>,
    error: Option<String>,
) -> ApplyChangeResult {
    ApplyChangeResult {
        change_id: change.id,
        kind: change.kind,
        key: change.key.clone(),
        status,
        stages,
        error,
    }
}

fn execute_change(
    change: &PlannedChange,
    context: &mut ApplyContext<'_>,
    stages: &mut Vec<String>,
) -> ApplyResult<Outcome> {
    let key = &change.key;
    match change.kind {
        ChangeKind::Create => {
            reevaluate_resource(context.pending, context.state, key)?;
            create(context, key)?;
        }
        ChangeKind::Update => {
            reevaluate_resource(context.pending, context.state, key)?;
            update(context, key)?;
        }
        ChangeKind::Delete => delete(context.state, key)?,
        ChangeKind::Replace => {
            let Some(workflow) = context.pending.workflow_for(&key.type_name).cloned() else {
                return Ok(Outcome::Skipped);
            };
            reevaluate_resource(context.pending, context.state, key)?;
            for stage in &workflow.stages {
                debug!("{key}: workflow `{}` stage `{}`", workflow.name, stage.name);
                let executed = match stage.action {
                    StageAction::Delete => delete(context.state, key),
                    StageAction::Create => create(context, key),
                }
                .and_then(|()| persist(context).map_err(ApplyError::from));
                if let Err(source) = executed {
                    return Err(ApplyError::Stage {
                        workflow: workflow.name.clone(),
                        stage: stage.name.clone(),
                        source: Box::new(source),
                    });
                }
                stages.push(stage.name.clone());
            }
            return Ok(Outcome::Applied);
        }
    }
    persist(context)?;
    Ok(Outcome::Applied)
}

fn file_of(scope: &RootScope, key: &ResourceKey, side: &'static str) -> ApplyResult<PathBuf> {
    scope
        .file_of(key)
        .map(Path::to_path_buf)
        .ok_or_else(|| ApplyError::MissingResource {
            key: key.clone(),
            side,
        })
}

fn create(context: &mut ApplyContext<'_>, key: &ResourceKey) -> ApplyResult<()> {
    let file = file_of(context.pending, key, "pending")?;
    let Some(resource) = context.pending.resource(key) else {
        return Err(ApplyError::MissingResource {
            key: key.clone(),
            side: "pending",
        });
    };
    let kind = Arc::clone(resource.kind());
    let creatable = kind.creatable().ok_or_else(|| ApplyError::Unsupported {
        key: key.clone(),
        action: "create",
    })?;

    let mut fields = resource.fields().clone();
    creatable
        .create(&mut fields, &resource.context())
        .map_err(|source| ApplyError::Provider {
            action: "create",
            key: key.clone(),
            source,
        })?;

    let mut created = resource.clone();
    *created.fields_mut() = fields;
    context.pending.insert_resource(&file, created.clone());
    context.state.insert_resource(&file, created);
    Ok(())
}

fn update(context: &mut ApplyContext<'_>, key: &ResourceKey) -> ApplyResult<()> {
    let file = file_of(context.pending, key, "pending")?;
    let (Some(resource), Some(existing)) =
        (context.pending.resource(key), context.state.resource(key))
    else {
        return Err(ApplyError::MissingResource {
            key: key.clone(),
            side: "current",
        });
    };
    let kind = Arc::clone(resource.kind());
    let updatable = kind.updatable().ok_or_else(|| ApplyError::Unsupported {
        key: key.clone(),
        action: "update",
    })?;

    let changes = changed_fields(resource, existing);
    let changed: Vec<&str> = changes.iter().map(|change| change.field.as_str()).collect();
    let mut fields = resource.fields().clone();
    updatable
        .update(existing.fields(), &mut fields, &changed, &resource.context())
        .map_err(|source| ApplyError::Provider {
            action: "update",
            key: key.clone(),
            source,
        })?;

    let mut updated = resource.clone();
    *updated.fields_mut() = fields;
    context.pending.insert_resource(&file, updated.clone());
    context.state.insert_resource(&file, updated);
    Ok(())
}

fn delete(state: &mut RootScope, key: &ResourceKey) -> ApplyResult<()> {
    let Some(resource) = state.resource(key) else {
        debug!("{key} is already gone");
        return Ok(());
    };
    let kind = Arc::clone(resource.kind());
    let deletable = kind.deletable().ok_or_else(|| ApplyError::Unsupported {
        key: key.clone(),
        action: "delete",
    })?;
    deletable
        .delete(resource.fields(), &resource.context())
        .map_err(|source| ApplyError::Provider {
            action: "delete",
            key: key.clone(),
            source,
        })?;
    state.remove_resource(key);
    Ok(())
}

/// Carry the file-level declarations of the configuration over to the state
/// and write it. Imports of files that still hold resources are kept so
/// their state stays reachable.
fn persist(context: &mut ApplyContext<'_>) -> std::result::Result<(), StateError> {
    let mut paths: Vec<PathBuf> = context
        .state
        .files()
        .map(|file| file.path().to_path_buf())
        .collect();
    for file in context.pending.files() {
        if !paths.iter().any(|path| path == file.path()) {
            paths.push(file.path().to_path_buf());
        }
    }

    for path in paths {
        let declared = context.pending.file(&path);
        let recorded = context.state.file(&path);
        let mut imports: Vec<PathBuf> = declared
            .map(|file| file.imports().to_vec())
            .unwrap_or_default();
        for import in recorded.map(|file| file.imports()).unwrap_or_default() {
            let populated = context
                .state
                .file(import)
                .is_some_and(|file| !file.is_empty());
            if populated && !imports.contains(import) {
                imports.push(import.clone());
            }
        }
        let plugins = declared
            .or(recorded)
            .map(|file| file.plugins().to_vec())
            .unwrap_or_default();
        context.state.file_mut(&path).set_declarations(imports, plugins);
    }

    context.backend.save(context.state)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use cairn_domain::{ApplyStatus, ChangeGroup, ChangeKind, PlannedChange, ResourceKey, Value};
    use cairn_lang::parse;

    use super::{ApplyContext, ApplyOptions, ApproveAll, Approver, apply_plan};
    use crate::diff::{RefreshFailures, diff};
    use crate::eval::Evaluator;
    use crate::providers::TypeRegistry;
    use crate::root::RootScope;
    use crate::state::{LocalStateBackend, StateBackend};

    struct DeclineDeletes;

    impl Approver for DeclineDeletes {
        fn approve(&self, group: ChangeGroup, _changes: &[&PlannedChange]) -> bool {
            group != ChangeGroup::Delete
        }
    }

    fn key(raw: &str) -> ResourceKey {
        ResourceKey::parse(raw).expect("valid key")
    }

    fn evaluate_pending(config: &Path, source: &str, state: &RootScope) -> RootScope {
        let file = parse(source, config).expect("config parses");
        let mut root = RootScope::new(Arc::new(TypeRegistry::builtin()));
        Evaluator::new(&mut root)
            .with_current(state)
            .evaluate(std::slice::from_ref(&file))
            .expect("config evaluates");
        root
    }

    fn load(config: &Path) -> RootScope {
        LocalStateBackend
            .load(&[config.to_path_buf()], Arc::new(TypeRegistry::builtin()))
            .expect("state loads")
    }

    #[test]
    fn creates_files_and_records_outputs_in_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = temp.path().join("main.cairn");
        let target = temp.path().join("out.txt");
        let source = format!(
            "local::file out\n  path: '{}'\n  content: 'hello'\nend\n\
             local::file copy\n  path: '{}.sum'\n  content: $(local::file out | sha256)\nend\n",
            target.display(),
            target.display()
        );

        let mut state = load(&config);
        let mut pending = evaluate_pending(&config, &source, &state);
        let plan = diff(&pending, &state, &RefreshFailures::new()).expect("plan builds");
        let report = apply_plan(
            &plan,
            &mut ApplyContext {
                pending: &mut pending,
                state: &mut state,
                backend: &LocalStateBackend,
            },
            &ApproveAll,
            ApplyOptions::default(),
        );

        assert!(!report.has_failures(), "{:?}", report.errors);
        assert_eq!(fs::read_to_string(&target).expect("out written"), "hello");
        let digest = state
            .resource(&key("local::file out"))
            .and_then(|resource| resource.field("sha256"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .expect("sha256 recorded");
        let copy = fs::read_to_string(format!("{}.sum", target.display())).expect("copy written");
        assert_eq!(copy, digest);

        let reloaded = load(&config);
        assert_eq!(reloaded.resource_count(), 2);
    }

    #[test]
    fn declined_groups_leave_state_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = temp.path().join("main.cairn");
        let target = temp.path().join("gone.txt");
        let declared = format!(
            "local::file gone\n  path: '{}'\n  content: 'x'\nend\n",
            target.display()
        );

        let mut state = load(&config);
        let mut first = evaluate_pending(&config, &declared, &state);
        let plan = diff(&first, &state, &RefreshFailures::new()).expect("plan builds");
        let _ = apply_plan(
            &plan,
            &mut ApplyContext {
                pending: &mut first,
                state: &mut state,
                backend: &LocalStateBackend,
            },
            &ApproveAll,
            ApplyOptions::default(),
        );

        let mut state = load(&config);
        let mut second = evaluate_pending(&config, "", &state);
        let plan = diff(&second, &state, &RefreshFailures::new()).expect("plan builds");
        let report = apply_plan(
            &plan,
            &mut ApplyContext {
                pending: &mut second,
                state: &mut state,
                backend: &LocalStateBackend,
            },
            &DeclineDeletes,
            ApplyOptions::default(),
        );

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, ApplyStatus::Declined);
        assert!(target.exists());
        assert_eq!(load(&config).resource_count(), 1);
    }

    #[test]
    fn replace_without_a_workflow_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = temp.path().join("main.cairn");
        let old_path = temp.path().join("old.txt");
        let new_path = temp.path().join("new.txt");
        let note = |path: &Path| {
            format!(
                "local::file note\n  path: '{}'\n  content: 'x'\nend\n",
                path.display()
            )
        };

        let mut state = load(&config);
        let mut first = evaluate_pending(&config, &note(&old_path), &state);
        let plan = diff(&first, &state, &RefreshFailures::new()).expect("plan builds");
        let _ = apply_plan(
            &plan,
            &mut ApplyContext {
                pending: &mut first,
                state: &mut state,
                backend: &LocalStateBackend,
            },
            &ApproveAll,
            ApplyOptions::default(),
        );
        assert!(old_path.exists());

        let mut state = load(&config);
        let mut second = evaluate_pending(&config, &note(&new_path), &state);
        let plan = diff(&second, &state, &RefreshFailures::new()).expect("plan builds");
        let report = apply_plan(
            &plan,
            &mut ApplyContext {
                pending: &mut second,
                state: &mut state,
                backend: &LocalStateBackend,
            },
            &ApproveAll,
            ApplyOptions::default(),
        );

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].kind, ChangeKind::Replace);
        assert_eq!(report.results[0].status, ApplyStatus::Skipped);
        assert!(!report.has_failures(), "{:?}", report.errors);
        assert!(old_path.exists());
        assert!(!new_path.exists());
        let recorded = load(&config)
            .resource(&key("local::file note"))
            .and_then(|resource| resource.field("path"))
            .and_then(Value::as_str)
            .map(str::to_string);
        assert_eq!(recorded, Some(old_path.display().to_string()));
    }

    #[test]
    fn failure_skips_the_rest_of_its_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = temp.path().join("main.cairn");
        let taken = temp.path().join("taken.txt");
        fs::write(&taken, "already here").expect("fixture");
        let source = format!(
            "local::file first\n  path: '{}'\n  content: 'x'\nend\n\
             local::file second\n  path: '{}'\n  content: 'y'\nend\n",
            taken.display(),
            temp.path().join("second.txt").display()
        );

        let mut state = load(&config);
        let mut pending = evaluate_pending(&config, &source, &state);
        let plan = diff(&pending, &state, &RefreshFailures::new()).expect("plan builds");
        let report = apply_plan(
            &plan,
            &mut ApplyContext {
                pending: &mut pending,
                state: &mut state,
                backend: &LocalStateBackend,
            },
            &ApproveAll,
            ApplyOptions::default(),
        );

        let statuses: Vec<_> = report.results.iter().map(|result| result.status).collect();
        assert_eq!(statuses, vec![ApplyStatus::Failed, ApplyStatus::Skipped]);
        assert!(report.errors.iter().any(|error| error.contains("fail-fast")));
        assert!(!temp.path().join("second.txt").exists());
    }
}
