use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use cairn_domain::{ChangeKind, FieldChange, PlanReport, PlannedChange, ResourceKey, Value};
use log::{debug, warn};

use crate::error::GraphError;
use crate::graph::build_execution_order;
use crate::resource::Diffable;
use crate::root::RootScope;

#[cfg(test)]
mod tests;

/// Resources whose refresh failed, with the provider's message.
pub type RefreshFailures = BTreeMap<ResourceKey, String>;

/// Reload every resource of `current` through its provider.
///
/// Resources the provider reports as gone are dropped from `current`. A
/// failing refresh leaves the recorded fields untouched and is returned so
/// the plan can force a replacement of the resource.
pub fn refresh(current: &mut RootScope) -> RefreshFailures {
    let keys: Vec<ResourceKey> = current
        .resources()
        .map(|resource| resource.key().clone())
        .collect();
    let mut failures = RefreshFailures::new();

    for key in keys {
        let Some(resource) = current.resource(&key) else {
            continue;
        };
        let kind = Arc::clone(resource.kind());
        let Some(refreshable) = kind.refreshable() else {
            continue;
        };
        let mut fields = resource.fields().clone();
        match refreshable.refresh(&mut fields, &resource.context()) {
            Ok(true) => {
                if let Some(resource) = current.resource_mut(&key) {
                    *resource.fields_mut() = fields;
                }
            }
            Ok(false) => {
                debug!("{key} no longer exists");
                current.remove_resource(&key);
            }
            Err(error) => {
                warn!("failed to refresh {key}: {error:#}");
                failures.insert(key, format!("{error:#}"));
            }
        }
    }
    failures
}

/// Field differences between the two sides of one resource. Output fields
/// and fields configured on neither side are not compared.
#[must_use]
pub fn changed_fields<P, C>(pending: &P, current: &C) -> Vec<FieldChange>
where
    P: Diffable + ?Sized,
    C: Diffable + ?Sized,
{
    pending
        .schema()
        .fields()
        .iter()
        .filter(|spec| !spec.output)
        .filter(|spec| pending.is_configured(spec.name) || current.is_configured(spec.name))
        .filter_map(|spec| {
            let wanted = pending.value(spec.name).cloned().unwrap_or(Value::Null);
            let recorded = current.value(spec.name).cloned().unwrap_or(Value::Null);
            (wanted != recorded).then(|| FieldChange {
                field: spec.name.to_string(),
                current: recorded,
                pending: wanted,
                updatable: spec.updatable,
            })
        })
        .collect()
}

/// Update when every changed field can change in place, Replace otherwise.
#[must_use]
pub fn classify(fields: &[FieldChange]) -> Option<ChangeKind> {
    if fields.is_empty() {
        None
    } else if fields.iter().all(|change| change.updatable) {
        Some(ChangeKind::Update)
    } else {
        Some(ChangeKind::Replace)
    }
}

#[derive(Debug)]
struct Candidate {
    kind: ChangeKind,
    key: ResourceKey,
    file: PathBuf,
    fields: Vec<FieldChange>,
    workflow: Option<String>,
    hint: Option<String>,
    depends_on: BTreeSet<ResourceKey>,
}

/// Compute the changes converging `current` to `pending`.
///
/// Creates and updates come first in dependency order, then replacements,
/// then deletions with dependents before their dependencies.
///
/// # Errors
///
/// Returns an error when the changed resources reference each other in a
/// cycle.
pub fn diff(
    pending: &RootScope,
    current: &RootScope,
    unknown: &RefreshFailures,
) -> std::result::Result<PlanReport, GraphError> {
    let mut forward = Vec::new();
    let mut replaces = Vec::new();
    let mut deletes = Vec::new();
    let mut unchanged = 0_usize;

    for resource in pending.resources() {
        let key = resource.key();
        let file = pending.file_of(key).map(PathBuf::from).unwrap_or_default();
        let Some(existing) = current.resource(key) else {
            let schema = resource.kind().schema();
            let fields = resource
                .fields()
                .iter()
                .filter_map(|(name, value)| {
                    let spec = schema.field(name)?;
                    (!spec.output && !value.is_null()).then(|| FieldChange {
                        field: name.clone(),
                        current: Value::Null,
                        pending: value.clone(),
                        updatable: spec.updatable,
                    })
                })
                .collect();
            forward.push(Candidate {
                kind: ChangeKind::Create,
                key: key.clone(),
                file,
                fields,
                workflow: None,
                hint: None,
                depends_on: resource.depends_on().clone(),
            });
            continue;
        };

        let fields = changed_fields(resource, existing);
        let refresh_failure = unknown.get(key);
        let kind = if refresh_failure.is_some() {
            Some(ChangeKind::Replace)
        } else {
            classify(&fields)
        };
        let Some(kind) = kind else {
            unchanged += 1;
            continue;
        };

        let mut candidate = Candidate {
            kind,
            key: key.clone(),
            file,
            fields,
            workflow: None,
            hint: refresh_failure.map(|message| format!("state unknown, refresh failed: {message}")),
            depends_on: resource.depends_on().clone(),
        };
        if kind == ChangeKind::Replace {
            match pending.workflow_for(&key.type_name) {
                Some(workflow) => candidate.workflow = Some(workflow.name.clone()),
                None => {
                    let note = format!("no workflow replaces `{}`; skipped", key.type_name);
                    candidate.hint = Some(match candidate.hint.take() {
                        Some(hint) => format!("{hint}; {note}"),
                        None => note,
                    });
                }
            }
            replaces.push(candidate);
        } else {
            forward.push(candidate);
        }
    }

    for resource in current.resources() {
        let key = resource.key();
        if pending.resource(key).is_some() {
            continue;
        }
        deletes.push(Candidate {
            kind: ChangeKind::Delete,
            key: key.clone(),
            file: current.file_of(key).map(PathBuf::from).unwrap_or_default(),
            fields: Vec::new(),
            workflow: None,
            hint: None,
            depends_on: resource.depends_on().clone(),
        });
    }

    let mut ordered = in_dependency_order(forward)?;
    ordered.extend(in_dependency_order(replaces)?);
    let mut deletes = in_dependency_order(deletes)?;
    deletes.reverse();
    ordered.extend(deletes);

    let changes = ordered
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| PlannedChange {
            id: index + 1,
            kind: candidate.kind,
            key: candidate.key,
            file: candidate.file,
            fields: candidate.fields,
            workflow: candidate.workflow,
            hint: candidate.hint,
        })
        .collect();

    Ok(PlanReport {
        files: pending.files().map(|file| file.path().to_path_buf()).collect(),
        changes,
        unchanged,
        warnings: unknown
            .iter()
            .map(|(key, message)| format!("could not refresh {key}: {message}"))
            .collect(),
        errors: Vec::new(),
    })
}

fn in_dependency_order(
    candidates: Vec<Candidate>,
) -> std::result::Result<Vec<Candidate>, GraphError> {
    let nodes: Vec<(ResourceKey, BTreeSet<ResourceKey>)> = candidates
        .iter()
        .map(|candidate| (candidate.key.clone(), candidate.depends_on.clone()))
        .collect();
    let order = build_execution_order(&nodes)?;
    let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|index| slots.get_mut(index).and_then(Option::take))
        .collect())
}
