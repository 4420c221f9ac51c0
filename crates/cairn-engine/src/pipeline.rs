use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_domain::{ApplyReport, PlanReport};
use cairn_lang::{FileNode, parse};
use log::debug;

use crate::apply::{ApplyContext, ApplyOptions, Approver, apply_plan};
use crate::diff::{RefreshFailures, diff, refresh};
use crate::error::PipelineError;
use crate::eval::Evaluator;
use crate::fs_util::normalize_path;
use crate::providers::TypeRegistry;
use crate::root::RootScope;
use crate::state::StateBackend;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpOptions {
    /// Trust recorded state instead of asking providers for the real one.
    pub skip_refresh: bool,
}

/// A planned run: both graphs plus the changes between them.
#[derive(Debug)]
pub struct Session {
    pub pending: RootScope,
    pub state: RootScope,
    pub plan: PlanReport,
}

impl Session {
    /// Execute the plan, persisting state through `backend`.
    pub fn apply(
        &mut self,
        backend: &dyn StateBackend,
        approver: &dyn Approver,
        options: ApplyOptions,
    ) -> ApplyReport {
        let mut context = ApplyContext {
            pending: &mut self.pending,
            state: &mut self.state,
            backend,
        };
        apply_plan(&self.plan, &mut context, approver, options)
    }
}

/// Parse `root_file` and every file it imports, transitively.
///
/// # Errors
///
/// Returns an error when the root file does not exist or a file cannot be
/// read or parsed.
pub fn load_sources(root_file: &Path) -> std::result::Result<Vec<FileNode>, PipelineError> {
    let root = fs::canonicalize(root_file).map_err(|source| PipelineError::MissingRoot {
        path: root_file.to_path_buf(),
        source,
    })?;

    let mut queue = VecDeque::from([root]);
    let mut seen = BTreeSet::new();
    let mut files = Vec::new();
    while let Some(path) = queue.pop_front() {
        if !seen.insert(path.clone()) {
            continue;
        }
        let source = fs::read_to_string(&path).map_err(|source| PipelineError::ReadSource {
            path: path.clone(),
            source,
        })?;
        let file = parse(&source, &path)?;
        let directory = path.parent().unwrap_or_else(|| Path::new(""));
        for (import, _) in file.imports() {
            queue.push_back(normalize_path(&directory.join(import)));
        }
        files.push(file);
    }
    debug!("loaded {} configuration file(s)", files.len());
    Ok(files)
}

/// Everything `cairn up` does before asking for confirmation: load sources
/// and state, refresh, evaluate and diff.
///
/// # Errors
///
/// Returns an error when sources or state cannot be loaded, evaluation
/// fails, or the changed resources form a dependency cycle.
pub fn plan_up(
    root_file: &Path,
    registry: Arc<TypeRegistry>,
    backend: &dyn StateBackend,
    options: UpOptions,
) -> std::result::Result<Session, PipelineError> {
    let sources = load_sources(root_file)?;
    let paths: Vec<PathBuf> = sources.iter().map(|file| file.path.clone()).collect();

    let mut state = backend.load(&paths, Arc::clone(&registry))?;
    let failures = if options.skip_refresh {
        debug!("refresh skipped");
        RefreshFailures::new()
    } else {
        refresh(&mut state)
    };

    let mut pending = RootScope::new(registry);
    Evaluator::new(&mut pending)
        .with_current(&state)
        .evaluate(&sources)?;
    let plan = diff(&pending, &state, &failures)?;
    debug!(
        "planned {} change(s), {} unchanged",
        plan.changes.len(),
        plan.unchanged
    );

    Ok(Session {
        pending,
        state,
        plan,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::fs;
    use std::sync::Arc;

    use cairn_domain::{ApplyStatus, ChangeKind};

    use super::{UpOptions, load_sources, plan_up};
    use crate::apply::{ApplyOptions, ApproveAll};
    use crate::error::PipelineError;
    use crate::providers::TypeRegistry;
    use crate::state::LocalStateBackend;

    #[test]
    fn follows_imports_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("lib")).expect("lib dir");
        fs::write(
            temp.path().join("main.cairn"),
            "@import: 'lib/a.cairn'\n@import: 'lib/b.cairn'\n",
        )
        .expect("main");
        fs::write(temp.path().join("lib/a.cairn"), "@import: 'b.cairn'\n").expect("a");
        fs::write(temp.path().join("lib/b.cairn"), "x: 1\n").expect("b");

        let files = load_sources(&temp.path().join("main.cairn")).expect("sources load");
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn missing_root_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let error = load_sources(&temp.path().join("absent.cairn")).expect_err("root is missing");
        assert!(matches!(error, PipelineError::MissingRoot { .. }));
    }

    #[test]
    fn second_run_after_apply_plans_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = temp.path().join("main.cairn");
        fs::write(
            &config,
            format!(
                "local::file page\n  path: '{}'\n  content: 'hello'\n  mode: '644'\nend\n",
                temp.path().join("page.html").display()
            ),
        )
        .expect("config");
        let registry = Arc::new(TypeRegistry::builtin());

        let mut session = plan_up(
            &config,
            Arc::clone(&registry),
            &LocalStateBackend,
            UpOptions::default(),
        )
        .expect("plan");
        assert_eq!(session.plan.changes.len(), 1);
        assert_eq!(session.plan.changes[0].kind, ChangeKind::Create);
        let report = session.apply(&LocalStateBackend, &ApproveAll, ApplyOptions::default());
        assert_eq!(report.results[0].status, ApplyStatus::Applied);

        let session = plan_up(&config, registry, &LocalStateBackend, UpOptions::default())
            .expect("second plan");
        assert!(!session.plan.has_changes(), "{:?}", session.plan.changes);
        assert_eq!(session.plan.unchanged, 1);
    }
}
