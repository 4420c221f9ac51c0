//! Persisted state: every configuration file gets a `<file>.state` sibling
//! written in the configuration language itself.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_domain::Value;
use cairn_lang::{Directive, FileNode, Literal, Node, Pair, Reference, ResourceBlock, Span, parse};
use log::{debug, trace};
use tempfile::NamedTempFile;

use crate::error::StateError;
use crate::eval::{CONFIGURED_FIELDS, DEPENDS_ON, Evaluator};
use crate::fs_util::{normalize_path, relative_path};
use crate::providers::TypeRegistry;
use crate::resource::Resource;
use crate::root::{FileScope, RootScope};

/// Where the current graph is read from and written to.
pub trait StateBackend {
    /// Load the state recorded for `files` and for every file their state
    /// still imports.
    ///
    /// # Errors
    ///
    /// Returns an error when a state file cannot be read, parsed or
    /// evaluated.
    fn load(
        &self,
        files: &[PathBuf],
        registry: Arc<TypeRegistry>,
    ) -> std::result::Result<RootScope, StateError>;

    /// Persist every file scope of `state`.
    ///
    /// # Errors
    ///
    /// Returns an error when a state file cannot be written or removed.
    fn save(&self, state: &RootScope) -> std::result::Result<(), StateError>;
}

/// Keeps state in `.state` files next to the configuration files.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStateBackend;

/// State file recorded for the configuration file at `config`.
#[must_use]
pub fn state_path(config: &Path) -> PathBuf {
    let mut name = config.as_os_str().to_owned();
    name.push(".state");
    PathBuf::from(name)
}

impl StateBackend for LocalStateBackend {
    fn load(
        &self,
        files: &[PathBuf],
        registry: Arc<TypeRegistry>,
    ) -> std::result::Result<RootScope, StateError> {
        let mut queue: VecDeque<PathBuf> = files.iter().cloned().collect();
        let mut seen = BTreeSet::new();
        let mut parsed = Vec::new();

        while let Some(config) = queue.pop_front() {
            if !seen.insert(config.clone()) {
                continue;
            }
            let path = state_path(&config);
            let source = match fs::read_to_string(&path) {
                Ok(source) => source,
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    trace!("no state recorded at {}", path.display());
                    continue;
                }
                Err(source) => return Err(StateError::Read { path, source }),
            };
            debug!("loading state from {}", path.display());

            let mut file = parse(&source, &path)?;
            file.path.clone_from(&config);
            let directory = config.parent().unwrap_or_else(|| Path::new(""));
            for (import, _) in file.imports() {
                queue.push_back(normalize_path(&directory.join(import)));
            }
            parsed.push(file);
        }

        let mut state = RootScope::new(registry);
        Evaluator::new(&mut state).for_state().evaluate(&parsed)?;
        Ok(state)
    }

    fn save(&self, state: &RootScope) -> std::result::Result<(), StateError> {
        for file in state.files() {
            write_state_file(file)?;
        }
        Ok(())
    }
}

fn write_state_file(file: &FileScope) -> std::result::Result<(), StateError> {
    let path = state_path(file.path());
    if file.is_empty() {
        return match fs::remove_file(&path) {
            Ok(()) => {
                debug!("removed empty state file {}", path.display());
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Remove { path, source }),
        };
    }

    let rendered = render_state(file).to_string();
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let write_error = |source| StateError::Write {
        path: path.clone(),
        source,
    };
    let mut temporary = NamedTempFile::new_in(directory).map_err(write_error)?;
    temporary
        .write_all(rendered.as_bytes())
        .map_err(write_error)?;
    temporary.as_file().sync_all().map_err(write_error)?;
    temporary
        .persist(&path)
        .map_err(|source| StateError::Persist {
            path: path.clone(),
            source,
        })?;
    debug!("wrote {}", path.display());
    Ok(())
}

/// The state file for `file` as a syntax tree.
#[must_use]
pub fn render_state(file: &FileScope) -> FileNode {
    let directory = file.path().parent().unwrap_or_else(|| Path::new(""));
    let mut body = Vec::new();
    for plugin in file.plugins() {
        body.push(bodyless("plugin", vec![Node::string(plugin.as_str())]));
    }
    for import in file.imports() {
        let relative = relative_path(directory, import);
        body.push(bodyless(
            "import",
            vec![Node::string(relative.to_string_lossy())],
        ));
    }
    body.extend(file.resources().map(resource_node));

    FileNode {
        path: state_path(file.path()),
        body,
    }
}

fn resource_node(resource: &Resource) -> Node {
    let mut body: Vec<Node> = resource
        .fields()
        .iter()
        .map(|(name, value)| pair(name, value_node(value)))
        .collect();
    body.push(pair(
        CONFIGURED_FIELDS,
        Node::List(resource.configured().iter().map(Node::string).collect()),
    ));
    if !resource.depends_on().is_empty() {
        body.push(pair(
            DEPENDS_ON,
            Node::List(
                resource
                    .depends_on()
                    .iter()
                    .map(|key| Node::string(key.to_string()))
                    .collect(),
            ),
        ));
    }
    body.push(bodyless(
        "uses-credentials",
        vec![Node::string(resource.credentials())],
    ));

    Node::Resource(ResourceBlock {
        type_name: resource.type_name().to_string(),
        name: Box::new(Node::string(resource.name())),
        body,
        span: Span::synthetic(),
    })
}

fn pair(key: &str, value: Node) -> Node {
    Node::Pair(Box::new(Pair {
        key: key.to_string(),
        value,
        span: Span::synthetic(),
    }))
}

fn bodyless(name: &str, arguments: Vec<Node>) -> Node {
    Node::Directive(Directive {
        name: name.to_string(),
        arguments,
        options: Vec::new(),
        bodyless: true,
        body: Vec::new(),
        sections: Vec::new(),
        span: Span::synthetic(),
    })
}

fn value_node(value: &Value) -> Node {
    match value {
        Value::Null => Node::Literal(Literal::Null),
        Value::Bool(flag) => Node::Literal(Literal::Bool(*flag)),
        Value::Number(number) => Node::Literal(Literal::Number(*number)),
        Value::String(text) => Node::string(text.as_str()),
        Value::List(items) => Node::List(items.iter().map(value_node).collect()),
        Value::Map(entries) => Node::Map(
            entries
                .iter()
                .map(|(key, value)| Pair {
                    key: key.clone(),
                    value: value_node(value),
                    span: Span::synthetic(),
                })
                .collect(),
        ),
        Value::Resource(key) => Node::Reference(Reference::Resource {
            type_name: key.type_name.to_string(),
            name: Some(Box::new(Node::string(key.name.as_str()))),
            attribute: Vec::new(),
            span: Span::synthetic(),
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use cairn_domain::{ResourceKey, Value};
    use cairn_lang::parse;

    use super::{LocalStateBackend, StateBackend, state_path};
    use crate::eval::Evaluator;
    use crate::providers::TypeRegistry;
    use crate::root::RootScope;

    fn key(raw: &str) -> ResourceKey {
        ResourceKey::parse(raw).expect("valid key")
    }

    fn evaluate_config(sources: &[(&Path, &str)]) -> RootScope {
        let files: Vec<_> = sources
            .iter()
            .map(|(path, source)| parse(source, path).expect("config parses"))
            .collect();
        let mut root = RootScope::new(Arc::new(TypeRegistry::builtin()));
        Evaluator::new(&mut root)
            .evaluate(&files)
            .expect("config evaluates");
        root
    }

    #[test]
    fn saved_state_loads_back_with_resources_and_imports() {
        let temp = tempfile::tempdir().expect("tempdir");
        let main = temp.path().join("main.cairn");
        let shared = temp.path().join("lib").join("shared.cairn");
        fs::create_dir_all(shared.parent().expect("parent")).expect("lib dir");

        let config = evaluate_config(&[
            (
                main.as_path(),
                "@import: 'lib/shared.cairn'\n@plugin: 'local'\n\
                 local::file index\n  path: '/srv/index'\n  content: $(local::file base)\n  mode: '644'\nend\n\
                 local::file notes\n  path: '/srv/notes'\n  content: \"it's 'quoted'\"\n\
                 \x20 @uses-credentials: 'ops'\nend\n",
            ),
            (
                shared.as_path(),
                "local::file base\n  path: '/srv/base'\n  content: 'base'\nend\n\
                 local::symlink current\n  path: '/srv/current'\n  target: '/srv/base'\nend\n",
            ),
        ]);

        LocalStateBackend.save(&config).expect("state saves");
        assert!(state_path(&main).exists());
        assert!(state_path(&shared).exists());

        let loaded = LocalStateBackend
            .load(&[main.clone()], Arc::new(TypeRegistry::builtin()))
            .expect("state loads");

        assert_eq!(loaded.resource_count(), 4);
        let main_scope = loaded.file(&main).expect("main state");
        assert_eq!(main_scope.imports(), &[shared.clone()]);
        assert_eq!(main_scope.plugins(), &["local".to_string()]);
        assert_eq!(loaded.file_of(&key("local::symlink current")), Some(shared.as_path()));

        let index = loaded.resource(&key("local::file index")).expect("index");
        assert_eq!(
            index.field("content"),
            Some(&Value::Resource(key("local::file base")))
        );
        assert!(index.depends_on().contains(&key("local::file base")));
        assert!(index.configured().contains("mode"));

        let notes = loaded.resource(&key("local::file notes")).expect("notes");
        assert_eq!(notes.field("content").and_then(Value::as_str), Some("it's 'quoted'"));
        assert_eq!(notes.credentials(), "ops");
    }

    #[test]
    fn missing_state_loads_as_an_empty_graph() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded = LocalStateBackend
            .load(
                &[temp.path().join("main.cairn")],
                Arc::new(TypeRegistry::builtin()),
            )
            .expect("missing state is fine");
        assert_eq!(loaded.resource_count(), 0);
    }

    #[test]
    fn empty_file_scopes_remove_their_state_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let main = temp.path().join("main.cairn");
        let mut state = evaluate_config(&[(
            main.as_path(),
            "local::file a\n  path: '/srv/a'\n  content: ''\nend\n",
        )]);
        LocalStateBackend.save(&state).expect("state saves");
        assert!(state_path(&main).exists());

        state.remove_resource(&key("local::file a"));
        LocalStateBackend.save(&state).expect("state saves");
        assert!(!state_path(&main).exists());
    }
}
