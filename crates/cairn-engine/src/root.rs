use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_domain::{ResourceKey, TypeName, Value};
use cairn_lang::{Node, Span};
use indexmap::IndexMap;

use crate::providers::TypeRegistry;
use crate::resource::Resource;
use crate::workflow::Workflow;

/// A `@virtual` template: instantiating it evaluates `body` with only the
/// parameters in scope.
#[derive(Debug, Clone)]
pub struct VirtualDefinition {
    pub type_name: TypeName,
    pub parameters: Vec<String>,
    pub body: Vec<Node>,
    pub span: Span,
}

/// Everything declared by one source file.
#[derive(Debug, Clone)]
pub struct FileScope {
    path: PathBuf,
    imports: Vec<PathBuf>,
    plugins: Vec<String>,
    bindings: IndexMap<String, Value>,
    resources: IndexMap<ResourceKey, Resource>,
}

impl FileScope {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            imports: Vec::new(),
            plugins: Vec::new(),
            bindings: IndexMap::new(),
            resources: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn imports(&self) -> &[PathBuf] {
        &self.imports
    }

    #[must_use]
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    #[must_use]
    pub const fn bindings(&self) -> &IndexMap<String, Value> {
        &self.bindings
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.imports.is_empty()
    }

    pub fn add_import(&mut self, path: PathBuf) {
        if !self.imports.contains(&path) {
            self.imports.push(path);
        }
    }

    pub fn add_plugin(&mut self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        if !self.plugins.contains(&namespace) {
            self.plugins.push(namespace);
        }
    }

    pub(crate) fn set_bindings(&mut self, bindings: IndexMap<String, Value>) {
        self.bindings = bindings;
    }

    pub(crate) fn set_declarations(&mut self, imports: Vec<PathBuf>, plugins: Vec<String>) {
        self.imports = imports;
        self.plugins = plugins;
    }
}

/// The whole evaluated program: one [`FileScope`] per file plus the
/// definitions shared across files.
#[derive(Debug, Clone)]
pub struct RootScope {
    registry: Arc<TypeRegistry>,
    files: IndexMap<PathBuf, FileScope>,
    virtuals: IndexMap<TypeName, Arc<VirtualDefinition>>,
    workflows: Vec<Workflow>,
}

impl RootScope {
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            files: IndexMap::new(),
            virtuals: IndexMap::new(),
            workflows: Vec::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn files(&self) -> impl Iterator<Item = &FileScope> {
        self.files.values()
    }

    #[must_use]
    pub fn file(&self, path: &Path) -> Option<&FileScope> {
        self.files.get(path)
    }

    /// Index of the scope for `path`, creating an empty one if needed.
    pub fn ensure_file(&mut self, path: &Path) -> usize {
        if let Some(index) = self.files.get_index_of(path) {
            return index;
        }
        self.files
            .insert_full(path.to_path_buf(), FileScope::new(path.to_path_buf()))
            .0
    }

    pub(crate) fn file_at_mut(&mut self, index: usize) -> Option<&mut FileScope> {
        self.files.get_index_mut(index).map(|(_, file)| file)
    }

    pub(crate) fn file_mut(&mut self, path: &Path) -> &mut FileScope {
        let index = self.ensure_file(path);
        &mut self.files[index]
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.files.values().flat_map(FileScope::resources)
    }

    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.files.values().map(|file| file.resources.len()).sum()
    }

    #[must_use]
    pub fn resource(&self, key: &ResourceKey) -> Option<&Resource> {
        self.files.values().find_map(|file| file.resources.get(key))
    }

    pub(crate) fn resource_mut(&mut self, key: &ResourceKey) -> Option<&mut Resource> {
        self.files
            .values_mut()
            .find_map(|file| file.resources.get_mut(key))
    }

    #[must_use]
    pub fn file_of(&self, key: &ResourceKey) -> Option<&Path> {
        self.files
            .values()
            .find(|file| file.resources.contains_key(key))
            .map(FileScope::path)
    }

    pub(crate) fn file_index_of(&self, key: &ResourceKey) -> Option<usize> {
        self.files
            .values()
            .position(|file| file.resources.contains_key(key))
    }

    /// Insert or replace `resource` in the file at `index`, removing any copy
    /// held by another file.
    pub(crate) fn insert_at(&mut self, index: usize, resource: Resource) {
        for (position, file) in self.files.values_mut().enumerate() {
            if position != index {
                file.resources.shift_remove(resource.key());
            }
        }
        if let Some(file) = self.file_at_mut(index) {
            file.resources.insert(resource.key().clone(), resource);
        }
    }

    /// Insert or replace `resource` in the scope of `path`.
    pub fn insert_resource(&mut self, path: &Path, resource: Resource) {
        let index = self.ensure_file(path);
        self.insert_at(index, resource);
    }

    pub fn remove_resource(&mut self, key: &ResourceKey) -> Option<Resource> {
        self.files
            .values_mut()
            .find_map(|file| file.resources.shift_remove(key))
    }

    pub(crate) fn define_virtual(&mut self, definition: VirtualDefinition) {
        self.virtuals
            .insert(definition.type_name.clone(), Arc::new(definition));
    }

    #[must_use]
    pub fn virtual_definition(&self, type_name: &TypeName) -> Option<&Arc<VirtualDefinition>> {
        self.virtuals.get(type_name)
    }

    pub(crate) fn add_workflow(&mut self, workflow: Workflow) {
        self.workflows.push(workflow);
    }

    /// Workflow replacing resources of `type_name`: configuration-defined
    /// workflows win over provider defaults.
    #[must_use]
    pub fn workflow_for(&self, type_name: &TypeName) -> Option<&Workflow> {
        self.workflows
            .iter()
            .find(|workflow| &workflow.for_type == type_name)
            .or_else(|| self.registry.workflow_for(type_name))
    }
}
