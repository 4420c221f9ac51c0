use std::collections::BTreeSet;
use std::sync::Arc;

use cairn_domain::TypeName;
use indexmap::IndexMap;

use crate::resource::ResourceType;
use crate::workflow::Workflow;

mod local;

pub use local::{LocalFile, LocalProvider, LocalSymlink};

/// A bundle of resource types sharing one namespace.
pub trait Provider {
    fn namespace(&self) -> &'static str;

    fn register(&self, registry: &mut TypeRegistry);
}

/// Resource types and default workflows known to a run. Built once at
/// start-up and shared read-only.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: IndexMap<TypeName, Arc<dyn ResourceType>>,
    namespaces: BTreeSet<String>,
    workflows: Vec<Workflow>,
}

impl TypeRegistry {
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_providers(vec![Box::new(LocalProvider)])
    }

    #[must_use]
    pub fn from_providers(providers: Vec<Box<dyn Provider>>) -> Self {
        let mut registry = Self::default();
        for provider in providers {
            registry.namespaces.insert(provider.namespace().to_string());
            provider.register(&mut registry);
        }
        registry
    }

    pub fn register_type(&mut self, kind: Arc<dyn ResourceType>) {
        self.namespaces.insert(kind.type_name().namespace().to_string());
        self.types.insert(kind.type_name().clone(), kind);
    }

    pub fn register_workflow(&mut self, workflow: Workflow) {
        self.workflows.push(workflow);
    }

    #[must_use]
    pub fn get(&self, type_name: &TypeName) -> Option<&Arc<dyn ResourceType>> {
        self.types.get(type_name)
    }

    #[must_use]
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }

    #[must_use]
    pub fn workflow_for(&self, type_name: &TypeName) -> Option<&Workflow> {
        self.workflows
            .iter()
            .find(|workflow| &workflow.for_type == type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &TypeName> {
        self.types.keys()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use cairn_domain::TypeName;

    use super::TypeRegistry;

    #[test]
    fn builtin_registry_knows_local_types() {
        let registry = TypeRegistry::builtin();
        let file = TypeName::try_from("local::file").expect("valid type");
        let symlink = TypeName::try_from("local::symlink").expect("valid type");

        assert!(registry.get(&file).is_some());
        assert!(registry.has_namespace("local"));
        assert!(!registry.has_namespace("aws"));
        assert!(registry.workflow_for(&file).is_none());
        assert_eq!(
            registry
                .workflow_for(&symlink)
                .map(|workflow| workflow.name.as_str()),
            Some("relink")
        );
    }

    #[test]
    fn empty_registry_has_no_types() {
        let registry = TypeRegistry::from_providers(Vec::new());
        assert_eq!(registry.type_names().count(), 0);
    }
}
