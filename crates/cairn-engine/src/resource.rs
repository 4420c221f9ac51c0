use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use cairn_domain::{ResourceKey, TypeName, Value};
use cairn_lang::{ResourceBlock, Span};
use indexmap::IndexMap;

/// Field values of one resource, in schema order.
pub type Fields = IndexMap<String, Value>;

pub const DEFAULT_CREDENTIALS: &str = "default";

/// Schema metadata for one resource field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Changes apply in place; otherwise a change forces replacement.
    pub updatable: bool,
    pub nullable: bool,
    /// Part of the provider-side identity of the resource.
    pub id: bool,
    /// Computed by the provider, never set in configuration.
    pub output: bool,
}

impl FieldSpec {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            updatable: false,
            nullable: true,
            id: false,
            output: false,
        }
    }

    #[must_use]
    pub const fn updatable(mut self) -> Self {
        self.updatable = true;
        self
    }

    #[must_use]
    pub const fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub const fn id(mut self) -> Self {
        self.id = true;
        self.nullable = false;
        self
    }

    #[must_use]
    pub const fn output(mut self) -> Self {
        self.output = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSchema {
    fields: Vec<FieldSpec>,
}

impl ResourceSchema {
    #[must_use]
    pub const fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|spec| spec.name == name)
    }
}

/// Arguments every provider operation receives besides the field values.
#[derive(Debug, Clone, Copy)]
pub struct ProviderContext<'a> {
    pub key: &'a ResourceKey,
    pub credentials: &'a str,
}

pub trait Refreshable {
    /// Reload `fields` from the real world. `Ok(false)` means the resource no
    /// longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the real state cannot be read.
    fn refresh(&self, fields: &mut Fields, context: &ProviderContext<'_>) -> anyhow::Result<bool>;
}

pub trait Creatable {
    /// Create the resource; output fields may be filled in.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider rejects the creation.
    fn create(&self, fields: &mut Fields, context: &ProviderContext<'_>) -> anyhow::Result<()>;
}

pub trait Updatable {
    /// Apply `changed` fields of `pending` in place.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider rejects the update.
    fn update(
        &self,
        current: &Fields,
        pending: &mut Fields,
        changed: &[&str],
        context: &ProviderContext<'_>,
    ) -> anyhow::Result<()>;
}

pub trait Deletable {
    /// # Errors
    ///
    /// Returns an error when the provider rejects the deletion.
    fn delete(&self, fields: &Fields, context: &ProviderContext<'_>) -> anyhow::Result<()>;
}

/// A resource type contributed by a provider. Capabilities a type lacks are
/// reported as `None` and surface as unsupported-operation errors.
pub trait ResourceType: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &TypeName;

    fn schema(&self) -> &ResourceSchema;

    fn refreshable(&self) -> Option<&dyn Refreshable> {
        None
    }

    fn creatable(&self) -> Option<&dyn Creatable> {
        None
    }

    fn updatable(&self) -> Option<&dyn Updatable> {
        None
    }

    fn deletable(&self) -> Option<&dyn Deletable> {
        None
    }
}

pub trait Identifiable {
    fn key(&self) -> &ResourceKey;
}

/// What the diff engine needs from either side of a comparison.
pub trait Diffable: Identifiable {
    fn schema(&self) -> &ResourceSchema;

    fn value(&self, field: &str) -> Option<&Value>;

    fn is_configured(&self, field: &str) -> bool;
}

/// Declaration a configuration resource was evaluated from, kept so the
/// body can be evaluated again right before the change executes.
#[derive(Debug)]
pub(crate) struct ResourceSource {
    pub(crate) block: ResourceBlock,
    pub(crate) bindings: IndexMap<String, Value>,
    pub(crate) prefix: Option<String>,
    pub(crate) inherited: BTreeSet<ResourceKey>,
}

#[derive(Debug, Clone)]
pub struct Resource {
    key: ResourceKey,
    kind: Arc<dyn ResourceType>,
    fields: Fields,
    configured: BTreeSet<String>,
    credentials: String,
    depends_on: BTreeSet<ResourceKey>,
    origin: Span,
    source: Option<Arc<ResourceSource>>,
}

impl Resource {
    #[must_use]
    pub fn new(key: ResourceKey, kind: Arc<dyn ResourceType>, origin: Span) -> Self {
        Self {
            key,
            kind,
            fields: Fields::new(),
            configured: BTreeSet::new(),
            credentials: DEFAULT_CREDENTIALS.to_string(),
            depends_on: BTreeSet::new(),
            origin,
            source: None,
        }
    }

    #[must_use]
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    #[must_use]
    pub fn with_configured(mut self, configured: BTreeSet<String>) -> Self {
        self.configured = configured;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = credentials.into();
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, depends_on: BTreeSet<ResourceKey>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub(crate) fn with_source(mut self, source: Arc<ResourceSource>) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    #[must_use]
    pub const fn kind(&self) -> &Arc<dyn ResourceType> {
        &self.kind
    }

    #[must_use]
    pub fn type_name(&self) -> &TypeName {
        &self.key.type_name
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.key.name
    }

    #[must_use]
    pub const fn fields(&self) -> &Fields {
        &self.fields
    }

    pub const fn fields_mut(&mut self) -> &mut Fields {
        &mut self.fields
    }

    #[must_use]
    pub const fn configured(&self) -> &BTreeSet<String> {
        &self.configured
    }

    #[must_use]
    pub fn credentials(&self) -> &str {
        &self.credentials
    }

    #[must_use]
    pub const fn depends_on(&self) -> &BTreeSet<ResourceKey> {
        &self.depends_on
    }

    #[must_use]
    pub const fn origin(&self) -> &Span {
        &self.origin
    }

    pub(crate) const fn source(&self) -> Option<&Arc<ResourceSource>> {
        self.source.as_ref()
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn context(&self) -> ProviderContext<'_> {
        ProviderContext {
            key: &self.key,
            credentials: &self.credentials,
        }
    }
}

impl Identifiable for Resource {
    fn key(&self) -> &ResourceKey {
        &self.key
    }
}

impl Diffable for Resource {
    fn schema(&self) -> &ResourceSchema {
        self.kind.schema()
    }

    fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    fn is_configured(&self, field: &str) -> bool {
        self.configured.contains(field)
    }
}
