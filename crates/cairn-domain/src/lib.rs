use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainValidationError {
    #[error("resource type must look like namespace::kind, got \"{value}\"")]
    InvalidTypeName { value: String },
    #[error("resource name must not be empty")]
    EmptyResourceName,
}

/// A `namespace::kind` resource type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeName(String);

impl TypeName {
    /// Create a type name, rejecting values without exactly one `::` separator.
    ///
    /// # Errors
    ///
    /// Returns an error when either side of the separator is empty or when the
    /// separator is missing.
    pub fn new(value: String) -> Result<Self, DomainValidationError> {
        let valid = value.split_once("::").is_some_and(|(namespace, kind)| {
            is_type_segment(namespace) && is_type_segment(kind)
        });
        if valid {
            Ok(Self(value))
        } else {
            Err(DomainValidationError::InvalidTypeName { value })
        }
    }

    /// Type name for provider-defined types whose segments are known at
    /// compile time.
    #[must_use]
    pub fn from_static(namespace: &'static str, kind: &'static str) -> Self {
        debug_assert!(is_type_segment(namespace) && is_type_segment(kind));
        Self(format!("{namespace}::{kind}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.0.split_once("::").map_or("", |(namespace, _)| namespace)
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        self.0.split_once("::").map_or("", |(_, kind)| kind)
    }
}

fn is_type_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

impl TryFrom<String> for TypeName {
    type Error = DomainValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TypeName {
    type Error = DomainValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_string())
    }
}

impl AsRef<str> for TypeName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for TypeName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

impl From<TypeName> for String {
    fn from(value: TypeName) -> Self {
        value.0
    }
}

/// Identity of a resource: its type plus its (possibly prefixed) name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ResourceKey {
    #[serde(rename = "type")]
    pub type_name: TypeName,
    pub name: String,
}

impl ResourceKey {
    /// # Errors
    ///
    /// Returns an error when `name` is blank.
    pub fn new(type_name: TypeName, name: impl Into<String>) -> Result<Self, DomainValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainValidationError::EmptyResourceName);
        }
        Ok(Self { type_name, name })
    }

    /// Parse the `type name` form used in persisted dependency lists.
    ///
    /// # Errors
    ///
    /// Returns an error when the type half is invalid or the name is missing.
    pub fn parse(value: &str) -> Result<Self, DomainValidationError> {
        let (type_name, name) = value
            .trim()
            .split_once(' ')
            .ok_or(DomainValidationError::EmptyResourceName)?;
        Self::new(TypeName::try_from(type_name)?, name.trim())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} {}", self.type_name, self.name)
    }
}

/// A runtime value produced by evaluating configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    Resource(ResourceKey),
}

impl Value {
    #[must_use]
    pub const fn type_label(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Resource(_) => "resource",
        }
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(value) => *value,
            Self::Number(value) => *value != 0.0,
            Self::String(value) => !value.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Map(entries) => !entries.is_empty(),
            Self::Resource(_) => true,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Text form used for string interpolation: strings are not quoted and
    /// null renders as nothing.
    #[must_use]
    pub fn to_plain_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(value) => value.clone(),
            Self::Number(value) => format_number(*value),
            Self::Resource(key) => key.name.clone(),
            other => other.to_string(),
        }
    }

    /// Collect every resource handle reachable from this value.
    pub fn collect_resources<'a>(&'a self, into: &mut Vec<&'a ResourceKey>) {
        match self {
            Self::Resource(key) => into.push(key),
            Self::List(items) => {
                for item in items {
                    item.collect_resources(into);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.collect_resources(into);
                }
            }
            _ => {}
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => formatter.write_str("null"),
            Self::Bool(value) => write!(formatter, "{value}"),
            Self::Number(value) => formatter.write_str(&format_number(*value)),
            Self::String(value) => {
                write!(formatter, "'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            Self::List(items) => {
                formatter.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        formatter.write_str(", ")?;
                    }
                    write!(formatter, "{item}")?;
                }
                formatter.write_str("]")
            }
            Self::Map(entries) => {
                if entries.is_empty() {
                    return formatter.write_str("{}");
                }
                formatter.write_str("{ ")?;
                for (index, (key, item)) in entries.iter().enumerate() {
                    if index > 0 {
                        formatter.write_str(", ")?;
                    }
                    write!(formatter, "{key}: {item}")?;
                }
                formatter.write_str(" }")
            }
            Self::Resource(key) => write!(formatter, "$({key})"),
        }
    }
}

/// Render a number the way configuration files spell it: integral values
/// without a fractional part.
#[must_use]
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Replace,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub const fn group(self) -> ChangeGroup {
        match self {
            Self::Create | Self::Update => ChangeGroup::CreateOrUpdate,
            Self::Replace => ChangeGroup::Replace,
            Self::Delete => ChangeGroup::Delete,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Changes are confirmed and executed one group at a time, in declaration
/// order of the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeGroup {
    CreateOrUpdate,
    Replace,
    Delete,
}

impl ChangeGroup {
    pub const ALL: [Self; 3] = [Self::CreateOrUpdate, Self::Replace, Self::Delete];

    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::CreateOrUpdate => "create/update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub current: Value,
    pub pending: Value,
    pub updatable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub id: usize,
    pub kind: ChangeKind,
    pub key: ResourceKey,
    pub file: PathBuf,
    pub fields: Vec<FieldChange>,
    pub workflow: Option<String>,
    pub hint: Option<String>,
}

impl PlannedChange {
    #[must_use]
    pub fn changed_field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|change| change.field.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlanReport {
    pub files: Vec<PathBuf>,
    pub changes: Vec<PlannedChange>,
    pub unchanged: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl PlanReport {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn changes_in(&self, group: ChangeGroup) -> impl Iterator<Item = &PlannedChange> {
        self.changes
            .iter()
            .filter(move |change| change.kind.group() == group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    Failed,
    Skipped,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyChangeResult {
    pub change_id: usize,
    pub kind: ChangeKind,
    pub key: ResourceKey,
    pub status: ApplyStatus,
    pub stages: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub plan: PlanReport,
    pub results: Vec<ApplyChangeResult>,
    pub errors: Vec<String>,
}

impl ApplyReport {
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
            || self
                .results
                .iter()
                .any(|result| result.status == ApplyStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use indexmap::IndexMap;

    use super::{DomainValidationError, ResourceKey, TypeName, Value};

    #[test]
    fn type_name_requires_namespace_separator() {
        let error = TypeName::try_from("file").expect_err("missing separator must be rejected");
        assert!(matches!(error, DomainValidationError::InvalidTypeName { .. }));
        assert!(TypeName::try_from("local::").is_err());
        assert!(TypeName::try_from("a::b::c").is_err());

        let name = TypeName::try_from("local::file").expect("valid type");
        assert_eq!(name.namespace(), "local");
        assert_eq!(name.kind(), "file");
    }

    #[test]
    fn resource_key_parses_persisted_form() {
        let key = ResourceKey::parse("local::file site/index").expect("valid key");
        assert_eq!(key.type_name.as_str(), "local::file");
        assert_eq!(key.name, "site/index");
        assert_eq!(key.to_string(), "local::file site/index");
        assert!(ResourceKey::parse("local::file").is_err());
    }

    #[test]
    fn values_render_in_configuration_syntax() {
        let mut map = IndexMap::new();
        map.insert("port".to_string(), Value::Number(8080.0));
        map.insert("name".to_string(), Value::from("it's"));
        let value = Value::List(vec![Value::Map(map), Value::Null, Value::Number(1.5)]);
        assert_eq!(value.to_string(), "[{ port: 8080, name: 'it\\'s' }, null, 1.5]");
        assert_eq!(Value::Number(3.0).to_plain_string(), "3");
        assert_eq!(Value::Null.to_plain_string(), "");
    }

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(!Value::List(Vec::new()).is_truthy());
    }
}
