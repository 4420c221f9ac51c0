use cairn_domain::Value;
use indexmap::IndexMap;

/// Name bindings for one level of evaluation.
///
/// Reads fall through to the parent chain; writes always land in this scope.
/// Values produced by nested key blocks are collected separately and become
/// fields of the enclosing resource.
#[derive(Debug, Default)]
pub struct Scope<'p> {
    parent: Option<&'p Scope<'p>>,
    values: IndexMap<String, Value>,
    blocks: IndexMap<String, Vec<Value>>,
}

impl<'p> Scope<'p> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_values(values: IndexMap<String, Value>) -> Self {
        Self {
            parent: None,
            values,
            blocks: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn child(parent: &'p Scope<'p>) -> Self {
        Self {
            parent: Some(parent),
            values: IndexMap::new(),
            blocks: IndexMap::new(),
        }
    }

    /// Look a name up locally, then through every ancestor.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(value) => Some(value),
            None => self.parent.and_then(|parent| parent.find(name)),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn put(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(name.into(), value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub const fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    pub fn add_block(&mut self, key: impl Into<String>, value: Value) {
        self.blocks.entry(key.into()).or_default().push(value);
    }

    pub(crate) fn take_blocks(&mut self) -> IndexMap<String, Vec<Value>> {
        std::mem::take(&mut self.blocks)
    }

    pub(crate) fn extend_blocks(&mut self, blocks: IndexMap<String, Vec<Value>>) {
        for (key, mut values) in blocks {
            self.blocks.entry(key).or_default().append(&mut values);
        }
    }

    /// Every binding visible from this scope, nearest definition winning.
    #[must_use]
    pub fn flatten(&self) -> IndexMap<String, Value> {
        let mut flattened = self.parent.map(Scope::flatten).unwrap_or_default();
        for (name, value) in &self.values {
            flattened.insert(name.clone(), value.clone());
        }
        flattened
    }

    #[must_use]
    pub fn into_values(self) -> IndexMap<String, Value> {
        self.values
    }

    /// Local bindings plus collected blocks: a single block becomes a map,
    /// repeated blocks become a list of maps.
    pub(crate) fn into_fields(self) -> IndexMap<String, Value> {
        let mut fields = self.values;
        for (key, mut values) in self.blocks {
            let value = if values.len() == 1 {
                values.pop().unwrap_or(Value::Null)
            } else {
                Value::List(values)
            };
            fields.insert(key, value);
        }
        fields
    }
}
