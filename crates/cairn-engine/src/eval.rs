//! Evaluation of parsed files into a resource graph.
//!
//! A statement that needs something not defined yet (a variable, a resource,
//! or every resource of a type) stops with [`Interrupt::Deferred`]. Bodies
//! are evaluated repeatedly, retrying only the deferred statements, until
//! either everything resolved or a pass makes no progress.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use cairn_domain::{ResourceKey, TypeName, Value, format_number};
use cairn_lang::{
    Binary, BinaryOp, FileNode, KeyBlock, Literal, Node, Reference, ResourceBlock, Span,
};
use indexmap::IndexMap;
use log::{debug, trace};

use crate::error::EvalError;
use crate::graph::find_cycles;
use crate::resource::{
    DEFAULT_CREDENTIALS, Fields, Resource, ResourceSource, ResourceType,
};
use crate::root::RootScope;
use crate::scope::Scope;

mod directives;
#[cfg(test)]
mod tests;

/// Reserved pair recording which fields were set in configuration.
pub const CONFIGURED_FIELDS: &str = "_configured-fields";
/// Reserved pair recording the dependency edges of a persisted resource.
pub const DEPENDS_ON: &str = "_depends-on";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    Resource(ResourceKey),
    Variable(String),
    PendingType(TypeName),
}

impl fmt::Display for DeferReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(key) => write!(formatter, "resource `{key}` is not defined"),
            Self::Variable(name) => write!(formatter, "variable `{name}` is not defined"),
            Self::PendingType(type_name) => {
                write!(formatter, "declarations of `{type_name}` are still pending")
            }
        }
    }
}

/// One unresolved reference and where it appeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defer {
    pub span: Span,
    pub reason: DeferReason,
}

/// A statement that could not be evaluated when evaluation settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckStatement {
    pub span: Span,
    pub label: String,
    /// Key declared by the statement, when it is a resource with a literal name.
    pub key: Option<ResourceKey>,
    pub defers: Vec<Defer>,
}

#[derive(Debug)]
pub(crate) enum Interrupt {
    Deferred(Vec<Defer>),
    Failed(EvalError),
}

impl From<EvalError> for Interrupt {
    fn from(error: EvalError) -> Self {
        Self::Failed(error)
    }
}

pub(crate) type Evaluation<T> = std::result::Result<T, Interrupt>;

fn defer(span: &Span, reason: DeferReason) -> Interrupt {
    Interrupt::Deferred(vec![Defer {
        span: span.clone(),
        reason,
    }])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Configuration,
    State,
}

/// Where a statement is being evaluated.
#[derive(Debug, Clone)]
struct Frame {
    file: usize,
    /// Name prefix of the virtual instance being expanded.
    prefix: Option<String>,
    in_resource: bool,
    /// Dependencies picked up by virtual parameters, added to every resource
    /// the instance produces.
    inherited: BTreeSet<ResourceKey>,
    /// Instantiations and loop iterations enclosing the statement.
    site: Vec<SiteStep>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SiteStep {
    Instance(Span),
    Iteration(Span, usize),
}

/// Distinguishes a retried declaration from a second declaration of the
/// same key produced by the same block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeclarationSite {
    path: Vec<SiteStep>,
    origin: Span,
}

impl DeclarationSite {
    fn location(&self) -> Span {
        match self.path.first() {
            Some(SiteStep::Instance(span) | SiteStep::Iteration(span, _)) => span.clone(),
            None => self.origin.clone(),
        }
    }
}

impl Frame {
    const fn new(file: usize) -> Self {
        Self {
            file,
            prefix: None,
            in_resource: false,
            inherited: BTreeSet::new(),
            site: Vec::new(),
        }
    }

    fn iteration(&self, directive: &Span, index: usize) -> Self {
        let mut frame = self.clone();
        frame.site.push(SiteStep::Iteration(directive.clone(), index));
        frame
    }

    fn resource_body(&self) -> Self {
        Self {
            in_resource: true,
            ..self.clone()
        }
    }

    fn qualify(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name.to_string(),
        }
    }
}

/// State gathered while one resource body evaluates.
#[derive(Debug, Default)]
struct BodyContext {
    dependencies: BTreeSet<ResourceKey>,
    credentials: Option<String>,
}

struct EvaluatedBody {
    fields: IndexMap<String, Value>,
    credentials: Option<String>,
    dependencies: BTreeSet<ResourceKey>,
}

/// Evaluates parsed files into a [`RootScope`].
///
/// Configuration evaluation may be given the current (state) graph: fields
/// the configuration leaves unset are then copied from it, so references to
/// provider outputs resolve at plan time.
pub struct Evaluator<'r, 'c> {
    root: &'r mut RootScope,
    current: Option<&'c RootScope>,
    mode: Mode,
    pending_types: IndexMap<Span, BTreeSet<TypeName>>,
    active: Option<Span>,
    /// Set for one pass after evaluation stalled on type queries alone.
    settling: bool,
    bodies: Vec<BodyContext>,
    declared: BTreeMap<ResourceKey, DeclarationSite>,
    location: Span,
}

impl<'r, 'c> Evaluator<'r, 'c> {
    #[must_use]
    pub fn new(root: &'r mut RootScope) -> Self {
        Self {
            root,
            current: None,
            mode: Mode::Configuration,
            pending_types: IndexMap::new(),
            active: None,
            settling: false,
            bodies: Vec::new(),
            declared: BTreeMap::new(),
            location: Span::synthetic(),
        }
    }

    #[must_use]
    pub const fn with_current(mut self, current: &'c RootScope) -> Self {
        self.current = Some(current);
        self
    }

    /// Evaluate persisted state: reserved pairs are honored and output fields
    /// are accepted.
    #[must_use]
    pub const fn for_state(mut self) -> Self {
        self.mode = Mode::State;
        self
    }

    /// Evaluate `files` into the root scope.
    ///
    /// # Errors
    ///
    /// Returns the first type or shape error, or [`EvalError::Unresolvable`]
    /// when a pass over the remaining statements resolves nothing.
    pub fn evaluate(&mut self, files: &[FileNode]) -> Result<(), EvalError> {
        let indices: Vec<usize> = files
            .iter()
            .map(|file| self.root.ensure_file(&file.path))
            .collect();
        for (file, &index) in files.iter().zip(&indices) {
            self.collect_definitions(file, index)?;
        }

        let mut remaining: Vec<(usize, &Node)> = files
            .iter()
            .enumerate()
            .flat_map(|(position, file)| {
                file.body
                    .iter()
                    .filter(|node| !is_definition(node))
                    .map(move |node| (position, node))
            })
            .collect();
        for (_, node) in &remaining {
            let types = self.declared_types(node);
            if !types.is_empty() {
                self.pending_types.insert(statement_span(node), types);
            }
        }

        let mut scopes: Vec<Scope<'_>> = files.iter().map(|_| Scope::new()).collect();
        let mut pass = 0_usize;
        loop {
            pass += 1;
            let attempted = remaining.len();
            let mut deferred = Vec::new();
            let mut stuck = Vec::new();
            for (position, node) in remaining {
                let span = statement_span(node);
                self.active = Some(span.clone());
                let frame = Frame::new(indices[position]);
                match self.evaluate_statement(node, &mut scopes[position], &frame) {
                    Ok(()) => {
                        self.pending_types.shift_remove(&span);
                    }
                    Err(Interrupt::Deferred(defers)) => {
                        stuck.push(StuckStatement {
                            span,
                            label: statement_label(node),
                            key: statement_key(node),
                            defers: dedupe(defers),
                        });
                        deferred.push((position, node));
                    }
                    Err(Interrupt::Failed(error)) => {
                        self.active = None;
                        return Err(error);
                    }
                }
            }
            self.active = None;

            if deferred.is_empty() {
                break;
            }
            if deferred.len() == attempted {
                let only_type_queries = stuck
                    .iter()
                    .flat_map(|statement| &statement.defers)
                    .all(|defer| matches!(defer.reason, DeferReason::PendingType(_)));
                if self.settling || !only_type_queries {
                    return Err(unresolvable(stuck));
                }
                debug!(
                    "evaluation pass {pass}: answering type queries from the {} registered resource(s)",
                    self.root.resource_count()
                );
                self.settling = true;
                remaining = deferred;
                continue;
            }
            self.settling = false;
            debug!(
                "evaluation pass {pass}: {} of {attempted} statement(s) deferred",
                deferred.len()
            );
            remaining = deferred;
        }

        for (scope, &index) in scopes.into_iter().zip(&indices) {
            if let Some(file) = self.root.file_at_mut(index) {
                file.set_bindings(scope.into_values());
            }
        }
        Ok(())
    }

    fn declared_types(&self, node: &Node) -> BTreeSet<TypeName> {
        let mut types = BTreeSet::new();
        let mut expanded = BTreeSet::new();
        self.collect_declared_types(node, &mut types, &mut expanded);
        types
    }

    fn collect_declared_types(
        &self,
        node: &Node,
        types: &mut BTreeSet<TypeName>,
        expanded: &mut BTreeSet<TypeName>,
    ) {
        let mut bodies: Vec<&[Node]> = Vec::new();
        match node {
            Node::Resource(block) => {
                if let Ok(type_name) = TypeName::try_from(block.type_name.as_str()) {
                    match self.root.virtual_definition(&type_name) {
                        Some(definition) => {
                            if expanded.insert(type_name) {
                                bodies.push(&definition.body);
                            }
                        }
                        None => {
                            types.insert(type_name);
                        }
                    }
                }
                bodies.push(&block.body);
            }
            Node::KeyBlock(block) => bodies.push(&block.body),
            Node::Directive(directive) => {
                bodies.push(&directive.body);
                bodies.extend(directive.sections.iter().map(|section| section.body.as_slice()));
            }
            _ => {}
        }
        for child in bodies.into_iter().flatten() {
            self.collect_declared_types(child, types, expanded);
        }
    }

    // ── Statements ──────────────────────────────────────────────────

    /// Evaluate `body`, retrying deferred statements while each pass makes
    /// progress. A stuck body reports all of its deferrals.
    fn evaluate_body<'n>(
        &mut self,
        body: impl IntoIterator<Item = &'n Node>,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        let mut remaining: Vec<&Node> = body.into_iter().collect();
        loop {
            let attempted = remaining.len();
            let mut deferred = Vec::new();
            let mut defers = Vec::new();
            for node in remaining {
                match self.evaluate_statement(node, scope, frame) {
                    Ok(()) => {}
                    Err(Interrupt::Deferred(mut reasons)) => {
                        deferred.push(node);
                        defers.append(&mut reasons);
                    }
                    Err(failed @ Interrupt::Failed(_)) => return Err(failed),
                }
            }
            if deferred.is_empty() {
                return Ok(());
            }
            if deferred.len() == attempted {
                return Err(Interrupt::Deferred(defers));
            }
            remaining = deferred;
        }
    }

    /// Evaluate `body` once, in order, stopping at the first deferral.
    fn evaluate_plain(
        &mut self,
        body: &[Node],
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        for node in body {
            self.evaluate_statement(node, scope, frame)?;
        }
        Ok(())
    }

    fn evaluate_statement(
        &mut self,
        node: &Node,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        let previous = node
            .span()
            .map(|span| std::mem::replace(&mut self.location, span.clone()));
        let result = self.dispatch_statement(node, scope, frame);
        if let Some(previous) = previous {
            self.location = previous;
        }
        result
    }

    fn dispatch_statement(
        &mut self,
        node: &Node,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        match node {
            Node::Pair(pair) => {
                let value = self.evaluate_expression(&pair.value, scope, frame)?;
                scope.put(pair.key.clone(), value);
                Ok(())
            }
            Node::Resource(block) => self.evaluate_resource(block, scope, frame),
            Node::KeyBlock(block) => self.evaluate_key_block(block, scope, frame),
            Node::Directive(directive) => self.evaluate_directive(directive, scope, frame),
            other => Err(EvalError::UnexpectedNode {
                span: self.location.clone(),
                expected: "a statement",
                found: node_label(other),
            }
            .into()),
        }
    }

    fn evaluate_key_block(
        &mut self,
        block: &KeyBlock,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        if !frame.in_resource {
            return Err(EvalError::MisplacedBlock {
                span: block.span.clone(),
                key: block.key.clone(),
            }
            .into());
        }
        let value = {
            let mut child = Scope::child(scope);
            self.evaluate_body(&block.body, &mut child, frame)?;
            Value::Map(child.into_fields())
        };
        scope.add_block(block.key.clone(), value);
        Ok(())
    }

    // ── Resources ───────────────────────────────────────────────────

    fn evaluate_resource(
        &mut self,
        block: &ResourceBlock,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        let type_name = parse_type_name(&block.type_name, &block.span)?;
        let name = self.evaluate_name(&block.name, scope, frame)?;

        if let Some(definition) = self.root.virtual_definition(&type_name).cloned() {
            return self.instantiate_virtual(&definition, &name, block, scope, frame);
        }
        let Some(kind) = self.root.registry().get(&type_name).cloned() else {
            return Err(EvalError::UnknownType {
                span: block.span.clone(),
                type_name,
            }
            .into());
        };

        let key = resource_key(type_name, frame.qualify(&name), &block.span)?;
        let body = self.evaluate_resource_body(&block.body, scope, &frame.resource_body())?;
        let mut resource = self.finish_resource(key, kind, &block.span, body)?;
        if self.mode == Mode::Configuration {
            resource = resource.with_source(Arc::new(ResourceSource {
                block: block.clone(),
                bindings: scope.flatten(),
                prefix: frame.prefix.clone(),
                inherited: frame.inherited.clone(),
            }));
        }
        self.register(frame, resource)?;
        Ok(())
    }

    /// Pairs and key blocks run before directives so `@extends` never
    /// overrides an explicitly set field.
    fn evaluate_resource_body(
        &mut self,
        body: &[Node],
        parent: &Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<EvaluatedBody> {
        let is_directive = |node: &&Node| matches!(node, Node::Directive(_));
        let ordered: Vec<&Node> = body
            .iter()
            .filter(|node| !is_directive(node))
            .chain(body.iter().filter(is_directive))
            .collect();

        let mut scope = Scope::child(parent);
        self.bodies.push(BodyContext::default());
        let outcome = self.evaluate_body(ordered, &mut scope, frame);
        let context = self.bodies.pop().unwrap_or_default();
        outcome?;

        let mut dependencies = context.dependencies;
        dependencies.extend(frame.inherited.iter().cloned());
        Ok(EvaluatedBody {
            fields: scope.into_fields(),
            credentials: context.credentials,
            dependencies,
        })
    }

    fn finish_resource(
        &self,
        key: ResourceKey,
        kind: Arc<dyn ResourceType>,
        origin: &Span,
        body: EvaluatedBody,
    ) -> Result<Resource, EvalError> {
        let EvaluatedBody {
            fields: mut raw,
            credentials,
            mut dependencies,
        } = body;
        let schema = kind.schema();

        let mut recorded = None;
        if self.mode == Mode::State {
            if let Some(value) = raw.shift_remove(CONFIGURED_FIELDS) {
                recorded = Some(string_list(&value).into_iter().collect::<BTreeSet<_>>());
            }
            if let Some(value) = raw.shift_remove(DEPENDS_ON) {
                for entry in string_list(&value) {
                    let dependency = ResourceKey::parse(&entry).map_err(|source| {
                        EvalError::InvalidIdentity {
                            span: origin.clone(),
                            source,
                        }
                    })?;
                    dependencies.insert(dependency);
                }
            }
        }

        let mut configured = BTreeSet::new();
        let mut fields = Fields::new();
        for (name, value) in raw {
            let Some(spec) = schema.field(&name) else {
                return Err(EvalError::UnknownField {
                    span: origin.clone(),
                    key,
                    field: name,
                });
            };
            if spec.output && self.mode == Mode::Configuration {
                return Err(EvalError::OutputField {
                    span: origin.clone(),
                    key,
                    field: name,
                });
            }
            if !spec.output {
                configured.insert(name.clone());
            }
            fields.insert(name, value);
        }
        if let Some(recorded) = recorded {
            configured = recorded;
        }

        for value in fields.values() {
            let mut referenced = Vec::new();
            value.collect_resources(&mut referenced);
            dependencies.extend(referenced.into_iter().cloned());
        }
        dependencies.remove(&key);

        if let Some(current) = self.current.and_then(|current| current.resource(&key)) {
            for (name, value) in current.fields() {
                let unconfigured =
                    !configured.contains(name) && !current.configured().contains(name);
                if unconfigured && !fields.contains_key(name) {
                    fields.insert(name.clone(), value.clone());
                }
            }
        }

        if self.mode == Mode::Configuration {
            // A null from a reference to an output not produced yet is
            // filled in when the resource is evaluated again before it runs.
            let missing = schema
                .fields()
                .iter()
                .find(|spec| !spec.nullable && !spec.output && !fields.contains_key(spec.name));
            if let Some(spec) = missing {
                return Err(EvalError::MissingField {
                    span: origin.clone(),
                    key,
                    field: spec.name.to_string(),
                });
            }
        }

        let ordered: Fields = schema
            .fields()
            .iter()
            .filter_map(|spec| {
                fields
                    .shift_remove(spec.name)
                    .map(|value| (spec.name.to_string(), value))
            })
            .collect();

        Ok(Resource::new(key, kind, origin.clone())
            .with_fields(ordered)
            .with_configured(configured)
            .with_credentials(credentials.unwrap_or_else(|| DEFAULT_CREDENTIALS.to_string()))
            .with_dependencies(dependencies))
    }

    /// Add `resource` to the graph. Evaluating the same declaration again on
    /// a later pass replaces it; any other declaration of the key fails.
    fn register(&mut self, frame: &Frame, resource: Resource) -> Result<(), EvalError> {
        let site = DeclarationSite {
            path: frame.site.clone(),
            origin: resource.origin().clone(),
        };
        let key = resource.key().clone();
        let first = match self.declared.get(&key) {
            Some(first) => (*first != site).then(|| first.location()),
            None => self
                .root
                .resource(&key)
                .filter(|existing| existing.origin() != resource.origin())
                .map(|existing| existing.origin().clone()),
        };
        if let Some(first) = first {
            return Err(EvalError::DuplicateResource {
                key,
                first,
                second: site.location(),
            });
        }
        trace!("registered {key}");
        self.root.insert_at(frame.file, resource);
        self.declared.insert(key, site);
        Ok(())
    }

    fn evaluate_name(
        &mut self,
        node: &Node,
        scope: &Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<String> {
        match self.evaluate_expression(node, scope, frame)? {
            Value::String(name) => Ok(name),
            Value::Number(number) => Ok(format_number(number)),
            other => Err(EvalError::InvalidName {
                span: self.location.clone(),
                found: other.type_label(),
            }
            .into()),
        }
    }

    fn record_dependency(&mut self, key: &ResourceKey) {
        if let Some(body) = self.bodies.last_mut() {
            body.dependencies.insert(key.clone());
        }
    }

    // ── Expressions ─────────────────────────────────────────────────

    fn evaluate_expression(
        &mut self,
        node: &Node,
        scope: &Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<Value> {
        match node {
            Node::Literal(literal) => Ok(literal_value(literal)),
            Node::Interpolated(parts) => {
                let mut text = String::new();
                for part in parts {
                    let value = self.evaluate_expression(part, scope, frame)?;
                    text.push_str(&value.to_plain_string());
                }
                Ok(Value::String(text))
            }
            Node::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.evaluate_expression(item, scope, frame)?);
                }
                Ok(Value::List(values))
            }
            Node::Map(entries) => {
                let mut map = IndexMap::with_capacity(entries.len());
                for entry in entries {
                    let value = self.evaluate_expression(&entry.value, scope, frame)?;
                    map.insert(entry.key.clone(), value);
                }
                Ok(Value::Map(map))
            }
            Node::Reference(reference) => self.resolve_reference(reference, scope, frame),
            Node::Binary(binary) => self.evaluate_binary(binary, scope, frame),
            other => Err(EvalError::UnexpectedNode {
                span: self.location.clone(),
                expected: "a value",
                found: node_label(other),
            }
            .into()),
        }
    }

    fn evaluate_binary(
        &mut self,
        binary: &Binary,
        scope: &Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<Value> {
        let left = self.evaluate_expression(&binary.left, scope, frame)?;
        match binary.op {
            BinaryOp::And if !left.is_truthy() => return Ok(Value::Bool(false)),
            BinaryOp::Or if left.is_truthy() => return Ok(Value::Bool(true)),
            _ => {}
        }
        let right = self.evaluate_expression(&binary.right, scope, frame)?;
        if matches!(binary.op, BinaryOp::And | BinaryOp::Or) {
            return Ok(Value::Bool(right.is_truthy()));
        }

        let (left_label, right_label) = (left.type_label(), right.type_label());
        apply_operator(binary.op, left, right).ok_or_else(|| {
            EvalError::InvalidOperands {
                span: self.location.clone(),
                op: binary.op.symbol(),
                left: left_label,
                right: right_label,
            }
            .into()
        })
    }

    fn resolve_reference(
        &mut self,
        reference: &Reference,
        scope: &Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<Value> {
        match reference {
            Reference::Variable { path, span } => {
                let Some((head, rest)) = path.split_first() else {
                    return Ok(Value::Null);
                };
                let Some(value) = scope.find(head) else {
                    return Err(defer(span, DeferReason::Variable(head.clone())));
                };
                self.follow_path(value.clone(), rest, span)
            }
            Reference::Resource {
                type_name,
                name,
                attribute,
                span,
            } => {
                let type_name = parse_type_name(type_name, span)?;
                let known = self.root.registry().get(&type_name).is_some()
                    || self.root.virtual_definition(&type_name).is_some();
                if !known {
                    return Err(EvalError::UnknownType {
                        span: span.clone(),
                        type_name,
                    }
                    .into());
                }

                let Some(name) = name else {
                    return self.query_type(&type_name, None, attribute, span);
                };
                let name = self.evaluate_name(name, scope, frame)?;
                if let Some(prefix) = name.strip_suffix('*') {
                    return self.query_type(&type_name, Some(prefix), attribute, span);
                }
                let key = self.locate(&type_name, &name, frame, span)?;
                self.record_dependency(&key);
                self.project(key, attribute, span)
            }
        }
    }

    /// Resolve a named reference, preferring the instance-local resource
    /// inside a virtual expansion.
    fn locate(
        &self,
        type_name: &TypeName,
        name: &str,
        frame: &Frame,
        span: &Span,
    ) -> Evaluation<ResourceKey> {
        let plain = resource_key(type_name.clone(), name.to_string(), span)?;
        if frame.prefix.is_some() {
            let scoped = ResourceKey {
                type_name: type_name.clone(),
                name: frame.qualify(name),
            };
            if self.root.resource(&scoped).is_some() {
                return Ok(scoped);
            }
            if self.root.resource(&plain).is_some() {
                return Ok(plain);
            }
            return Err(defer(span, DeferReason::Resource(scoped)));
        }
        if self.root.resource(&plain).is_some() {
            Ok(plain)
        } else {
            Err(defer(span, DeferReason::Resource(plain)))
        }
    }

    fn query_type(
        &mut self,
        type_name: &TypeName,
        prefix: Option<&str>,
        attribute: &[String],
        span: &Span,
    ) -> Evaluation<Value> {
        let pending = !self.settling
            && self.pending_types.iter().any(|(statement, types)| {
                self.active.as_ref() != Some(statement) && types.contains(type_name)
            });
        if pending {
            return Err(defer(span, DeferReason::PendingType(type_name.clone())));
        }

        let keys: Vec<ResourceKey> = self
            .root
            .resources()
            .map(Resource::key)
            .filter(|key| {
                &key.type_name == type_name
                    && prefix.is_none_or(|prefix| key.name.starts_with(prefix))
            })
            .cloned()
            .collect();
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            self.record_dependency(&key);
            values.push(self.project(key, attribute, span)?);
        }
        Ok(Value::List(values))
    }

    /// The handle itself, or the value at `attribute` of the resource.
    fn project(
        &mut self,
        key: ResourceKey,
        attribute: &[String],
        span: &Span,
    ) -> Evaluation<Value> {
        let Some((field, rest)) = attribute.split_first() else {
            return Ok(Value::Resource(key));
        };
        let Some(resource) = self.root.resource(&key) else {
            return Ok(Value::Null);
        };
        if resource.kind().schema().field(field).is_none() {
            return Err(EvalError::UnknownField {
                span: span.clone(),
                key,
                field: field.clone(),
            }
            .into());
        }
        let value = resource.field(field).cloned().unwrap_or(Value::Null);
        self.follow_path(value, rest, span)
    }

    fn follow_path(&mut self, value: Value, segments: &[String], span: &Span) -> Evaluation<Value> {
        let mut value = value;
        for (index, segment) in segments.iter().enumerate() {
            value = match value {
                Value::Map(mut entries) => entries.shift_remove(segment).unwrap_or(Value::Null),
                Value::List(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|position| items.into_iter().nth(position))
                    .unwrap_or(Value::Null),
                Value::Resource(key) => {
                    self.record_dependency(&key);
                    return self.project(key, &segments[index..], span);
                }
                _ => Value::Null,
            };
        }
        Ok(value)
    }
}

/// Evaluate the declaration of `key` again against `pending`, so references
/// to outputs produced earlier in the same run see their real values.
///
/// Resources that were not evaluated from configuration are left as they are.
///
/// # Errors
///
/// Returns an error when the body no longer evaluates.
pub fn reevaluate_resource(
    pending: &mut RootScope,
    current: &RootScope,
    key: &ResourceKey,
) -> Result<(), EvalError> {
    let Some(resource) = pending.resource(key) else {
        return Ok(());
    };
    let Some(source) = resource.source().cloned() else {
        return Ok(());
    };
    let kind = Arc::clone(resource.kind());
    let origin = resource.origin().clone();
    let Some(file) = pending.file_index_of(key) else {
        return Ok(());
    };

    let mut evaluator = Evaluator::new(pending).with_current(current);
    evaluator.location = origin.clone();
    let bindings = Scope::with_values(source.bindings.clone());
    let frame = Frame {
        file,
        prefix: source.prefix.clone(),
        in_resource: true,
        inherited: source.inherited.clone(),
        site: Vec::new(),
    };
    let body = match evaluator.evaluate_resource_body(&source.block.body, &bindings, &frame) {
        Ok(body) => body,
        Err(Interrupt::Deferred(defers)) => {
            return Err(EvalError::Unresolvable {
                statements: vec![StuckStatement {
                    span: origin,
                    label: key.to_string(),
                    key: Some(key.clone()),
                    defers: dedupe(defers),
                }],
                cycles: Vec::new(),
            });
        }
        Err(Interrupt::Failed(error)) => return Err(error),
    };

    let resource = evaluator
        .finish_resource(key.clone(), kind, &origin, body)?
        .with_source(source);
    evaluator.root.insert_at(file, resource);
    Ok(())
}

pub(crate) fn describe_unresolvable(
    statements: &[StuckStatement],
    cycles: &[Vec<ResourceKey>],
) -> String {
    let mut out = format!("unable to resolve {} statement(s):", statements.len());
    for statement in statements {
        let _ = write!(out, "\n  {}: {}", statement.span, statement.label);
        for defer in &statement.defers {
            let _ = write!(out, "\n    {}: {}", defer.span, defer.reason);
        }
    }
    for cycle in cycles {
        let chain = cycle
            .iter()
            .chain(cycle.first())
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        let _ = write!(out, "\n  dependency cycle: {chain}");
    }
    out
}

fn unresolvable(stuck: Vec<StuckStatement>) -> EvalError {
    let declared: BTreeSet<&ResourceKey> = stuck
        .iter()
        .filter_map(|statement| statement.key.as_ref())
        .collect();
    let mut edges: BTreeMap<ResourceKey, BTreeSet<ResourceKey>> = BTreeMap::new();
    for statement in &stuck {
        let Some(key) = &statement.key else {
            continue;
        };
        let targets = statement.defers.iter().filter_map(|defer| match &defer.reason {
            DeferReason::Resource(target) if declared.contains(target) => Some(target.clone()),
            _ => None,
        });
        edges.entry(key.clone()).or_default().extend(targets);
    }
    let cycles = find_cycles(&edges);
    EvalError::Unresolvable {
        statements: stuck,
        cycles,
    }
}

fn dedupe(defers: Vec<Defer>) -> Vec<Defer> {
    let mut unique: Vec<Defer> = Vec::with_capacity(defers.len());
    for defer in defers {
        if !unique.contains(&defer) {
            unique.push(defer);
        }
    }
    unique
}

fn is_definition(node: &Node) -> bool {
    matches!(
        node,
        Node::Directive(directive)
            if matches!(directive.name.as_str(), "import" | "plugin" | "virtual" | "workflow")
    )
}

fn statement_span(node: &Node) -> Span {
    node.span().cloned().unwrap_or_else(Span::synthetic)
}

fn statement_label(node: &Node) -> String {
    match node {
        Node::Resource(block) => match block.name.as_string_literal() {
            Some(name) => format!("{} {name}", block.type_name),
            None => format!("{} {}", block.type_name, block.name),
        },
        Node::Pair(pair) => format!("{}:", pair.key),
        Node::KeyBlock(block) => block.key.clone(),
        Node::Directive(directive) => format!("@{}", directive.name),
        other => other.to_string(),
    }
}

fn statement_key(node: &Node) -> Option<ResourceKey> {
    let Node::Resource(block) = node else {
        return None;
    };
    let type_name = TypeName::try_from(block.type_name.as_str()).ok()?;
    ResourceKey::new(type_name, block.name.as_string_literal()?).ok()
}

const fn node_label(node: &Node) -> &'static str {
    match node {
        Node::Literal(_) => "a literal",
        Node::Interpolated(_) => "a string",
        Node::List(_) => "a list",
        Node::Map(_) => "a map",
        Node::Reference(_) => "a reference",
        Node::Binary(_) => "an expression",
        Node::Pair(_) => "a pair",
        Node::Resource(_) => "a resource",
        Node::KeyBlock(_) => "a block",
        Node::Directive(_) => "a directive",
    }
}

fn parse_type_name(raw: &str, span: &Span) -> Result<TypeName, EvalError> {
    TypeName::try_from(raw).map_err(|source| EvalError::InvalidIdentity {
        span: span.clone(),
        source,
    })
}

fn resource_key(type_name: TypeName, name: String, span: &Span) -> Result<ResourceKey, EvalError> {
    ResourceKey::new(type_name, name).map_err(|source| EvalError::InvalidIdentity {
        span: span.clone(),
        source,
    })
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Bool(value) => Value::Bool(*value),
        Literal::Number(value) => Value::Number(*value),
        Literal::String(value) => Value::String(value.clone()),
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(single) => vec![single.clone()],
        Value::List(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => left.partial_cmp(right),
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

const fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn apply_operator(op: BinaryOp, left: Value, right: Value) -> Option<Value> {
    use std::cmp::Ordering;

    let value = match op {
        BinaryOp::Eq => Value::Bool(left == right),
        BinaryOp::Ne => Value::Bool(left != right),
        BinaryOp::Lt => Value::Bool(compare(&left, &right)? == Ordering::Less),
        BinaryOp::Le => Value::Bool(compare(&left, &right)? != Ordering::Greater),
        BinaryOp::Gt => Value::Bool(compare(&left, &right)? == Ordering::Greater),
        BinaryOp::Ge => Value::Bool(compare(&left, &right)? != Ordering::Less),
        BinaryOp::Add => match (left, right) {
            (Value::Number(left), Value::Number(right)) => finite(left + right)?,
            (Value::List(mut left), Value::List(right)) => {
                left.extend(right);
                Value::List(left)
            }
            (Value::String(left), right) if is_scalar(&right) => {
                Value::String(left + &right.to_plain_string())
            }
            (left, Value::String(right)) if is_scalar(&left) => {
                Value::String(left.to_plain_string() + &right)
            }
            _ => return None,
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            let (Value::Number(left), Value::Number(right)) = (left, right) else {
                return None;
            };
            match op {
                BinaryOp::Sub => finite(left - right)?,
                BinaryOp::Mul => finite(left * right)?,
                _ if right == 0.0 => return None,
                _ => finite(left / right)?,
            }
        }
        BinaryOp::And | BinaryOp::Or => Value::Bool(left.is_truthy() && right.is_truthy()),
    };
    Some(value)
}

/// Overflowed arithmetic has no literal form, so it is an operand error.
fn finite(number: f64) -> Option<Value> {
    number.is_finite().then_some(Value::Number(number))
}
