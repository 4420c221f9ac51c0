use std::collections::BTreeSet;
use std::path::Path;

use cairn_domain::{ResourceKey, Value};
use cairn_lang::{Directive, FileNode, Node, ResourceBlock};
use indexmap::IndexMap;

use super::{Evaluation, Evaluator, Frame, Interrupt, SiteStep, parse_type_name};
use crate::error::EvalError;
use crate::fs_util::normalize_path;
use crate::root::VirtualDefinition;
use crate::scope::Scope;
use crate::workflow::Workflow;

const EXCLUDE_NAMES: &str = "`-exclude` expects field names";

fn invalid(directive: &Directive, message: impl Into<String>) -> EvalError {
    EvalError::InvalidDirective {
        span: directive.span.clone(),
        name: directive.name.clone(),
        message: message.into(),
    }
}

fn misplaced(directive: &Directive, context: &'static str) -> Interrupt {
    EvalError::MisplacedDirective {
        span: directive.span.clone(),
        name: directive.name.clone(),
        context,
    }
    .into()
}

fn literal_argument(directive: &Directive) -> Result<&str, EvalError> {
    directive
        .arguments
        .first()
        .and_then(Node::as_string_literal)
        .ok_or_else(|| invalid(directive, "expects a literal string argument"))
}

/// Deep merge used by `@extends`: lists concatenate, maps merge key by key
/// and a value already bound wins over the incoming one.
pub(super) fn merge_values(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::List(mut existing), Value::List(incoming)) => {
            existing.extend(incoming);
            Value::List(existing)
        }
        (Value::Map(mut existing), Value::Map(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => {
                        let current = std::mem::replace(slot, Value::Null);
                        *slot = merge_values(current, value);
                    }
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
            Value::Map(existing)
        }
        (Value::Null, incoming) => incoming,
        (existing, _) => existing,
    }
}

impl Evaluator<'_, '_> {
    // ── File-level definitions ──────────────────────────────────────

    /// Register imports, plugins, virtual types and workflows of `file`
    /// before any statement is evaluated.
    pub(super) fn collect_definitions(
        &mut self,
        file: &FileNode,
        index: usize,
    ) -> Result<(), EvalError> {
        let directory = file.path.parent().unwrap_or_else(|| Path::new(""));
        for node in &file.body {
            let Node::Directive(directive) = node else {
                continue;
            };
            match directive.name.as_str() {
                "import" => {
                    let target = normalize_path(&directory.join(literal_argument(directive)?));
                    if let Some(scope) = self.root.file_at_mut(index) {
                        scope.add_import(target);
                    }
                }
                "plugin" => {
                    let namespace = literal_argument(directive)?;
                    if !self.root.registry().has_namespace(namespace) {
                        return Err(EvalError::UnknownPlugin {
                            span: directive.span.clone(),
                            namespace: namespace.to_string(),
                        });
                    }
                    if let Some(scope) = self.root.file_at_mut(index) {
                        scope.add_plugin(namespace);
                    }
                }
                "virtual" => self.define_virtual(directive)?,
                "workflow" => {
                    let workflow = Workflow::from_directive(directive)?;
                    self.root.add_workflow(workflow);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn define_virtual(&mut self, directive: &Directive) -> Result<(), EvalError> {
        let type_name = parse_type_name(literal_argument(directive)?, &directive.span)?;
        if self.root.registry().get(&type_name).is_some() {
            return Err(invalid(
                directive,
                format!("cannot redefine provider type `{type_name}`"),
            ));
        }
        if self.root.virtual_definition(&type_name).is_some() {
            return Err(invalid(directive, format!("defines `{type_name}` twice")));
        }

        let mut parameters = Vec::new();
        let mut body = Vec::new();
        for node in &directive.body {
            match node {
                Node::Directive(parameter) if parameter.name == "param" => {
                    parameters.push(literal_argument(parameter)?.to_string());
                }
                other => body.push(other.clone()),
            }
        }
        self.root.define_virtual(VirtualDefinition {
            type_name,
            parameters,
            body,
            span: directive.span.clone(),
        });
        Ok(())
    }

    // ── Body directives ─────────────────────────────────────────────

    pub(super) fn evaluate_directive(
        &mut self,
        directive: &Directive,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        match directive.name.as_str() {
            "if" => self.evaluate_if(directive, scope, frame),
            "for" => self.evaluate_for(directive, scope, frame),
            "extends" => self.evaluate_extends(directive, scope, frame),
            "uses-credentials" => self.evaluate_credentials(directive, scope, frame),
            "import" | "plugin" | "virtual" | "workflow" => {
                Err(misplaced(directive, "inside a block"))
            }
            "param" => Err(misplaced(directive, "outside `@virtual`")),
            "stage" => Err(misplaced(directive, "outside `@workflow`")),
            _ => Err(EvalError::UnknownDirective {
                span: directive.span.clone(),
                name: directive.name.clone(),
            }
            .into()),
        }
    }

    fn evaluate_if(
        &mut self,
        directive: &Directive,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        let Some(condition) = directive.arguments.first() else {
            return Err(invalid(directive, "expects a condition").into());
        };
        if self.evaluate_expression(condition, scope, frame)?.is_truthy() {
            return self.evaluate_body(&directive.body, scope, frame);
        }
        for section in &directive.sections {
            let matched = match section.arguments.first() {
                Some(guard) => self.evaluate_expression(guard, scope, frame)?.is_truthy(),
                None => true,
            };
            if matched {
                return self.evaluate_body(&section.body, scope, frame);
            }
        }
        Ok(())
    }

    /// Each iteration runs in its own child scope. Blocks produced by the
    /// body are handed to the enclosing scope only once every iteration
    /// succeeded, so a deferred loop leaves nothing behind.
    fn evaluate_for(
        &mut self,
        directive: &Directive,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        let names = directive
            .arguments
            .iter()
            .map(|argument| {
                argument
                    .as_string_literal()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(directive, "loop variables must be plain names"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if names.is_empty() {
            return Err(invalid(directive, "expects at least one loop variable").into());
        }
        let Some(source) = directive
            .option("in")
            .and_then(|option| option.arguments.first())
        else {
            return Err(invalid(directive, "expects `in <list or map>`").into());
        };

        let iterations: Vec<Vec<Value>> = match self.evaluate_expression(source, scope, frame)? {
            Value::List(items) => items
                .chunks(names.len())
                .map(|chunk| {
                    let mut values = chunk.to_vec();
                    values.resize(names.len(), Value::Null);
                    values
                })
                .collect(),
            Value::Map(entries) => {
                if names.len() > 2 {
                    return Err(
                        invalid(directive, "binds at most a key and a value over a map").into(),
                    );
                }
                entries
                    .into_iter()
                    .map(|(key, value)| {
                        let mut values = vec![Value::String(key), value];
                        values.truncate(names.len());
                        values
                    })
                    .collect()
            }
            Value::Null => Vec::new(),
            other => {
                return Err(EvalError::NotIterable {
                    span: directive.span.clone(),
                    found: other.type_label(),
                }
                .into());
            }
        };

        let mut produced: IndexMap<String, Vec<Value>> = IndexMap::new();
        for (index, values) in iterations.into_iter().enumerate() {
            let mut iteration = Scope::child(scope);
            for (name, value) in names.iter().zip(values) {
                iteration.put(name.clone(), value);
            }
            let iteration_frame = frame.iteration(&directive.span, index);
            self.evaluate_plain(&directive.body, &mut iteration, &iteration_frame)?;
            for (key, mut blocks) in iteration.take_blocks() {
                produced.entry(key).or_default().append(&mut blocks);
            }
        }
        scope.extend_blocks(produced);
        Ok(())
    }

    fn evaluate_extends(
        &mut self,
        directive: &Directive,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        let Some(source) = directive.arguments.first() else {
            return Err(invalid(directive, "expects a map or resource to extend").into());
        };
        let mut entries = match self.evaluate_expression(source, scope, frame)? {
            Value::Map(entries) => entries,
            Value::Resource(key) => self.configured_values(&key),
            other => {
                let message = format!("cannot extend a {}", other.type_label());
                return Err(invalid(directive, message).into());
            }
        };

        if let Some(option) = directive.option("exclude") {
            for argument in &option.arguments {
                match self.evaluate_expression(argument, scope, frame)? {
                    Value::List(items) => {
                        for item in &items {
                            let Some(name) = item.as_str() else {
                                return Err(invalid(directive, EXCLUDE_NAMES).into());
                            };
                            entries.shift_remove(name);
                        }
                    }
                    Value::String(name) => {
                        entries.shift_remove(&name);
                    }
                    _ => return Err(invalid(directive, EXCLUDE_NAMES).into()),
                }
            }
        }

        for (key, incoming) in entries {
            let merged = match scope.get(&key) {
                Some(existing) => merge_values(existing.clone(), incoming),
                None => incoming,
            };
            scope.put(key, merged);
        }
        Ok(())
    }

    fn configured_values(&self, key: &ResourceKey) -> IndexMap<String, Value> {
        self.root
            .resource(key)
            .map(|resource| {
                resource
                    .fields()
                    .iter()
                    .filter(|(name, _)| resource.configured().contains(name.as_str()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn evaluate_credentials(
        &mut self,
        directive: &Directive,
        scope: &mut Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        if !frame.in_resource {
            return Err(misplaced(directive, "outside a resource"));
        }
        let Some(argument) = directive.arguments.first() else {
            return Err(invalid(directive, "expects a credentials name").into());
        };
        let Value::String(name) = self.evaluate_expression(argument, scope, frame)? else {
            return Err(invalid(directive, "expects a credentials name").into());
        };
        if let Some(body) = self.bodies.last_mut() {
            body.credentials = Some(name);
        }
        Ok(())
    }

    // ── Virtual instances ───────────────────────────────────────────

    /// Expand a `@virtual` type: the block body binds the parameters, then
    /// the definition body runs in a scope holding only those parameters.
    pub(super) fn instantiate_virtual(
        &mut self,
        definition: &VirtualDefinition,
        name: &str,
        block: &ResourceBlock,
        scope: &Scope<'_>,
        frame: &Frame,
    ) -> Evaluation<()> {
        let argument_frame = Frame {
            in_resource: false,
            ..frame.clone()
        };
        let (values, dependencies) = {
            let mut arguments = Scope::child(scope);
            self.bodies.push(super::BodyContext::default());
            let outcome = self.evaluate_body(&block.body, &mut arguments, &argument_frame);
            let context = self.bodies.pop().unwrap_or_default();
            outcome?;
            (arguments.into_values(), context.dependencies)
        };

        if let Some(parameter) = definition
            .parameters
            .iter()
            .find(|parameter| !values.contains_key(parameter.as_str()))
        {
            return Err(EvalError::MissingParameter {
                span: block.span.clone(),
                virtual_type: definition.type_name.clone(),
                parameter: parameter.clone(),
            }
            .into());
        }
        if let Some(unknown) = values
            .keys()
            .find(|provided| !definition.parameters.contains(provided))
        {
            return Err(EvalError::UnknownParameter {
                span: block.span.clone(),
                virtual_type: definition.type_name.clone(),
                parameter: unknown.clone(),
            }
            .into());
        }

        let mut inherited: BTreeSet<ResourceKey> = frame.inherited.clone();
        inherited.extend(dependencies);
        let mut site = frame.site.clone();
        site.push(SiteStep::Instance(block.span.clone()));
        let instance = Frame {
            file: frame.file,
            prefix: Some(frame.qualify(name)),
            in_resource: false,
            inherited,
            site,
        };
        let mut isolated = Scope::with_values(values);
        self.evaluate_body(&definition.body, &mut isolated, &instance)
    }
}
