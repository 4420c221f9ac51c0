use std::io;
use std::path::PathBuf;

use cairn_domain::{DomainValidationError, ResourceKey, TypeName};
use cairn_lang::{ParseError, Span};
use thiserror::Error;

use crate::eval::{StuckStatement, describe_unresolvable};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("{span}: {source}")]
    InvalidIdentity {
        span: Span,
        #[source]
        source: DomainValidationError,
    },
    #[error("{span}: unknown resource type `{type_name}`")]
    UnknownType { span: Span, type_name: TypeName },
    #[error("{span}: resource name must be a string, got {found}")]
    InvalidName { span: Span, found: &'static str },
    #[error("{span}: `{key}` has no field `{field}`")]
    UnknownField {
        span: Span,
        key: ResourceKey,
        field: String,
    },
    #[error("{span}: `{key}` is missing required field `{field}`")]
    MissingField {
        span: Span,
        key: ResourceKey,
        field: String,
    },
    #[error("{span}: field `{field}` of `{key}` is computed by the provider and cannot be set")]
    OutputField {
        span: Span,
        key: ResourceKey,
        field: String,
    },
    #[error("{second}: duplicate resource `{key}` (first defined at {first})")]
    DuplicateResource {
        key: ResourceKey,
        first: Span,
        second: Span,
    },
    #[error("{span}: `{virtual_type}` requires parameter `{parameter}`")]
    MissingParameter {
        span: Span,
        virtual_type: TypeName,
        parameter: String,
    },
    #[error("{span}: `{virtual_type}` has no parameter `{parameter}`")]
    UnknownParameter {
        span: Span,
        virtual_type: TypeName,
        parameter: String,
    },
    #[error("{span}: cannot iterate over a {found}")]
    NotIterable { span: Span, found: &'static str },
    #[error("{span}: cannot apply `{op}` to {left} and {right}")]
    InvalidOperands {
        span: Span,
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("{span}: expected {expected}, found {found}")]
    UnexpectedNode {
        span: Span,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{span}: block `{key}` is only allowed inside a resource")]
    MisplacedBlock { span: Span, key: String },
    #[error("{span}: unknown directive `@{name}`")]
    UnknownDirective { span: Span, name: String },
    #[error("{span}: `@{name}` is not allowed {context}")]
    MisplacedDirective {
        span: Span,
        name: String,
        context: &'static str,
    },
    #[error("{span}: `@{name}` {message}")]
    InvalidDirective {
        span: Span,
        name: String,
        message: String,
    },
    #[error("{span}: no provider is registered for plugin `{namespace}`")]
    UnknownPlugin { span: Span, namespace: String },
    #[error("{}", describe_unresolvable(.statements, .cycles))]
    Unresolvable {
        statements: Vec<StuckStatement>,
        cycles: Vec<Vec<ResourceKey>>,
    },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write state file: {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to replace state file: {path}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
    #[error("failed to remove state file: {path}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("invalid state: {0}")]
    Eval(#[from] EvalError),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{message}")]
    Invariant { message: String },
    #[error("dependency cycle detected among: {cycle}")]
    CycleDetected { cycle: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration file not found: {path}")]
    MissingRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read configuration file: {path}")]
    ReadSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to {action} {key}: {source:#}")]
    Provider {
        action: &'static str,
        key: ResourceKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("{key}: resource type cannot {action}")]
    Unsupported {
        key: ResourceKey,
        action: &'static str,
    },
    #[error("{key} is missing from the {side} graph")]
    MissingResource {
        key: ResourceKey,
        side: &'static str,
    },
    #[error("workflow `{workflow}` stopped at stage `{stage}`: {source}")]
    Stage {
        workflow: String,
        stage: String,
        #[source]
        source: Box<ApplyError>,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}
