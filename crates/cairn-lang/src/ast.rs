use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// 1-based source location of a statement or reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct Span {
    pub file: Arc<str>,
    pub line: usize,
    pub column: usize,
}

impl Span {
    #[must_use]
    pub fn new(file: impl Into<Arc<str>>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// Span for nodes synthesized in code rather than parsed from a file.
    #[must_use]
    pub fn synthetic() -> Self {
        Self::new("<generated>", 0, 0)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }

    pub(crate) const fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge => 3,
            Self::Add | Self::Sub => 4,
            Self::Mul | Self::Div => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binary {
    pub op: BinaryOp,
    pub left: Node,
    pub right: Node,
}

/// `$(...)` expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    /// `$(name.path.0)`: a binding visible from the current scope.
    Variable { path: Vec<String>, span: Span },
    /// `$(ns::kind name | attribute.path)`. Without a name the reference
    /// selects every resource of the type; a name ending in `*` selects by
    /// prefix.
    Resource {
        type_name: String,
        name: Option<Box<Node>>,
        attribute: Vec<String>,
        span: Span,
    },
}

impl Reference {
    #[must_use]
    pub const fn span(&self) -> &Span {
        match self {
            Self::Variable { span, .. } | Self::Resource { span, .. } => span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub key: String,
    pub value: Node,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceBlock {
    pub type_name: String,
    pub name: Box<Node>,
    pub body: Vec<Node>,
    pub span: Span,
}

/// Nested block inside a resource body, e.g. `tags ... end`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyBlock {
    pub key: String,
    pub body: Vec<Node>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveOption {
    pub name: String,
    pub arguments: Vec<Node>,
}

/// `@else` / `@else if <guard>` part of a directive.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveSection {
    pub name: String,
    pub arguments: Vec<Node>,
    pub body: Vec<Node>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub name: String,
    pub arguments: Vec<Node>,
    pub options: Vec<DirectiveOption>,
    /// `@name: args` form without a body.
    pub bodyless: bool,
    pub body: Vec<Node>,
    pub sections: Vec<DirectiveSection>,
    pub span: Span,
}

impl Directive {
    #[must_use]
    pub fn option(&self, name: &str) -> Option<&DirectiveOption> {
        self.options.iter().find(|option| option.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Literal),
    /// Double-quoted string; literal text parts are `Literal::String`.
    Interpolated(Vec<Node>),
    List(Vec<Node>),
    Map(Vec<Pair>),
    Reference(Reference),
    Binary(Box<Binary>),
    Pair(Box<Pair>),
    Resource(ResourceBlock),
    KeyBlock(KeyBlock),
    Directive(Directive),
}

impl Node {
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::Literal(Literal::String(value.into()))
    }

    /// Span of statement and reference nodes.
    #[must_use]
    pub const fn span(&self) -> Option<&Span> {
        match self {
            Self::Reference(reference) => Some(reference.span()),
            Self::Pair(pair) => Some(&pair.span),
            Self::Resource(block) => Some(&block.span),
            Self::KeyBlock(block) => Some(&block.span),
            Self::Directive(directive) => Some(&directive.span),
            Self::Literal(_)
            | Self::Interpolated(_)
            | Self::List(_)
            | Self::Map(_)
            | Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn as_string_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(Literal::String(value)) => Some(value),
            _ => None,
        }
    }
}

/// Parsed contents of one configuration or state file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileNode {
    pub path: PathBuf,
    pub body: Vec<Node>,
}

impl FileNode {
    /// Arguments of every top-level `@import` directive, in source order.
    pub fn imports(&self) -> impl Iterator<Item = (&str, &Span)> {
        self.body.iter().filter_map(|node| match node {
            Node::Directive(directive) if directive.name == "import" => directive
                .arguments
                .first()
                .and_then(Node::as_string_literal)
                .map(|path| (path, &directive.span)),
            _ => None,
        })
    }
}
