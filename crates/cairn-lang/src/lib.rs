//! Syntax tree, parser and printer for `.cairn` configuration and state files.
//!
//! Every node prints back to source form through [`std::fmt::Display`], and
//! the printed form parses back to an equal tree (ignoring spans).

mod ast;
mod error;
mod parser;
mod printer;

pub use ast::{
    Binary, BinaryOp, Directive, DirectiveOption, DirectiveSection, FileNode, KeyBlock, Literal,
    Node, Pair, Reference, ResourceBlock, Span,
};
pub use error::ParseError;
pub use parser::parse;
