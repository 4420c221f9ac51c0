use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{file}:{line}:{column}: {message}")]
pub struct ParseError {
    pub file: Arc<str>,
    pub line: usize,
    pub column: usize,
    pub message: String,
}
