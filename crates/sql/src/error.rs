use thiserror::Error;
use tissdb_storage::StorageError;

/// Lexer or parser failure, with the byte offset it happened at.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("parse error at offset {offset}: {message}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("query expects {expected} parameters, {supplied} supplied")]
    ParameterCount { expected: usize, supplied: usize },
    #[error("INSERT has {columns} columns but {values} values")]
    ColumnCountMismatch { columns: usize, values: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("field `{field}` has no {expected} form")]
    FieldTypeMismatch {
        field: String,
        expected: &'static str,
    },
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
