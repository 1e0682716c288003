use crate::common::{PageId, TransactionId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

/// Broad error category, one per branch of the taxonomy.
///
/// Every `DbError` maps onto exactly one code; callers that only care
/// about the class of failure (retryable, user mistake, corruption)
/// can match on this instead of the full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Lexical,
    Syntax,
    Semantic,
    Planning,
    Execution,
    Transaction,
    Storage,
    Resource,
    Concurrency,
}

#[derive(Error, Debug)]
pub enum DbError {
    // Lexical
    #[error("unknown character '{ch}' at {line}:{column}")]
    UnknownCharacter { ch: char, line: u32, column: u32 },

    #[error("unterminated string literal at {line}:{column}")]
    UnterminatedString { line: u32, column: u32 },

    // Syntactic
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax {
        message: String,
        line: u32,
        column: u32,
    },

    // Semantic
    #[error("name '{0}' not found")]
    NotFound(String),

    #[error("name '{0}' is ambiguous")]
    Ambiguous(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("'{0}' is neither aggregated nor listed in GROUP BY")]
    AggregatePlacement(String),

    #[error("constraint error: {0}")]
    Constraint(String),

    #[error("semantic error: {0}")]
    Semantic(String),

    // Planning
    #[error("planning error: {0}")]
    Planning(String),

    // Execution
    #[error("execution error: {0}")]
    Execution(String),

    #[error("arithmetic overflow in {0}")]
    Overflow(String),

    // Transactional
    #[error("deadlock detected; transaction {0} chosen as victim")]
    Deadlock(TransactionId),

    #[error("lock wait timed out on {0}")]
    LockTimeout(String),

    #[error("transaction {0} is not active")]
    TransactionNotActive(TransactionId),

    #[error("no savepoint named '{0}'")]
    NoSuchSavepoint(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    // Storage
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("corrupt page {0}: {1}")]
    Corrupt(PageId, String),

    // Resource
    #[error("buffer pool exhausted")]
    BufferExhausted,

    #[error("too many sessions")]
    TooManySessions,

    // Concurrency
    #[error("query cancelled")]
    Cancelled,

    #[error("query timeout")]
    QueryTimeout,
}

impl DbError {
    /// The taxonomy category this error belongs to.
    pub fn code(&self) -> ErrorCode {
        match self {
            DbError::UnknownCharacter { .. } | DbError::UnterminatedString { .. } => {
                ErrorCode::Lexical
            }
            DbError::Syntax { .. } => ErrorCode::Syntax,
            DbError::NotFound(_)
            | DbError::Ambiguous(_)
            | DbError::TypeMismatch(_)
            | DbError::AggregatePlacement(_)
            | DbError::Constraint(_)
            | DbError::Semantic(_) => ErrorCode::Semantic,
            DbError::Planning(_) => ErrorCode::Planning,
            DbError::Execution(_) | DbError::Overflow(_) => ErrorCode::Execution,
            DbError::Deadlock(_)
            | DbError::LockTimeout(_)
            | DbError::TransactionNotActive(_)
            | DbError::NoSuchSavepoint(_)
            | DbError::CommitFailed(_) => ErrorCode::Transaction,
            DbError::Io(_) | DbError::Storage(_) | DbError::OutOfSpace(_) | DbError::Corrupt(..) => {
                ErrorCode::Storage
            }
            DbError::BufferExhausted | DbError::TooManySessions => ErrorCode::Resource,
            DbError::Cancelled | DbError::QueryTimeout => ErrorCode::Concurrency,
        }
    }

    /// True for errors a caller may reasonably retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::Deadlock(_)
                | DbError::LockTimeout(_)
                | DbError::BufferExhausted
                | DbError::QueryTimeout
        )
    }
}
