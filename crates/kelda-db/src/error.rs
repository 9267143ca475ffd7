//! Error types for the state store.

use thiserror::Error;

/// Result type alias for store operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur during store operations.
///
/// Transaction closures return `DbError` to abort: the view's changes are
/// discarded and the error is handed back to the caller.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("no blueprint row")]
    NoBlueprint,

    #[error("no acl row")]
    NoAcl,

    #[error("no self minion row")]
    NoSelfMinion,

    #[error("transaction aborted: {0}")]
    Aborted(String),
}
