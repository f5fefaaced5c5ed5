//! Error taxonomy surfaced by the table services.

use tabledex_core::ddl::SchemaError;
use tabledex_core::query::{QueryError, TokenError};
use tabledex_core::view::ViewPopulationError;
use tabledex_core::{CodecError, TableStatus};

/// Failures returned to callers of the table services.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// Malformed SQL or a reference to an unknown table or column.
    #[error("{0}")]
    InvalidQuery(String),
    /// The query can only return zero rows. Callers answer with an empty
    /// bundle instead of an error.
    #[error("{message}")]
    EmptyResult { table_id: i64, message: String },
    #[error("Table {table_id} not found")]
    NotFound { table_id: i64 },
    /// Another processing attempt holds the table's status token.
    #[error("The status of table {table_id} was changed by another process")]
    ConflictingUpdate { table_id: i64 },
    /// The table is being rebuilt.
    #[error("Table {} is unavailable: {}", .0.table_id, .0.state)]
    Unavailable(Box<TableStatus>),
    /// The last rebuild failed and needs attention.
    #[error("Table {} failed to build: {}", .0.table_id, .0.error_message.as_deref().unwrap_or("unknown error"))]
    Failed(Box<TableStatus>),
    #[error("Timed out after {timeout_ms} ms waiting for the lock on table {table_id}, try again later")]
    LockUnavailable { table_id: i64, timeout_ms: u64 },
    /// Actionable problem with a schema or the data it must hold.
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TableError {
    /// Transient conditions a caller may retry after a delay.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TableError::Unavailable(_) | TableError::LockUnavailable { .. }
        )
    }
}

impl From<QueryError> for TableError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidQuery(message) => TableError::InvalidQuery(message),
            QueryError::InvalidArgument(message) => TableError::InvalidArgument(message),
            QueryError::EmptyResult { table_id, message } => {
                TableError::EmptyResult { table_id, message }
            }
        }
    }
}

impl From<TokenError> for TableError {
    fn from(err: TokenError) -> Self {
        TableError::InvalidArgument(err.to_string())
    }
}

impl From<SchemaError> for TableError {
    fn from(err: SchemaError) -> Self {
        TableError::Validation(err.to_string())
    }
}

impl From<CodecError> for TableError {
    fn from(err: CodecError) -> Self {
        TableError::Validation(err.to_string())
    }
}

impl From<ViewPopulationError> for TableError {
    fn from(err: ViewPopulationError) -> Self {
        TableError::Validation(err.to_string())
    }
}

impl From<StatusUpdateError> for TableError {
    fn from(err: StatusUpdateError) -> Self {
        match err {
            StatusUpdateError::NotFound { table_id } => TableError::NotFound { table_id },
            StatusUpdateError::Conflict { table_id } => TableError::ConflictingUpdate { table_id },
            StatusUpdateError::Storage(e) => TableError::Internal(e),
        }
    }
}

/// Outcome of a token-guarded status transition that did not apply.
#[derive(Debug, thiserror::Error)]
pub enum StatusUpdateError {
    #[error("no status exists for table {table_id}")]
    NotFound { table_id: i64 },
    /// The stored token differs from the caller's.
    #[error("reset token for table {table_id} does not match")]
    Conflict { table_id: i64 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
