//! Storage error type.

use thiserror::Error;
use vpo_model::StatusParseError;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Write attempted after [`crate::DbPool::close`]. Programming error.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A stored enum value no longer parses. Indicates schema drift or a
    /// foreign writer.
    #[error("corrupt stored value: {0}")]
    Parse(#[from] StatusParseError),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("row not found: {0}")]
    NotFound(String),
}

impl DbError {
    /// True for SQLITE_BUSY / SQLITE_LOCKED conditions, the only errors the
    /// retry wrapper is allowed to swallow.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::Database(db)) => {
                let message = db.message().to_ascii_lowercase();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}
