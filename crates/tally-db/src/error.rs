//! # Database Errors
//!
//! ```text
//!  sqlx::Error ──► DbError ──► SyncError::Database ──► gate.log_error
//!                    ▲
//!  repository checks ┘  Forbidden / RunNotOpen / StaleCredential
//! ```
//!
//! `is_transient` drives the immediate retry in the sync crate: a locked
//! database or a starved pool may clear up, a constraint never will.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The consumption key belongs to a different client. The existing row
    /// is left untouched.
    #[error("forbidden")]
    Forbidden,

    /// A sync run was closed twice, or never opened.
    #[error("Sync run {run_id} is not running")]
    RunNotOpen { run_id: String },

    /// A credential swap lost its compare-and-swap: another rotation or a
    /// re-enrollment got there first.
    #[error("Credential for {location_id}/{provider} changed concurrently")]
    StaleCredential {
        location_id: String,
        provider: String,
    },

    /// A stored row could not be turned back into a domain value.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// SQLite reported the database locked past `busy_timeout`.
    #[error("Database busy: {0}")]
    Busy(String),

    /// A statement was rejected (constraint, syntax, missing table).
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// The file could not be opened, or the pool is closed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Every connection stayed checked out past the acquire timeout.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// True if the same statement could succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::Busy(_)
                | DbError::ConnectionFailed(_)
                | DbError::PoolExhausted
                | DbError::Internal(_)
        )
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                if is_lock_contention(&message) {
                    DbError::Busy(message)
                } else {
                    DbError::QueryFailed(message)
                }
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::InvalidRow(format!("column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::InvalidRow(source.to_string()),
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool is closed".to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED surface as these messages.
fn is_lock_contention(message: &str) -> bool {
    message.contains("database is locked") || message.contains("database table is locked")
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::InvalidRow(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
