//! Error types for the migration engine
//!
//! Three layers: `DatabaseError` is what a backend reports, `MigrationError`
//! is the taxonomy surfaced to callers, and `RunError` wraps the fatal error
//! of a run together with the change-sets that committed before it.

use std::path::PathBuf;
use thiserror::Error;

use crate::migrations::Direction;

/// Result type alias for backend operations
pub type DbResult<T> = Result<T, DatabaseError>;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Postgres SQLSTATE codes raised when two sessions race on `CREATE ... IF NOT EXISTS`
const ALREADY_EXISTS_CODES: [&str; 3] = [
    "42P07", // duplicate_table
    "42710", // duplicate_object
    "23505", // unique_violation on the pg_type / pg_class catalogs
];

const UNDEFINED_TABLE: &str = "42P01";

/// Errors reported by a database backend
#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {message}")]
    Query {
        message: String,
        /// SQLSTATE code when the server reported one
        code: Option<String>,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl DatabaseError {
    /// Create a query error without a SQLSTATE code
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            code: None,
        }
    }

    /// Create a query error carrying a SQLSTATE code
    pub fn query_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// SQLSTATE code, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Whether the statement referenced a relation that does not exist
    pub fn is_undefined_table(&self) -> bool {
        self.code() == Some(UNDEFINED_TABLE)
    }

    /// Whether this error is the losing side of a concurrent create
    pub fn is_already_exists(&self) -> bool {
        self.code()
            .map_or(false, |code| ALREADY_EXISTS_CODES.contains(&code))
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .map(|code| code.into_owned());

        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_) => DatabaseError::Connection(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DatabaseError::Decode(err.to_string())
            }
            _ => DatabaseError::Query {
                message: err.to_string(),
                code,
            },
        }
    }
}

/// Errors surfaced by the migration engine. Every variant is fatal to a run.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The change-set storage location could not be enumerated or read
    #[error("Failed to discover change-sets in {}: {message}", .path.display())]
    Discovery { path: PathBuf, message: String },

    /// The ledger table could not be created, queried or written
    #[error("Ledger error: {0}")]
    Ledger(#[source] DatabaseError),

    /// Begin, commit or rollback failed independently of the change-set body
    #[error("Transaction error for change-set '{name}': {source}")]
    Transaction {
        name: String,
        #[source]
        source: DatabaseError,
    },

    /// The change-set body itself failed
    #[error("Change-set '{name}' failed: {source}")]
    Execution {
        name: String,
        #[source]
        source: DatabaseError,
    },

    /// A Down change-set has no active Up entry to close
    #[error("No active ledger entry for change-set '{name}'")]
    NoActiveEntry { name: String },

    /// The run-scoped advisory lock could not be taken
    #[error("Failed to acquire migration lock: {0}")]
    Lock(#[source] DatabaseError),

    /// Cancellation was requested while waiting for the advisory lock
    #[error("Run cancelled while waiting for the migration lock")]
    LockCancelled,

    /// Cancellation was requested between change-sets
    #[error("Run cancelled before change-set '{next}'")]
    Cancelled { next: String },

    /// A new change-set pair could not be written
    #[error("Failed to create change-set: {0}")]
    Scaffold(String),
}

impl MigrationError {
    pub(crate) fn discovery(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Discovery {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Name of the change-set the error is attributed to, when there is one
    pub fn change_set(&self) -> Option<&str> {
        match self {
            Self::Transaction { name, .. }
            | Self::Execution { name, .. }
            | Self::NoActiveEntry { name }
            | Self::Cancelled { next: name } => Some(name),
            _ => None,
        }
    }
}

/// A failed run: the fatal error plus everything that committed before it
#[derive(Debug, Error)]
#[error("{direction} run stopped after {} committed change-set(s): {error}", .completed.len())]
pub struct RunError {
    pub direction: Direction,
    /// Names committed before the failure, in execution order
    pub completed: Vec<String>,
    #[source]
    pub error: MigrationError,
}
