//! Error types for batched migrations.

use thiserror::Error;

use crate::record::MigrationStatus;

/// Error raised by user-authored migration code.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Batched migration errors.
#[derive(Debug, Error)]
pub enum Error {
    /// No migration matches the identifier.
    #[error("migration not found: {project}:{timestamp}")]
    NotFound {
        /// Project namespace.
        project: String,
        /// 14-digit migration timestamp.
        timestamp: String,
    },

    /// The migration has already been enqueued for this project.
    #[error("migration already enqueued: {project}:{timestamp}")]
    AlreadyExists {
        /// Project namespace.
        project: String,
        /// 14-digit migration timestamp.
        timestamp: String,
    },

    /// The identifier does not start with a 14-digit timestamp.
    #[error("invalid migration identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Two definitions share a timestamp.
    #[error("duplicate migration definition for timestamp {timestamp}: {first} and {second}")]
    DuplicateDefinition {
        /// The shared timestamp.
        timestamp: String,
        /// Name already registered.
        first: String,
        /// Name that collided with it.
        second: String,
    },

    /// The definition reported parameters that cannot be scheduled.
    #[error("invalid parameters for migration {timestamp}: {reason}")]
    InvalidParameters {
        /// The migration timestamp.
        timestamp: String,
        /// What is wrong with the parameters.
        reason: String,
    },

    /// The definition failed to compute its parameters.
    #[error("failed to compute parameters for migration {timestamp}: {source}")]
    Parameters {
        /// The migration timestamp.
        timestamp: String,
        /// Error returned by the definition.
        #[source]
        source: HandlerError,
    },

    /// User logic failed while processing a batch.
    #[error("batch [{start}, {end}] of migration {timestamp} failed: {source}")]
    BatchFailed {
        /// The migration timestamp.
        timestamp: String,
        /// First unit of the failed batch.
        start: i64,
        /// Last unit of the failed batch.
        end: i64,
        /// Error returned by the definition.
        #[source]
        source: HandlerError,
    },

    /// Finalize finished without the record reaching `succeeded`.
    #[error("migration {timestamp} finished finalizing in status {status}, expected succeeded")]
    InconsistentState {
        /// The migration timestamp.
        timestamp: String,
        /// The status found after finalizing.
        status: MigrationStatus,
    },

    /// Operator transition not allowed from the current status.
    #[error("cannot {action} migration {timestamp} in status {status}")]
    InvalidTransition {
        /// The attempted operation.
        action: &'static str,
        /// The migration timestamp.
        timestamp: String,
        /// The current status.
        status: MigrationStatus,
    },

    /// No record has this store ID.
    #[error("no migration record with id {id}")]
    UnknownRecord {
        /// The record ID.
        id: i64,
    },

    /// A cursor write would move backwards or past the end of the range.
    #[error("cursor {cursor} out of range for migration record {id}")]
    CursorOutOfRange {
        /// The record ID.
        id: i64,
        /// The rejected cursor.
        cursor: i64,
    },

    /// Gave up waiting for a migration lock.
    #[error("timed out waiting for lock {key}")]
    LockTimeout {
        /// The lock key.
        key: String,
    },

    /// A held lock lapsed and may now belong to another process.
    #[error("lock {key} lost before release")]
    LockLost {
        /// The lock key.
        key: String,
    },

    /// Lock service failure (not contention).
    #[error("lock error: {0}")]
    Lock(String),

    /// Record store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Stored data could not be decoded.
    #[error("corrupt migration record: {0}")]
    Corrupt(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Store(format!("blocking task failed: {}", err))
    }
}

impl Error {
    /// Whether the error came from user migration code.
    pub fn is_handler_error(&self) -> bool {
        matches!(self, Error::BatchFailed { .. } | Error::Parameters { .. })
    }
}
