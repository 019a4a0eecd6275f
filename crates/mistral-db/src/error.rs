use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur in the persistence layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// `start_tx` called on a session that already has an open transaction.
    #[error("transaction already active on session {session}")]
    TransactionAlreadyActive { session: u64 },

    /// `commit_tx` / `rollback_tx` (or an operation that needs a transaction)
    /// called on a session without one.
    #[error("no active transaction on session {session}")]
    NoActiveTransaction { session: u64 },

    /// No pooled connection became free within `pool_timeout`, or the pool
    /// could not open one.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Caller passed something the operation cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{table} row not found: {id}")]
    NotFound { table: &'static str, id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] mistral_core::CoreError),
}

impl DbError {
    /// Whether retrying the same unit of work may succeed.
    ///
    /// SQLite reports lock contention as BUSY (another connection holds the
    /// write lock past `busy_timeout`, or a deferred transaction lost the race
    /// to upgrade its snapshot) and LOCKED. These are this backend's analogues
    /// of deadlocks and dropped connections on a client/server database.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            DbError::Pool(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
