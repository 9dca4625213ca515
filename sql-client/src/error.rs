use thiserror::Error;

/// SQLSTATE-shaped classification surfaced to `backup_core::retry`.
///
/// The retry policy owns the transient/fatal decision; this enum only
/// carries enough information for that classification (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlErrorKind {
    /// Connection-class failure (SQLSTATE `08*`).
    Connection,
    /// Timeout (`HYT00`/`HYT01`).
    Timeout,
    /// Deadlock or serialization failure (SQLSTATE `40*`).
    Concurrency,
    /// SQLite's "database is locked".
    Locked,
    /// Anything else: constraint violations, syntax errors, missing
    /// objects, and all other non-retryable failures.
    Other,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sql error ({kind:?}): {message}")]
    Sql { kind: SqlErrorKind, message: String },

    #[error("unsupported operation for this dialect: {0}")]
    Unsupported(String),

    #[error("no more rows")]
    NoRows,
}

impl ClientError {
    pub fn kind(&self) -> SqlErrorKind {
        match self {
            ClientError::Sql { kind, .. } => kind.clone(),
            ClientError::Sqlite(rusqlite::Error::SqliteFailure(err, msg)) => {
                // SQLITE_BUSY / SQLITE_LOCKED.
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked
                    || msg.as_deref().is_some_and(|m| m.contains("database is locked"))
                {
                    SqlErrorKind::Locked
                } else {
                    SqlErrorKind::Other
                }
            }
            _ => SqlErrorKind::Other,
        }
    }
}
