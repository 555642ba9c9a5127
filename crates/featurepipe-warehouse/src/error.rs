//! Warehouse error types.

/// Errors produced by [`Warehouse`](crate::Warehouse) and
/// [`WarehouseConnection`](crate::WarehouseConnection) operations.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// Connection could not be established. `transient` failures may be retried.
    #[error("connect failed: {message}")]
    Connect { message: String, transient: bool },

    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Operation issued on a connection that was already disconnected.
    #[error("connection is closed")]
    Closed,

    #[error("{operation} failed for {table}: {message}")]
    Operation {
        operation: &'static str,
        table: String,
        message: String,
    },

    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking worker task panicked or was cancelled.
    #[error("warehouse worker failed: {0}")]
    Worker(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("warehouse lock poisoned")]
    LockPoisoned,
}

impl WarehouseError {
    #[must_use]
    pub fn transient_connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            transient: true,
        }
    }

    #[must_use]
    pub fn fatal_connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            transient: false,
        }
    }

    #[must_use]
    pub fn operation(
        operation: &'static str,
        table: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::Operation {
            operation,
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect { transient, .. } => *transient,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, WarehouseError>;
