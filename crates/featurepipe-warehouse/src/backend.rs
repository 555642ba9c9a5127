//! Warehouse client trait definitions.
//!
//! The engine never runs queries itself: it issues logical read, write and
//! swap requests through a [`WarehouseConnection`] and trusts the backend to
//! execute them. Connections are explicit values passed to every operation;
//! no connection state is shared implicitly between runs.

use std::time::Duration;

use async_trait::async_trait;
use featurepipe_types::{RowSet, TableRef};

use crate::error;

/// How a [`WarehouseConnection::write`] lands rows in a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Drop and recreate the table with exactly the given rows. Used for
    /// staging tables only; readers of the target never observe it.
    Replace,
    /// Update rows matching `key_column` in place, insert the rest, leave
    /// other target rows untouched. Applied in a single transaction.
    Upsert { key_column: String },
}

/// Options for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Name the client identifies itself with (the pipeline name).
    pub client_name: String,
    /// How long a backend may wait on a locked resource before failing.
    pub busy_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_name: "featurepipe".to_string(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// A warehouse that hands out connections.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn Warehouse>`.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Backend label used in logs.
    fn name(&self) -> &str;

    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::Connect`](crate::WarehouseError::Connect);
    /// its `transient` flag tells callers whether a retry may succeed.
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> error::Result<Box<dyn WarehouseConnection>>;
}

/// An open warehouse connection.
#[async_trait]
pub trait WarehouseConnection: Send {
    /// Read `columns` of `table`. Requested columns the table lacks are
    /// omitted from the result's column list rather than failing, so callers
    /// can report them as data-quality findings. An empty `columns` slice
    /// reads every column.
    ///
    /// # Errors
    ///
    /// Returns [`WarehouseError::TableNotFound`](crate::WarehouseError::TableNotFound)
    /// if the table does not exist.
    async fn read(&mut self, table: &TableRef, columns: &[String]) -> error::Result<RowSet>;

    /// Column names of `table`, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns a backend error on storage failure.
    async fn table_columns(&mut self, table: &TableRef) -> error::Result<Option<Vec<String>>>;

    /// Write `rows` to `table` and return the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns a backend error; on error nothing has been committed.
    async fn write(
        &mut self,
        table: &TableRef,
        rows: &RowSet,
        mode: &WriteMode,
    ) -> error::Result<u64>;

    /// Drop `table` if it exists.
    ///
    /// # Errors
    ///
    /// Returns a backend error on storage failure.
    async fn drop_table(&mut self, table: &TableRef) -> error::Result<()>;

    /// Atomically replace `target` with `staging`. Readers see either the old
    /// target or the new one, never a partial state. On error the target is
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the swap could not be committed.
    async fn swap(&mut self, staging: &TableRef, target: &TableRef) -> error::Result<()>;

    /// Close the connection. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a backend error if closing failed.
    async fn disconnect(&mut self) -> error::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the traits are object-safe (can be used as `dyn`).
    #[test]
    fn test_traits_are_object_safe() {
        fn _assert_warehouse(_: &dyn Warehouse) {}
        fn _assert_connection(_: &dyn WarehouseConnection) {}
    }

    #[test]
    fn test_connect_options_default() {
        let opts = ConnectOptions::default();
        assert_eq!(opts.client_name, "featurepipe");
        assert_eq!(opts.busy_timeout, Duration::from_secs(5));
    }
}
