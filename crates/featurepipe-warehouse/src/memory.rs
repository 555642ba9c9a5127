//! In-memory implementation of [`Warehouse`] with fault injection.
//!
//! Tables live in a `HashMap` behind a single `Mutex`. Every write builds
//! the new table contents off to the side and installs them in one step, so
//! a failed write or swap leaves the previous contents untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use featurepipe_types::{Row, RowSet, TableRef, Value};

use crate::backend::{ConnectOptions, Warehouse, WarehouseConnection, WriteMode};
use crate::error::{self, WarehouseError};

/// Faults the warehouse injects into subsequent operations.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Fail this many upcoming `connect` calls with a transient error.
    pub transient_connect_failures: u32,
    /// Fail every `connect` with a non-transient error.
    pub refuse_connections: bool,
    /// Fail the next `swap` after the staging table was written.
    pub fail_next_swap: bool,
    /// Fail the next `write` before anything is applied.
    pub fail_next_write: bool,
    /// Fail reads of this table.
    pub fail_read_of: Option<TableRef>,
    /// Panic while reading this table. The lock is released first.
    pub panic_on_read_of: Option<TableRef>,
    /// Delay each read by this long (exercises connection backpressure).
    pub read_latency: Option<Duration>,
}

/// Operation counters for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connect_attempts: u32,
    pub connects: u32,
    pub disconnects: u32,
    pub open_connections: u32,
    pub peak_open_connections: u32,
    pub reads: u32,
    pub writes: u32,
    pub swaps: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<TableRef, RowSet>,
    faults: FaultPlan,
    stats: MemoryStats,
}

/// Shared in-memory warehouse. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<MemoryState>>,
}

fn lock(state: &Mutex<MemoryState>) -> error::Result<MutexGuard<'_, MemoryState>> {
    state.lock().map_err(|_| WarehouseError::LockPoisoned)
}

impl MemoryWarehouse {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a table.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn insert_table(&self, table: TableRef, rows: RowSet) {
        self.state
            .lock()
            .expect("memory warehouse lock poisoned")
            .tables
            .insert(table, rows);
    }

    /// Snapshot of a table's contents.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn table(&self, table: &TableRef) -> Option<RowSet> {
        self.state
            .lock()
            .expect("memory warehouse lock poisoned")
            .tables
            .get(table)
            .cloned()
    }

    /// Replace the fault plan.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().expect("memory warehouse lock poisoned").faults = faults;
    }

    /// Current operation counters.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.state.lock().expect("memory warehouse lock poisoned").stats
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> error::Result<Box<dyn WarehouseConnection>> {
        let mut state = lock(&self.state)?;
        state.stats.connect_attempts += 1;
        if state.faults.refuse_connections {
            return Err(WarehouseError::fatal_connect(format!(
                "connection refused for client '{}'",
                options.client_name
            )));
        }
        if state.faults.transient_connect_failures > 0 {
            state.faults.transient_connect_failures -= 1;
            return Err(WarehouseError::transient_connect("simulated connection reset"));
        }
        state.stats.connects += 1;
        state.stats.open_connections += 1;
        state.stats.peak_open_connections = state
            .stats
            .peak_open_connections
            .max(state.stats.open_connections);
        Ok(Box::new(MemoryConnection {
            state: Some(Arc::clone(&self.state)),
        }))
    }
}

struct MemoryConnection {
    state: Option<Arc<Mutex<MemoryState>>>,
}

impl MemoryConnection {
    fn state(&self) -> error::Result<&Arc<Mutex<MemoryState>>> {
        self.state.as_ref().ok_or(WarehouseError::Closed)
    }
}

#[async_trait]
impl WarehouseConnection for MemoryConnection {
    async fn read(&mut self, table: &TableRef, columns: &[String]) -> error::Result<RowSet> {
        let (latency, panics) = {
            let mut state = lock(self.state()?)?;
            state.stats.reads += 1;
            if state.faults.fail_read_of.as_ref() == Some(table) {
                return Err(WarehouseError::operation("read", table, "simulated read failure"));
            }
            (
                state.faults.read_latency,
                state.faults.panic_on_read_of.as_ref() == Some(table),
            )
        };
        if panics {
            panic!("simulated panic reading {table}");
        }
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let state = lock(self.state()?)?;
        let stored = state
            .tables
            .get(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
        Ok(project(stored, columns))
    }

    async fn table_columns(&mut self, table: &TableRef) -> error::Result<Option<Vec<String>>> {
        let state = lock(self.state()?)?;
        Ok(state.tables.get(table).map(|t| t.columns.clone()))
    }

    async fn write(
        &mut self,
        table: &TableRef,
        rows: &RowSet,
        mode: &WriteMode,
    ) -> error::Result<u64> {
        let mut state = lock(self.state()?)?;
        if state.faults.fail_next_write {
            state.faults.fail_next_write = false;
            return Err(WarehouseError::operation("write", table, "simulated write failure"));
        }
        state.stats.writes += 1;

        let next = match mode {
            WriteMode::Replace => rows.clone(),
            WriteMode::Upsert { key_column } => {
                let existing = state.tables.get(table).cloned().unwrap_or_default();
                upsert(existing, rows, key_column)
            }
        };
        state.tables.insert(table.clone(), next);
        Ok(rows.len() as u64)
    }

    async fn drop_table(&mut self, table: &TableRef) -> error::Result<()> {
        lock(self.state()?)?.tables.remove(table);
        Ok(())
    }

    async fn swap(&mut self, staging: &TableRef, target: &TableRef) -> error::Result<()> {
        let mut state = lock(self.state()?)?;
        if state.faults.fail_next_swap {
            state.faults.fail_next_swap = false;
            return Err(WarehouseError::operation("swap", target, "simulated swap failure"));
        }
        let staged = state
            .tables
            .remove(staging)
            .ok_or_else(|| WarehouseError::TableNotFound(staging.to_string()))?;
        state.tables.insert(target.clone(), staged);
        state.stats.swaps += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> error::Result<()> {
        if let Some(shared) = self.state.take() {
            let mut state = lock(&shared)?;
            state.stats.disconnects += 1;
            state.stats.open_connections = state.stats.open_connections.saturating_sub(1);
        }
        Ok(())
    }
}

/// Keep only the requested columns that exist, in request order.
fn project(stored: &RowSet, columns: &[String]) -> RowSet {
    if columns.is_empty() {
        return stored.clone();
    }
    let present: Vec<String> = columns
        .iter()
        .filter(|c| stored.has_column(c))
        .cloned()
        .collect();
    let rows = stored
        .rows
        .iter()
        .map(|row| {
            present
                .iter()
                .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                .collect::<Row>()
        })
        .collect();
    RowSet {
        columns: present,
        rows,
    }
}

/// Merge `incoming` into `existing` by key, returning rows sorted by key.
fn upsert(existing: RowSet, incoming: &RowSet, key_column: &str) -> RowSet {
    let mut columns = existing.columns;
    for column in &incoming.columns {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }

    let mut by_key: BTreeMap<Value, Row> = BTreeMap::new();
    for row in existing.rows {
        let key = row.get(key_column).cloned().unwrap_or(Value::Null);
        by_key.insert(key, row);
    }
    for row in &incoming.rows {
        let key = row.get(key_column).cloned().unwrap_or(Value::Null);
        let target = by_key.entry(key).or_default();
        for (column, value) in row {
            target.insert(column.clone(), value.clone());
        }
    }

    RowSet {
        columns,
        rows: by_key.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(values: &[(i64, i64)]) -> RowSet {
        RowSet::from_values(
            &["id", "v"],
            values
                .iter()
                .map(|(k, v)| vec![Value::Int(*k), Value::Int(*v)]),
        )
    }

    #[tokio::test]
    async fn test_upsert_updates_inserts_and_keeps_untouched_rows() {
        let wh = MemoryWarehouse::new();
        let target = TableRef::new("t");
        wh.insert_table(target.clone(), pairs(&[(1, 10), (2, 20)]));

        let mut conn = wh.connect(&ConnectOptions::default()).await.unwrap();
        conn.write(
            &target,
            &pairs(&[(1, 15), (3, 30)]),
            &WriteMode::Upsert {
                key_column: "id".into(),
            },
        )
        .await
        .unwrap();
        conn.disconnect().await.unwrap();

        assert_eq!(wh.table(&target).unwrap(), pairs(&[(1, 15), (2, 20), (3, 30)]));
    }

    #[tokio::test]
    async fn test_failed_swap_leaves_target_intact() {
        let wh = MemoryWarehouse::new();
        let target = TableRef::new("t");
        wh.insert_table(target.clone(), pairs(&[(1, 10)]));
        wh.set_faults(FaultPlan {
            fail_next_swap: true,
            ..FaultPlan::default()
        });

        let mut conn = wh.connect(&ConnectOptions::default()).await.unwrap();
        conn.write(&target.staging(), &pairs(&[(9, 90)]), &WriteMode::Replace)
            .await
            .unwrap();
        assert!(conn.swap(&target.staging(), &target).await.is_err());

        assert_eq!(wh.table(&target).unwrap(), pairs(&[(1, 10)]));
    }

    #[tokio::test]
    async fn test_transient_connect_failures_are_consumed() {
        let wh = MemoryWarehouse::new();
        wh.set_faults(FaultPlan {
            transient_connect_failures: 1,
            ..FaultPlan::default()
        });
        let first = wh.connect(&ConnectOptions::default()).await;
        assert!(first.is_err_and(|e| e.is_transient()));
        assert!(wh.connect(&ConnectOptions::default()).await.is_ok());
        assert_eq!(wh.stats().connect_attempts, 2);
        assert_eq!(wh.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_read_omits_missing_columns() {
        let wh = MemoryWarehouse::new();
        let t = TableRef::new("src");
        wh.insert_table(t.clone(), pairs(&[(1, 10)]));
        let mut conn = wh.connect(&ConnectOptions::default()).await.unwrap();
        let rs = conn
            .read(&t, &["id".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(rs.columns, vec!["id".to_string()]);
        assert_eq!(rs.rows[0].len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_closes() {
        let wh = MemoryWarehouse::new();
        let mut conn = wh.connect(&ConnectOptions::default()).await.unwrap();
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(wh.stats().disconnects, 1);
        assert_eq!(wh.stats().open_connections, 0);
        let err = conn.read(&TableRef::new("t"), &[]).await.unwrap_err();
        assert!(matches!(err, WarehouseError::Closed));
    }
}
