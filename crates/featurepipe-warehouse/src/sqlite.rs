//! `SQLite`-backed implementation of [`Warehouse`].
//!
//! Each connection owns one `rusqlite::Connection` behind a `Mutex`; all
//! statements run on the blocking pool. Tables are named by the quoted
//! `namespace.name` identifier and use untyped columns. Dates are stored as
//! `YYYY-MM-DD` text.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use featurepipe_types::value::DATE_FORMAT;
use featurepipe_types::{Row, RowSet, TableRef, Value};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction};

use crate::backend::{ConnectOptions, Warehouse, WarehouseConnection, WriteMode};
use crate::error::{self, WarehouseError};

/// `SQLite` warehouse rooted at a database file.
#[derive(Debug, Clone)]
pub struct SqliteWarehouse {
    path: PathBuf,
}

impl SqliteWarehouse {
    /// Warehouse backed by the database file at `path` (created on first connect).
    #[must_use]
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> error::Result<Box<dyn WarehouseConnection>> {
        let path = self.path.clone();
        let busy_timeout = options.busy_timeout;
        let conn = tokio::task::spawn_blocking(move || -> error::Result<Connection> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| WarehouseError::fatal_connect(e.to_string()))?;
            }
            let conn = Connection::open(&path).map_err(classify_open_error)?;
            conn.busy_timeout(busy_timeout)?;
            Ok(conn)
        })
        .await
        .map_err(|e| WarehouseError::transient_connect(format!("connect task failed: {e}")))??;

        tracing::debug!(
            path = %self.path.display(),
            client = options.client_name,
            "Opened sqlite warehouse connection"
        );
        Ok(Box::new(SqliteConnection {
            conn: Some(Arc::new(Mutex::new(conn))),
        }))
    }
}

fn classify_open_error(err: rusqlite::Error) -> WarehouseError {
    let transient = matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    );
    WarehouseError::Connect {
        message: err.to_string(),
        transient,
    }
}

struct SqliteConnection {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl SqliteConnection {
    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> error::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> error::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(self.conn.as_ref().ok_or(WarehouseError::Closed)?);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| WarehouseError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| WarehouseError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl WarehouseConnection for SqliteConnection {
    async fn read(&mut self, table: &TableRef, columns: &[String]) -> error::Result<RowSet> {
        let table = table.clone();
        let requested = columns.to_vec();
        self.with_conn(move |conn| {
            let existing = table_info(conn, &table)?
                .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))?;
            let present: Vec<String> = if requested.is_empty() {
                existing
            } else {
                requested
                    .into_iter()
                    .filter(|c| existing.contains(c))
                    .collect()
            };
            if present.is_empty() {
                return Ok(RowSet::new(present));
            }

            let select_list = present
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("SELECT {select_list} FROM {}", table_ident(&table));
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut out = RowSet::new(present.clone());
            while let Some(row) = rows.next()? {
                let mut record = Row::new();
                for (idx, column) in present.iter().enumerate() {
                    record.insert(column.clone(), from_sql(row.get_ref(idx)?));
                }
                out.push(record);
            }
            Ok(out)
        })
        .await
    }

    async fn table_columns(&mut self, table: &TableRef) -> error::Result<Option<Vec<String>>> {
        let table = table.clone();
        self.with_conn(move |conn| table_info(conn, &table)).await
    }

    async fn write(
        &mut self,
        table: &TableRef,
        rows: &RowSet,
        mode: &WriteMode,
    ) -> error::Result<u64> {
        let table = table.clone();
        let rows = rows.clone();
        let mode = mode.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let written = match &mode {
                WriteMode::Replace => replace_table(&tx, &table, &rows)?,
                WriteMode::Upsert { key_column } => upsert_rows(&tx, &table, &rows, key_column)?,
            };
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    async fn drop_table(&mut self, table: &TableRef) -> error::Result<()> {
        let table = table.clone();
        self.with_conn(move |conn| {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", table_ident(&table)), [])?;
            Ok(())
        })
        .await
    }

    async fn swap(&mut self, staging: &TableRef, target: &TableRef) -> error::Result<()> {
        let staging = staging.clone();
        let target = target.clone();
        self.with_conn(move |conn| {
            // DDL is transactional in SQLite; dropping the transaction rolls back.
            let tx = conn.transaction()?;
            if table_info(&tx, &staging)?.is_none() {
                return Err(WarehouseError::TableNotFound(staging.to_string()));
            }
            tx.execute(&format!("DROP TABLE IF EXISTS {}", table_ident(&target)), [])
                .map_err(|e| WarehouseError::operation("swap drop", &target, e.to_string()))?;
            tx.execute(
                &format!(
                    "ALTER TABLE {} RENAME TO {}",
                    table_ident(&staging),
                    table_ident(&target)
                ),
                [],
            )
            .map_err(|e| WarehouseError::operation("swap rename", &target, e.to_string()))?;
            tx.commit()?;
            tracing::info!(staging = %staging, target = %target, "Atomic swap committed");
            Ok(())
        })
        .await
    }

    async fn disconnect(&mut self) -> error::Result<()> {
        let Some(shared) = self.conn.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(shared) {
            Ok(mutex) => {
                let conn = mutex.into_inner().map_err(|_| WarehouseError::LockPoisoned)?;
                conn.close().map_err(|(_, e)| WarehouseError::Sqlite(e))
            }
            // A blocking task still holds a clone; it closes on drop.
            Err(_) => Ok(()),
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn table_ident(table: &TableRef) -> String {
    quote_ident(&table.qualified_name())
}

/// Column names of `table`, or `None` if it does not exist.
fn table_info(conn: &Connection, table: &TableRef) -> error::Result<Option<Vec<String>>> {
    let name = table.qualified_name();
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [&name],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(None);
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(columns))
}

fn replace_table(tx: &Transaction<'_>, table: &TableRef, rows: &RowSet) -> error::Result<u64> {
    let ident = table_ident(table);
    tx.execute(&format!("DROP TABLE IF EXISTS {ident}"), [])?;
    let column_list = rows
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    tx.execute(&format!("CREATE TABLE {ident} ({column_list})"), [])?;
    insert_rows(tx, &ident, &rows.columns, &rows.rows)
}

fn insert_rows(
    tx: &Transaction<'_>,
    ident: &str,
    columns: &[String],
    rows: &[Row],
) -> error::Result<u64> {
    if columns.is_empty() {
        return Ok(0);
    }
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt =
        tx.prepare(&format!("INSERT INTO {ident} ({column_list}) VALUES ({placeholders})"))?;
    let mut written = 0u64;
    for row in rows {
        let values = columns
            .iter()
            .map(|c| to_sql(row.get(c).unwrap_or(&Value::Null)));
        stmt.execute(params_from_iter(values))?;
        written += 1;
    }
    Ok(written)
}

fn upsert_rows(
    tx: &Transaction<'_>,
    table: &TableRef,
    rows: &RowSet,
    key_column: &str,
) -> error::Result<u64> {
    let ident = table_ident(table);
    let existing = match table_info(tx, table)? {
        Some(columns) => columns,
        None => {
            let column_list = rows
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            tx.execute(&format!("CREATE TABLE {ident} ({column_list})"), [])?;
            rows.columns.clone()
        }
    };
    for column in rows.columns.iter().filter(|c| !existing.contains(c)) {
        tx.execute(
            &format!("ALTER TABLE {ident} ADD COLUMN {}", quote_ident(column)),
            [],
        )?;
    }

    let value_columns: Vec<&String> = rows.columns.iter().filter(|c| *c != key_column).collect();
    let mut written = 0u64;
    for row in &rows.rows {
        let key = row.get(key_column).cloned().unwrap_or(Value::Null);
        let updated = if value_columns.is_empty() {
            let found: Option<i64> = tx
                .query_row(
                    &format!(
                        "SELECT 1 FROM {ident} WHERE {} = ?1",
                        quote_ident(key_column)
                    ),
                    [to_sql(&key)],
                    |r| r.get(0),
                )
                .optional()?;
            usize::from(found.is_some())
        } else {
            let assignments = value_columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE {ident} SET {assignments} WHERE {} = ?{}",
                quote_ident(key_column),
                value_columns.len() + 1
            );
            let mut params: Vec<SqlValue> = value_columns
                .iter()
                .map(|c| to_sql(row.get(*c).unwrap_or(&Value::Null)))
                .collect();
            params.push(to_sql(&key));
            tx.execute(&sql, params_from_iter(params))?
        };
        if updated == 0 {
            insert_rows(tx, &ident, &rows.columns, std::slice::from_ref(row))?;
        }
        written += 1;
    }
    Ok(written)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Float(v) => SqlValue::Real(*v),
        Value::Str(v) => SqlValue::Text(v.clone()),
        Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Str(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
