//! Warehouse table references and in-memory row sets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Row, Value};

/// Suffix appended to a table name for its overwrite staging copy.
pub const STAGING_SUFFIX: &str = "__fp_staging";

/// Reference to a warehouse table, optionally qualified by a namespace
/// (the source system's connection name, e.g. `hive_crm`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl TableRef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn qualified(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// `namespace.name`, or just `name` when unqualified.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{}", self.name),
            None => self.name.clone(),
        }
    }

    /// The staging table an overwrite writes before swapping.
    #[must_use]
    pub fn staging(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            name: format!("{}{STAGING_SUFFIX}", self.name),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// An ordered set of rows sharing a column list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowSet {
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a row set from positional tuples, one value per column.
    #[must_use]
    pub fn from_values<I, R>(columns: &[&str], rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = Value>,
    {
        let columns: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect::<Row>())
            .collect();
        Self { columns, rows }
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Add `column` to the column list if it is not already there.
    pub fn ensure_column(&mut self, column: &str) {
        if !self.has_column(column) {
            self.columns.push(column.to_string());
        }
    }

    /// Sort rows ascending by the given column (absent sorts as null).
    pub fn sort_by_column(&mut self, column: &str) {
        self.rows.sort_by(|a, b| {
            let av = a.get(column).unwrap_or(&Value::Null);
            let bv = b.get(column).unwrap_or(&Value::Null);
            av.cmp(bv)
        });
    }

    /// Keep only rows matching `predicate`.
    pub fn retain<F>(&mut self, predicate: F)
    where
        F: FnMut(&Row) -> bool,
    {
        self.rows.retain(predicate);
    }

    /// Values of a single column, in row order.
    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = Option<&'a Value>> + 'a {
        self.rows.iter().map(move |row| row.get(column))
    }
}
