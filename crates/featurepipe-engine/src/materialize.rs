//! Commit computed feature rows to the target table.
//!
//! Overwrite writes a `<table>__fp_staging` copy and swaps it in with one
//! atomic warehouse operation. Incremental upserts by key in one write. In
//! both cases a failure leaves the target exactly as it was.

use featurepipe_types::{MaterializeMode, RowSet, TableRef};
use featurepipe_warehouse::{WarehouseConnection, WriteMode};

use crate::error::MaterializeError;

/// What a successful materialization did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeSummary {
    pub target: TableRef,
    pub mode: MaterializeMode,
    pub rows_written: u64,
}

/// Commit `rows` to `target`.
///
/// `rows` must already be sorted by `key_column` so repeated runs produce
/// identical tables.
///
/// # Errors
///
/// Returns a [`MaterializeError`]; the target table is unchanged.
pub async fn materialize(
    conn: &mut dyn WarehouseConnection,
    rows: &RowSet,
    target: &TableRef,
    key_column: &str,
    mode: MaterializeMode,
) -> Result<MaterializeSummary, MaterializeError> {
    let rows_written = match mode {
        MaterializeMode::Overwrite => overwrite(conn, rows, target).await?,
        MaterializeMode::Incremental => conn
            .write(
                target,
                rows,
                &WriteMode::Upsert {
                    key_column: key_column.to_string(),
                },
            )
            .await
            .map_err(|error| MaterializeError::Upsert {
                table: target.to_string(),
                error,
            })?,
    };

    tracing::info!(
        table = %target,
        mode = %mode,
        rows = rows_written,
        "Materialized feature table"
    );

    Ok(MaterializeSummary {
        target: target.clone(),
        mode,
        rows_written,
    })
}

async fn overwrite(
    conn: &mut dyn WarehouseConnection,
    rows: &RowSet,
    target: &TableRef,
) -> Result<u64, MaterializeError> {
    let staging = target.staging();
    let staging_err = |error| MaterializeError::Staging {
        table: staging.to_string(),
        error,
    };

    // A previous crashed run may have left a staging table behind.
    conn.drop_table(&staging).await.map_err(staging_err)?;

    let written = match conn.write(&staging, rows, &WriteMode::Replace).await {
        Ok(n) => n,
        Err(error) => {
            discard_staging(conn, &staging).await;
            return Err(staging_err(error));
        }
    };
    tracing::debug!(table = %staging, rows = written, "Staging table written");

    if let Err(error) = conn.swap(&staging, target).await {
        discard_staging(conn, &staging).await;
        return Err(MaterializeError::Swap {
            table: target.to_string(),
            error,
        });
    }
    Ok(written)
}

async fn discard_staging(conn: &mut dyn WarehouseConnection, staging: &TableRef) {
    if let Err(err) = conn.drop_table(staging).await {
        tracing::warn!(table = %staging, error = %err, "Failed to drop staging table");
    }
}
