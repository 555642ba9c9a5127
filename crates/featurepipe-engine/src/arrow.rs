//! Arrow conversion for previewing computed feature rows.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Date32Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::Datelike;
use featurepipe_types::{RowSet, Value};

/// Days from 0001-01-01 (CE) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Arrow type for a column: integer, float, date or text, decided by the
/// non-null values present. Mixed integer/float columns widen to float;
/// anything else mixed falls back to text.
fn column_type(rows: &RowSet, column: &str) -> DataType {
    let mut ty: Option<DataType> = None;
    for value in rows.column_values(column).flatten() {
        let this = match value {
            Value::Null => continue,
            Value::Int(_) => DataType::Int64,
            Value::Float(_) => DataType::Float64,
            Value::Date(_) => DataType::Date32,
            Value::Str(_) => DataType::Utf8,
        };
        ty = Some(match (ty, this) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(DataType::Int64 | DataType::Float64), DataType::Int64 | DataType::Float64) => {
                DataType::Float64
            }
            _ => DataType::Utf8,
        });
    }
    ty.unwrap_or(DataType::Utf8)
}

fn build_array(rows: &RowSet, column: &str, ty: &DataType) -> ArrayRef {
    let values = rows.column_values(column).map(|v| v.filter(|v| !v.is_null()));
    match ty {
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .map(|v| match v {
                    Some(Value::Int(i)) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values
                .map(|v| v.and_then(Value::as_f64))
                .collect::<Vec<_>>(),
        )),
        DataType::Date32 => Arc::new(Date32Array::from(
            values
                .map(|v| v.and_then(Value::as_date))
                .map(|d| d.map(|d| d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE))
                .collect::<Vec<_>>(),
        )),
        _ => Arc::new(StringArray::from(
            values
                .map(|v| v.map(ToString::to_string))
                .collect::<Vec<_>>(),
        )),
    }
}

/// Convert a row set to a single Arrow record batch.
///
/// # Errors
///
/// Returns an error if the row set has no columns.
pub fn row_set_to_record_batch(rows: &RowSet) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(rows.columns.len());
    let mut arrays = Vec::with_capacity(rows.columns.len());
    for column in &rows.columns {
        let ty = column_type(rows, column);
        arrays.push(build_array(rows, column, &ty));
        fields.push(Field::new(column, ty, true));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .context("Failed to build record batch from feature rows")
}

/// Render a row set as an ASCII table.
///
/// # Errors
///
/// Returns an error if the rows cannot be converted or formatted.
pub fn pretty_format(rows: &RowSet) -> Result<String> {
    let batch = row_set_to_record_batch(rows)?;
    let table = arrow::util::pretty::pretty_format_batches(&[batch])
        .context("Failed to format record batch")?;
    Ok(table.to_string())
}
