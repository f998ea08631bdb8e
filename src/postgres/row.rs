use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::Statement;

use crate::error::StoreError;
use crate::value::SqlValue;

/// Column names of a prepared statement, in result order.
pub(crate) fn statement_columns(stmt: &Statement) -> Vec<String> {
    stmt.columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect()
}

/// Decode every column of a row into the backend-neutral value form.
pub(crate) fn extract_row(row: &tokio_postgres::Row) -> Result<Vec<SqlValue>, StoreError> {
    let count = row.columns().len();
    let mut values = Vec::with_capacity(count);
    for idx in 0..count {
        values.push(extract_value(row, idx)?);
    }
    Ok(values)
}

/// Extract a single `SqlValue` from a row at the given index.
///
/// # Errors
/// Returns `StoreError` if the column cannot be retrieved as a supported type.
pub(crate) fn extract_value(
    row: &tokio_postgres::Row,
    idx: usize,
) -> Result<SqlValue, StoreError> {
    let type_info = row.columns()[idx].type_();

    // Match on the type based on PostgreSQL type names. Common types are
    // handled explicitly; everything else is attempted as text.
    if type_info.name() == "int2" {
        let val: Option<i16> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))))
    } else if type_info.name() == "int4" {
        let val: Option<i32> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))))
    } else if type_info.name() == "int8" {
        let val: Option<i64> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, SqlValue::Int))
    } else if type_info.name() == "float4" {
        let val: Option<f32> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, |v| SqlValue::Float(f64::from(v))))
    } else if type_info.name() == "float8" {
        let val: Option<f64> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, SqlValue::Float))
    } else if type_info.name() == "bool" {
        let val: Option<bool> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, SqlValue::Bool))
    } else if type_info.name() == "timestamp" {
        let val: Option<NaiveDateTime> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, |v| SqlValue::Timestamp(v.and_utc())))
    } else if type_info.name() == "timestamptz" {
        let val: Option<DateTime<Utc>> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, SqlValue::Timestamp))
    } else if type_info.name() == "json" || type_info.name() == "jsonb" {
        let val: Option<JsonValue> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, SqlValue::Json))
    } else if type_info.name() == "bytea" {
        let val: Option<Vec<u8>> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, SqlValue::Bytes))
    } else {
        // text, varchar, char, name, and anything else representable as text
        let val: Option<String> = row.try_get(idx)?;
        Ok(val.map_or(SqlValue::Null, SqlValue::Text))
    }
}
