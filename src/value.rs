use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::StoreError;

/// Values that can appear in a result row or be bound as query parameters.
///
/// One enum serves every execution scope so data-access helpers never branch
/// on driver types:
/// ```rust
/// use library_store::SqlValue;
///
/// let params = vec![SqlValue::Int(1), SqlValue::Text("alice".into())];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value; sessions are validated to run in UTC
    Timestamp(DateTime<Utc>),
    /// NULL value
    Null,
    /// JSON value
    Json(JsonValue),
    /// Binary data
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        if let SqlValue::Int(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let SqlValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    /// Bind text that the service treats as absent when empty: an empty
    /// string becomes NULL.
    #[must_use]
    pub fn nullable_text(value: impl Into<String>) -> SqlValue {
        let value = value.into();
        if value.is_empty() {
            SqlValue::Null
        } else {
            SqlValue::Text(value)
        }
    }

    /// Text content of a possibly-NULL column, with NULL read as "".
    #[must_use]
    pub fn text_or_empty(&self) -> &str {
        self.as_text().unwrap_or("")
    }
}

/// Read column `column` as text.
///
/// Accepts native text or a UTF-8 byte payload; NULL is `NullValue`, anything
/// else is `TypeMismatch`.
pub(crate) fn string_at(values: &[SqlValue], column: usize) -> Result<String, StoreError> {
    match values.get(column) {
        Some(SqlValue::Text(s)) => Ok(s.clone()),
        Some(SqlValue::Bytes(b)) => String::from_utf8(b.clone()).map_err(|_| {
            StoreError::TypeMismatch {
                column,
                wanted: "string",
            }
        }),
        Some(SqlValue::Null) => Err(StoreError::NullValue { column }),
        Some(_) => Err(StoreError::TypeMismatch {
            column,
            wanted: "string",
        }),
        None => Err(StoreError::Execution(format!(
            "column index {column} out of range"
        ))),
    }
}

/// Read column `column` as a 64-bit integer.
///
/// Accepts a native integer or a textual/byte payload parseable as base-10.
pub(crate) fn int64_at(values: &[SqlValue], column: usize) -> Result<i64, StoreError> {
    let parse = |s: &str| {
        s.parse::<i64>().map_err(|_| StoreError::TypeMismatch {
            column,
            wanted: "int64",
        })
    };

    match values.get(column) {
        Some(SqlValue::Int(i)) => Ok(*i),
        Some(SqlValue::Text(s)) => parse(s),
        Some(SqlValue::Bytes(b)) => match std::str::from_utf8(b) {
            Ok(s) => parse(s),
            Err(_) => Err(StoreError::TypeMismatch {
                column,
                wanted: "int64",
            }),
        },
        Some(SqlValue::Null) => Err(StoreError::NullValue { column }),
        Some(_) => Err(StoreError::TypeMismatch {
            column,
            wanted: "int64",
        }),
        None => Err(StoreError::Execution(format!(
            "column index {column} out of range"
        ))),
    }
}

/// Read column `column` as a timestamp.
///
/// Accepts a native timestamp or an RFC 3339 textual/byte payload (nanosecond
/// precision).
pub(crate) fn timestamp_at(
    values: &[SqlValue],
    column: usize,
) -> Result<DateTime<Utc>, StoreError> {
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| StoreError::TypeMismatch {
                column,
                wanted: "timestamp",
            })
    };

    match values.get(column) {
        Some(SqlValue::Timestamp(ts)) => Ok(*ts),
        Some(SqlValue::Text(s)) => parse(s),
        Some(SqlValue::Bytes(b)) => match std::str::from_utf8(b) {
            Ok(s) => parse(s),
            Err(_) => Err(StoreError::TypeMismatch {
                column,
                wanted: "timestamp",
            }),
        },
        Some(SqlValue::Null) => Err(StoreError::NullValue { column }),
        Some(_) => Err(StoreError::TypeMismatch {
            column,
            wanted: "timestamp",
        }),
        None => Err(StoreError::Execution(format!(
            "column index {column} out of range"
        ))),
    }
}
