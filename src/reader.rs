#[cfg(feature = "test-utils")]
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio_postgres::RowStream;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::StoreError;
use crate::postgres::row as pg_row;
use crate::record::{Record, populate_record};
use crate::value::{self, SqlValue};

/// Where a reader's rows come from.
pub(crate) enum RowSource {
    Postgres(Pin<Box<RowStream>>),
    #[cfg(feature = "test-utils")]
    Buffered(VecDeque<Result<Vec<SqlValue>, StoreError>>),
}

/// Cursor over one query result.
///
/// A reader is tied to a single open result set. Advance it with
/// [`scan_next`](RowReader::scan_next); after a successful advance the typed
/// accessors read the current row until the next advance. When the query was
/// routed at pool scope the reader also owns the leased connection, which goes
/// back to the pool when the reader is dropped.
///
/// `scan_next` returning `false` means either exhaustion or a scan failure;
/// check [`take_error`](RowReader::take_error) after the drain to tell them
/// apart.
pub struct RowReader {
    source: RowSource,
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
    last_error: Option<StoreError>,
    cancel: CancellationToken,
    _lease: Option<Connection>,
}

impl RowReader {
    pub(crate) fn new(
        columns: Arc<Vec<String>>,
        source: RowSource,
        cancel: CancellationToken,
        lease: Option<Connection>,
    ) -> Self {
        Self {
            source,
            columns,
            values: Vec::new(),
            last_error: None,
            cancel,
            _lease: lease,
        }
    }

    /// Column names of the result, in order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Advance to the next row, decoding every column into the row buffer.
    ///
    /// Returns `false` once no row is available. A decode or stream failure is
    /// recorded and also ends the drain; it does not panic and it is not lost,
    /// it waits in [`take_error`](RowReader::take_error).
    pub async fn scan_next(&mut self) -> bool {
        if self.last_error.is_some() {
            return false;
        }

        match &mut self.source {
            RowSource::Postgres(stream) => {
                let next = tokio::select! {
                    () = self.cancel.cancelled() => {
                        self.last_error = Some(StoreError::Canceled);
                        return false;
                    }
                    next = stream.next() => next,
                };
                match next {
                    None => false,
                    Some(Err(e)) => {
                        self.last_error = Some(e.into());
                        false
                    }
                    Some(Ok(row)) => match pg_row::extract_row(&row) {
                        Ok(values) => {
                            self.values = values;
                            true
                        }
                        Err(e) => {
                            self.last_error = Some(e);
                            false
                        }
                    },
                }
            }
            #[cfg(feature = "test-utils")]
            RowSource::Buffered(rows) => match rows.pop_front() {
                None => false,
                Some(Err(e)) => {
                    self.last_error = Some(e);
                    false
                }
                Some(Ok(values)) => {
                    self.values = values;
                    true
                }
            },
        }
    }

    /// The most recent scan/decode failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&StoreError> {
        self.last_error.as_ref()
    }

    /// Take ownership of the recorded failure for propagation with `?`.
    pub fn take_error(&mut self) -> Option<StoreError> {
        self.last_error.take()
    }

    /// Read the current row's column `idx` as text.
    ///
    /// # Errors
    /// `NullValue` on NULL, `TypeMismatch` on a non-text representation.
    pub fn read_string_at(&self, idx: usize) -> Result<String, StoreError> {
        value::string_at(&self.values, idx)
    }

    /// Read the current row's column `idx` as a 64-bit integer.
    ///
    /// # Errors
    /// `NullValue` on NULL, `TypeMismatch` on unparsable or foreign values.
    pub fn read_int64_at(&self, idx: usize) -> Result<i64, StoreError> {
        value::int64_at(&self.values, idx)
    }

    /// Read the current row's column `idx` as a timestamp.
    ///
    /// # Errors
    /// `NullValue` on NULL, `TypeMismatch` on unparsable or foreign values.
    pub fn read_timestamp_at(&self, idx: usize) -> Result<DateTime<Utc>, StoreError> {
        value::timestamp_at(&self.values, idx)
    }

    /// Fill `record` from the current row using its declared field map.
    ///
    /// Columns without a matching field are skipped, as are NULL columns (a
    /// direct typed read of the same column would fail with `NullValue`; the
    /// populate path deliberately does not).
    ///
    /// # Errors
    /// `UnsupportedType` for fields declared with an unmappable bind,
    /// `TypeMismatch` when a mapped column cannot be coerced.
    pub fn populate<T: Record>(&self, record: &mut T) -> Result<(), StoreError> {
        populate_record(&self.columns, &self.values, record)
    }

    /// Move the current row out of the reader's buffer.
    pub(crate) fn take_row(&mut self) -> Row {
        Row {
            columns: self.columns.clone(),
            values: std::mem::take(&mut self.values),
        }
    }
}

impl std::fmt::Debug for RowReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowReader")
            .field("columns", &self.columns)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

/// One fully-decoded row, as returned by `Runner::query_row`.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Column names of the row, in order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Look up a value by column name.
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|name| name == column_name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Read column `idx` as text; same coercions as the reader accessor.
    pub fn read_string_at(&self, idx: usize) -> Result<String, StoreError> {
        value::string_at(&self.values, idx)
    }

    /// Read column `idx` as a 64-bit integer.
    pub fn read_int64_at(&self, idx: usize) -> Result<i64, StoreError> {
        value::int64_at(&self.values, idx)
    }

    /// Read column `idx` as a timestamp.
    pub fn read_timestamp_at(&self, idx: usize) -> Result<DateTime<Utc>, StoreError> {
        value::timestamp_at(&self.values, idx)
    }

    /// Fill `record` from this row; see [`RowReader::populate`].
    pub fn populate<T: Record>(&self, record: &mut T) -> Result<(), StoreError> {
        populate_record(&self.columns, &self.values, record)
    }
}
