//! Column-to-field mapping for application records.
//!
//! Instead of inspecting record types at runtime, each record declares a
//! static table of column bindings once; `populate` walks the row's columns
//! against that table.

use crate::error::StoreError;
use crate::value::{self, SqlValue};

/// How one column lands in a record field.
pub enum Bind<T> {
    /// Text-like field, filled through the string accessor.
    Text(fn(&mut T, String)),
    /// Integer field of any width, funneled through the int64 accessor.
    Int(fn(&mut T, i64)),
    /// Declared but unmappable field kind; reading its column fails with
    /// `UnsupportedType`.
    Unsupported,
}

/// One entry of a record's field map.
pub struct Field<T> {
    /// Result column name this field matches, exactly.
    pub column: &'static str,
    pub bind: Bind<T>,
}

/// A record that can be populated from a result row.
///
/// ```rust
/// use library_store::{Bind, Field, Record};
///
/// #[derive(Default)]
/// struct Book {
///     book_id: String,
///     page_count: i32,
/// }
///
/// impl Record for Book {
///     const FIELDS: &'static [Field<Self>] = &[
///         Field { column: "BookID", bind: Bind::Text(|b, v| b.book_id = v) },
///         Field { column: "PageCount", bind: Bind::Int(|b, v| b.page_count = v as i32) },
///     ];
/// }
/// ```
pub trait Record: Sized + 'static {
    /// The record's column bindings, built once and reused.
    const FIELDS: &'static [Field<Self>];
}

/// Fill `record` from a decoded row.
///
/// Columns with no matching field are skipped. NULL columns are skipped too,
/// never raised, even though a direct typed read would fail with `NullValue`.
pub(crate) fn populate_record<T: Record>(
    columns: &[String],
    values: &[SqlValue],
    record: &mut T,
) -> Result<(), StoreError> {
    for (idx, name) in columns.iter().enumerate() {
        let Some(value) = values.get(idx) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let Some(field) = T::FIELDS.iter().find(|f| f.column == name) else {
            continue;
        };
        match field.bind {
            Bind::Text(set) => set(record, value::string_at(values, idx)?),
            Bind::Int(set) => set(record, value::int64_at(values, idx)?),
            Bind::Unsupported => {
                return Err(StoreError::UnsupportedType {
                    column: name.clone(),
                });
            }
        }
    }
    Ok(())
}
