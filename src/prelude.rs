//! Convenient imports for common functionality.

pub use crate::{
    Bind, Field, Isolation, Prepared, Record, Row, RowReader, Runner, SqlValue, Store,
    StoreError, StoreKind, StoreSettings, TxOptions,
};
