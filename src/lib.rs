//! Pooled Postgres execution/transaction core for the library service.
//!
//! The crate has three moving parts:
//!
//! - [`Store`]: the process-wide pooled handle, opened and validated once at
//!   startup (reachable, session timezone `UTC`) and shared by every request.
//! - [`Runner`]: a per-request coordinator that routes `query` / `query_row` /
//!   `execute` / `prepare` to the active transaction, a dedicated connection,
//!   or the pool, in that order, so data-access code never branches on scope.
//!   `transact` nests by counting (all-or-nothing, no savepoints) and
//!   `with_connection` pins one pooled connection across statements.
//! - [`RowReader`]: a cursor over one query result with checked typed access
//!   and record population through a declared field map.
//!
//! ```rust,no_run
//! use library_store::{Runner, SqlValue, Store, StoreSettings, TxOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(settings: StoreSettings) -> Result<(), library_store::StoreError> {
//! let store = Store::initialize(settings).await?;
//!
//! // Per request:
//! let mut runner = Runner::new(&store, CancellationToken::new());
//! runner
//!     .transact(TxOptions::default(), |run| {
//!         Box::pin(async move {
//!             run.execute(
//!                 "UPDATE book SET Copies = Copies - 1 WHERE BookID = $1",
//!                 &[SqlValue::Text("b1".into())],
//!             )
//!             .await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! # Ok(()) }
//! ```

mod connection;
mod error;
mod postgres;
mod reader;
mod record;
mod runner;
mod store;
mod value;

pub mod prelude;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use error::StoreError;
pub use reader::{Row, RowReader};
pub use record::{Bind, Field, Record};
pub use runner::{Isolation, Prepared, Runner, TxOptions};
pub use store::{Store, StoreKind, StoreSettings};
pub use value::SqlValue;
