use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::StoreError;
use crate::reader::{Row, RowReader};
use crate::store::Store;
use crate::value::SqlValue;

/// Transaction isolation levels understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    fn as_sql(self) -> &'static str {
        match self {
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead => "REPEATABLE READ",
            Isolation::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options applied when a transaction is opened.
///
/// Only the outermost [`Runner::transact`] call uses them; nested calls join
/// the open transaction and their options are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<Isolation>,
    pub read_only: bool,
}

impl TxOptions {
    fn begin_sql(self) -> String {
        let mut sql = String::from("BEGIN");
        if let Some(level) = self.isolation {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        if self.read_only {
            sql.push_str(" READ ONLY");
        }
        sql
    }
}

/// A prepared statement.
///
/// Carries the SQL; each connection keeps the parsed statement in its own
/// statement cache, so re-executing by SQL reuses the prepared form without
/// pinning the statement to one connection.
#[derive(Debug, Clone)]
pub struct Prepared {
    sql: Arc<str>,
}

impl Prepared {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Per-request execution coordinator.
///
/// A runner belongs to exactly one request's call chain: its transaction and
/// connection state is mutated in place, so it must never be shared across
/// concurrent chains. The [`Store`] underneath is the shared, concurrency-safe
/// part.
///
/// Statements route to the active transaction if one is open, else to the
/// dedicated connection if one is leased, else to the pool. Call sites stay
/// transaction-agnostic.
pub struct Runner {
    store: Store,
    tx: Option<TxGuard>,
    conn: Option<Connection>,
    depth: u32,
    cancel: CancellationToken,
}

/// Holds the connection a transaction is pinned to.
struct TxGuard {
    conn: Option<Connection>,
    from_dedicated: bool,
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        // Only reached when the runner is dropped mid-transaction (a panicked
        // or abandoned body). The connection still has an open transaction, so
        // it must not go back to the pool; closing it makes the server roll
        // back.
        if let Some(conn) = self.conn.take() {
            conn.detach();
        }
    }
}

enum Routed<'a> {
    Held(&'a mut Connection),
    Leased(Connection),
}

impl Runner {
    /// Create the runner for one request, bound to that request's
    /// cancellation token.
    #[must_use]
    pub fn new(store: &Store, cancel: CancellationToken) -> Runner {
        Runner {
            store: store.clone(),
            tx: None,
            conn: None,
            depth: 0,
            cancel,
        }
    }

    /// Whether a transaction is open on this runner.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Run a SELECT and return a [`RowReader`] over its result.
    ///
    /// At pool scope the reader owns the leased connection and returns it to
    /// the pool when dropped.
    ///
    /// # Errors
    /// Statement preparation/execution failures, or `Canceled`.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<RowReader, StoreError> {
        let cancel = self.cancel.clone();
        match self.route().await? {
            Routed::Held(conn) => {
                let (columns, source) = with_cancel(&cancel, conn.query(sql, params)).await?;
                Ok(RowReader::new(columns, source, cancel, None))
            }
            Routed::Leased(mut conn) => {
                let (columns, source) = with_cancel(&cancel, conn.query(sql, params)).await?;
                Ok(RowReader::new(columns, source, cancel, Some(conn)))
            }
        }
    }

    /// Run a SELECT expected to produce at most one row.
    ///
    /// # Errors
    /// Statement failures, or the scan error if decoding the row failed.
    pub async fn query_row(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<Row>, StoreError> {
        let mut reader = self.query(sql, params).await?;
        if reader.scan_next().await {
            Ok(Some(reader.take_row()))
        } else {
            match reader.take_error() {
                Some(err) => Err(err),
                None => Ok(None),
            }
        }
    }

    /// Execute a DML statement and return the affected row count.
    ///
    /// # Errors
    /// Statement failures, or `Canceled`.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        let cancel = self.cancel.clone();
        match self.route().await? {
            Routed::Held(conn) => with_cancel(&cancel, conn.execute(sql, params)).await,
            Routed::Leased(mut conn) => with_cancel(&cancel, conn.execute(sql, params)).await,
        }
    }

    /// Prepare a statement on the current execution scope.
    ///
    /// Surfaces syntax errors early; the returned handle replays through
    /// [`query_prepared`](Runner::query_prepared) and
    /// [`execute_prepared`](Runner::execute_prepared) with normal routing.
    ///
    /// # Errors
    /// Preparation failures, or `Canceled`.
    pub async fn prepare(&mut self, sql: &str) -> Result<Prepared, StoreError> {
        let cancel = self.cancel.clone();
        match self.route().await? {
            Routed::Held(conn) => with_cancel(&cancel, conn.prepare(sql)).await?,
            Routed::Leased(mut conn) => with_cancel(&cancel, conn.prepare(sql)).await?,
        }
        Ok(Prepared {
            sql: Arc::from(sql),
        })
    }

    /// Run a prepared SELECT.
    ///
    /// # Errors
    /// Same failure modes as [`query`](Runner::query).
    pub async fn query_prepared(
        &mut self,
        stmt: &Prepared,
        params: &[SqlValue],
    ) -> Result<RowReader, StoreError> {
        let sql = stmt.sql.clone();
        self.query(&sql, params).await
    }

    /// Run a prepared DML statement.
    ///
    /// # Errors
    /// Same failure modes as [`execute`](Runner::execute).
    pub async fn execute_prepared(
        &mut self,
        stmt: &Prepared,
        params: &[SqlValue],
    ) -> Result<u64, StoreError> {
        let sql = stmt.sql.clone();
        self.execute(&sql, params).await
    }

    /// Run a SELECT whose result is one text value.
    ///
    /// Returns `None` when no row matched; a scan failure after a drained
    /// cursor is surfaced rather than swallowed.
    ///
    /// # Errors
    /// Statement failures, or `NullValue`/`TypeMismatch` from the read.
    pub async fn query_string_value(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<String>, StoreError> {
        let mut reader = self.query(sql, params).await?;
        let mut result = None;
        if reader.scan_next().await {
            result = Some(reader.read_string_at(0)?);
        }
        if let Some(err) = reader.take_error() {
            return Err(err);
        }
        Ok(result)
    }

    /// Run a SELECT whose result is one 64-bit integer value.
    ///
    /// # Errors
    /// Statement failures, or `NullValue`/`TypeMismatch` from the read.
    pub async fn query_int64_value(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<i64>, StoreError> {
        let mut reader = self.query(sql, params).await?;
        let mut result = None;
        if reader.scan_next().await {
            result = Some(reader.read_int64_at(0)?);
        }
        if let Some(err) = reader.take_error() {
            return Err(err);
        }
        Ok(result)
    }

    /// Run a SELECT whose result is one timestamp value.
    ///
    /// # Errors
    /// Statement failures, or `NullValue`/`TypeMismatch` from the read.
    pub async fn query_timestamp_value(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>, StoreError> {
        let mut reader = self.query(sql, params).await?;
        let mut result = None;
        if reader.scan_next().await {
            result = Some(reader.read_timestamp_at(0)?);
        }
        if let Some(err) = reader.take_error() {
            return Err(err);
        }
        Ok(result)
    }

    /// Run `body` inside a transaction.
    ///
    /// The first call on a runner opens a transaction (on the dedicated
    /// connection if one is held, else a fresh lease) with the supplied
    /// options. Nested calls join the open transaction by counting; no
    /// savepoints are created, so an inner failure rolls back everything, not
    /// just the inner unit of work. Any error at any depth rolls back the
    /// whole transaction exactly once and resets the nesting state; that
    /// decision is final even if an enclosing level would have continued. The
    /// commit happens when the outermost level completes without error.
    ///
    /// If `body`'s future is dropped or panics, discard the runner: dropping
    /// it detaches the pinned connection from the pool and the server rolls
    /// the transaction back.
    ///
    /// # Errors
    /// Begin/commit failures, `body`'s own error, or `Canceled` when a fired
    /// cancellation is detected at commit time.
    pub async fn transact<T, F>(&mut self, options: TxOptions, body: F) -> Result<T, StoreError>
    where
        F: for<'r> FnOnce(&'r mut Runner) -> BoxFuture<'r, Result<T, StoreError>>,
    {
        if self.tx.is_none() {
            let (conn, from_dedicated) = match self.conn.take() {
                Some(conn) => (conn, true),
                None => (self.lease_with_cancel().await?, false),
            };
            let mut guard = TxGuard {
                conn: Some(conn),
                from_dedicated,
            };
            let begin_sql = options.begin_sql();
            let begun = match guard.conn.as_mut() {
                Some(conn) => with_cancel(&self.cancel, conn.begin(&begin_sql)).await,
                None => Err(StoreError::TransactionState(
                    "transaction connection missing".to_string(),
                )),
            };
            if let Err(err) = begun {
                self.reclaim(guard);
                return Err(err);
            }
            tracing::debug!(begin = %begin_sql, "transaction started");
            self.tx = Some(guard);
            self.depth = 1;
        } else {
            // Nested level joins the open transaction; its options are ignored.
            self.depth += 1;
        }

        match body(self).await {
            Err(err) => {
                // The first level to observe a failure rolls the whole
                // transaction back; enclosing levels find the state cleared
                // and only propagate the error.
                if let Some(mut guard) = self.tx.take() {
                    self.depth = 0;
                    if let Some(mut conn) = guard.conn.take() {
                        match conn.rollback().await {
                            Ok(()) => {
                                tracing::debug!("transaction rolled back");
                                if guard.from_dedicated {
                                    self.conn = Some(conn);
                                }
                            }
                            Err(rollback_err) => {
                                tracing::debug!(
                                    error = %rollback_err,
                                    "rollback failed, detaching connection"
                                );
                                conn.detach();
                            }
                        }
                    }
                }
                Err(err)
            }
            Ok(value) => {
                if self.tx.is_none() {
                    return Err(StoreError::TransactionState(
                        "transaction already rolled back or committed".to_string(),
                    ));
                }
                self.depth -= 1;
                if self.depth > 0 {
                    return Ok(value);
                }
                let Some(mut guard) = self.tx.take() else {
                    return Err(StoreError::TransactionState(
                        "transaction already rolled back or committed".to_string(),
                    ));
                };
                let Some(mut conn) = guard.conn.take() else {
                    return Err(StoreError::TransactionState(
                        "transaction connection missing".to_string(),
                    ));
                };
                match conn.commit().await {
                    Ok(()) => {
                        tracing::debug!("transaction committed");
                        if guard.from_dedicated {
                            self.conn = Some(conn);
                        }
                        Ok(value)
                    }
                    Err(err) => {
                        conn.detach();
                        // A commit racing a fired cancellation reports the
                        // cancellation, not the backend's state error.
                        if self.cancel.is_cancelled() {
                            Err(StoreError::Canceled)
                        } else {
                            Err(err)
                        }
                    }
                }
            }
        }
    }

    /// Run `body` against one dedicated connection.
    ///
    /// Inside a transaction or an existing lease this is reentrant and `body`
    /// just runs on the current scope. Otherwise one connection is leased
    /// (retrying exactly once if the pool hands back a stale one), `body`
    /// runs with every statement routed to it, and the connection is released
    /// on every exit path. Release goes through the pool's return mechanism
    /// and cannot itself fail.
    ///
    /// # Errors
    /// Lease failures, or whatever `body` returns.
    pub async fn with_connection<T, F>(&mut self, body: F) -> Result<T, StoreError>
    where
        F: for<'r> FnOnce(&'r mut Runner) -> BoxFuture<'r, Result<T, StoreError>>,
    {
        if self.tx.is_some() || self.conn.is_some() {
            return body(self).await;
        }

        let conn = match self.lease_with_cancel().await {
            Ok(conn) => conn,
            Err(err) if err.is_stale_connection() => {
                tracing::debug!(error = %err, "stale connection on lease, retrying once");
                self.lease_with_cancel().await?
            }
            Err(err) => return Err(err),
        };

        self.conn = Some(conn);
        let result = body(self).await;
        // Release on every exit path; dropping the lease hands it back.
        drop(self.conn.take());
        result
    }

    async fn route(&mut self) -> Result<Routed<'_>, StoreError> {
        if self.tx.is_none() && self.conn.is_none() {
            return Ok(Routed::Leased(self.lease_with_cancel().await?));
        }
        if let Some(guard) = self.tx.as_mut() {
            let conn = guard.conn.as_mut().ok_or_else(|| {
                StoreError::TransactionState("transaction connection missing".to_string())
            })?;
            return Ok(Routed::Held(conn));
        }
        let conn = self
            .conn
            .as_mut()
            .expect("conn present when tx absent and route not leased");
        Ok(Routed::Held(conn))
    }

    async fn lease_with_cancel(&self) -> Result<Connection, StoreError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(StoreError::Canceled),
            leased = self.store.lease() => leased,
        }
    }

    fn reclaim(&mut self, mut guard: TxGuard) {
        if let Some(conn) = guard.conn.take() {
            if guard.from_dedicated {
                self.conn = Some(conn);
            }
            // A fresh lease just goes back to the pool.
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("store", &self.store.name())
            .field("depth", &self.depth)
            .field("dedicated", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

async fn with_cancel<T>(
    cancel: &CancellationToken,
    op: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::select! {
        () = cancel.cancelled() => Err(StoreError::Canceled),
        result = op => result,
    }
}
