use std::sync::Arc;

use crate::error::StoreError;
use crate::postgres::{params, row};
use crate::reader::RowSource;
use crate::value::SqlValue;

/// One leased store connection.
///
/// Every execution scope (pinned transaction connection, dedicated connection,
/// fresh pool lease) is one of these, so the runner issues statements the same
/// way regardless of where they are routed.
pub(crate) enum Connection {
    Postgres(deadpool_postgres::Object),
    #[cfg(feature = "test-utils")]
    Memory(crate::test_utils::MemoryConn),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres(_) => f.debug_tuple("Postgres").field(&"<Object>").finish(),
            #[cfg(feature = "test-utils")]
            Self::Memory(conn) => f.debug_tuple("Memory").field(conn).finish(),
        }
    }
}

impl Connection {
    /// Execute a DML statement and return the affected row count.
    pub(crate) async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, StoreError> {
        match self {
            Connection::Postgres(obj) => {
                let stmt = obj.prepare_cached(sql).await?;
                let refs = params::as_refs(params);
                Ok(obj.execute(&stmt, &refs).await?)
            }
            #[cfg(feature = "test-utils")]
            Connection::Memory(conn) => conn.execute(sql, params),
        }
    }

    /// Run a SELECT and hand back the column names plus an open row source.
    ///
    /// The rows stream lazily; the caller owns draining and releasing.
    pub(crate) async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<(Arc<Vec<String>>, RowSource), StoreError> {
        match self {
            Connection::Postgres(obj) => {
                let stmt = obj.prepare_cached(sql).await?;
                let columns = Arc::new(row::statement_columns(&stmt));
                let refs = params::as_refs(params);
                let stream = obj.query_raw(&stmt, refs.iter().copied()).await?;
                Ok((columns, RowSource::Postgres(Box::pin(stream))))
            }
            #[cfg(feature = "test-utils")]
            Connection::Memory(conn) => conn.query(sql, params),
        }
    }

    /// Prepare a statement on this connection, surfacing syntax errors early.
    ///
    /// Postgres keeps the prepared statement in the connection's statement
    /// cache; later executions of the same SQL reuse it.
    pub(crate) async fn prepare(&mut self, sql: &str) -> Result<(), StoreError> {
        match self {
            Connection::Postgres(obj) => {
                obj.prepare_cached(sql).await?;
                Ok(())
            }
            #[cfg(feature = "test-utils")]
            Connection::Memory(conn) => conn.prepare(sql),
        }
    }

    /// Open a transaction with the given BEGIN statement.
    pub(crate) async fn begin(&mut self, begin_sql: &str) -> Result<(), StoreError> {
        match self {
            Connection::Postgres(obj) => {
                obj.batch_execute(begin_sql).await?;
                Ok(())
            }
            #[cfg(feature = "test-utils")]
            Connection::Memory(conn) => conn.begin(begin_sql),
        }
    }

    /// Commit the open transaction.
    pub(crate) async fn commit(&mut self) -> Result<(), StoreError> {
        match self {
            Connection::Postgres(obj) => {
                obj.batch_execute("COMMIT").await?;
                Ok(())
            }
            #[cfg(feature = "test-utils")]
            Connection::Memory(conn) => conn.commit(),
        }
    }

    /// Roll back the open transaction.
    pub(crate) async fn rollback(&mut self) -> Result<(), StoreError> {
        match self {
            Connection::Postgres(obj) => {
                obj.batch_execute("ROLLBACK").await?;
                Ok(())
            }
            #[cfg(feature = "test-utils")]
            Connection::Memory(conn) => conn.rollback(),
        }
    }

    /// Remove this connection from the pool and close it.
    ///
    /// Used when the connection's session state is unknown (an interrupted
    /// transaction); the server rolls back whatever was open when the socket
    /// closes, and the pool never sees the connection again.
    pub(crate) fn detach(self) {
        match self {
            Connection::Postgres(obj) => {
                let _client = deadpool_postgres::Object::take(obj);
            }
            #[cfg(feature = "test-utils")]
            Connection::Memory(conn) => conn.detach(),
        }
    }
}
