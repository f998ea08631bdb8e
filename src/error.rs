use deadpool::managed::PoolError;
use thiserror::Error;

/// Errors surfaced by the store handle, the runner, and row reading.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Pool(#[from] PoolError<tokio_postgres::Error>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store validation failed: {0}")]
    Validation(String),

    #[error("connection lease failed: {0}")]
    Lease(String),

    #[error("stale connection: {0}")]
    StaleConnection(String),

    #[error("transaction state error: {0}")]
    TransactionState(String),

    #[error("SQL execution error: {0}")]
    Execution(String),

    #[error("operation canceled")]
    Canceled,

    #[error("null value in column {column}")]
    NullValue { column: usize },

    #[error("cannot read column {column} as {wanted}")]
    TypeMismatch { column: usize, wanted: &'static str },

    #[error("unsupported field kind for column {column}")]
    UnsupportedType { column: String },
}

impl StoreError {
    /// Whether a lease failed on a connection the pool handed back dead.
    /// `Runner::with_connection` retries exactly once on this condition.
    #[must_use]
    pub fn is_stale_connection(&self) -> bool {
        match self {
            StoreError::StaleConnection(_) => true,
            StoreError::Pool(PoolError::Backend(e)) => e.is_closed(),
            _ => false,
        }
    }
}
