use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use deadpool_postgres::{Manager, ManagerConfig, RecyclingMethod};
use serde::Deserialize;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::StoreError;
use crate::reader::RowReader;

/// How often the pooled handle trims idle and aged-out connections.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Session timezone probe issued during bootstrap validation.
pub(crate) const SHOW_TIMEZONE_SQL: &str = "SHOW timezone";

/// The store type accepted at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum StoreKind {
    Postgres,
    /// Scripted in-memory backend for tests.
    #[cfg(feature = "test-utils")]
    Memory,
}

/// Bootstrap configuration for the pooled store handle.
///
/// Field names follow the deployment's `database.*` configuration keys; the
/// (out-of-scope) config loader deserializes straight into this.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// Label for this handle in logs.
    pub name: String,
    pub store_type: String,
    pub connection_string: String,
    pub max_idle_connections: usize,
    pub max_open_connections: usize,
    pub connection_max_lifetime: Duration,
}

/// The process-wide pooled store handle.
///
/// Created once at startup, cheap to clone, safe to share across every
/// request's `Runner`. Pool limits are fixed at bootstrap. Tear down with
/// [`close`](Store::close) at process shutdown.
#[derive(Clone)]
pub struct Store {
    name: Arc<str>,
    backend: Backend,
    sweeper: Option<Arc<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
enum Backend {
    Postgres(deadpool_postgres::Pool),
    #[cfg(feature = "test-utils")]
    Memory(crate::test_utils::MemoryStore),
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.backend {
            Backend::Postgres(_) => "postgres",
            #[cfg(feature = "test-utils")]
            Backend::Memory(_) => "memory",
        };
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open and validate the pooled store handle.
    ///
    /// Applies the configured pool limits, then verifies the store is
    /// reachable and that the session timezone is `UTC` before the process
    /// accepts traffic. Validation failure closes the handle and propagates;
    /// it is a fatal startup condition, never retried.
    ///
    /// # Errors
    /// `StoreError::Config` for empty or unusable settings,
    /// `StoreError::Validation` when the store is unreachable or reports a
    /// session timezone other than `UTC`.
    pub async fn initialize(settings: StoreSettings) -> Result<Store, StoreError> {
        if settings.store_type.is_empty() {
            return Err(StoreError::Config("store type is empty".to_string()));
        }
        if settings.connection_string.is_empty() {
            return Err(StoreError::Config("connection string is empty".to_string()));
        }
        let kind = StoreKind::from_str(&settings.store_type, true).map_err(|_| {
            StoreError::Config(format!("unknown store type '{}'", settings.store_type))
        })?;

        let name: Arc<str> = Arc::from(settings.name.as_str());
        let store = match kind {
            StoreKind::Postgres => {
                let pg_config: tokio_postgres::Config =
                    settings.connection_string.parse().map_err(|e| {
                        StoreError::Config(format!("invalid connection string: {e}"))
                    })?;
                let manager = Manager::from_config(
                    pg_config,
                    NoTls,
                    ManagerConfig {
                        recycling_method: RecyclingMethod::Fast,
                    },
                );
                let pool = deadpool_postgres::Pool::builder(manager)
                    .max_size(settings.max_open_connections)
                    .runtime(deadpool::Runtime::Tokio1)
                    .build()
                    .map_err(|e| {
                        StoreError::Config(format!("failed to build store pool: {e}"))
                    })?;
                let sweeper = spawn_idle_sweeper(
                    pool.clone(),
                    settings.max_idle_connections,
                    settings.connection_max_lifetime,
                );
                Store {
                    name,
                    backend: Backend::Postgres(pool),
                    sweeper: Some(Arc::new(sweeper)),
                }
            }
            #[cfg(feature = "test-utils")]
            StoreKind::Memory => Store {
                name,
                backend: Backend::Memory(crate::test_utils::MemoryStore::new()),
                sweeper: None,
            },
        };

        if let Err(err) = store.validate().await {
            tracing::error!(store = %store.name, error = %err, "store validation failed");
            store.close();
            return Err(err);
        }
        tracing::info!(store = %store.name, "store handle ready");
        Ok(store)
    }

    /// Label this handle was initialized under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the handle: stop the idle sweeper and shut the pool down.
    pub fn close(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
        match &self.backend {
            Backend::Postgres(pool) => pool.close(),
            #[cfg(feature = "test-utils")]
            Backend::Memory(mem) => mem.close(),
        }
        tracing::info!(store = %self.name, "store handle closed");
    }

    /// Lease one connection from the pool.
    pub(crate) async fn lease(&self) -> Result<Connection, StoreError> {
        match &self.backend {
            Backend::Postgres(pool) => match pool.get().await {
                Ok(obj) => Ok(Connection::Postgres(obj)),
                Err(deadpool::managed::PoolError::Backend(e)) if e.is_closed() => {
                    Err(StoreError::StaleConnection(e.to_string()))
                }
                Err(e) => Err(StoreError::Pool(e)),
            },
            #[cfg(feature = "test-utils")]
            Backend::Memory(mem) => mem.lease().map(Connection::Memory),
        }
    }

    async fn validate(&self) -> Result<(), StoreError> {
        let mut conn = self.lease().await?;

        // Reachability probe.
        conn.execute("SELECT 1", &[]).await?;

        let timezone = read_session_timezone(&mut conn).await?;
        if timezone != "UTC" {
            return Err(StoreError::Validation(format!(
                "store session timezone must be 'UTC', currently it is '{timezone}'"
            )));
        }
        Ok(())
    }
}

#[cfg(feature = "test-utils")]
impl Store {
    /// Build a store over a pre-scripted memory backend, running the same
    /// bootstrap validation as [`initialize`](Store::initialize).
    ///
    /// # Errors
    /// Propagates validation failures after closing the backend, exactly like
    /// the production path.
    pub async fn initialize_memory(
        name: &str,
        memory: crate::test_utils::MemoryStore,
    ) -> Result<Store, StoreError> {
        let store = Store {
            name: Arc::from(name),
            backend: Backend::Memory(memory),
            sweeper: None,
        };
        if let Err(err) = store.validate().await {
            store.close();
            return Err(err);
        }
        Ok(store)
    }
}

/// Read the session timezone through the regular query path.
async fn read_session_timezone(conn: &mut Connection) -> Result<String, StoreError> {
    let (columns, source) = conn.query(SHOW_TIMEZONE_SQL, &[]).await?;
    let mut reader = RowReader::new(columns, source, CancellationToken::new(), None);
    if !reader.scan_next().await {
        return Err(match reader.take_error() {
            Some(err) => err,
            None => StoreError::Validation("store reported no session timezone".to_string()),
        });
    }
    reader.read_string_at(0)
}

/// Enforce `max_idle_connections` and `connection_max_lifetime`.
///
/// The pool only takes a `max_size`; surplus idle connections and connections
/// past their lifetime are trimmed here, from a task owned by the handle.
fn spawn_idle_sweeper(
    pool: deadpool_postgres::Pool,
    max_idle: usize,
    max_lifetime: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if pool.is_closed() {
                break;
            }
            sweep_idle(&pool, max_idle, max_lifetime);
        }
    })
}

fn sweep_idle(pool: &deadpool_postgres::Pool, max_idle: usize, max_lifetime: Duration) {
    let mut kept = 0usize;
    let _ = pool.retain(|_, metrics| {
        // A zero lifetime means connections never age out.
        if !max_lifetime.is_zero() && metrics.age() >= max_lifetime {
            return false;
        }
        if kept < max_idle {
            kept += 1;
            return true;
        }
        false
    });
    tracing::trace!(kept, "idle sweep complete");
}
