//! Scripted in-memory backend for exercising the runner, reader, and
//! bootstrap without a live store.
//!
//! Tests script results and failures up front, drive the public API, then
//! assert against the recorded event log:
//!
//! ```rust
//! use library_store::test_utils::MemoryStore;
//! use library_store::SqlValue;
//!
//! let mem = MemoryStore::new();
//! mem.script_query("SELECT name FROM user", &["name"], vec![
//!     vec![SqlValue::Text("alice".into())],
//! ]);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::reader::RowSource;
use crate::store::SHOW_TIMEZONE_SQL;
use crate::value::SqlValue;

/// One entry of the recorded backend activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    Lease { conn: usize },
    Release { conn: usize },
    Detach { conn: usize },
    Begin { conn: usize, sql: String },
    Commit { conn: usize },
    Rollback { conn: usize },
    Statement { conn: usize, sql: String },
    Prepare { conn: usize, sql: String },
}

/// How a scripted lease attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseFailure {
    /// The pool handed back a dead connection; `with_connection` retries this
    /// once.
    Stale,
    /// Any other lease failure; never retried.
    Unavailable,
}

#[derive(Debug, Clone, Default)]
struct Script {
    columns: Vec<String>,
    rows: Vec<Result<Vec<SqlValue>, String>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<MemoryEvent>,
    queries: HashMap<String, VecDeque<Script>>,
    executes: HashMap<String, VecDeque<u64>>,
    statement_failures: HashMap<String, VecDeque<String>>,
    lease_failures: VecDeque<LeaseFailure>,
    commit_failures: VecDeque<String>,
    next_conn: usize,
    closed: bool,
}

/// Scripted stand-in for the pooled store backend.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A fresh store whose sessions report a `UTC` timezone, so bootstrap
    /// validation passes unless a test overrides it.
    #[must_use]
    pub fn new() -> MemoryStore {
        let store = MemoryStore {
            state: Arc::default(),
        };
        store.script_session_timezone("UTC");
        store
    }

    /// Script the result of one query; repeated scripts for the same SQL are
    /// consumed in order, and the last one repeats.
    pub fn script_query(&self, sql: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) {
        self.push_script(
            sql,
            Script {
                columns: to_owned(columns),
                rows: rows.into_iter().map(Ok).collect(),
            },
        );
    }

    /// Script a query that yields `rows`, then fails mid-drain with `error`.
    pub fn script_query_failing(
        &self,
        sql: &str,
        columns: &[&str],
        rows: Vec<Vec<SqlValue>>,
        error: &str,
    ) {
        let mut scripted: Vec<Result<Vec<SqlValue>, String>> =
            rows.into_iter().map(Ok).collect();
        scripted.push(Err(error.to_string()));
        self.push_script(
            sql,
            Script {
                columns: to_owned(columns),
                rows: scripted,
            },
        );
    }

    /// Replace the session timezone every connection reports.
    pub fn script_session_timezone(&self, timezone: &str) {
        let script = Script {
            columns: vec!["TimeZone".to_string()],
            rows: vec![Ok(vec![SqlValue::Text(timezone.to_string())])],
        };
        let mut state = self.lock();
        let queue = state.queries.entry(SHOW_TIMEZONE_SQL.to_string()).or_default();
        queue.clear();
        queue.push_back(script);
    }

    /// Script the affected-row count of one DML statement.
    pub fn script_execute(&self, sql: &str, rows_affected: u64) {
        self.lock()
            .executes
            .entry(sql.to_string())
            .or_default()
            .push_back(rows_affected);
    }

    /// Make the next occurrence of `sql` (statement, prepare, or BEGIN) fail.
    pub fn fail_statement(&self, sql: &str, message: &str) {
        self.lock()
            .statement_failures
            .entry(sql.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    /// Make the next lease attempt fail.
    pub fn fail_next_lease(&self, failure: LeaseFailure) {
        self.lock().lease_failures.push_back(failure);
    }

    /// Make the next commit fail.
    pub fn fail_next_commit(&self, message: &str) {
        self.lock().commit_failures.push_back(message.to_string());
    }

    /// Everything the backend has been asked to do, in order.
    #[must_use]
    pub fn events(&self) -> Vec<MemoryEvent> {
        self.lock().events.clone()
    }

    /// Forget recorded events (typically right after bootstrap).
    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Scripted lease failures not yet consumed.
    #[must_use]
    pub fn pending_lease_failures(&self) -> usize {
        self.lock().lease_failures.len()
    }

    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.count(|e| matches!(e, MemoryEvent::Lease { .. }))
    }

    #[must_use]
    pub fn begin_count(&self) -> usize {
        self.count(|e| matches!(e, MemoryEvent::Begin { .. }))
    }

    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.count(|e| matches!(e, MemoryEvent::Commit { .. }))
    }

    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.count(|e| matches!(e, MemoryEvent::Rollback { .. }))
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
    }

    pub(crate) fn lease(&self) -> Result<MemoryConn, StoreError> {
        let mut state = self.lock();
        if state.closed {
            return Err(StoreError::Lease("memory store is closed".to_string()));
        }
        if let Some(failure) = state.lease_failures.pop_front() {
            return Err(match failure {
                LeaseFailure::Stale => {
                    StoreError::StaleConnection("scripted stale lease".to_string())
                }
                LeaseFailure::Unavailable => {
                    StoreError::Lease("scripted lease failure".to_string())
                }
            });
        }
        state.next_conn += 1;
        let id = state.next_conn;
        state.events.push(MemoryEvent::Lease { conn: id });
        Ok(MemoryConn {
            id,
            state: Arc::clone(&self.state),
            detached: false,
        })
    }

    fn push_script(&self, sql: &str, script: Script) {
        self.lock()
            .queries
            .entry(sql.to_string())
            .or_default()
            .push_back(script);
    }

    fn count(&self, pred: impl Fn(&MemoryEvent) -> bool) -> usize {
        self.lock().events.iter().filter(|e| pred(e)).count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One leased scripted connection.
#[derive(Debug)]
pub struct MemoryConn {
    id: usize,
    state: Arc<Mutex<MemoryState>>,
    detached: bool,
}

impl MemoryConn {
    pub(crate) fn execute(
        &mut self,
        sql: &str,
        _params: &[SqlValue],
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        state.events.push(MemoryEvent::Statement {
            conn: self.id,
            sql: sql.to_string(),
        });
        if let Some(message) = pop_failure(&mut state, sql) {
            return Err(StoreError::Execution(message));
        }
        Ok(pop_or_repeat(&mut state.executes, sql).unwrap_or(0))
    }

    pub(crate) fn query(
        &mut self,
        sql: &str,
        _params: &[SqlValue],
    ) -> Result<(Arc<Vec<String>>, RowSource), StoreError> {
        let mut state = self.lock();
        state.events.push(MemoryEvent::Statement {
            conn: self.id,
            sql: sql.to_string(),
        });
        if let Some(message) = pop_failure(&mut state, sql) {
            return Err(StoreError::Execution(message));
        }
        let script = pop_or_repeat(&mut state.queries, sql).unwrap_or_default();
        let rows: VecDeque<Result<Vec<SqlValue>, StoreError>> = script
            .rows
            .into_iter()
            .map(|row| row.map_err(StoreError::Execution))
            .collect();
        Ok((Arc::new(script.columns), RowSource::Buffered(rows)))
    }

    pub(crate) fn prepare(&mut self, sql: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.events.push(MemoryEvent::Prepare {
            conn: self.id,
            sql: sql.to_string(),
        });
        if let Some(message) = pop_failure(&mut state, sql) {
            return Err(StoreError::Execution(message));
        }
        Ok(())
    }

    pub(crate) fn begin(&mut self, sql: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.events.push(MemoryEvent::Begin {
            conn: self.id,
            sql: sql.to_string(),
        });
        if let Some(message) = pop_failure(&mut state, sql) {
            return Err(StoreError::Execution(message));
        }
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.events.push(MemoryEvent::Commit { conn: self.id });
        if let Some(message) = state.commit_failures.pop_front() {
            return Err(StoreError::Execution(message));
        }
        Ok(())
    }

    pub(crate) fn rollback(&mut self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.events.push(MemoryEvent::Rollback { conn: self.id });
        Ok(())
    }

    pub(crate) fn detach(mut self) {
        self.detached = true;
        let id = self.id;
        self.lock().events.push(MemoryEvent::Detach { conn: id });
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        if !self.detached {
            let id = self.id;
            self.lock().events.push(MemoryEvent::Release { conn: id });
        }
    }
}

fn to_owned(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| (*c).to_string()).collect()
}

fn pop_or_repeat<T: Clone>(map: &mut HashMap<String, VecDeque<T>>, sql: &str) -> Option<T> {
    let queue = map.get_mut(sql)?;
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

fn pop_failure(state: &mut MemoryState, sql: &str) -> Option<String> {
    let queue = state.statement_failures.get_mut(sql)?;
    let message = queue.pop_front();
    if queue.is_empty() {
        state.statement_failures.remove(sql);
    }
    message
}
