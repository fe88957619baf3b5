//! IO-valued query execution over the pool.
//!
//! Concurrency model:
//! - Each `run_query` acquires a pooled connection, runs one statement
//!   (possibly returning several result sets), and releases the connection
//!   when the delivered [`SessionState`] drops.
//! - Queries submitted through the same session are NOT serialized; two
//!   concurrent `run_query` calls may hold two pooled connections at once,
//!   subject to pool availability.
//! - There is no transaction continuity or ordering across calls. Ordered
//!   multi-statement work belongs in a single `run_query` issuing
//!   `BEGIN; ...; COMMIT;` with `multi_queries` enabled in the config.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mysql_async::prelude::Queryable;

use aqueduct_io::{codes, Error, Result, IO};

use super::pool::{driver_error, MySqlPool};
use super::state::{ResultSet, SessionState};
use super::types::{from_mysql_value, from_wire_value};

/// Timeout applied by the shorthand `run_query`/`run_query_with` calls.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

static INSTANCE_COUNT: AtomicUsize = AtomicUsize::new(0);
static QUERY_SEQ: AtomicU64 = AtomicU64::new(0);

/// A thin query executor bound to a pool.
pub struct MonadicSession {
    pool: Arc<MySqlPool>,
}

impl MonadicSession {
    pub fn new(pool: Arc<MySqlPool>) -> Self {
        let count = INSTANCE_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(instances = count, "monadic session created");
        Self { pool }
    }

    /// Live session instances; used by tests to assert against leaks.
    pub fn instance_count() -> usize {
        INSTANCE_COUNT.load(Ordering::SeqCst)
    }

    /// Run one SQL statement with the default acquisition timeout.
    pub fn run_query(&self, sql: impl Into<String>) -> IO<SessionState> {
        self.run_query_timeout(sql, DEFAULT_QUERY_TIMEOUT)
    }

    /// Run one SQL statement; the timeout bounds connection acquisition.
    ///
    /// Driver-level execution errors do not fail the IO: they are recorded
    /// on the delivered state (`error`, `diagnostics`) so shape adaptors
    /// can map them. Acquisition errors fail the IO directly.
    pub fn run_query_timeout(&self, sql: impl Into<String>, timeout: Duration) -> IO<SessionState> {
        let pool = Arc::clone(&self.pool);
        let sql: Arc<str> = Arc::from(sql.into());
        IO::from_thunk(move || {
            let pool = Arc::clone(&pool);
            let sql = Arc::clone(&sql);
            async move {
                let qid = QUERY_SEQ.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(qid, "run_query enter");
                let mut state = pool.acquire(timeout).run().await?;
                execute_sql(&mut state, &sql).await;
                tracing::trace!(qid, error = state.error, "run_query complete");
                Ok(state)
            }
        })
    }

    /// Run a statement whose SQL is computed under the acquired connection,
    /// with the default timeout.
    pub fn run_query_with<G>(&self, generator: G) -> IO<SessionState>
    where
        G: Fn(&mut mysql_async::Conn) -> Result<String> + Send + Sync + 'static,
    {
        self.run_query_with_timeout(generator, DEFAULT_QUERY_TIMEOUT)
    }

    /// Generator variant: the SQL is produced by `generator` while holding
    /// the pooled connection, so connection-scoped helpers (server version,
    /// character set, identifier quoting) are available. A generator error
    /// propagates and releases the connection.
    pub fn run_query_with_timeout<G>(&self, generator: G, timeout: Duration) -> IO<SessionState>
    where
        G: Fn(&mut mysql_async::Conn) -> Result<String> + Send + Sync + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let generator = Arc::new(generator);
        IO::from_thunk(move || {
            let pool = Arc::clone(&pool);
            let generator = Arc::clone(&generator);
            async move {
                let qid = QUERY_SEQ.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(qid, "run_query(generator) enter");
                let mut state = pool.acquire(timeout).run().await?;
                let sql = {
                    let conn = state.conn.as_mut().ok_or_else(|| {
                        Error::new(
                            codes::sql_exec::SQL_FAILED,
                            "session state has no connection",
                        )
                    })?;
                    generator(&mut *conn)?
                };
                execute_sql(&mut state, &sql).await;
                tracing::trace!(qid, error = state.error, "run_query(generator) complete");
                Ok(state)
            }
        })
    }
}

impl Drop for MonadicSession {
    fn drop(&mut self) {
        let count = INSTANCE_COUNT.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::trace!(instances = count, "monadic session dropped");
    }
}

/// Execute `sql` on the state's connection, buffering every result set.
/// Errors are recorded in the state rather than returned.
async fn execute_sql(state: &mut SessionState, sql: &str) {
    let Some(conn) = state.conn.as_mut() else {
        state.error = codes::sql_exec::SQL_FAILED;
        state.diagnostics = "session state has no connection".to_string();
        return;
    };

    let outcome = async {
        let mut query_result = conn
            .query_iter(sql)
            .await
            .map_err(|e| driver_error(&e))?;
        let mut sets = Vec::new();
        // every statement yields at least one result set (an OK packet has
        // no rows but still carries affected-rows metadata)
        loop {
            let affected = query_result.affected_rows();
            let last_insert_id = query_result.last_insert_id();
            let raw: Vec<mysql_async::Row> = query_result
                .collect()
                .await
                .map_err(|e| driver_error(&e))?;
            let columns: Vec<String> = raw
                .first()
                .map(|row| {
                    row.columns_ref()
                        .iter()
                        .map(|c| c.name_str().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            let mut rows = Vec::with_capacity(raw.len());
            for row in raw {
                let meta = row.columns();
                let cells = row.unwrap();
                let mut converted = Vec::with_capacity(cells.len());
                for (i, cell) in cells.into_iter().enumerate() {
                    // the text protocol ships cells as bytes; recover the
                    // typed value from the column metadata
                    let value = match meta.get(i) {
                        Some(column) => from_wire_value(cell, column)?,
                        None => from_mysql_value(cell)?,
                    };
                    converted.push(value);
                }
                rows.push(converted);
            }
            let mut set = ResultSet::new(columns, rows, affected);
            set.last_insert_id = last_insert_id;
            sets.push(set);
            if query_result.is_empty() {
                break;
            }
        }
        Ok::<Vec<ResultSet>, Error>(sets)
    }
    .await;

    match outcome {
        Ok(sets) => {
            state.results = sets;
            state.error = 0;
            state.diagnostics.clear();
        }
        Err(e) => {
            tracing::error!(code = e.code, message = %e.what, "query execution failed");
            state.error = e.code;
            state.diagnostics = e.what;
        }
    }
}
