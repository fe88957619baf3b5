//! MySQL connection pool.
//!
//! Wraps `mysql_async::Pool` built from a [`MysqlConfig`]: transport and
//! credentials chosen by socket vs TCP, TLS material installed when
//! requested, bounded size. A supervisory task warms the pool to
//! `initial_size` and keeps idle connections alive with periodic pings.
//!
//! [`MySqlPool::acquire`] is the monadic entry point: it installs a
//! one-second watchdog that traces while the request is outstanding plus a
//! hard timeout, and wraps the obtained connection in a tracked handle that
//! maintains the active counter and logs the release on drop. Exactly one
//! of {acquired, timed out, refused-by-shutdown} is observed per run.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mysql_async::{ClientIdentity, Opts, OptsBuilder, PoolConstraints, PoolOpts, SslOpts};

use aqueduct_io::{codes, Error, Result, IO};

use crate::config::{decode_pem_field, MysqlConfig, SslMode};

use super::state::SessionState;

/// Map a driver error onto the taxonomy: server rejections keep the
/// server's own code, everything else is `SQL_FAILED`.
pub(crate) fn driver_error(e: &mysql_async::Error) -> Error {
    match e {
        mysql_async::Error::Server(server) => {
            Error::new(i32::from(server.code), server.message.clone())
        }
        other => Error::new(codes::sql_exec::SQL_FAILED, other.to_string()),
    }
}

fn ssl_opts_from_config(config: &MysqlConfig) -> Result<SslOpts> {
    let mut ssl = SslOpts::default();
    let ca = decode_pem_field(&config.ca_str)?;
    if !ca.is_empty() {
        ssl = ssl.with_root_certs(vec![ca.into()]);
    }
    let cert = decode_pem_field(&config.cert_str)?;
    let key = decode_pem_field(&config.cert_key_str)?;
    if !cert.is_empty() && !key.is_empty() {
        ssl = ssl.with_client_identity(Some(ClientIdentity::new(cert.into(), key.into())));
    }
    if config.ssl_mode() == SslMode::Enable {
        // opportunistic TLS: encrypt but do not insist on a verified peer
        ssl = ssl
            .with_danger_accept_invalid_certs(true)
            .with_danger_skip_domain_validation(true);
    }
    Ok(ssl)
}

fn opts_from_config(config: &MysqlConfig) -> Result<Opts> {
    let min = config.initial_size.min(config.max_size) as usize;
    let max = config.max_size.max(1) as usize;
    let constraints = PoolConstraints::new(min, max).ok_or_else(|| {
        Error::new(
            codes::parse::BAD_VALUE_ACCESS,
            format!("invalid pool constraints: initial {min}, max {max}"),
        )
    })?;
    let pool_opts = PoolOpts::default().with_constraints(constraints);

    let mut builder = OptsBuilder::default()
        .db_name(Some(config.database.clone()))
        .pool_opts(pool_opts);

    if config.uses_unix_socket() {
        builder = builder
            .socket(Some(config.unix_socket.clone()))
            .user(Some(config.username_socket.clone()))
            .pass(Some(config.password_socket.clone()));
    } else {
        builder = builder
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .prefer_socket(false)
            .user(Some(config.username.clone()))
            .pass(Some(config.password.clone()));
        if config.ssl_mode() != SslMode::Disable {
            builder = builder.ssl_opts(Some(ssl_opts_from_config(config)?));
        }
    }

    Ok(builder.into())
}

/// A bounded pool of MySQL connections. Single-owner: construct once, share
/// behind an `Arc`, call [`stop`](Self::stop) exactly when the application
/// shuts down.
pub struct MySqlPool {
    inner: mysql_async::Pool,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MySqlPool {
    /// Build the pool and spawn its supervisory run loop. Must be called
    /// from within a tokio runtime.
    pub fn from_config(config: &MysqlConfig) -> Result<Self> {
        let opts = opts_from_config(config)?;
        let inner = mysql_async::Pool::new(opts);
        let shutdown = Arc::new(AtomicBool::new(false));

        let supervisor = tokio::spawn(supervise(
            inner.clone(),
            config.initial_size,
            config.ping_interval(),
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            inner,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Connections currently lent out to sessions.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Acquire a pooled connection within `timeout`.
    ///
    /// While the request is outstanding a watchdog traces once per second.
    /// On timeout the pending driver request is dropped (its connection, if
    /// one arrives late, is released by drop) and the IO fails with
    /// `CONNECTION_TIMEOUT`.
    pub fn acquire(&self, timeout: Duration) -> IO<SessionState> {
        let pool = self.inner.clone();
        let active = Arc::clone(&self.active);
        let shutdown = Arc::clone(&self.shutdown);
        IO::from_thunk(move || {
            let pool = pool.clone();
            let active = Arc::clone(&active);
            let shutdown = Arc::clone(&shutdown);
            async move {
                if shutdown.load(Ordering::SeqCst) {
                    return Err(Error::new(
                        codes::network::CONNECTION_REFUSED,
                        "pool is shutting down",
                    ));
                }
                let started = Instant::now();
                let deadline = tokio::time::sleep(timeout);
                tokio::pin!(deadline);
                let mut watchdog = tokio::time::interval_at(
                    tokio::time::Instant::now() + Duration::from_secs(1),
                    Duration::from_secs(1),
                );
                let get = pool.get_conn();
                tokio::pin!(get);
                loop {
                    tokio::select! {
                        result = &mut get => {
                            return match result {
                                Ok(conn) => {
                                    active.fetch_add(1, Ordering::SeqCst);
                                    Ok(SessionState::new(TrackedConn::new(conn, Arc::clone(&active))))
                                }
                                Err(e) => Err(driver_error(&e)),
                            };
                        }
                        _ = &mut deadline => {
                            tracing::warn!(
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "connection acquisition timed out"
                            );
                            return Err(Error::new(
                                codes::network::CONNECTION_TIMEOUT,
                                "Operation timed out",
                            ));
                        }
                        _ = watchdog.tick() => {
                            tracing::debug!(
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "connection acquisition still pending"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Stop the pool. Idempotent; subsequent acquires fail with a
    /// "pool is shutting down" error, and idle connections are closed.
    pub async fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.supervisor.lock().expect("supervisor lock").take() {
            handle.abort();
        }
        if let Err(e) = self.inner.clone().disconnect().await {
            tracing::warn!(error = %e, "pool disconnect reported an error");
        }
        tracing::debug!("mysql pool stopped");
    }
}

/// Warm the pool to `initial_size`, then ping an idle connection every
/// `ping_interval`. Failures are logged and never propagate.
async fn supervise(
    pool: mysql_async::Pool,
    initial_size: u64,
    ping_interval: Option<Duration>,
    shutdown: Arc<AtomicBool>,
) {
    let mut warm = Vec::new();
    for n in 0..initial_size {
        match pool.get_conn().await {
            Ok(conn) => warm.push(conn),
            Err(e) => {
                tracing::warn!(warmed = n, error = %e, "pool warm-up stopped early");
                break;
            }
        }
    }
    drop(warm);

    let Some(period) = ping_interval else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match pool.get_conn().await {
            Ok(mut conn) => {
                use mysql_async::prelude::Queryable;
                if let Err(e) = conn.ping().await {
                    tracing::warn!(error = %e, "keep-alive ping failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "keep-alive ping could not get a connection"),
        }
    }
}

static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// A pooled connection lent to one session. Dropping the handle returns the
/// connection to the driver pool and decrements the active counter.
pub struct TrackedConn {
    conn: mysql_async::Conn,
    active: Arc<AtomicUsize>,
    id: u64,
}

impl TrackedConn {
    fn new(conn: mysql_async::Conn, active: Arc<AtomicUsize>) -> Self {
        let id = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(conn_id = id, "pooled connection acquired");
        Self { conn, active, id }
    }
}

impl std::ops::Deref for TrackedConn {
    type Target = mysql_async::Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for TrackedConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for TrackedConn {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(conn_id = self.id, "pooled connection released");
    }
}
