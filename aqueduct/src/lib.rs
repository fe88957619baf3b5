//! aqueduct - asynchronous data-access and HTTP transport core
//!
//! Two tightly coupled subsystems built on `aqueduct-io`:
//!
//! - **MySQL**: a bounded connection pool over `mysql_async` with
//!   watchdog-supervised acquisition, a per-query [`SessionState`] carrying
//!   buffered result sets, and [`MonadicSession`] whose `run_query` is an
//!   `IO<SessionState>` (acquire, execute one statement, release on drop).
//!   Shape adaptors on the state turn raw result sets into typed outcomes
//!   ("exactly one row", "affected exactly one", "list plus total",
//!   "single scalar of type T").
//! - **HTTP**: a per-origin connection pool (idle deques, reaping, caps),
//!   TCP-or-TLS connections with in-place upgrade for `CONNECT` tunnels,
//!   and [`PooledSession`] driving one request/response exchange with a
//!   stable stage-code error surface.
//!
//! # Example
//!
//! ```ignore
//! use aqueduct::{MonadicSession, MySqlPool};
//! use std::sync::Arc;
//!
//! let pool = Arc::new(MySqlPool::from_config(&config)?);
//! let session = MonadicSession::new(Arc::clone(&pool));
//! let count = session
//!     .run_query("SELECT COUNT(*) FROM film")
//!     .run()
//!     .await?
//!     .expect_count("film count", 0)?;
//! ```

pub mod config;
pub mod executor;
pub mod http;
pub mod mysql;

// Core A re-exported so downstream crates depend on one name.
pub use aqueduct_io::{codes, zip2, zip3, zip4, Error, Result, IO};

pub use config::{
    substitute_env, substitute_env_json, HttpclientConfig, MysqlConfig, PoolConfig, ProxySetting,
    SslMode,
};
pub use executor::Executor;
pub use http::{
    stage, BodyKind, HttpConnectionPool, HttpRequest, HttpResponse, Origin, PooledSession,
    ProxyPool,
};
pub use mysql::{
    FieldView, MonadicSession, MySqlPool, ResultSetView, RowView, SessionState, Value,
};
