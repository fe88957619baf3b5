//! Pooled HTTP/1.1 client transport with TLS and proxy tunneling.

pub mod connection;
pub mod origin;
pub mod pool;
pub mod proxy;
pub mod request;
pub mod response;
pub mod session;
pub mod tls;

pub use connection::{Connection, Stream};
pub use origin::Origin;
pub use pool::HttpConnectionPool;
pub use proxy::ProxyPool;
pub use request::HttpRequest;
pub use response::{BodyKind, HttpResponse, DEFAULT_FILE_LIMIT, DEFAULT_TEXT_LIMIT};
pub use session::{stage, PooledSession};
pub use tls::client_tls_config;
