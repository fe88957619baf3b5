//! One request/response exchange over a pooled connection.
//!
//! The session acquires a connection (via the proxy when one is
//! configured), optionally tunnels with HTTP `CONNECT` plus an in-place TLS
//! upgrade, writes the request, reads the response per its body kind, and
//! releases the connection before delivering the outcome. Failures are
//! reported as a small stage integer, a stable surface callers switch on.

use std::sync::Arc;

use aqueduct_io::{codes, Error, IO};

use crate::config::ProxySetting;

use super::origin::Origin;
use super::pool::HttpConnectionPool;
use super::request::{serialize_connect, HttpRequest};
use super::response::{read_response, BodyKind, HttpResponse};

/// Stage codes reported by [`PooledSession::run`]. Zero is success; the
/// other values name the phase that failed.
pub mod stage {
    pub const OK: i32 = 0;
    pub const ACQUIRE: i32 = 1;
    pub const CONNECT_WRITE: i32 = 2;
    pub const CONNECT_READ: i32 = 3;
    pub const PROXY_STATUS: i32 = 4;
    pub const UPGRADE: i32 = 5;
    pub const HANDSHAKE: i32 = 6;
    pub const REQUEST_WRITE: i32 = 7;
    pub const RESPONSE_READ: i32 = 8;

    pub fn name(stage: i32) -> &'static str {
        match stage {
            OK => "ok",
            ACQUIRE => "acquire",
            CONNECT_WRITE => "proxy connect write",
            CONNECT_READ => "proxy connect read",
            PROXY_STATUS => "proxy connect status",
            UPGRADE => "tls upgrade",
            HANDSHAKE => "tls handshake",
            REQUEST_WRITE => "request write",
            RESPONSE_READ => "response read",
            _ => "unknown",
        }
    }
}

/// A short-lived driver for one exchange over one pooled connection.
#[derive(Clone)]
pub struct PooledSession {
    pool: Arc<HttpConnectionPool>,
    origin: Origin,
    request: HttpRequest,
    body: BodyKind,
    proxy: Option<ProxySetting>,
}

impl PooledSession {
    pub fn new(pool: Arc<HttpConnectionPool>, origin: Origin, request: HttpRequest) -> Self {
        Self {
            pool,
            origin,
            request,
            body: BodyKind::text(),
            proxy: None,
        }
    }

    /// Route the exchange through an HTTP proxy. For https destinations a
    /// `CONNECT` tunnel is established first.
    pub fn with_proxy(mut self, proxy: ProxySetting) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Choose how the response body is consumed (default: in-memory text).
    pub fn with_body_kind(mut self, kind: BodyKind) -> Self {
        self.body = kind;
        self
    }

    /// Drive the exchange. Exactly one `(response, stage)` pair is
    /// returned; the connection has been released (re-idled or closed)
    /// before this returns.
    pub async fn run(self) -> (Option<HttpResponse>, i32) {
        let io_timeout = self.pool.config().io_timeout();
        let handshake_timeout = self.pool.config().handshake_timeout();

        // proxy hop is plain TCP to the proxy's own host/port
        let acquire_origin = match &self.proxy {
            Some(proxy) => match proxy.port_u16() {
                Ok(port) => Origin::http(proxy.host.clone(), port),
                Err(e) => {
                    tracing::warn!(error = %e, "invalid proxy setting");
                    return (None, stage::ACQUIRE);
                }
            },
            None => self.origin.clone(),
        };

        let mut conn = match self.pool.acquire(&acquire_origin).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(origin = %acquire_origin, error = %e, "connection acquire failed");
                return (None, stage::ACQUIRE);
            }
        };

        if self.proxy.is_some() && self.origin.is_https() {
            let authority = self.origin.authority();
            let auth = self.proxy.as_ref().and_then(|p| {
                (!p.username.is_empty() && !p.password.is_empty())
                    .then(|| (p.username.as_str(), p.password.as_str()))
            });
            let connect = serialize_connect(&authority, auth);
            if let Err(e) = conn.write_all_timed(&connect, io_timeout).await {
                tracing::warn!(error = %e, "CONNECT write failed");
                self.pool.release(conn, false).await;
                return (None, stage::CONNECT_WRITE);
            }
            let head = match read_response(&mut conn, &BodyKind::Empty, io_timeout).await {
                Ok(head) => head,
                Err(e) => {
                    tracing::warn!(error = %e, "CONNECT response read failed");
                    self.pool.release(conn, false).await;
                    return (None, stage::CONNECT_READ);
                }
            };
            if head.status != 200 {
                tracing::warn!(status = head.status, "proxy refused CONNECT");
                self.pool.release(conn, false).await;
                return (None, stage::PROXY_STATUS);
            }
            if !conn.can_upgrade() {
                self.pool.release(conn, false).await;
                return (None, stage::UPGRADE);
            }
            if let Err(e) = conn
                .upgrade_to_tls(&self.origin.host, handshake_timeout)
                .await
            {
                tracing::warn!(error = %e, "TLS handshake through tunnel failed");
                self.pool.release(conn, false).await;
                return (None, stage::HANDSHAKE);
            }
        }

        let wire = self.request.serialize(&self.origin.host_header(), true);
        if let Err(e) = conn.write_all_timed(&wire, io_timeout).await {
            tracing::warn!(error = %e, "request write failed");
            self.pool.release(conn, false).await;
            return (None, stage::REQUEST_WRITE);
        }

        let response = match read_response(&mut conn, &self.body, io_timeout).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "response read failed");
                self.pool.release(conn, false).await;
                return (None, stage::RESPONSE_READ);
            }
        };

        // release before delivering the outcome
        let reusable = response.keep_alive();
        self.pool.release(conn, reusable).await;
        (Some(response), stage::OK)
    }

    /// Monadic adapter: stage `s` failures surface as
    /// `Error { code: 4100 + s }`.
    pub fn io(self) -> IO<HttpResponse> {
        IO::from_thunk(move || {
            let session = self.clone();
            async move {
                let origin = session.origin.clone();
                match session.run().await {
                    (Some(response), stage::OK) => Ok(response),
                    (_, failed_stage) => Err(Error::new(
                        codes::http_stage::BASE + failed_stage,
                        format!("http exchange with {origin} failed at {}", stage::name(failed_stage)),
                    )),
                }
            }
        })
    }
}
