//! One pooled HTTP transport connection: plain TCP or TLS over TCP.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use aqueduct_io::{codes, Error, Result};

use crate::config::PoolConfig;

use super::origin::Origin;

/// The underlying transport, tagged by whether TLS has been negotiated.
/// The CONNECT-tunnel upgrade path moves the TCP variant into the TLS one.
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

fn map_io_error(e: &std::io::Error, detail: &str) -> Error {
    use std::io::ErrorKind;
    let code = match e.kind() {
        ErrorKind::ConnectionRefused => codes::network::CONNECTION_REFUSED,
        ErrorKind::TimedOut => codes::network::CONNECTION_TIMEOUT,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::NetworkDown => {
            codes::network::HOST_UNREACHABLE
        }
        _ => codes::network::CONNECTION_REFUSED,
    };
    Error::new(code, format!("{detail}: {e}"))
}

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// A single transport connection owned by the pool and lent to one
/// exchange at a time.
pub struct Connection {
    stream: Option<Stream>,
    origin: Origin,
    tls: Option<TlsConnector>,
    busy: bool,
    last_used: Instant,
    id: u64,
}

impl Connection {
    /// Resolve, connect and (for https origins) handshake, honoring the
    /// per-phase timeouts of `config`. The connection comes back busy.
    pub async fn open(
        origin: Origin,
        tls: Option<TlsConnector>,
        config: &PoolConfig,
    ) -> Result<Self> {
        let authority = origin.authority();
        let addrs = tokio::time::timeout(
            config.resolve_timeout(),
            tokio::net::lookup_host(authority.as_str()),
        )
        .await
        .map_err(|_| {
            Error::new(
                codes::network::DNS_LOOKUP_FAILED,
                format!("DNS lookup for {authority} timed out"),
            )
        })?
        .map_err(|e| {
            Error::new(
                codes::network::DNS_LOOKUP_FAILED,
                format!("DNS lookup for {authority} failed: {e}"),
            )
        })?;
        let addr = addrs.into_iter().next().ok_or_else(|| {
            Error::new(
                codes::network::DNS_LOOKUP_FAILED,
                format!("DNS lookup for {authority} returned no addresses"),
            )
        })?;

        let tcp = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| {
                Error::new(
                    codes::network::CONNECTION_TIMEOUT,
                    format!("connect to {authority} timed out"),
                )
            })?
            .map_err(|e| map_io_error(&e, &format!("connect to {authority} failed")))?;
        let _ = tcp.set_nodelay(true);

        let id = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut conn = Self {
            stream: Some(Stream::Tcp(tcp)),
            origin,
            tls,
            busy: true,
            last_used: Instant::now(),
            id,
        };
        if conn.origin.is_https() {
            let host = conn.origin.host.clone();
            conn.upgrade_to_tls(&host, config.handshake_timeout()).await?;
        }
        tracing::trace!(conn_id = conn.id, origin = %conn.origin, "connection opened");
        Ok(conn)
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Some(Stream::Tls(_)))
    }

    /// Whether an in-place TLS upgrade is possible: a TLS context was
    /// supplied and the stream is still plain TCP.
    pub fn can_upgrade(&self) -> bool {
        self.tls.is_some() && matches!(self.stream, Some(Stream::Tcp(_)))
    }

    pub fn busy(&self) -> bool {
        self.busy
    }

    /// Toggle busy/idle; the idle transition refreshes `last_used`.
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
        if !busy {
            self.last_used = Instant::now();
        }
    }

    pub fn is_expired(&self, idle_keep_alive: Duration) -> bool {
        self.last_used.elapsed() > idle_keep_alive
    }

    pub fn alive(&self) -> bool {
        self.stream.is_some()
    }

    /// Convert the established TCP stream into a TLS stream in place,
    /// with SNI set to `server_name`. Fails when no TLS context was
    /// supplied or the stream is already TLS.
    pub async fn upgrade_to_tls(&mut self, server_name: &str, timeout: Duration) -> Result<()> {
        let connector = self.tls.clone().ok_or_else(|| {
            Error::new(
                codes::network::CONNECTION_REFUSED,
                "no TLS context supplied for https upgrade",
            )
        })?;
        let tcp = match self.stream.take() {
            Some(Stream::Tcp(tcp)) => tcp,
            Some(other) => {
                self.stream = Some(other);
                return Err(Error::new(
                    codes::network::CONNECTION_REFUSED,
                    "stream is already TLS",
                ));
            }
            None => {
                return Err(Error::new(
                    codes::network::CONNECTION_REFUSED,
                    "stream is closed",
                ))
            }
        };
        let name = ServerName::try_from(server_name.to_string()).map_err(|_| {
            Error::new(
                codes::network::DNS_LOOKUP_FAILED,
                format!("invalid SNI host name '{server_name}'"),
            )
        })?;
        let handshake = tokio::time::timeout(timeout, connector.connect(name, tcp)).await;
        match handshake {
            Ok(Ok(tls_stream)) => {
                self.stream = Some(Stream::Tls(Box::new(tls_stream)));
                tracing::trace!(conn_id = self.id, "TLS handshake complete");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::new(
                codes::network::CONNECTION_REFUSED,
                format!("TLS handshake with {server_name} failed: {e}"),
            )),
            Err(_) => Err(Error::new(
                codes::network::CONNECTION_TIMEOUT,
                format!("TLS handshake with {server_name} timed out"),
            )),
        }
    }

    /// Write the whole buffer within `timeout`.
    pub async fn write_all_timed(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        let write = async {
            stream.write_all(data).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(map_io_error(&e, "write failed")),
            Err(_) => Err(Error::new(
                codes::network::CONNECTION_TIMEOUT,
                "write timed out",
            )),
        }
    }

    /// Read some bytes into `buf` within `timeout`. `Ok(0)` is end of
    /// stream; a TLS truncation ("short read") counts as clean EOF.
    pub async fn read_some_timed(
        &mut self,
        buf: &mut bytes::BytesMut,
        timeout: Duration,
    ) -> Result<usize> {
        use tokio::io::AsyncReadExt;
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;
        match tokio::time::timeout(timeout, stream.read_buf(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
            Ok(Err(e)) => Err(map_io_error(&e, "read failed")),
            Err(_) => Err(Error::new(
                codes::network::CONNECTION_TIMEOUT,
                "read timed out",
            )),
        }
    }

    /// Shut the transport down. TLS close errors (including truncation by
    /// the peer) are logged and otherwise ignored.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            match tokio::time::timeout(Duration::from_secs(2), stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::trace!(conn_id = self.id, error = %e, "shutdown reported an error")
                }
                Err(_) => tracing::trace!(conn_id = self.id, "shutdown timed out"),
            }
            tracing::trace!(conn_id = self.id, "connection closed");
        }
    }
}

fn closed_error() -> Error {
    Error::new(codes::network::CONNECTION_REFUSED, "connection is closed")
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("origin", &self.origin.to_string())
            .field("tls", &self.is_tls())
            .field("busy", &self.busy)
            .field("alive", &self.alive())
            .finish()
    }
}
