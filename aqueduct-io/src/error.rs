//! Error type and the closed code taxonomy

use thiserror::Error as ThisError;

/// Result type alias used throughout the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// A numeric error code paired with a human-readable message.
///
/// Codes occupy disjoint, documented ranges (see [`codes`]); the set is
/// closed and only grows by recompilation. Negative codes are reserved for
/// combinator-internal panic capture.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("[Error {code}] {what}")]
pub struct Error {
    pub code: i32,
    pub what: String,
}

impl Error {
    pub fn new(code: i32, what: impl Into<String>) -> Self {
        Self {
            code,
            what: what.into(),
        }
    }

    /// The canonical timeout error produced by `IO::timeout`.
    pub fn timed_out() -> Self {
        Self::new(codes::io::TIMED_OUT, "Operation timed out")
    }

    /// Timer machinery failure (distinct from a timeout firing).
    pub fn timer(detail: impl Into<String>) -> Self {
        Self::new(codes::io::TIMER_ERROR, format!("Timer error: {}", detail.into()))
    }

    /// Prefix the message with caller-supplied context, keeping the code.
    pub fn with_context(mut self, context: &str) -> Self {
        self.what = format!("{}: {}", context, self.what);
        self
    }
}

/// Documented error code constants, grouped by namespace.
pub mod codes {
    /// SQL execution and result-shape errors (1000-1999)
    pub mod sql_exec {
        pub const SQL_FAILED: i32 = 1000;
        pub const NO_ROWS: i32 = 1001;
        pub const MULTIPLE_RESULTS: i32 = 1002;
        pub const NULL_ID: i32 = 1003;
        pub const INDEX_OUT_OF_BOUNDS: i32 = 1004;
    }

    /// Value parsing errors (2000-2999)
    pub mod parse {
        pub const BAD_VALUE_ACCESS: i32 = 2000;
    }

    /// HTTP response errors. Standard status codes are reused verbatim;
    /// 4999 is the one local extension.
    pub mod response {
        pub const BAD_REQUEST: i32 = 400;
        pub const UNAUTHORIZED: i32 = 401;
        pub const FORBIDDEN: i32 = 403;
        pub const NOT_FOUND: i32 = 404;
        pub const METHOD_NOT_ALLOWED: i32 = 405;
        pub const PAYLOAD_TOO_LARGE: i32 = 413;
        pub const DOWNLOAD_FILE_OPEN_FAILED: i32 = 4999;
    }

    /// Transport-level network errors (4000-4099)
    pub mod network {
        pub const CONNECTION_TIMEOUT: i32 = 4001;
        pub const CONNECTION_REFUSED: i32 = 4002;
        pub const HOST_UNREACHABLE: i32 = 4003;
        pub const DNS_LOOKUP_FAILED: i32 = 4004;
    }

    /// Pooled HTTP session stage failures: `BASE + stage` where stage is
    /// the small integer the session reports (1 = acquire .. 8 = response
    /// read). Kept inside the network range so callers can range-match.
    pub mod http_stage {
        pub const BASE: i32 = 4100;
        pub const ACQUIRE: i32 = BASE + 1;
        pub const CONNECT_WRITE: i32 = BASE + 2;
        pub const CONNECT_READ: i32 = BASE + 3;
        pub const PROXY_STATUS: i32 = BASE + 4;
        pub const UPGRADE: i32 = BASE + 5;
        pub const HANDSHAKE: i32 = BASE + 6;
        pub const REQUEST_WRITE: i32 = BASE + 7;
        pub const RESPONSE_READ: i32 = BASE + 8;
    }

    /// Combinator-internal codes. Positive values are timer outcomes,
    /// negative values capture panics raised inside user callables.
    pub mod io {
        pub const TIMER_ERROR: i32 = 1;
        pub const TIMED_OUT: i32 = 2;
        pub const MAP_PANIC: i32 = -1;
        pub const THEN_PANIC: i32 = -2;
        pub const CATCH_PANIC: i32 = -3;
    }
}

/// Merge two independent results; the first error wins.
pub fn zip2<A, B>(a: Result<A>, b: Result<B>) -> Result<(A, B)> {
    Ok((a?, b?))
}

/// Merge three independent results; the first error wins.
pub fn zip3<A, B, C>(a: Result<A>, b: Result<B>, c: Result<C>) -> Result<(A, B, C)> {
    Ok((a?, b?, c?))
}

/// Merge four independent results; the first error wins.
pub fn zip4<A, B, C, D>(
    a: Result<A>,
    b: Result<B>,
    c: Result<C>,
    d: Result<D>,
) -> Result<(A, B, C, D)> {
    Ok((a?, b?, c?, d?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let e = Error::new(codes::sql_exec::NO_ROWS, "no such user");
        assert_eq!(e.to_string(), "[Error 1001] no such user");
    }

    #[test]
    fn timed_out_uses_reserved_code() {
        let e = Error::timed_out();
        assert_eq!(e.code, codes::io::TIMED_OUT);
        assert_eq!(e.what, "Operation timed out");
    }

    #[test]
    fn with_context_keeps_code() {
        let e = Error::new(codes::network::CONNECTION_REFUSED, "connect").with_context("origin a");
        assert_eq!(e.code, codes::network::CONNECTION_REFUSED);
        assert_eq!(e.what, "origin a: connect");
    }

    #[test]
    fn zip_short_circuits_on_first_error() {
        let a: Result<i64> = Ok(1);
        let b: Result<i64> = Err(Error::new(codes::parse::BAD_VALUE_ACCESS, "bad"));
        let c: Result<i64> = Err(Error::new(codes::sql_exec::NO_ROWS, "empty"));
        let merged = zip3(a, b, c);
        assert_eq!(merged.unwrap_err().code, codes::parse::BAD_VALUE_ACCESS);
    }
}
