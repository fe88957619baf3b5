//! HTTP/1.1 response parsing: status line, headers, content-length and
//! chunked bodies, with per-body-kind size caps.

use std::path::PathBuf;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;

use aqueduct_io::{codes, Error, Result};

use super::connection::Connection;

/// Default cap for in-memory text bodies.
pub const DEFAULT_TEXT_LIMIT: usize = 4 * 1024 * 1024;
/// Default cap for file-backed bodies.
pub const DEFAULT_FILE_LIMIT: u64 = 10 * 1024 * 1024 * 1024;

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// How the response body is consumed.
#[derive(Debug, Clone)]
pub enum BodyKind {
    /// Header only; any body bytes are not read.
    Empty,
    /// Body buffered in memory up to `limit` bytes.
    Text { limit: usize },
    /// Body streamed to `path`, up to `limit` bytes.
    File { path: PathBuf, limit: u64 },
}

impl BodyKind {
    pub fn text() -> Self {
        BodyKind::Text {
            limit: DEFAULT_TEXT_LIMIT,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        BodyKind::File {
            path: path.into(),
            limit: DEFAULT_FILE_LIMIT,
        }
    }
}

/// A fully received HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// In-memory body; empty for `BodyKind::Empty` and `BodyKind::File`.
    pub body: Bytes,
    /// Bytes written to the target file for `BodyKind::File`.
    pub file_bytes: Option<u64>,
    version_11: bool,
}

impl HttpResponse {
    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the connection may be reused after this exchange:
    /// HTTP/1.1 unless `connection: close`, HTTP/1.0 only with an explicit
    /// `connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").map(str::to_ascii_lowercase);
        if self.version_11 {
            !connection.map(|v| v.contains("close")).unwrap_or(false)
        } else {
            connection.map(|v| v.contains("keep-alive")).unwrap_or(false)
        }
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).map_err(|_| {
            Error::new(
                codes::parse::BAD_VALUE_ACCESS,
                "response body is not valid UTF-8",
            )
        })
    }
}

struct ParsedHead {
    status: u16,
    version_11: bool,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    chunked: bool,
}

/// Position of the first `\r\n\r\n`, if fully buffered.
fn find_header_end(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(3)).find(|&i| {
        data[i] == b'\r' && data[i + 1] == b'\n' && data[i + 2] == b'\r' && data[i + 3] == b'\n'
    })
}

fn parse_head(data: &[u8]) -> Option<ParsedHead> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    // Status line: HTTP/1.1 200 OK
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    let status: u16 = parts.next()?.parse().ok()?;
    let version_11 = version == "HTTP/1.1";

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().ok();
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
        headers.push((name, value));
    }

    Some(ParsedHead {
        status,
        version_11,
        headers,
        content_length,
        chunked,
    })
}

enum Sink {
    Mem { buf: BytesMut, limit: usize },
    File { file: tokio::fs::File, written: u64, limit: u64 },
}

impl Sink {
    async fn push(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Sink::Mem { buf, limit } => {
                if buf.len() + data.len() > *limit {
                    return Err(Error::new(
                        codes::response::PAYLOAD_TOO_LARGE,
                        format!("response body exceeds {limit} bytes"),
                    ));
                }
                buf.extend_from_slice(data);
                Ok(())
            }
            Sink::File { file, written, limit } => {
                if *written + data.len() as u64 > *limit {
                    return Err(Error::new(
                        codes::response::PAYLOAD_TOO_LARGE,
                        format!("response body exceeds {limit} bytes"),
                    ));
                }
                file.write_all(data).await.map_err(|e| {
                    Error::new(
                        codes::response::DOWNLOAD_FILE_OPEN_FAILED,
                        format!("writing download file failed: {e}"),
                    )
                })?;
                *written += data.len() as u64;
                Ok(())
            }
        }
    }
}

/// Read one response from `conn` according to `kind`.
pub(crate) async fn read_response(
    conn: &mut Connection,
    kind: &BodyKind,
    io_timeout: Duration,
) -> Result<HttpResponse> {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    // Phase 1: headers.
    let head = loop {
        if let Some(end) = find_header_end(&buf) {
            let head = parse_head(&buf[..end]).ok_or_else(|| {
                Error::new(codes::response::BAD_REQUEST, "malformed response head")
            })?;
            // keep any body bytes that arrived with the head
            let body_start = buf.split_off(end + 4);
            buf = body_start;
            break head;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::new(
                codes::response::BAD_REQUEST,
                "response head too large",
            ));
        }
        let n = conn.read_some_timed(&mut buf, io_timeout).await?;
        if n == 0 {
            return Err(Error::new(
                codes::network::CONNECTION_REFUSED,
                "connection closed before response head",
            ));
        }
    };

    // Phase 2: body, per kind.
    let mut sink = match kind {
        BodyKind::Empty => {
            return Ok(HttpResponse {
                status: head.status,
                headers: head.headers,
                body: Bytes::new(),
                file_bytes: None,
                version_11: head.version_11,
            })
        }
        BodyKind::Text { limit } => Sink::Mem {
            buf: BytesMut::new(),
            limit: *limit,
        },
        BodyKind::File { path, limit } => {
            let file = tokio::fs::File::create(path).await.map_err(|e| {
                Error::new(
                    codes::response::DOWNLOAD_FILE_OPEN_FAILED,
                    format!("open download file failed: {e}"),
                )
            })?;
            Sink::File {
                file,
                written: 0,
                limit: *limit,
            }
        }
    };

    if head.chunked {
        read_chunked_body(conn, &mut buf, &mut sink, io_timeout).await?;
    } else if let Some(length) = head.content_length {
        read_counted_body(conn, &mut buf, &mut sink, length, io_timeout).await?;
    } else {
        // no framing: body runs to end of stream
        sink.push(&buf).await?;
        loop {
            buf.clear();
            let n = conn.read_some_timed(&mut buf, io_timeout).await?;
            if n == 0 {
                break;
            }
            sink.push(&buf).await?;
        }
    }

    let (body, file_bytes) = match sink {
        Sink::Mem { buf, .. } => (buf.freeze(), None),
        Sink::File { mut file, written, .. } => {
            file.flush().await.map_err(|e| {
                Error::new(
                    codes::response::DOWNLOAD_FILE_OPEN_FAILED,
                    format!("flushing download file failed: {e}"),
                )
            })?;
            (Bytes::new(), Some(written))
        }
    };

    Ok(HttpResponse {
        status: head.status,
        headers: head.headers,
        body,
        file_bytes,
        version_11: head.version_11,
    })
}

async fn read_counted_body(
    conn: &mut Connection,
    buf: &mut BytesMut,
    sink: &mut Sink,
    length: u64,
    io_timeout: Duration,
) -> Result<()> {
    let mut remaining = length;
    loop {
        if !buf.is_empty() {
            let take = (buf.len() as u64).min(remaining) as usize;
            sink.push(&buf[..take]).await?;
            remaining -= take as u64;
            let _ = buf.split_to(take);
        }
        if remaining == 0 {
            return Ok(());
        }
        let n = conn.read_some_timed(buf, io_timeout).await?;
        if n == 0 {
            return Err(Error::new(
                codes::network::CONNECTION_REFUSED,
                "connection closed mid-body",
            ));
        }
    }
}

enum ChunkStep<'a> {
    Complete {
        data: &'a [u8],
        consumed: usize,
        is_last: bool,
    },
    NeedMore,
}

/// Decode one chunk from a chunked transfer-encoded stream.
fn decode_chunk(data: &[u8]) -> ChunkStep<'_> {
    let crlf = match find_crlf(data) {
        Some(pos) => pos,
        None => return ChunkStep::NeedMore,
    };
    let size_str = match std::str::from_utf8(&data[..crlf]) {
        Ok(s) => s.trim(),
        Err(_) => return ChunkStep::NeedMore,
    };
    // strip chunk extensions (;key=value)
    let size_hex = size_str.split(';').next().unwrap_or("").trim();
    let size = match usize::from_str_radix(size_hex, 16) {
        Ok(s) => s,
        Err(_) => return ChunkStep::NeedMore,
    };

    if size == 0 {
        return ChunkStep::Complete {
            data: &[],
            consumed: crlf + 2,
            is_last: true,
        };
    }

    let chunk_start = crlf + 2;
    let chunk_end = chunk_start + size;
    let total = chunk_end + 2; // trailing \r\n
    if data.len() < total {
        return ChunkStep::NeedMore;
    }
    ChunkStep::Complete {
        data: &data[chunk_start..chunk_end],
        consumed: total,
        is_last: false,
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    (0..data.len().saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}

async fn read_chunked_body(
    conn: &mut Connection,
    buf: &mut BytesMut,
    sink: &mut Sink,
    io_timeout: Duration,
) -> Result<()> {
    loop {
        match decode_chunk(buf) {
            ChunkStep::Complete {
                data,
                consumed,
                is_last,
            } => {
                sink.push(data).await?;
                let _ = buf.split_to(consumed);
                if is_last {
                    return Ok(());
                }
            }
            ChunkStep::NeedMore => {
                let n = conn.read_some_timed(buf, io_timeout).await?;
                if n == 0 {
                    return Err(Error::new(
                        codes::network::CONNECTION_REFUSED,
                        "connection closed mid-chunk",
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_head() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n").unwrap();
        assert_eq!(head.status, 200);
        assert!(head.version_11);
        assert_eq!(head.content_length, Some(5));
        assert!(!head.chunked);
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn parse_chunked_head() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n").unwrap();
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
    }

    #[test]
    fn header_end_detection() {
        assert_eq!(
            find_header_end(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\nbody"),
            Some(34)
        );
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn chunk_decoding() {
        match decode_chunk(b"5\r\nhello\r\n") {
            ChunkStep::Complete {
                data,
                consumed,
                is_last,
            } => {
                assert_eq!(data, b"hello");
                assert_eq!(consumed, 10);
                assert!(!is_last);
            }
            ChunkStep::NeedMore => panic!("expected Complete"),
        }
        assert!(matches!(
            decode_chunk(b"0\r\n"),
            ChunkStep::Complete { is_last: true, .. }
        ));
        assert!(matches!(decode_chunk(b"5\r\nhel"), ChunkStep::NeedMore));
        // chunk extension is ignored
        match decode_chunk(b"5;ext=1\r\nhello\r\n") {
            ChunkStep::Complete { data, .. } => assert_eq!(data, b"hello"),
            ChunkStep::NeedMore => panic!("expected Complete"),
        }
    }

    fn response(version_11: bool, headers: &[(&str, &str)]) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: Bytes::new(),
            file_bytes: None,
            version_11,
        }
    }

    #[test]
    fn keep_alive_rules() {
        assert!(response(true, &[]).keep_alive());
        assert!(!response(true, &[("Connection", "close")]).keep_alive());
        assert!(!response(false, &[]).keep_alive());
        assert!(response(false, &[("Connection", "Keep-Alive")]).keep_alive());
    }

    #[tokio::test]
    async fn mem_sink_enforces_limit() {
        let mut sink = Sink::Mem {
            buf: BytesMut::new(),
            limit: 4,
        };
        sink.push(b"abcd").await.unwrap();
        let err = sink.push(b"e").await.unwrap_err();
        assert_eq!(err.code, codes::response::PAYLOAD_TOO_LARGE);
    }
}
