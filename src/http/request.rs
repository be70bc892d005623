//! Client request reading.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) or adopt the client's
//! - Read one HTTP/1.x request head and its Content-Length body
//! - Enforce head and body size limits
//! - Extract what the resolver needs (authority, path)
//!
//! # Design Decisions
//! - Request ID assigned as early as possible for tracing
//! - Head size limit enforced before the body is read
//! - Chunked request bodies are refused with 411

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::protocol::status::HttpVersion;
use crate::upstream::RequestTarget;

/// Header carrying the request ID in both directions.
pub const X_REQUEST_ID: &str = "x-request-id";

const MAX_REQUEST_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// Unique request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Adopt a client-supplied ID when it is a sane header token.
    pub fn from_header(value: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(value).ok()?.trim();
        let valid = !text.is_empty()
            && text.len() <= 128
            && text.bytes().all(|b| b.is_ascii_graphic());
        valid.then(|| Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reasons a client request is refused before anything is forwarded.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("chunked request bodies are not accepted")]
    LengthRequired,

    #[error("request body of {length} bytes exceeds {limit}")]
    BodyTooLarge { length: u64, limit: usize },

    #[error("connection closed before the request was complete")]
    Incomplete,

    #[error("IO error reading request: {0}")]
    Io(#[from] std::io::Error),
}

impl RequestError {
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::LengthRequired => 411,
            RequestError::BodyTooLarge { .. } => 413,
            _ => 400,
        }
    }
}

/// A fully read client request.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: String,
    /// Origin-form target (path and query).
    pub path: String,
    /// Host header, or the authority of an absolute-form target.
    pub authority: Option<String>,
    pub version: HttpVersion,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    /// Bytes the client sent past the body; relayed only in tunnel mode.
    pub surplus: Bytes,
}

impl ClientRequest {
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn target(&self) -> RequestTarget<'_> {
        RequestTarget {
            authority: self.authority.as_deref(),
            path: &self.path,
        }
    }

    /// The client's ID if it sent a usable one, otherwise a fresh one.
    pub fn request_id(&self) -> RequestId {
        self.header(X_REQUEST_ID)
            .and_then(RequestId::from_header)
            .unwrap_or_default()
    }
}

/// Limits applied while reading a request.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub max_head: usize,
    pub max_body: usize,
}

/// Read one request from `stream`.
pub async fn read_request<R>(stream: &mut R, limits: RequestLimits) -> Result<ClientRequest, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let (head_len, mut request) = loop {
        if let Some(parsed) = parse_head(&buf, limits.max_head)? {
            break parsed;
        }
        if buf.len() >= limits.max_head {
            return Err(RequestError::HeadTooLarge(limits.max_head));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::Incomplete);
        }
    };

    let body_len = body_length(&request.headers)?;
    if body_len > limits.max_body as u64 {
        return Err(RequestError::BodyTooLarge { length: body_len, limit: limits.max_body });
    }
    let body_len = body_len as usize;

    buf.advance(head_len);
    while buf.len() < body_len {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::Incomplete);
        }
    }

    request.body = buf.split_to(body_len).freeze();
    request.surplus = buf.freeze();
    Ok(request)
}

/// Try to parse a complete head; `None` means more bytes are needed.
fn parse_head(buf: &[u8], max_head: usize) -> Result<Option<(usize, ClientRequest)>, RequestError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
    let mut req = httparse::Request::new(&mut storage);

    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RequestError::Malformed(e.to_string())),
    };
    if head_len > max_head {
        return Err(RequestError::HeadTooLarge(max_head));
    }

    let method = req.method.unwrap_or("GET").to_string();
    let raw_target = req.path.unwrap_or("/");
    let version = HttpVersion { major: 1, minor: req.version.unwrap_or(1) };

    let headers: Vec<(String, Vec<u8>)> = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect();

    let host_header = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("host"))
        .and_then(|(_, v)| std::str::from_utf8(v).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let (authority, path) = split_target(raw_target);
    let authority = authority.map(str::to_string).or(host_header);

    Ok(Some((
        head_len,
        ClientRequest {
            method,
            path: path.to_string(),
            authority,
            version,
            headers,
            body: Bytes::new(),
            surplus: Bytes::new(),
        },
    )))
}

/// Split an absolute-form target into authority and path.
fn split_target(target: &str) -> (Option<&str>, &str) {
    let rest = match target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        Some(rest) => rest,
        None => return (None, target),
    };
    match rest.find(|c| c == '/' || c == '?') {
        Some(idx) => (Some(&rest[..idx]), &rest[idx..]),
        None => (Some(rest), "/"),
    }
}

fn body_length(headers: &[(String, Vec<u8>)]) -> Result<u64, RequestError> {
    if headers
        .iter()
        .any(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
    {
        return Err(RequestError::LengthRequired);
    }

    let mut length = None;
    for (_, value) in headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        let parsed = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(RequestError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => return Err(RequestError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: RequestLimits = RequestLimits { max_head: 1024, max_body: 64 };

    async fn read(raw: &[u8]) -> Result<ClientRequest, RequestError> {
        let mut stream = raw;
        read_request(&mut stream, LIMITS).await
    }

    #[tokio::test]
    async fn test_reads_head_and_body() {
        let req = read(b"POST /submit?x=1 HTTP/1.1\r\nHost: site.test:8080\r\nContent-Length: 5\r\n\r\nhelloEXTRA")
            .await
            .unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/submit?x=1");
        assert_eq!(req.authority.as_deref(), Some("site.test:8080"));
        assert_eq!(req.version, HttpVersion::HTTP_11);
        assert_eq!(&req.body[..], b"hello");
        assert_eq!(&req.surplus[..], b"EXTRA");
    }

    #[tokio::test]
    async fn test_absolute_form_target() {
        let req = read(b"GET http://origin.test/a/b HTTP/1.0\r\nHost: ignored\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.authority.as_deref(), Some("origin.test"));
        assert_eq!(req.path, "/a/b");
        assert_eq!(req.version, HttpVersion::HTTP_10);
    }

    #[tokio::test]
    async fn test_rejections() {
        let err = read(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").await.unwrap_err();
        assert_eq!(err.status_code(), 411);

        let err = read(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n").await.unwrap_err();
        assert_eq!(err.status_code(), 413);

        let err = read(b"GET / HTTP/1.1\r\nContent-Length: 2\r\n\r\nx").await.unwrap_err();
        assert!(matches!(err, RequestError::Incomplete));

        let err = read(b"\x01\x02 nonsense\r\n\r\n").await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_head_limit() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(2048));
        raw.extend_from_slice(b"\r\n\r\n");
        let err = read(&raw).await.unwrap_err();
        assert!(matches!(err, RequestError::HeadTooLarge(1024)));
    }

    #[test]
    fn test_request_id_adoption() {
        assert_eq!(RequestId::from_header(b" abc-123 ").unwrap().as_str(), "abc-123");
        assert!(RequestId::from_header(b"has space").is_none());
        assert!(RequestId::from_header(b"").is_none());
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
