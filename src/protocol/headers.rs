//! Upstream response header block parsing.
//!
//! # Responsibilities
//! - Accumulate the header block that follows the status line
//! - Hand the completed block to `httparse`
//! - Extract body framing (Content-Length, chunked, Connection: close)
//!
//! # Design Decisions
//! - The block is bounded; an upstream that never finishes it fails the request
//! - Chunked transfer coding wins over Content-Length
//! - Conflicting Content-Length values are rejected
//! - Chunked is the only transfer coding relayed; `Transfer-Encoding` is
//!   hop-by-hop, so any other coding would reach the client unlabelled and
//!   is rejected instead

use thiserror::Error;

const MAX_HEADERS: usize = 100;

/// Errors raised on a malformed header block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header block exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed header block: {0}")]
    Malformed(String),

    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),

    #[error("conflicting Content-Length values")]
    ConflictingContentLength,

    #[error("unsupported transfer coding {0:?}")]
    UnsupportedCoding(String),
}

/// Parsed response headers with their framing summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    /// Header fields in upstream order.
    pub fields: Vec<(String, Vec<u8>)>,
    /// Declared body length, when one applies.
    pub content_length: Option<u64>,
    /// The body uses chunked transfer coding.
    pub chunked: bool,
    /// The upstream asked to close the connection.
    pub connection_close: bool,
}

impl ResponseHeaders {
    /// First value of a header, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    fn from_fields(fields: Vec<(String, Vec<u8>)>) -> Result<Self, HeaderError> {
        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut connection_close = false;

        for (name, value) in &fields {
            let text = String::from_utf8_lossy(value);
            if name.eq_ignore_ascii_case("content-length") {
                let parsed = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| HeaderError::InvalidContentLength(text.to_string()))?;
                match content_length {
                    Some(existing) if existing != parsed => {
                        return Err(HeaderError::ConflictingContentLength)
                    }
                    _ => content_length = Some(parsed),
                }
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                for coding in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    if !coding.eq_ignore_ascii_case("chunked") {
                        return Err(HeaderError::UnsupportedCoding(coding.to_string()));
                    }
                    chunked = true;
                }
            } else if name.eq_ignore_ascii_case("connection") {
                connection_close |= text
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"));
            }
        }

        if chunked {
            content_length = None;
        }

        Ok(Self {
            fields,
            content_length,
            chunked,
            connection_close,
        })
    }
}

/// Outcome of one `parse` call.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderProgress {
    Incomplete { consumed: usize },
    Complete { consumed: usize, headers: ResponseHeaders },
}

/// Accumulating header block parser.
#[derive(Debug)]
pub struct HeaderParser {
    buf: Vec<u8>,
    max_size: usize,
}

impl HeaderParser {
    pub fn new(max_size: usize) -> Self {
        Self { buf: Vec::new(), max_size }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Feed bytes that follow the status line.
    pub fn parse(&mut self, input: &[u8]) -> Result<HeaderProgress, HeaderError> {
        let previous = self.buf.len();
        let room = self.max_size.saturating_sub(previous);
        let take = input.len().min(room);
        self.buf.extend_from_slice(&input[..take]);

        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        match httparse::parse_headers(&self.buf, &mut storage) {
            Ok(httparse::Status::Complete((end, parsed))) => {
                let fields = parsed
                    .iter()
                    .map(|h| (h.name.to_string(), h.value.to_vec()))
                    .collect();
                let headers = ResponseHeaders::from_fields(fields)?;
                self.buf.clear();
                Ok(HeaderProgress::Complete { consumed: end - previous, headers })
            }
            Ok(httparse::Status::Partial) => {
                if take < input.len() || self.buf.len() >= self.max_size {
                    return Err(HeaderError::TooLarge(self.max_size));
                }
                Ok(HeaderProgress::Incomplete { consumed: take })
            }
            Err(e) => Err(HeaderError::Malformed(e.to_string())),
        }
    }
}

/// Headers that describe one connection and are never forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Header names listed in `Connection`, lowercased.
pub fn connection_tokens<'a, I>(fields: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    fields
        .into_iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| {
            String::from_utf8_lossy(value)
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// True for headers that must be dropped when forwarding.
pub fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        || connection_tokens.iter().any(|t| name.eq_ignore_ascii_case(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(progress: HeaderProgress) -> (usize, ResponseHeaders) {
        match progress {
            HeaderProgress::Complete { consumed, headers } => (consumed, headers),
            other => panic!("expected complete block, got {:?}", other),
        }
    }

    #[test]
    fn test_content_length_block() {
        let mut parser = HeaderParser::new(4096);
        let (consumed, headers) =
            complete(parser.parse(b"Content-Length: 5\r\nServer: up\r\n\r\nhello").unwrap());
        assert_eq!(consumed, 33);
        assert_eq!(headers.content_length, Some(5));
        assert!(!headers.chunked);
        assert_eq!(headers.get("server"), Some(&b"up"[..]));
    }

    #[test]
    fn test_split_block() {
        let mut parser = HeaderParser::new(4096);
        assert_eq!(
            parser.parse(b"Transfer-Encoding: chu").unwrap(),
            HeaderProgress::Incomplete { consumed: 22 }
        );
        let (consumed, headers) = complete(parser.parse(b"nked\r\nConnection: close\r\n\r\n0\r\n").unwrap());
        assert_eq!(consumed, 27);
        assert!(headers.chunked);
        assert!(headers.connection_close);
        assert_eq!(headers.content_length, None);
    }

    #[test]
    fn test_empty_block() {
        let mut parser = HeaderParser::new(64);
        let (consumed, headers) = complete(parser.parse(b"\r\n").unwrap());
        assert_eq!(consumed, 2);
        assert!(headers.fields.is_empty());
    }

    #[test]
    fn test_chunked_overrides_length() {
        let mut parser = HeaderParser::new(4096);
        let (_, headers) = complete(
            parser
                .parse(b"Content-Length: 10\r\nTransfer-Encoding: chunked\r\n\r\n")
                .unwrap(),
        );
        assert!(headers.chunked);
        assert_eq!(headers.content_length, None);
    }

    #[test]
    fn test_other_transfer_codings_rejected() {
        for block in [
            &b"Transfer-Encoding: gzip\r\n\r\n"[..],
            b"Transfer-Encoding: gzip, chunked\r\n\r\n",
            b"Transfer-Encoding: chunked\r\nTransfer-Encoding: deflate\r\n\r\n",
        ] {
            let mut parser = HeaderParser::new(4096);
            assert!(matches!(parser.parse(block), Err(HeaderError::UnsupportedCoding(_))));
        }
    }

    #[test]
    fn test_conflicting_lengths() {
        let mut parser = HeaderParser::new(4096);
        assert_eq!(
            parser.parse(b"Content-Length: 1\r\nContent-Length: 2\r\n\r\n").unwrap_err(),
            HeaderError::ConflictingContentLength
        );
    }

    #[test]
    fn test_bounded_block() {
        let mut parser = HeaderParser::new(16);
        assert_eq!(
            parser.parse(b"X-Very-Long-Header: aaaaaaaaaaaa\r\n").unwrap_err(),
            HeaderError::TooLarge(16)
        );
    }

    #[test]
    fn test_hop_by_hop_includes_connection_tokens() {
        let fields = [("Connection", &b"close, X-Secret"[..])];
        let tokens = connection_tokens(fields.iter().copied());
        assert_eq!(tokens, vec!["close".to_string(), "x-secret".to_string()]);
        assert!(is_hop_by_hop("x-secret", &tokens));
        assert!(is_hop_by_hop("Transfer-Encoding", &tokens));
        assert!(!is_hop_by_hop("Content-Type", &tokens));
    }
}
