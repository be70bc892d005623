//! Client response writing.
//!
//! # Responsibilities
//! - Render the response head handed over by the proxy context
//! - Strip hop-by-hop headers and re-frame the body for the client
//! - Render error responses for requests that fail before a head exists
//!
//! # Design Decisions
//! - The client connection is always closed after one response
//! - A known length is passed on; otherwise HTTP/1.1 clients get chunked
//!   framing and HTTP/1.0 clients read until close
//! - A truncated body is never terminated, so the client sees the failure

use axum::http::StatusCode;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::context::ResponseHead;
use crate::http::request::{RequestId, X_REQUEST_ID};
use crate::protocol::chunked::{encode_chunk, encode_last_chunk};
use crate::protocol::headers::{connection_tokens, is_hop_by_hop};
use crate::protocol::status::HttpVersion;

/// How the body is delimited towards the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFraming {
    /// No body follows the head.
    Empty,
    Length(u64),
    Chunked,
    /// The body ends when the connection closes.
    Close,
}

/// Writes one response to the client.
#[derive(Debug)]
pub struct ResponseWriter {
    client_version: HttpVersion,
    head_request: bool,
    framing: Option<ClientFraming>,
    scratch: BytesMut,
    body_bytes: u64,
}

impl ResponseWriter {
    pub fn new(client_version: HttpVersion, head_request: bool) -> Self {
        Self {
            client_version,
            head_request,
            framing: None,
            scratch: BytesMut::new(),
            body_bytes: 0,
        }
    }

    /// Framing chosen when the head was rendered.
    pub fn framing(&self) -> Option<ClientFraming> {
        self.framing
    }

    pub fn head_written(&self) -> bool {
        self.framing.is_some()
    }

    /// Body bytes written so far, before framing.
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    /// Render the head and fix the body framing.
    pub fn render_head(&mut self, head: &ResponseHead, request_id: &RequestId) -> BytesMut {
        let framing = if self.head_request || head.status.forbids_body() {
            ClientFraming::Empty
        } else if let Some(length) = head.headers.content_length.filter(|_| !head.headers.chunked) {
            ClientFraming::Length(length)
        } else if self.client_version == HttpVersion::HTTP_10 {
            ClientFraming::Close
        } else {
            ClientFraming::Chunked
        };
        self.framing = Some(framing);

        let mut out = BytesMut::with_capacity(512);
        let reason = if head.status.reason.is_empty() {
            canonical_reason(head.status.code)
        } else {
            head.status.reason.as_str()
        };
        out.put_slice(format!("HTTP/1.1 {} {}\r\n", head.status.code, reason).as_bytes());

        let fields = &head.headers.fields;
        let tokens = connection_tokens(fields.iter().map(|(n, v)| (n.as_str(), v.as_slice())));
        let mut has_request_id = false;
        for (name, value) in fields {
            if is_hop_by_hop(name, &tokens) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            has_request_id |= name.eq_ignore_ascii_case(X_REQUEST_ID);
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }

        match framing {
            ClientFraming::Length(length) => {
                out.put_slice(format!("Content-Length: {length}\r\n").as_bytes());
            }
            ClientFraming::Chunked => out.put_slice(b"Transfer-Encoding: chunked\r\n"),
            // HEAD keeps the length the upstream announced
            ClientFraming::Empty => {
                if let Some(length) = head.headers.content_length.filter(|_| self.head_request) {
                    out.put_slice(format!("Content-Length: {length}\r\n").as_bytes());
                }
            }
            ClientFraming::Close => {}
        }
        if !has_request_id {
            out.put_slice(format!("X-Request-Id: {request_id}\r\n").as_bytes());
        }
        out.put_slice(b"Connection: close\r\n\r\n");
        out
    }

    /// Frame a body slice for the client.
    pub fn encode_body<'a>(&'a mut self, data: &'a [u8]) -> &'a [u8] {
        self.body_bytes += data.len() as u64;
        match self.framing {
            Some(ClientFraming::Chunked) => {
                self.scratch.clear();
                encode_chunk(data, &mut self.scratch);
                &self.scratch
            }
            Some(ClientFraming::Empty) => &[],
            _ => data,
        }
    }

    pub async fn write_head<W>(&mut self, client: &mut W, head: &ResponseHead, request_id: &RequestId) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let rendered = self.render_head(head, request_id);
        client.write_all(&rendered).await
    }

    pub async fn write_body<W>(&mut self, client: &mut W, data: &[u8]) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let framed = self.encode_body(data);
        if framed.is_empty() {
            return Ok(());
        }
        client.write_all(framed).await
    }

    /// Complete a body that arrived in full.
    pub async fn finish<W>(&mut self, client: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.framing == Some(ClientFraming::Chunked) {
            self.scratch.clear();
            encode_last_chunk(&mut self.scratch);
            client.write_all(&self.scratch).await?;
        }
        client.flush().await
    }
}

/// A plain-text response for a request that never got an upstream head.
pub fn error_response(status: u16, request_id: Option<&RequestId>) -> BytesMut {
    let reason = canonical_reason(status);
    let body = format!("{status} {reason}\n");

    let mut out = BytesMut::with_capacity(160 + body.len());
    out.put_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    out.put_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
    out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    if let Some(id) = request_id {
        out.put_slice(format!("X-Request-Id: {id}\r\n").as_bytes());
    }
    out.put_slice(b"Connection: close\r\n\r\n");
    out.put_slice(body.as_bytes());
    out
}

fn canonical_reason(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
}
