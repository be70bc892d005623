//! Error taxonomy for a proxied request.
//!
//! Every component has its own error enum; all of them fold into
//! [`ProxyError`], which is what the context and the I/O driver deal with.
//!
//! # Design Decisions
//! - Errors are local to one context and never touch sibling contexts
//! - Only `Backpressure` is recoverable; everything else fails the request
//! - No retry happens at this layer

use thiserror::Error;

use crate::buffer::BufferError;
use crate::protocol::chunked::ChunkedError;
use crate::protocol::headers::HeaderError;
use crate::protocol::status::StatusError;
use crate::upstream::resolver::ResolveError;

#[cfg(feature = "socks")]
use crate::protocol::socks::SocksError;

/// Errors that can terminate (or stall) a proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Destination could not be resolved; raised before any upstream I/O.
    #[error("configuration error: {0}")]
    Config(#[from] ResolveError),

    /// Malformed status line or header block from the upstream.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Malformed chunked body framing.
    #[error("chunked framing error: {0}")]
    ChunkedFraming(#[from] ChunkedError),

    /// The SOCKS server refused the tunnel.
    #[error("tunnel rejected (code {code}): {reason}")]
    TunnelRejected { code: u8, reason: &'static str },

    /// The SOCKS server answered with something we could not parse.
    #[error("tunnel handshake error: {0}")]
    TunnelHandshake(String),

    /// The segment pool is at its ceiling; writes must stall.
    #[error("buffer ceiling reached")]
    Backpressure,

    /// The client sent a request we will not forward.
    #[error("bad client request: {0}")]
    ClientRequest(#[from] crate::http::request::RequestError),

    /// A connect or read deadline expired.
    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Returns false only for conditions that resolve by themselves.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProxyError::Backpressure)
    }

    /// Status code reported to the client when the response head has not
    /// been sent yet.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Config(_) => 500,
            ProxyError::ClientRequest(e) => e.status_code(),
            ProxyError::Timeout(_) => 504,
            ProxyError::Backpressure => 503,
            ProxyError::UpstreamProtocol(_)
            | ProxyError::ChunkedFraming(_)
            | ProxyError::TunnelRejected { .. }
            | ProxyError::TunnelHandshake(_)
            | ProxyError::Io(_) => 502,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config",
            ProxyError::UpstreamProtocol(_) => "upstream_protocol",
            ProxyError::ChunkedFraming(_) => "chunked_framing",
            ProxyError::TunnelRejected { .. } => "tunnel_rejected",
            ProxyError::TunnelHandshake(_) => "tunnel_handshake",
            ProxyError::Backpressure => "backpressure",
            ProxyError::ClientRequest(_) => "client_request",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Io(_) => "io",
        }
    }
}

impl From<StatusError> for ProxyError {
    fn from(e: StatusError) -> Self {
        ProxyError::UpstreamProtocol(e.to_string())
    }
}

impl From<HeaderError> for ProxyError {
    fn from(e: HeaderError) -> Self {
        ProxyError::UpstreamProtocol(e.to_string())
    }
}

impl From<BufferError> for ProxyError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::Backpressure => ProxyError::Backpressure,
            other => ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                other.to_string(),
            )),
        }
    }
}

#[cfg(feature = "socks")]
impl From<SocksError> for ProxyError {
    fn from(e: SocksError) -> Self {
        match e {
            SocksError::Rejected { code, reason } => ProxyError::TunnelRejected { code, reason },
            SocksError::NoAcceptableMethod => ProxyError::TunnelRejected {
                code: 0xff,
                reason: "no acceptable authentication method",
            },
            other => ProxyError::TunnelHandshake(other.to_string()),
        }
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
