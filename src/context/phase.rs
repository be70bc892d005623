//! Lifecycle phases of a proxied request.

use std::fmt;

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Declared by Content-Length.
    Plain,
    /// Chunked transfer coding.
    Chunked,
    /// Runs until the upstream closes.
    UntilClose,
}

impl BodyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyKind::Plain => "plain",
            BodyKind::Chunked => "chunked",
            BodyKind::UntilClose => "until_close",
        }
    }
}

/// ```text
/// Init → ConnectingUpstream → (SocksHandshake → Tunnel)
///                           | AwaitingStatus → AwaitingHeaders
///                             → ReceivingBody{Plain|Chunked|UntilClose}
///                             → Flushing → Done
/// any non-terminal phase → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ConnectingUpstream,
    #[cfg(feature = "socks")]
    SocksHandshake,
    /// Raw passthrough; no HTTP parsing.
    #[cfg(feature = "socks")]
    Tunnel,
    AwaitingStatus,
    AwaitingHeaders,
    ReceivingBody(BodyKind),
    /// Body complete, output still pending.
    Flushing,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Phases in which upstream bytes land in the output chain.
    pub fn buffers_output(&self) -> bool {
        match self {
            Phase::ReceivingBody(_) => true,
            #[cfg(feature = "socks")]
            Phase::Tunnel => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => f.write_str("init"),
            Phase::ConnectingUpstream => f.write_str("connecting_upstream"),
            #[cfg(feature = "socks")]
            Phase::SocksHandshake => f.write_str("socks_handshake"),
            #[cfg(feature = "socks")]
            Phase::Tunnel => f.write_str("tunnel"),
            Phase::AwaitingStatus => f.write_str("awaiting_status"),
            Phase::AwaitingHeaders => f.write_str("awaiting_headers"),
            Phase::ReceivingBody(kind) => write!(f, "receiving_body_{}", kind.as_str()),
            Phase::Flushing => f.write_str("flushing"),
            Phase::Done => f.write_str("done"),
            Phase::Failed => f.write_str("failed"),
        }
    }
}
