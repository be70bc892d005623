//! Per-request proxy state.

use std::sync::Arc;

use crate::buffer::{BufferChain, SegmentPool};
use crate::config::ProxyConfig;
use crate::context::phase::{BodyKind, Phase};
use crate::error::{ProxyError, ProxyResult};
use crate::http::request::RequestId;
use crate::observability::metrics;
use crate::protocol::chunked::{ChunkedDecoder, ChunkedState};
use crate::protocol::headers::{HeaderParser, HeaderProgress, ResponseHeaders};
use crate::protocol::status::{Status, StatusParser, StatusProgress};
use crate::upstream::ProxyVars;

#[cfg(feature = "socks")]
use crate::protocol::socks::SocksNegotiator;
#[cfg(feature = "socks")]
use crate::upstream::Destination;

/// Parser limits and buffer settings for one context.
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_status_line: usize,
    pub max_header_size: usize,
    pub max_chunk_size: u64,
    /// Reclaimed segments kept on the free list.
    pub free_segments: usize,
}

impl ContextLimits {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            max_status_line: config.limits.max_status_line,
            max_header_size: config.limits.max_header_size,
            max_chunk_size: config.limits.max_chunk_size,
            free_segments: config.buffers.free_segments,
        }
    }
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Status line and headers, handed to the client writer once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: Status,
    pub headers: ResponseHeaders,
}

/// State of one proxied request, from upstream connect to the last flushed
/// byte. Owned by a single task and never shared.
#[derive(Debug)]
pub struct ProxyContext {
    id: RequestId,
    vars: ProxyVars,
    phase: Phase,

    status_parser: StatusParser,
    header_parser: HeaderParser,
    status: Option<Status>,
    response_head: Option<ResponseHead>,

    chunked: ChunkedDecoder,
    chain: BufferChain,

    /// Declared body length; `None` while chunked or unspecified.
    internal_body_length: Option<u64>,
    body_received: u64,

    /// The request was HEAD: whatever the upstream declares, no body is relayed.
    head: bool,
    /// Set only while a chunked body is being decoded.
    internal_chunked: bool,
    /// The response head went to the client; it is never produced again.
    header_sent: bool,
    /// Upstream bytes are relayed raw; stays set after the tunnel closes.
    tunnel: bool,

    #[cfg(feature = "socks")]
    socks: Option<SocksNegotiator>,
}

impl ProxyContext {
    pub fn new(
        id: RequestId,
        vars: ProxyVars,
        head: bool,
        pool: Arc<SegmentPool>,
        limits: ContextLimits,
    ) -> Self {
        Self {
            id,
            vars,
            phase: Phase::Init,
            status_parser: StatusParser::new(limits.max_status_line),
            header_parser: HeaderParser::new(limits.max_header_size),
            status: None,
            response_head: None,
            chunked: ChunkedDecoder::new(limits.max_chunk_size),
            chain: BufferChain::new(pool, limits.free_segments),
            internal_body_length: None,
            body_received: 0,
            head,
            internal_chunked: false,
            header_sent: false,
            tunnel: false,
            #[cfg(feature = "socks")]
            socks: None,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn vars(&self) -> &ProxyVars {
        &self.vars
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Parsed final status, once available.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn head(&self) -> bool {
        self.head
    }

    pub fn internal_chunked(&self) -> bool {
        self.internal_chunked
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    pub fn internal_body_length(&self) -> Option<u64> {
        self.internal_body_length
    }

    pub fn body_received(&self) -> u64 {
        self.body_received
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    #[cfg(feature = "socks")]
    pub fn is_tunnel(&self) -> bool {
        self.phase == Phase::Tunnel
    }

    #[cfg(not(feature = "socks"))]
    pub fn is_tunnel(&self) -> bool {
        false
    }

    /// The upstream connection attempt has started.
    pub fn connecting(&mut self) {
        if self.phase == Phase::Init {
            self.phase = Phase::ConnectingUpstream;
        }
    }

    /// The upstream socket is open; pick the handshake or go straight to
    /// waiting for the status line.
    pub fn connected(&mut self) -> ProxyResult<()> {
        if self.phase != Phase::ConnectingUpstream {
            return Err(self.fail(ProxyError::UpstreamProtocol(format!(
                "connected in phase {}",
                self.phase
            ))));
        }

        #[cfg(feature = "socks")]
        if let Destination::SocksTunnel(tunnel) = &self.vars.destination {
            match SocksNegotiator::new(&tunnel.host, tunnel.port) {
                Ok(negotiator) => {
                    tracing::debug!(
                        request_id = %self.id,
                        destination = %format!("{}:{}", tunnel.host, tunnel.port),
                        tunnel_uri = %tunnel.uri,
                        "Starting SOCKS handshake"
                    );
                    self.socks = Some(negotiator);
                    self.phase = Phase::SocksHandshake;
                    return Ok(());
                }
                Err(e) => return Err(self.fail(e.into())),
            }
        }

        self.phase = Phase::AwaitingStatus;
        Ok(())
    }

    /// Handshake bytes to write to the SOCKS server, if any are due.
    #[cfg(feature = "socks")]
    pub fn handshake_output(&mut self) -> Option<Vec<u8>> {
        match self.phase {
            Phase::SocksHandshake => self.socks.as_mut().and_then(SocksNegotiator::take_outbound),
            _ => None,
        }
    }

    /// Consume upstream bytes. Returns how many were used; the caller keeps
    /// the rest and offers them again once output has drained.
    ///
    /// `ProxyError::Backpressure` means nothing could be used because the
    /// segment pool is at its ceiling.
    pub fn ingest(&mut self, input: &[u8]) -> ProxyResult<usize> {
        let mut consumed = 0;

        while consumed < input.len() {
            let rest = &input[consumed..];
            let step = match self.phase {
                #[cfg(feature = "socks")]
                Phase::SocksHandshake => self.ingest_handshake(rest),
                #[cfg(feature = "socks")]
                Phase::Tunnel => Ok(self.chain.push(rest)),
                Phase::AwaitingStatus => self.ingest_status(rest),
                Phase::AwaitingHeaders => self.ingest_headers(rest),
                Phase::ReceivingBody(kind) => self.ingest_body(kind, rest),
                Phase::Flushing | Phase::Done => {
                    tracing::warn!(
                        request_id = %self.id,
                        dropped = rest.len(),
                        "Discarding bytes after the end of the response"
                    );
                    Ok(rest.len())
                }
                Phase::Init | Phase::ConnectingUpstream | Phase::Failed => {
                    Err(ProxyError::UpstreamProtocol(format!(
                        "unexpected upstream data in phase {}",
                        self.phase
                    )))
                }
            };

            match step {
                Ok(0) => break,
                Ok(n) => consumed += n,
                Err(e) => return Err(self.fail(e)),
            }
        }

        if consumed == 0 && !input.is_empty() {
            if self.phase.buffers_output() {
                metrics::record_backpressure();
                return Err(ProxyError::Backpressure);
            }
            return Err(self.fail(ProxyError::UpstreamProtocol(format!(
                "parser made no progress in phase {}",
                self.phase
            ))));
        }
        Ok(consumed)
    }

    /// The upstream closed its side.
    pub fn upstream_eof(&mut self) -> ProxyResult<()> {
        match self.phase {
            Phase::ReceivingBody(BodyKind::UntilClose) => {
                self.finish_body(BodyKind::UntilClose);
                Ok(())
            }
            #[cfg(feature = "socks")]
            Phase::Tunnel => {
                self.finish_body(BodyKind::UntilClose);
                Ok(())
            }
            Phase::ReceivingBody(BodyKind::Plain) => {
                let declared = self.internal_body_length.unwrap_or(0);
                let err = ProxyError::UpstreamProtocol(format!(
                    "upstream closed after {} of {} body bytes",
                    self.body_received, declared
                ));
                Err(self.fail(err))
            }
            Phase::ReceivingBody(BodyKind::Chunked) => match self.chunked.finish() {
                Ok(()) => Ok(()),
                Err(e) => Err(self.fail(e.into())),
            },
            #[cfg(feature = "socks")]
            Phase::SocksHandshake => Err(self.fail(ProxyError::TunnelHandshake(
                "SOCKS server closed during handshake".to_string(),
            ))),
            Phase::AwaitingStatus | Phase::AwaitingHeaders => Err(self.fail(
                ProxyError::UpstreamProtocol("upstream closed before the response head".to_string()),
            )),
            Phase::Init | Phase::ConnectingUpstream => Err(self.fail(ProxyError::UpstreamProtocol(
                "upstream closed before connecting".to_string(),
            ))),
            Phase::Flushing | Phase::Done | Phase::Failed => Ok(()),
        }
    }

    /// The response head, exactly once. Later calls return `None`.
    pub fn take_header(&mut self) -> Option<ResponseHead> {
        if self.header_sent {
            return None;
        }
        let head = self.response_head.take()?;
        self.header_sent = true;
        Some(head)
    }

    /// Oldest body bytes not yet written to the client.
    ///
    /// Nothing is produced for HEAD responses or before the head was taken.
    /// Tunnel output has no head and is produced until the chain is drained.
    pub fn pending_output(&self) -> Option<&[u8]> {
        if self.head || !(self.header_sent || self.tunnel) {
            return None;
        }
        self.chain.pending()
    }

    pub fn has_pending_output(&self) -> bool {
        self.pending_output().is_some()
    }

    /// Record that `n` bytes of `pending_output` were written.
    pub fn advance_output(&mut self, n: usize) {
        self.chain.advance(n);
        self.chain.reclaim();
        if self.phase == Phase::Flushing && self.chain.is_flushed() {
            self.phase = Phase::Done;
        }
    }

    /// Segment pool this context draws from.
    pub fn pool(&self) -> &Arc<SegmentPool> {
        self.chain.pool()
    }

    /// Tear the context down on client abort or upstream reset. Every
    /// buffer is released and the context cannot be used afterwards.
    pub fn abort(self, reason: &str) {
        tracing::warn!(
            request_id = %self.id,
            phase = %self.phase,
            pending = self.chain.pending_bytes(),
            reason,
            "Proxy context aborted"
        );
    }

    fn fail(&mut self, err: ProxyError) -> ProxyError {
        if err.is_fatal() && self.phase != Phase::Failed {
            tracing::warn!(
                request_id = %self.id,
                phase = %self.phase,
                error = %err,
                kind = err.kind(),
                "Proxy context failed"
            );
            self.phase = Phase::Failed;
            self.internal_chunked = false;
        }
        err
    }

    #[cfg(feature = "socks")]
    fn ingest_handshake(&mut self, input: &[u8]) -> ProxyResult<usize> {
        let negotiator = self
            .socks
            .as_mut()
            .ok_or_else(|| ProxyError::TunnelHandshake("no handshake in progress".to_string()))?;

        let progress = match negotiator.feed(input) {
            Ok(progress) => progress,
            Err(e) => {
                let err = ProxyError::from(e);
                let result = match err {
                    ProxyError::TunnelRejected { .. } => "rejected",
                    _ => "handshake_error",
                };
                metrics::record_tunnel(result);
                return Err(err);
            }
        };

        if progress.established {
            tracing::info!(
                request_id = %self.id,
                bound = negotiator.bound_address().unwrap_or("unknown"),
                upstream = %self.vars,
                "SOCKS tunnel established"
            );
            metrics::record_tunnel("established");
            self.phase = Phase::Tunnel;
            self.tunnel = true;
        }
        Ok(progress.consumed)
    }

    fn ingest_status(&mut self, input: &[u8]) -> ProxyResult<usize> {
        match self.status_parser.parse(input)? {
            StatusProgress::Incomplete { consumed } => Ok(consumed),
            StatusProgress::Complete { consumed, status } => {
                tracing::debug!(
                    request_id = %self.id,
                    status = status.code,
                    version = %status.version,
                    "Upstream status line parsed"
                );
                self.status = Some(status);
                self.phase = Phase::AwaitingHeaders;
                Ok(consumed)
            }
        }
    }

    fn ingest_headers(&mut self, input: &[u8]) -> ProxyResult<usize> {
        let (consumed, headers) = match self.header_parser.parse(input)? {
            HeaderProgress::Incomplete { consumed } => return Ok(consumed),
            HeaderProgress::Complete { consumed, headers } => (consumed, headers),
        };

        let status = match self.status.clone() {
            Some(status) => status,
            None => {
                return Err(ProxyError::UpstreamProtocol(
                    "header block without a status line".to_string(),
                ))
            }
        };

        if status.is_interim() {
            tracing::debug!(request_id = %self.id, status = status.code, "Discarding interim response");
            self.status = None;
            self.status_parser.reset();
            self.header_parser.reset();
            self.phase = Phase::AwaitingStatus;
            return Ok(consumed);
        }

        let bodyless = self.head || status.forbids_body() || headers.content_length == Some(0);
        self.internal_body_length = headers.content_length;

        self.phase = if bodyless {
            Phase::Done
        } else if headers.chunked {
            self.internal_chunked = true;
            self.internal_body_length = None;
            Phase::ReceivingBody(BodyKind::Chunked)
        } else if headers.content_length.is_some() {
            Phase::ReceivingBody(BodyKind::Plain)
        } else {
            Phase::ReceivingBody(BodyKind::UntilClose)
        };

        tracing::debug!(
            request_id = %self.id,
            phase = %self.phase,
            content_length = ?self.internal_body_length,
            head = self.head,
            "Upstream response head parsed"
        );

        self.response_head = Some(ResponseHead { status, headers });
        Ok(consumed)
    }

    fn ingest_body(&mut self, kind: BodyKind, input: &[u8]) -> ProxyResult<usize> {
        match kind {
            BodyKind::Plain => {
                let declared = self.internal_body_length.unwrap_or(0);
                let remaining = declared.saturating_sub(self.body_received);
                let take = (remaining.min(input.len() as u64)) as usize;
                let accepted = self.chain.push(&input[..take]);
                self.body_received += accepted as u64;

                if accepted < take {
                    return Ok(accepted);
                }
                if self.body_received == declared {
                    self.finish_body(kind);
                    if take < input.len() {
                        tracing::warn!(
                            request_id = %self.id,
                            dropped = input.len() - take,
                            "Upstream sent more than Content-Length"
                        );
                        return Ok(input.len());
                    }
                }
                Ok(take)
            }
            BodyKind::Chunked => {
                let mut pos = 0;
                while pos < input.len() {
                    let decoded = self.chunked.decode(&input[pos..])?;
                    if decoded.consumed == 0 {
                        break;
                    }
                    let framing = decoded.consumed - decoded.data.len();
                    let accepted = self.chain.push(decoded.data);
                    self.body_received += accepted as u64;

                    if accepted < decoded.data.len() {
                        self.chunked.rewind(decoded.data.len() - accepted);
                        return Ok(pos + framing + accepted);
                    }
                    pos += decoded.consumed;

                    if decoded.state == ChunkedState::Done {
                        self.finish_body(kind);
                        if pos < input.len() {
                            tracing::warn!(
                                request_id = %self.id,
                                dropped = input.len() - pos,
                                "Discarding bytes after the last chunk"
                            );
                        }
                        return Ok(input.len());
                    }
                }
                Ok(pos)
            }
            BodyKind::UntilClose => {
                let accepted = self.chain.push(input);
                self.body_received += accepted as u64;
                Ok(accepted)
            }
        }
    }

    fn finish_body(&mut self, kind: BodyKind) {
        self.internal_chunked = false;
        metrics::record_body_bytes(kind.as_str(), self.body_received);
        self.phase = if self.chain.is_flushed() {
            Phase::Done
        } else {
            Phase::Flushing
        };
    }
}
