//! Per-connection request forwarding.
//!
//! # Data Flow
//! ```text
//! client socket → read_request → resolve → ProxyContext
//!     → connect (→ SOCKS handshake) → render_request → upstream
//! upstream bytes → ProxyContext::ingest → ResponseWriter → client socket
//! ```
//!
//! # Design Decisions
//! - One request per client connection; the client socket closes afterwards
//! - Upstream bytes the context could not take yet are carried to the next
//!   round, so nothing is read while the segment pool is exhausted
//! - Once the head went out, a failure only truncates the body

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::config::TimeoutConfig;
use crate::context::ProxyContext;
use crate::error::{ProxyError, ProxyResult};
use crate::http::request::{read_request, ClientRequest, RequestError, RequestId};
use crate::http::response::{error_response, ResponseWriter};
use crate::http::server::{AppState, SharedState};
use crate::net::upstream::connect as connect_upstream;
use crate::net::ConnectionGuard;
use crate::observability::metrics;
use crate::upstream::{render_request, Forwarding};

#[cfg(feature = "socks")]
use crate::context::Phase;

const READ_BUFFER: usize = 16 * 1024;
#[cfg(feature = "socks")]
const HANDSHAKE_BUFFER: usize = 512;

/// Status recorded when the client goes away mid-response.
const CLIENT_CLOSED: u16 = 499;

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    connect: Duration,
    read: Duration,
    idle: Duration,
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_secs),
            read: Duration::from_secs(config.read_secs),
            idle: Duration::from_secs(config.idle_secs),
        }
    }
}

/// Why forwarding stopped early.
#[derive(Debug)]
enum Stop {
    Proxy(ProxyError),
    /// Writing to the client failed; nobody is left to answer.
    ClientGone(std::io::Error),
}

impl From<ProxyError> for Stop {
    fn from(err: ProxyError) -> Self {
        Stop::Proxy(err)
    }
}

/// Serve one client connection from request to close.
pub async fn serve_connection(state: AppState, mut client: TcpStream, peer: SocketAddr, guard: ConnectionGuard) {
    let start = Instant::now();
    let shared = state.inner.load_full();
    let idle = Duration::from_secs(shared.config.timeouts.idle_secs);

    let request = match tokio::time::timeout(idle, read_request(&mut client, shared.request_limits)).await {
        Ok(Ok(request)) => request,
        Ok(Err(RequestError::Incomplete)) => {
            tracing::debug!(peer_addr = %peer, "Client closed before completing a request");
            return;
        }
        Ok(Err(RequestError::Io(e))) => {
            tracing::debug!(peer_addr = %peer, error = %e, "Client read failed");
            return;
        }
        Ok(Err(e)) => {
            let status = e.status_code();
            tracing::warn!(peer_addr = %peer, error = %e, status, "Rejecting client request");
            if let Err(e) = client.write_all(&error_response(status, None)).await {
                tracing::debug!(peer_addr = %peer, error = %e, "Failed to send rejection");
            }
            metrics::record_request(status, "client_request", start);
            return;
        }
        Err(_) => {
            tracing::debug!(peer_addr = %peer, "Client idle before sending a request");
            return;
        }
    };

    state.request_count.fetch_add(1, Ordering::Relaxed);
    let request_id = request.request_id();
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method,
        path = %request.path,
        peer_addr = %peer
    );

    proxy_request(&state, &shared, client, peer, &guard, request, request_id, start)
        .instrument(span)
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn proxy_request(
    state: &AppState,
    shared: &SharedState,
    mut client: TcpStream,
    peer: SocketAddr,
    guard: &ConnectionGuard,
    request: ClientRequest,
    request_id: RequestId,
    start: Instant,
) {
    let vars = match shared.resolver.resolve(&request.target()) {
        Ok(vars) => vars,
        Err(e) => {
            let err = ProxyError::from(e);
            let status = err.status_code();
            tracing::error!(error = %err, status, "Failed to resolve upstream");
            if let Err(e) = client.write_all(&error_response(status, Some(&request_id))).await {
                tracing::debug!(error = %e, "Failed to send error response");
            }
            metrics::record_request(status, err.kind(), start);
            return;
        }
    };
    guard.describe(request_id.as_str(), &vars);
    tracing::debug!(destination = %vars, "Proxying request");

    let mut ctx = ProxyContext::new(
        request_id.clone(),
        vars,
        request.is_head(),
        Arc::clone(&state.pool),
        shared.limits,
    );
    let mut writer = ResponseWriter::new(request.version, request.is_head());
    let forwarding = Forwarding {
        request_id: &request_id,
        client_ip: Some(peer.ip()),
        add_forwarded_for: shared.config.upstream.add_forwarded_for,
    };
    let timeouts = Timeouts::from(&shared.config.timeouts);

    let result = forward(&mut ctx, &mut client, &mut writer, &request, &forwarding, timeouts).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            let status = ctx.status().map(|s| s.code).unwrap_or(200);
            tracing::info!(status, body_bytes = writer.body_bytes(), latency_ms, "Request completed");
            metrics::record_request(status, "ok", start);
        }
        Err(Stop::Proxy(err)) => {
            let status = salvage(&mut ctx, &mut client, &mut writer, &err).await;
            tracing::warn!(status, error = %err, kind = err.kind(), latency_ms, "Request failed");
            metrics::record_request(status, err.kind(), start);
        }
        Err(Stop::ClientGone(e)) => {
            metrics::record_request(CLIENT_CLOSED, "client_closed", start);
            ctx.abort(&e.to_string());
        }
    }
    metrics::record_segments_live(state.pool.live());
}

async fn forward(
    ctx: &mut ProxyContext,
    client: &mut TcpStream,
    writer: &mut ResponseWriter,
    request: &ClientRequest,
    forwarding: &Forwarding<'_>,
    timeouts: Timeouts,
) -> Result<(), Stop> {
    ctx.connecting();
    let address = ctx.vars().connect_address();
    let mut upstream = connect_upstream(&address, timeouts.connect).await?;
    ctx.connected()?;

    #[cfg_attr(not(feature = "socks"), allow(unused_mut))]
    let mut carry: Vec<u8> = Vec::new();
    #[cfg(feature = "socks")]
    if ctx.phase() == Phase::SocksHandshake {
        carry = socks_handshake(ctx, &mut upstream, timeouts.read).await?;
    }

    let rendered = render_request(ctx.vars(), request, forwarding);
    upstream.write_all(&rendered).await.map_err(ProxyError::from)?;

    #[cfg(feature = "socks")]
    if ctx.is_tunnel() {
        return relay_tunnel(ctx, client, writer, upstream, &request.surplus, carry, timeouts.idle).await;
    }
    relay_response(ctx, client, writer, upstream, carry, timeouts).await
}

async fn relay_response(
    ctx: &mut ProxyContext,
    client: &mut TcpStream,
    writer: &mut ResponseWriter,
    mut upstream: TcpStream,
    mut carry: Vec<u8>,
    timeouts: Timeouts,
) -> Result<(), Stop> {
    let mut buf = vec![0u8; READ_BUFFER];
    let mut upstream_open = true;

    loop {
        flush_output(ctx, client, writer).await?;
        if ctx.is_done() {
            writer.finish(client).await.map_err(Stop::ClientGone)?;
            return Ok(());
        }
        if !carry.is_empty() {
            feed(ctx, &mut carry, timeouts.idle).await?;
            continue;
        }
        if !upstream_open {
            return Err(ProxyError::UpstreamProtocol(format!(
                "response unfinished after upstream close in phase {}",
                ctx.phase()
            ))
            .into());
        }

        let n = read_upstream(&mut upstream, &mut buf, timeouts.read).await?;
        if n == 0 {
            upstream_open = false;
            ctx.upstream_eof()?;
        } else {
            carry.extend_from_slice(&buf[..n]);
        }
    }
}

/// Relay raw bytes both ways until the upstream closes.
#[cfg(feature = "socks")]
async fn relay_tunnel(
    ctx: &mut ProxyContext,
    client: &mut TcpStream,
    writer: &mut ResponseWriter,
    mut upstream: TcpStream,
    surplus: &[u8],
    mut carry: Vec<u8>,
    idle: Duration,
) -> Result<(), Stop> {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    if !surplus.is_empty() {
        upstream_write.write_all(surplus).await.map_err(ProxyError::from)?;
    }

    let mut from_client = vec![0u8; READ_BUFFER];
    let mut from_upstream = vec![0u8; READ_BUFFER];
    let mut client_open = true;

    loop {
        flush_output(ctx, &mut client_write, writer).await?;
        if ctx.is_done() {
            writer.finish(&mut client_write).await.map_err(Stop::ClientGone)?;
            return Ok(());
        }
        if !carry.is_empty() {
            feed(ctx, &mut carry, idle).await?;
            continue;
        }

        tokio::select! {
            read = client_read.read(&mut from_client), if client_open => {
                let n = read.map_err(Stop::ClientGone)?;
                if n == 0 {
                    client_open = false;
                    if let Err(e) = upstream_write.shutdown().await {
                        tracing::debug!(error = %e, "Failed to half-close tunnel");
                    }
                } else {
                    upstream_write.write_all(&from_client[..n]).await.map_err(ProxyError::from)?;
                }
            }
            read = upstream_read.read(&mut from_upstream) => {
                let n = read.map_err(ProxyError::from)?;
                if n == 0 {
                    ctx.upstream_eof()?;
                } else {
                    carry.extend_from_slice(&from_upstream[..n]);
                }
            }
            _ = tokio::time::sleep(idle) => {
                return Err(ProxyError::Timeout("tunnel idle").into());
            }
        }
    }
}

/// Drive the SOCKS negotiation. Returns bytes that arrived after the reply.
#[cfg(feature = "socks")]
async fn socks_handshake(ctx: &mut ProxyContext, upstream: &mut TcpStream, read_timeout: Duration) -> ProxyResult<Vec<u8>> {
    let mut buf = [0u8; HANDSHAKE_BUFFER];
    loop {
        while let Some(outbound) = ctx.handshake_output() {
            upstream.write_all(&outbound).await?;
        }

        let n = read_upstream(upstream, &mut buf, read_timeout).await?;
        if n == 0 {
            ctx.upstream_eof()?;
            return Err(ProxyError::TunnelHandshake("SOCKS server closed during handshake".to_string()));
        }
        let used = ctx.ingest(&buf[..n])?;
        if ctx.is_tunnel() {
            return Ok(buf[used..n].to_vec());
        }
    }
}

/// Hand the head over once, then every pending body byte.
async fn flush_output<W>(ctx: &mut ProxyContext, client: &mut W, writer: &mut ResponseWriter) -> Result<(), Stop>
where
    W: AsyncWrite + Unpin,
{
    if let Some(head) = ctx.take_header() {
        writer.write_head(client, &head, ctx.id()).await.map_err(Stop::ClientGone)?;
    }
    while let Some(bytes) = ctx.pending_output() {
        let n = bytes.len();
        writer.write_body(client, bytes).await.map_err(Stop::ClientGone)?;
        ctx.advance_output(n);
    }
    Ok(())
}

/// Offer carried upstream bytes to the context, waiting out backpressure.
async fn feed(ctx: &mut ProxyContext, carry: &mut Vec<u8>, idle: Duration) -> ProxyResult<()> {
    match ctx.ingest(carry) {
        Ok(used) => {
            carry.drain(..used);
            Ok(())
        }
        Err(ProxyError::Backpressure) => {
            let pool = Arc::clone(ctx.pool());
            tracing::debug!(live = pool.live(), ceiling = pool.ceiling(), "Segment pool exhausted, waiting");
            tokio::time::timeout(idle, pool.wait_for_capacity())
                .await
                .map_err(|_| ProxyError::Backpressure)
        }
        Err(e) => Err(e),
    }
}

async fn read_upstream<R>(upstream: &mut R, buf: &mut [u8], limit: Duration) -> ProxyResult<usize>
where
    R: AsyncRead + Unpin,
{
    let n = tokio::time::timeout(limit, upstream.read(buf))
        .await
        .map_err(|_| ProxyError::Timeout("upstream read"))??;
    Ok(n)
}

/// Answer a failed request as well as the client's state allows.
/// Returns the status the client observed.
async fn salvage(ctx: &mut ProxyContext, client: &mut TcpStream, writer: &mut ResponseWriter, err: &ProxyError) -> u16 {
    if let Some(head) = ctx.take_header() {
        if writer.write_head(client, &head, ctx.id()).await.is_err() {
            return head.status.code;
        }
    }

    if ctx.header_sent() || writer.head_written() || writer.body_bytes() > 0 {
        while let Some(bytes) = ctx.pending_output() {
            let n = bytes.len();
            if writer.write_body(client, bytes).await.is_err() {
                break;
            }
            ctx.advance_output(n);
        }
        // no terminator: the client must see the body as cut short
        if let Err(e) = client.shutdown().await {
            tracing::debug!(error = %e, "Failed to close client connection");
        }
        return ctx.status().map(|s| s.code).unwrap_or_else(|| err.status_code());
    }

    let status = err.status_code();
    if let Err(e) = client.write_all(&error_response(status, Some(ctx.id()))).await {
        tracing::debug!(error = %e, "Failed to send error response");
    }
    status
}
