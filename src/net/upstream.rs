//! Upstream connection setup.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{ProxyError, ProxyResult};

/// Open a TCP connection to `addr` within `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> ProxyResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout("upstream connect"))??;
    stream.set_nodelay(true)?;
    tracing::debug!(upstream = addr, "Upstream connected");
    Ok(stream)
}
