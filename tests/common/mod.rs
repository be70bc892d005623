//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use socks_reverse_proxy::config::ProxyConfig;
use socks_reverse_proxy::http::HttpServer;
use socks_reverse_proxy::lifecycle::Shutdown;

/// Read one request (head plus Content-Length body) and return it as text.
pub async fn read_request_text(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return String::from_utf8_lossy(&buf).into_owned();
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Serve every connection: read the request, record it, then write
/// `pieces` with `pause` between them and close.
pub async fn start_backend(pieces: Vec<Vec<u8>>, pause: Duration) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let pieces = pieces.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let request = read_request_text(&mut socket).await;
                let _ = tx.send(request);
                write_pieces(&mut socket, &pieces, pause).await;
            });
        }
    });
    (addr, rx)
}

/// A backend answering every request with `body` and a Content-Length.
pub async fn start_mock_backend(body: &'static str) -> SocketAddr {
    let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}", body.len(), body);
    start_backend(vec![response.into_bytes()], Duration::ZERO).await.0
}

/// A backend that reads the request and never answers.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_request_text(&mut socket).await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    addr
}

/// What the mock SOCKS server was asked to connect to.
#[derive(Debug, Clone)]
pub struct SocksConnect {
    pub host: String,
    pub port: u16,
    pub request: String,
}

/// A SOCKS5 server that answers CONNECT with `reply_code`, then plays the
/// destination: reads the HTTP request and writes `pieces`.
pub async fn start_socks_server(reply_code: u8, pieces: Vec<Vec<u8>>) -> (SocketAddr, mpsc::UnboundedReceiver<SocksConnect>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let pieces = pieces.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut greeting = [0u8; 3];
                socket.read_exact(&mut greeting).await.unwrap();
                assert_eq!(greeting, [5, 1, 0]);
                socket.write_all(&[5, 0]).await.unwrap();

                let mut fixed = [0u8; 4];
                socket.read_exact(&mut fixed).await.unwrap();
                assert_eq!(&fixed[..3], &[5, 1, 0]);
                let host = match fixed[3] {
                    1 => {
                        let mut ip = [0u8; 4];
                        socket.read_exact(&mut ip).await.unwrap();
                        std::net::Ipv4Addr::from(ip).to_string()
                    }
                    3 => {
                        let len = socket.read_u8().await.unwrap() as usize;
                        let mut name = vec![0u8; len];
                        socket.read_exact(&mut name).await.unwrap();
                        String::from_utf8(name).unwrap()
                    }
                    4 => {
                        let mut ip = [0u8; 16];
                        socket.read_exact(&mut ip).await.unwrap();
                        std::net::Ipv6Addr::from(ip).to_string()
                    }
                    other => panic!("unexpected address type {other}"),
                };
                let port = socket.read_u16().await.unwrap();

                socket
                    .write_all(&[5, reply_code, 0, 1, 127, 0, 0, 1, 0x1f, 0x90])
                    .await
                    .unwrap();
                if reply_code != 0 {
                    let _ = tx.send(SocksConnect { host, port, request: String::new() });
                    return;
                }

                let request = read_request_text(&mut socket).await;
                let _ = tx.send(SocksConnect { host, port, request });
                write_pieces(&mut socket, &pieces, Duration::ZERO).await;
            });
        }
    });
    (addr, rx)
}

async fn write_pieces(socket: &mut TcpStream, pieces: &[Vec<u8>], pause: Duration) {
    for piece in pieces {
        if socket.write_all(piece).await.is_err() {
            return;
        }
        let _ = socket.flush().await;
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
    let _ = socket.shutdown().await;
}

/// Proxy config passing everything to `upstream`.
pub fn proxy_config(upstream: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.upstream.pass = format!("http://{}", upstream);
    config.observability.metrics_enabled = false;
    config
}

/// Start the proxy on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Shutdown) {
    let (addr, shutdown, _updates) = start_proxy_with_updates(config).await;
    (addr, shutdown)
}

/// Start the proxy and keep the config update channel.
pub async fn start_proxy_with_updates(config: ProxyConfig) -> (SocketAddr, Shutdown, mpsc::UnboundedSender<ProxyConfig>) {
    let shutdown = Shutdown::new();
    let (updates, config_updates) = mpsc::unbounded_channel();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config);
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });
    (addr, shutdown, updates)
}

/// A client that never reuses connections and ignores proxy env vars.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Send raw bytes and read the reply until the proxy closes.
pub async fn raw_request(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out)).await;
    String::from_utf8_lossy(&out).into_owned()
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
