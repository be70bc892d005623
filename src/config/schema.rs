//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Client-facing listener.
    pub listener: ListenerConfig,

    /// Proxy target template.
    pub upstream: UpstreamConfig,

    /// SOCKS tunnel settings.
    pub socks: SocksConfig,

    /// Output segment sizing and the memory ceiling.
    pub buffers: BufferConfig,

    /// Parser limits.
    pub limits: LimitsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Where requests are forwarded.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Target template, e.g. "http://backend:8080" or "http://$host:8080/api".
    /// `$host` and `$http_host` are taken from the client request.
    pub pass: String,

    /// Append the client address to X-Forwarded-For.
    pub add_forwarded_for: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            pass: "http://127.0.0.1:8000".to_string(),
            add_forwarded_for: true,
        }
    }
}

/// Which request line is written into a SOCKS tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardedUri {
    /// The HTTP-visible `uri` resolved from `upstream.pass`.
    Http,
    /// The tunnel's own `destination_uri`.
    Tunnel,
}

/// SOCKS tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocksConfig {
    /// Route upstream traffic through a SOCKS5 server.
    pub enabled: bool,

    /// SOCKS server address (e.g., "127.0.0.1:1080").
    pub server: String,

    /// Tunnel endpoint host; defaults to the upstream host.
    pub destination_host: Option<String>,

    /// Tunnel endpoint port; defaults to the upstream port.
    pub destination_port: Option<u16>,

    /// Tunnel URI, kept for logging; defaults to the upstream uri.
    pub destination_uri: Option<String>,

    /// Required when enabled: no default is inferred.
    pub forwarded_uri: Option<ForwardedUri>,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server: "127.0.0.1:1080".to_string(),
            destination_host: None,
            destination_port: None,
            destination_uri: None,
            forwarded_uri: None,
        }
    }
}

/// Output buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity of one output segment in bytes.
    pub segment_size: usize,

    /// Ceiling on segment memory across all requests, in bytes.
    pub max_memory: usize,

    /// Reclaimed segments a request keeps for reuse.
    pub free_segments: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            segment_size: 16 * 1024,
            max_memory: 64 * 1024 * 1024, // 64MB
            free_segments: 4,
        }
    }
}

/// Parser and request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Longest accepted upstream status line.
    pub max_status_line: usize,

    /// Largest accepted upstream header block.
    pub max_header_size: usize,

    /// Largest accepted declared chunk size.
    pub max_chunk_size: u64,

    /// Largest accepted client request head.
    pub max_request_head: usize,

    /// Largest accepted client request body.
    pub max_request_body: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_status_line: 4096,
            max_header_size: 32 * 1024,
            max_chunk_size: 64 * 1024 * 1024,
            max_request_head: 16 * 1024,
            max_request_body: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream (or SOCKS server) connect timeout in seconds.
    pub connect_secs: u64,

    /// Maximum wait for the next upstream read in seconds.
    pub read_secs: u64,

    /// Maximum wait for client progress in seconds.
    pub idle_secs: u64,

    /// Drain deadline on shutdown in seconds.
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            read_secs: 30,
            idle_secs: 60,
            shutdown_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin endpoint.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin endpoint bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
