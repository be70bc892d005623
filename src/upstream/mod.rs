//! Upstream target resolution and request rendering.
//!
//! # Data Flow
//! ```text
//! client request (Host, path)
//!     → resolver.rs (substitute $host/$http_host, parse target, pick destination)
//!     → ProxyVars (immutable for the rest of the request)
//!     → request.rs (request line, Host, forwarded headers, body)
//!     → written to the upstream (or into the SOCKS tunnel)
//! ```

pub mod request;
pub mod resolver;

use std::fmt;

#[cfg(feature = "socks")]
use crate::config::schema::ForwardedUri;

pub use request::{render_request, Forwarding};
pub use resolver::{DestinationResolver, RequestTarget, ResolveError};

/// Where the upstream connection actually goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Connect straight to the HTTP-visible host and port.
    Plain,
    /// Connect to a SOCKS server and open a tunnel to another endpoint.
    #[cfg(feature = "socks")]
    SocksTunnel(TunnelDestination),
}

/// The real endpoint behind a SOCKS tunnel.
#[cfg(feature = "socks")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDestination {
    /// SOCKS server to connect to.
    pub server: String,
    pub host: String,
    pub port: u16,
    /// Logical URI of the tunnel; not part of the handshake.
    pub uri: String,
    /// Which URI goes on the request line written into the tunnel.
    pub forwarded_uri: ForwardedUri,
}

/// Resolved connection descriptor for one proxied request.
///
/// Built once by the resolver and only handed out by shared reference
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyVars {
    /// `schema://host_header`; the prefix every cache key starts with.
    pub key_start: String,
    pub schema: String,
    /// Host header value; carries the port unless it is the default one.
    pub host_header: String,
    /// Host part alone, used to connect.
    pub host: String,
    pub port: u16,
    /// Request target written on the upstream request line.
    pub uri: String,
    pub destination: Destination,
}

impl ProxyVars {
    /// Key shared by every request to the same (schema, host, port).
    pub fn pool_key(&self) -> &str {
        &self.key_start
    }

    pub fn cache_key(&self) -> String {
        format!("{}{}", self.key_start, self.uri)
    }

    /// Address the TCP connection is opened to.
    pub fn connect_address(&self) -> String {
        match &self.destination {
            Destination::Plain => format!("{}:{}", self.host, self.port),
            #[cfg(feature = "socks")]
            Destination::SocksTunnel(tunnel) => tunnel.server.clone(),
        }
    }

    /// URI for the request line, honoring the tunnel's forwarding choice.
    pub fn request_uri(&self) -> &str {
        match &self.destination {
            Destination::Plain => &self.uri,
            #[cfg(feature = "socks")]
            Destination::SocksTunnel(tunnel) => match tunnel.forwarded_uri {
                ForwardedUri::Http => &self.uri,
                ForwardedUri::Tunnel => &tunnel.uri,
            },
        }
    }

    pub fn is_tunnel(&self) -> bool {
        !matches!(self.destination, Destination::Plain)
    }
}

impl fmt::Display for ProxyVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.key_start, self.uri)?;
        #[cfg(feature = "socks")]
        if let Destination::SocksTunnel(tunnel) = &self.destination {
            write!(
                f,
                " via {} to {}:{}{}",
                tunnel.server, tunnel.host, tunnel.port, tunnel.uri
            )?;
        }
        Ok(())
    }
}
