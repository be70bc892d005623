//! Destination resolution.
//!
//! # Responsibilities
//! - Substitute request variables into the configured target template
//! - Split the target into schema, host, port and request URI
//! - Pick the tunnel endpoint when SOCKS forwarding is enabled
//!
//! # Design Decisions
//! - Runs before any upstream I/O; every failure here is a configuration error
//! - Only plain `http` targets are accepted
//! - Unset tunnel fields fall back to the HTTP target's values

use thiserror::Error;
use url::Url;

use crate::config::ProxyConfig;
use crate::upstream::{Destination, ProxyVars};

#[cfg(feature = "socks")]
use crate::config::schema::{ForwardedUri, SocksConfig};
#[cfg(feature = "socks")]
use crate::upstream::TunnelDestination;

const DEFAULT_PORT: u16 = 80;

/// Reasons a target cannot be resolved to literal values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// A variable is referenced but the request does not provide it.
    #[error("variable {0} has no value for this request")]
    Unresolved(String),

    #[error("unknown variable {0}")]
    UnknownVariable(String),

    /// The request supplied a value that is not a plain host (or host:port).
    #[error("variable {name} has an invalid value {value:?}")]
    InvalidValue { name: String, value: String },

    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("unsupported schema {0:?}, only http is proxied")]
    UnsupportedSchema(String),

    #[error("target host is empty")]
    EmptyHost,

    #[error("target port is 0")]
    ZeroPort,
}

/// The parts of a client request the resolver reads.
#[derive(Debug, Clone, Copy)]
pub struct RequestTarget<'a> {
    /// Host header (or absolute-form authority), port included.
    pub authority: Option<&'a str>,
    /// Path and query as sent by the client.
    pub path: &'a str,
}

impl<'a> RequestTarget<'a> {
    /// Authority without its port; IPv6 literals keep their brackets.
    fn host(&self) -> Option<&'a str> {
        let authority = self.authority?;
        let host = if authority.starts_with('[') {
            match authority.find(']') {
                Some(end) => &authority[..=end],
                None => authority,
            }
        } else {
            authority.split(':').next().unwrap_or(authority)
        };
        Some(host)
    }

    fn normalized_path(&self) -> String {
        if self.path.is_empty() {
            "/".to_string()
        } else if self.path.starts_with('/') {
            self.path.to_string()
        } else {
            format!("/{}", self.path)
        }
    }
}

/// Turns a request into [`ProxyVars`] using the configured templates.
#[derive(Debug, Clone)]
pub struct DestinationResolver {
    pass: String,
    #[cfg(feature = "socks")]
    socks: Option<SocksConfig>,
}

impl DestinationResolver {
    pub fn new(pass: impl Into<String>) -> Self {
        Self {
            pass: pass.into(),
            #[cfg(feature = "socks")]
            socks: None,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        let resolver = Self::new(config.upstream.pass.trim());
        #[cfg(feature = "socks")]
        let resolver = if config.socks.enabled {
            resolver.with_socks(config.socks.clone())
        } else {
            resolver
        };
        resolver
    }

    /// Route every request through a SOCKS tunnel.
    #[cfg(feature = "socks")]
    pub fn with_socks(mut self, socks: SocksConfig) -> Self {
        self.socks = Some(socks);
        self
    }

    /// Resolve one request. Called exactly once per request.
    pub fn resolve(&self, request: &RequestTarget<'_>) -> Result<ProxyVars, ResolveError> {
        let target = substitute(&self.pass, request)?;
        let url = Url::parse(&target).map_err(|e| ResolveError::InvalidTarget {
            target: target.clone(),
            reason: e.to_string(),
        })?;

        if url.scheme() != "http" {
            return Err(ResolveError::UnsupportedSchema(url.scheme().to_string()));
        }

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(ResolveError::EmptyHost),
        };
        let port = url.port().unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(ResolveError::ZeroPort);
        }

        let host_header = if port == DEFAULT_PORT {
            host.clone()
        } else {
            format!("{}:{}", host, port)
        };

        let request_path = request.normalized_path();
        let uri = match url.path() {
            "" | "/" => request_path,
            prefix => format!("{}{}", prefix.trim_end_matches('/'), request_path),
        };

        let schema = url.scheme().to_string();
        let key_start = format!("{}://{}", schema, host_header);

        #[cfg_attr(not(feature = "socks"), allow(unused_mut))]
        let mut vars = ProxyVars {
            key_start,
            schema,
            host_header,
            host,
            port,
            uri,
            destination: Destination::Plain,
        };

        #[cfg(feature = "socks")]
        if let Some(socks) = &self.socks {
            vars.destination = Destination::SocksTunnel(tunnel_destination(socks, request, &vars)?);
        }

        tracing::trace!(destination = %vars, "Destination resolved");
        Ok(vars)
    }
}

#[cfg(feature = "socks")]
fn tunnel_destination(
    socks: &SocksConfig,
    request: &RequestTarget<'_>,
    vars: &ProxyVars,
) -> Result<TunnelDestination, ResolveError> {
    let host = match &socks.destination_host {
        Some(template) => substitute(template, request)?,
        None => vars.host.clone(),
    };
    let host = host.trim().to_string();
    if host.is_empty() {
        return Err(ResolveError::EmptyHost);
    }

    let port = socks.destination_port.unwrap_or(vars.port);
    if port == 0 {
        return Err(ResolveError::ZeroPort);
    }

    let uri = match &socks.destination_uri {
        Some(template) => substitute(template, request)?,
        None => vars.uri.clone(),
    };

    Ok(TunnelDestination {
        server: socks.server.clone(),
        host,
        port,
        uri,
        // validation rejects an enabled tunnel without a choice
        forwarded_uri: socks.forwarded_uri.unwrap_or(ForwardedUri::Http),
    })
}

/// Replace `$host` and `$http_host` with values from the request.
fn substitute(template: &str, request: &RequestTarget<'_>) -> Result<String, ResolveError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let name_len = after
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if name_len == 0 {
            out.push('$');
            rest = after;
            continue;
        }

        let name = &after[..name_len];
        let (value, with_port) = match name {
            "host" => (request.host(), false),
            "http_host" => (request.authority, true),
            _ => return Err(ResolveError::UnknownVariable(format!("${}", name))),
        };
        match value {
            Some(v) if !v.is_empty() => {
                if !is_valid_authority(v, with_port) {
                    return Err(ResolveError::InvalidValue {
                        name: format!("${}", name),
                        value: v.to_string(),
                    });
                }
                out.push_str(v);
            }
            _ => return Err(ResolveError::Unresolved(format!("${}", name))),
        }
        rest = &after[name_len..];
    }

    out.push_str(rest);
    Ok(out)
}

/// A host name or bracketed IPv6 literal, optionally followed by `:port`.
///
/// Anything that would end the authority inside the template (`/`, `?`,
/// `#`, `@`, `\`, whitespace or control bytes) is rejected.
fn is_valid_authority(value: &str, with_port: bool) -> bool {
    if value
        .bytes()
        .any(|b| b <= b' ' || b == 0x7f || matches!(b, b'/' | b'?' | b'#' | b'@' | b'\\'))
    {
        return false;
    }

    let (host, port) = if let Some(inner) = value.strip_prefix('[') {
        let Some(end) = inner.find(']') else {
            return false;
        };
        let literal = &inner[..end];
        if literal.is_empty() || !literal.bytes().all(|b| b.is_ascii_hexdigit() || b == b':' || b == b'.') {
            return false;
        }
        let rest = &inner[end + 1..];
        match rest.strip_prefix(':') {
            Some(port) => (&value[..end + 2], Some(port)),
            None if rest.is_empty() => (value, None),
            None => return false,
        }
    } else {
        let (host, port) = match value.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        };
        if host.contains(['[', ']']) {
            return false;
        }
        (host, port)
    };

    if host.is_empty() {
        return false;
    }
    match port {
        None => true,
        Some(port) => with_port && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target<'a>(authority: Option<&'a str>, path: &'a str) -> RequestTarget<'a> {
        RequestTarget { authority, path }
    }

    #[test]
    fn test_static_target() {
        let resolver = DestinationResolver::new("http://backend:8080");
        let vars = resolver.resolve(&target(Some("example.com"), "/index.html?x=1")).unwrap();

        assert_eq!(vars.schema, "http");
        assert_eq!(vars.host, "backend");
        assert_eq!(vars.port, 8080);
        assert_eq!(vars.host_header, "backend:8080");
        assert_eq!(vars.uri, "/index.html?x=1");
        assert_eq!(vars.pool_key(), "http://backend:8080");
        assert_eq!(vars.cache_key(), "http://backend:8080/index.html?x=1");
        assert_eq!(vars.connect_address(), "backend:8080");
    }

    #[test]
    fn test_default_port_omitted_from_host_header() {
        let resolver = DestinationResolver::new("http://backend");
        let vars = resolver.resolve(&target(None, "")).unwrap();
        assert_eq!(vars.port, 80);
        assert_eq!(vars.host_header, "backend");
        assert_eq!(vars.uri, "/");
        assert_eq!(vars.key_start, "http://backend");
    }

    #[test]
    fn test_template_path_is_prefixed() {
        let resolver = DestinationResolver::new("http://backend/api/");
        let vars = resolver.resolve(&target(None, "/users")).unwrap();
        assert_eq!(vars.uri, "/api/users");
    }

    #[test]
    fn test_host_variables() {
        let resolver = DestinationResolver::new("http://$host:9000");
        let vars = resolver.resolve(&target(Some("origin.internal:8443"), "/")).unwrap();
        assert_eq!(vars.host_header, "origin.internal:9000");

        let resolver = DestinationResolver::new("http://$http_host");
        let vars = resolver.resolve(&target(Some("origin.internal:8443"), "/")).unwrap();
        assert_eq!(vars.host_header, "origin.internal:8443");
    }

    #[test]
    fn test_requests_to_same_target_share_pool_key() {
        let resolver = DestinationResolver::new("http://$host:9000");
        let a = resolver.resolve(&target(Some("a.test"), "/one")).unwrap();
        let b = resolver.resolve(&target(Some("a.test:1234"), "/two")).unwrap();
        assert_eq!(a.pool_key(), b.pool_key());
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_missing_host_is_unresolved() {
        let resolver = DestinationResolver::new("http://$host");
        let err = resolver.resolve(&target(None, "/")).unwrap_err();
        assert_eq!(err, ResolveError::Unresolved("$host".into()));
    }

    #[test]
    fn test_host_cannot_rewrite_target() {
        let resolver = DestinationResolver::new("http://$host.internal:8080");
        for authority in ["attacker.example/", "evil.test?x", "a@b.test", "a b", "x#frag", "a\\b", "[::1"] {
            let err = resolver.resolve(&target(Some(authority), "/")).unwrap_err();
            assert!(matches!(err, ResolveError::InvalidValue { .. }), "{authority}: {err:?}");
        }

        let resolver = DestinationResolver::new("http://$http_host");
        for authority in ["origin.test:80/x", "origin.test:8o", "origin.test:"] {
            let err = resolver.resolve(&target(Some(authority), "/")).unwrap_err();
            assert!(matches!(err, ResolveError::InvalidValue { .. }), "{authority}: {err:?}");
        }

        let vars = resolver.resolve(&target(Some("[::1]:8080"), "/")).unwrap();
        assert_eq!(vars.port, 8080);
        let vars = DestinationResolver::new("http://$host.internal:8080")
            .resolve(&target(Some("api:443"), "/"))
            .unwrap();
        assert_eq!(vars.host, "api.internal");
    }

    #[test]
    fn test_rejected_targets() {
        let err = DestinationResolver::new("https://secure")
            .resolve(&target(None, "/"))
            .unwrap_err();
        assert_eq!(err, ResolveError::UnsupportedSchema("https".into()));

        let err = DestinationResolver::new("http://backend:0")
            .resolve(&target(None, "/"))
            .unwrap_err();
        assert_eq!(err, ResolveError::ZeroPort);

        let err = DestinationResolver::new("http://$upstream")
            .resolve(&target(None, "/"))
            .unwrap_err();
        assert_eq!(err, ResolveError::UnknownVariable("$upstream".into()));

        let err = DestinationResolver::new("not a url")
            .resolve(&target(None, "/"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidTarget { .. }));
    }

    #[cfg(feature = "socks")]
    #[test]
    fn test_tunnel_destination() {
        let socks = SocksConfig {
            enabled: true,
            server: "127.0.0.1:1080".into(),
            destination_host: Some("10.0.0.5".into()),
            destination_port: Some(1080),
            destination_uri: Some("/tunnel".into()),
            forwarded_uri: Some(ForwardedUri::Tunnel),
        };
        let resolver = DestinationResolver::new("http://$host").with_socks(socks);
        let vars = resolver.resolve(&target(Some("site.test"), "/page")).unwrap();

        assert_eq!(vars.host_header, "site.test");
        assert_eq!(vars.connect_address(), "127.0.0.1:1080");
        assert_eq!(vars.request_uri(), "/tunnel");
        match &vars.destination {
            Destination::SocksTunnel(t) => {
                assert_eq!(t.host, "10.0.0.5");
                assert_eq!(t.port, 1080);
                assert_eq!(t.uri, "/tunnel");
            }
            other => panic!("expected tunnel, got {:?}", other),
        }
    }

    #[cfg(feature = "socks")]
    #[test]
    fn test_tunnel_defaults_to_http_target() {
        let socks = SocksConfig {
            enabled: true,
            forwarded_uri: Some(ForwardedUri::Http),
            ..SocksConfig::default()
        };
        let resolver = DestinationResolver::new("http://backend:8080").with_socks(socks);
        let vars = resolver.resolve(&target(None, "/x")).unwrap();
        assert_eq!(vars.request_uri(), "/x");
        match &vars.destination {
            Destination::SocksTunnel(t) => {
                assert_eq!((t.host.as_str(), t.port), ("backend", 8080));
                assert_eq!(t.uri, "/x");
            }
            other => panic!("expected tunnel, got {:?}", other),
        }
    }
}
